//! # Transfer of RTEdbg logging data from a running embedded system
//!
//! The firmware logs binary messages into a circular buffer, the `g_rtedbg` structure.
//! This crate copies the structure to the host while the firmware keeps running. Logging
//! is paused through the message filter during the copy and restored afterwards.
//!
//! The target is reached either through a serial port speaking the RTEcom protocol, or
//! through an external remote-debug provider such as a GDB server.
//!
//! # Examples
//!
//! ## Reading the buffer over a serial port
//!
//! ```no_run
//! use rte_getdata::{
//!     bridge::MemoryBridge, config::{SerialConfig, TransferParameters},
//!     serial::SerialTransport, transfer::Transfer,
//! };
//!
//! let mut serial = SerialConfig::new("/dev/ttyUSB0");
//! serial.baud_rate = 115_200;
//!
//! let mut bridge = MemoryBridge::open(Box::new(SerialTransport::new(serial)), false)?;
//!
//! let mut transfer = Transfer::new(TransferParameters::default());
//! let report = transfer.run(&mut bridge)?;
//! println!("{report}");
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Restarting logging in single shot mode
//!
//! ```no_run
//! # use rte_getdata::{bridge::MemoryBridge, config::{SerialConfig, TransferParameters}, serial::SerialTransport};
//! use rte_getdata::mode::ModeController;
//!
//! # let mut bridge = MemoryBridge::open(Box::new(SerialTransport::new(SerialConfig::new("COM3"))), false)?;
//! let params = TransferParameters::default();
//! let change = ModeController::new(&params).switch_to_single_shot(&mut bridge)?;
//! println!("{change}");
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod bridge;
pub mod config;
mod error;
pub mod filter;
pub mod header;
pub mod mode;
mod priority;
pub mod provider;
pub mod script;
pub mod serial;
pub mod transfer;

#[cfg(any(test, feature = "test"))]
pub mod fake_target;

pub use crate::bridge::{BridgeError, MemoryBridge, MemoryTransport};
pub use crate::config::{SessionConfig, TransferParameters, TransportConfig};
pub use crate::error::ErrorCode;
pub use crate::priority::{is_elevated, PriorityGuard};
pub use crate::transfer::{Transfer, TransferError, TransferReport};
