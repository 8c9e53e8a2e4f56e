//! Session configuration consumed by the transfer core.
//!
//! The values are normally assembled by a front end (command line, config file) and are
//! fixed for the lifetime of a session. Only the transfer size and the filter override
//! are corrected at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::header::MIN_BUFFER_SIZE;
use crate::serial::protocol::MAX_RECEIVE_LEN;

/// Default baud rate of the serial channel.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time to wait for data after a command has been sent.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 50;

/// Default time to wait for the line echo in half-duplex mode.
pub const DEFAULT_ECHO_TIMEOUT_MS: u64 = 50;

/// Default time allowed for a packet to leave the host.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 50;

/// Smallest accepted maximum message size.
pub const MIN_MESSAGE_SIZE: u32 = 256;

/// Largest accepted maximum message size.
pub const MAX_MESSAGE_SIZE: u32 = 65535;

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of serial stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Parameters of the serial channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device name, e.g. `/dev/ttyUSB0` or `COM7`.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Time to wait for the first byte of a response, and between bytes of a data block.
    pub receive_timeout_ms: u64,
    /// Time to wait for the echo of a sent packet in half-duplex mode.
    pub echo_timeout_ms: u64,
    /// Time allowed for sending a packet.
    pub send_timeout_ms: u64,
    /// Every transmitted byte is received back (single wire communication).
    pub half_duplex: bool,
    /// Largest data block requested with a single read command.
    pub max_message_size: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            stop_bits: StopBits::One,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            echo_timeout_ms: DEFAULT_ECHO_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            half_duplex: false,
            max_message_size: MAX_RECEIVE_LEN as u32,
        }
    }
}

impl SerialConfig {
    /// Creates a configuration with default line settings for `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Receive timeout as a [`Duration`].
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Echo timeout as a [`Duration`].
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Largest chunk requested with a single read command.
    pub fn max_chunk_len(&self) -> usize {
        (self.max_message_size as usize).min(MAX_RECEIVE_LEN)
    }
}

/// Selection of the transport used for the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum TransportConfig {
    /// Direct serial channel with the RTEcom protocol.
    Serial(SerialConfig),
    /// External remote-debug provider, e.g. a GDB server, reached at `endpoint`.
    Remote {
        /// Network endpoint, e.g. `127.0.0.1:2331`.
        endpoint: String,
    },
}

/// Parameters of the buffer transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParameters {
    /// Address of the `g_rtedbg` structure. Must be zero for the serial transport,
    /// which addresses the structure relative to its start.
    pub start_address: u32,
    /// Size of the structure in bytes. Zero means discover it from the header.
    pub size: u32,
    /// Fill the circular buffer with `0xFFFFFFFF` after the transfer.
    pub clear_buffer: bool,
    /// Filter value written after the transfer instead of restoring the previous one.
    pub filter: Option<u32>,
    /// Delay before the data is copied, for low priority tasks to finish writing.
    pub delay_ms: u64,
    /// Keep the connection open for repeated transfers.
    pub persistent: bool,
    /// Output file for the snapshot.
    pub output: PathBuf,
    /// Command executed after a successful transfer, e.g. a decode batch file.
    pub decode_hook: Option<String>,
}

impl Default for TransferParameters {
    fn default() -> Self {
        Self {
            start_address: 0,
            size: 0,
            clear_buffer: false,
            filter: None,
            delay_ms: 0,
            persistent: false,
            output: PathBuf::from("data.bin"),
            decode_hook: None,
        }
    }
}

/// Complete configuration of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// The transport.
    pub transport: TransportConfig,
    /// Transfer parameters.
    #[serde(default)]
    pub transfer: TransferParameters,
    /// Raise the host scheduling priority while the session is open.
    #[serde(default)]
    pub elevated_priority: bool,
}

/// Errors in the session configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum ConfigError {
    /// The size parameter must be divisible by 4 and at least {MIN_BUFFER_SIZE} bytes, got {0}.
    BadSize(u32),

    /// The address parameter must be divisible by 4 (32-bit word aligned), got {0:#010x}.
    UnalignedAddress(u32),

    /// The structure at {0:#010x} does not fit into the 32-bit address space.
    AddressOutOfRange(u32),

    /// The address parameter must be zero when communicating through the serial port, got {0:#010x}.
    SerialAddressNotZero(u32),

    /// The maximum message size must be between {MIN_MESSAGE_SIZE} and {MAX_MESSAGE_SIZE}, got {0}.
    BadMessageSize(u32),

    /// No serial port name given.
    MissingPort,
}

impl SessionConfig {
    /// Checks the combination of parameters before a session is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let transfer = &self.transfer;

        if transfer.size % 4 != 0 || (transfer.size != 0 && transfer.size < MIN_BUFFER_SIZE) {
            return Err(ConfigError::BadSize(transfer.size));
        }

        if transfer.start_address % 4 != 0 {
            return Err(ConfigError::UnalignedAddress(transfer.start_address));
        }

        let end =
            u64::from(transfer.start_address) + u64::from(transfer.size.max(MIN_BUFFER_SIZE));
        if end > 1 << 32 {
            return Err(ConfigError::AddressOutOfRange(transfer.start_address));
        }

        if let TransportConfig::Serial(serial) = &self.transport {
            if transfer.start_address != 0 {
                return Err(ConfigError::SerialAddressNotZero(transfer.start_address));
            }

            if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&serial.max_message_size) {
                return Err(ConfigError::BadMessageSize(serial.max_message_size));
            }

            if serial.port.is_empty() {
                return Err(ConfigError::MissingPort);
            }
        }

        Ok(())
    }
}
