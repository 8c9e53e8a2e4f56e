//! Transport agnostic access to target memory.
//!
//! A session talks to the target through exactly one [`MemoryTransport`], selected when
//! the session is configured. The [`MemoryBridge`] wraps it with parameter checks,
//! timing, tracing, last error bookkeeping and the host priority guard.

use std::time::Instant;

use crate::error::ErrorCode;
use crate::priority::PriorityGuard;
use crate::provider::ProviderError;
use crate::serial::SerialError;

/// Memory access to the target, either over the serial protocol or a debug provider.
pub trait MemoryTransport: Send {
    /// Name of the transport for log messages, e.g. the port or endpoint.
    fn name(&self) -> &str;

    /// Opens the connection. Opening an already open transport does nothing.
    fn open(&mut self) -> Result<(), BridgeError>;

    /// Closes the connection.
    fn close(&mut self);

    /// Reads `data.len()` bytes starting at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), BridgeError>;

    /// Writes `data` starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), BridgeError>;

    /// Discards data that is still in flight.
    fn flush(&mut self) -> Result<(), BridgeError>;

    /// Drains and logs messages the transport received outside of an exchange.
    fn handle_unexpected_messages(&mut self) -> Result<(), BridgeError>;

    /// Forwards a command to the debug provider.
    fn execute_command(&mut self, command: &str) -> Result<(), BridgeError>;
}

/// Errors of the memory bridge.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum BridgeError {
    /// Bad parameter: {0}
    BadInput(&'static str),

    /// The connection to the target is not open.
    NotOpen,

    /// Serial transport error.
    Serial(#[from] SerialError),

    /// Debug provider error.
    Provider(#[from] ProviderError),

    /// Not supported: {0}.
    Unsupported(&'static str),
}

impl BridgeError {
    /// The diagnostic code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::BadInput(_) => ErrorCode::BadInputData,
            BridgeError::NotOpen => ErrorCode::CannotOpenPort,
            BridgeError::Serial(e) => e.code(),
            BridgeError::Provider(e) => e.code(),
            BridgeError::Unsupported(_) => ErrorCode::Unsupported,
        }
    }
}

/// An open connection to the target.
pub struct MemoryBridge {
    transport: Box<dyn MemoryTransport>,
    elevate_priority: bool,
    priority: Option<PriorityGuard>,
    last_error: ErrorCode,
    open: bool,
}

impl std::fmt::Debug for MemoryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBridge")
            .field("transport", &self.transport.name())
            .field("open", &self.open)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl MemoryBridge {
    /// Opens `transport` and returns the bridge using it.
    ///
    /// With `elevate_priority` the host priority is raised while the bridge is open.
    pub fn open(
        mut transport: Box<dyn MemoryTransport>,
        elevate_priority: bool,
    ) -> Result<Self, BridgeError> {
        transport.open()?;
        tracing::info!("Connected through {}", transport.name());

        Ok(Self {
            transport,
            elevate_priority,
            priority: elevate_priority.then(PriorityGuard::acquire),
            last_error: ErrorCode::NoError,
            open: true,
        })
    }

    /// Closes the connection and restores the host priority.
    pub fn close(&mut self) {
        if self.open {
            self.transport.close();
            self.open = false;
        }
        self.priority = None;
    }

    /// Closes and reopens the connection, e.g. after the provider dropped it.
    pub fn reconnect(&mut self) -> Result<(), BridgeError> {
        self.close();

        let result = self.transport.open();
        self.record(&result);
        result?;

        self.open = true;
        if self.elevate_priority {
            self.priority = Some(PriorityGuard::acquire());
        }

        tracing::info!("Reconnected through {}", self.transport.name());
        Ok(())
    }

    fn record<T>(&mut self, result: &Result<T, BridgeError>) {
        self.last_error = match result {
            Ok(_) => ErrorCode::NoError,
            Err(e) => e.code(),
        };
    }

    fn ensure_open(&mut self) -> Result<(), BridgeError> {
        if self.open {
            Ok(())
        } else {
            self.last_error = ErrorCode::CannotOpenPort;
            Err(BridgeError::NotOpen)
        }
    }

    /// Reads `data.len()` bytes starting at `address`.
    #[tracing::instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), BridgeError> {
        if data.is_empty() {
            self.last_error = ErrorCode::BadInputData;
            return Err(BridgeError::BadInput("read length must not be zero"));
        }
        self.ensure_open()?;

        let start = Instant::now();
        let result = self.transport.read_memory(address, data);
        self.record(&result);
        log_timing("read", address, data.len(), start);

        result
    }

    /// Writes `data` starting at `address`.
    #[tracing::instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), BridgeError> {
        if data.is_empty() {
            self.last_error = ErrorCode::BadInputData;
            return Err(BridgeError::BadInput("write length must not be zero"));
        }
        self.ensure_open()?;

        let start = Instant::now();
        let result = self.transport.write_memory(address, data);
        self.record(&result);
        log_timing("write", address, data.len(), start);

        result
    }

    /// Reads a single little endian word.
    pub fn read_word(&mut self, address: u32) -> Result<u32, BridgeError> {
        let mut word = [0u8; 4];
        self.read_memory(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Writes a single little endian word.
    pub fn write_word(&mut self, address: u32, value: u32) -> Result<(), BridgeError> {
        self.write_memory(address, &value.to_le_bytes())
    }

    /// Discards data that is still in flight.
    pub fn flush(&mut self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let result = self.transport.flush();
        self.record(&result);
        result
    }

    /// Drains and logs data received outside of an exchange.
    pub fn handle_unexpected_messages(&mut self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let result = self.transport.handle_unexpected_messages();
        self.record(&result);
        result
    }

    /// Forwards a command to the debug provider.
    pub fn execute_command(&mut self, command: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        tracing::debug!("Executing '{command}'");
        let result = self.transport.execute_command(command);
        self.record(&result);
        result
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Name of the transport.
    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Code of the last failed call, [`ErrorCode::NoError`] after a successful one.
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// A short description of [`Self::last_error`].
    pub fn last_error_text(&self) -> &'static str {
        self.last_error.short_text()
    }
}

impl Drop for MemoryBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn log_timing(operation: &str, address: u32, len: usize, start: Instant) {
    let elapsed = start.elapsed();
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 {
        len as f64 / secs / 1024.0
    } else {
        f64::INFINITY
    };

    tracing::debug!(
        "{operation} {len} bytes at {address:#010x} in {:.1} ms ({throughput:.1} kB/s)",
        secs * 1000.0,
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SerialConfig;
    use crate::fake_target::{FakeTarget, Operation, SimulatedLine, TargetState};
    use crate::priority;
    use crate::serial::{SerialLine, SerialTransport};
    use pretty_assertions::assert_eq;

    fn bridge(state: &TargetState) -> MemoryBridge {
        MemoryBridge::open(FakeTarget::transport(state), false).unwrap()
    }

    #[test]
    fn zero_length_access_is_bad_input() {
        let state = TargetState::with_capacity(0x2000_0000, 32);
        let mut bridge = bridge(&state);

        assert!(matches!(
            bridge.read_memory(0x2000_0000, &mut []),
            Err(BridgeError::BadInput(_))
        ));
        assert_eq!(bridge.last_error(), ErrorCode::BadInputData);

        assert!(matches!(
            bridge.write_memory(0x2000_0000, &[]),
            Err(BridgeError::BadInput(_))
        ));
        assert_eq!(state.operations(), vec![Operation::Connect(FakeTarget::ENDPOINT.into())]);
    }

    #[test]
    fn success_clears_last_error() {
        let state = TargetState::with_capacity(0x2000_0000, 32);
        let mut bridge = bridge(&state);

        let _ = bridge.read_memory(0x2000_0000, &mut []);
        assert_eq!(bridge.last_error_text(), "bad function parameter");

        bridge.write_word(0x2000_0004, 0x55).unwrap();
        assert_eq!(bridge.read_word(0x2000_0004).unwrap(), 0x55);
        assert_eq!(bridge.last_error(), ErrorCode::NoError);
        assert_eq!(bridge.last_error_text(), "");
    }

    #[test]
    fn closed_bridge_refuses_access() {
        let state = TargetState::with_capacity(0x2000_0000, 32);
        let mut bridge = bridge(&state);

        bridge.close();
        assert!(matches!(
            bridge.read_word(0x2000_0000),
            Err(BridgeError::NotOpen)
        ));

        bridge.reconnect().unwrap();
        bridge.read_word(0x2000_0000).unwrap();
    }

    #[test]
    fn reconnect_closes_before_opening() {
        let state = TargetState::with_capacity(0x2000_0000, 32);
        let mut bridge = bridge(&state);

        bridge.reconnect().unwrap();

        assert_eq!(
            state.operations(),
            vec![
                Operation::Connect(FakeTarget::ENDPOINT.into()),
                Operation::Detach,
                Operation::Connect(FakeTarget::ENDPOINT.into()),
            ]
        );
    }

    fn serial_transport(state: &TargetState, opens_allowed: usize) -> Box<dyn MemoryTransport> {
        let state = state.clone();
        let mut opens = 0;

        Box::new(SerialTransport::with_opener(
            SerialConfig::new("sim"),
            move |config| {
                opens += 1;
                if opens > opens_allowed {
                    return Err(SerialError::CannotOpen {
                        port: config.port.clone(),
                        source: serialport::Error::new(serialport::ErrorKind::NoDevice, "unplugged"),
                    });
                }
                Ok(Box::new(SimulatedLine::new(state.clone(), false)) as Box<dyn SerialLine>)
            },
        ))
    }

    #[test]
    fn priority_is_held_while_open() {
        let _lock = priority::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let state = TargetState::with_capacity(0, 32);

        let mut bridge = MemoryBridge::open(serial_transport(&state, 2), true).unwrap();
        assert!(priority::is_elevated());

        bridge.close();
        assert!(!priority::is_elevated());

        bridge.reconnect().unwrap();
        assert!(priority::is_elevated());

        drop(bridge);
        assert!(!priority::is_elevated());
    }

    #[test]
    fn failed_reconnect_releases_priority() {
        let _lock = priority::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let state = TargetState::with_capacity(0, 32);

        let mut bridge = MemoryBridge::open(serial_transport(&state, 1), true).unwrap();
        assert!(bridge.priority.is_some());

        let error = bridge.reconnect().unwrap_err();
        assert_eq!(error.code(), ErrorCode::CannotOpenPort);
        assert!(!bridge.is_open());
        assert!(bridge.priority.is_none());
        assert!(!priority::is_elevated());
    }

    #[test]
    fn priority_is_not_requested_by_default() {
        let _lock = priority::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let state = TargetState::with_capacity(0, 32);

        let bridge = MemoryBridge::open(serial_transport(&state, 1), false).unwrap();
        assert!(bridge.priority.is_none());
        assert!(!priority::is_elevated());
    }

    #[test]
    fn provider_errors_set_the_error_code() {
        let state = TargetState::with_capacity(0x2000_0000, 32);
        let mut bridge = bridge(&state);

        // Outside of the simulated RAM.
        let error = bridge.read_word(0x1000_0000).unwrap_err();
        assert_eq!(error.code(), ErrorCode::ProviderReportedError);
        assert_eq!(bridge.last_error(), ErrorCode::ProviderReportedError);
    }
}
