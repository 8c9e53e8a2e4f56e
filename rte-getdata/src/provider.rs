//! Seam to an external remote-debug provider.
//!
//! The provider owns the debug probe and its wire format (for example a GDB server
//! reached over a TCP socket). This crate only needs memory access and a way to pass
//! monitor commands through, see [`DebugProvider`].

use crate::bridge::{BridgeError, MemoryTransport};
use crate::error::ErrorCode;

/// Errors reported by a [`DebugProvider`].
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ProviderError {
    /// Could not connect to the debug provider at '{0}'.
    ConnectionFailed(String),

    /// The debug provider did not answer in time.
    Timeout,

    /// The debug provider closed the connection.
    ConnectionClosed,

    /// The debug provider reported an error: {0}
    Reported(String),

    /// Debug provider error.
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// The diagnostic code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::ConnectionFailed(_) => ErrorCode::CannotOpenPort,
            ProviderError::Timeout => ErrorCode::ReceiveTimeout,
            ProviderError::ConnectionClosed => ErrorCode::ConnectionClosed,
            ProviderError::Reported(_) | ProviderError::Other(_) => {
                ErrorCode::ProviderReportedError
            }
        }
    }
}

/// Memory access through an external remote-debug provider.
///
/// Addresses are absolute target addresses.
pub trait DebugProvider: Send {
    /// Connects to the provider listening at `endpoint`.
    fn connect(&mut self, endpoint: &str) -> Result<(), ProviderError>;

    /// Reads `data.len()` bytes at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), ProviderError>;

    /// Writes `data` at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ProviderError>;

    /// Detaches from the target and closes the connection.
    fn detach(&mut self);

    /// Executes a provider specific command, e.g. `monitor reset`.
    fn execute_command(&mut self, command: &str) -> Result<(), ProviderError>;

    /// Discards pending replies.
    fn flush(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Drains and logs notifications the provider sent on its own.
    fn handle_unexpected_messages(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Description of the last error, as reported by the provider.
    fn error_text(&self) -> Option<String> {
        None
    }
}

/// [`MemoryTransport`] over a [`DebugProvider`].
#[derive(Debug)]
pub struct RemoteTransport<P> {
    provider: P,
    endpoint: String,
    connected: bool,
}

impl<P: DebugProvider> RemoteTransport<P> {
    /// Creates a transport connecting `provider` to `endpoint` when opened.
    pub fn new(provider: P, endpoint: impl Into<String>) -> Self {
        Self {
            provider,
            endpoint: endpoint.into(),
            connected: false,
        }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn with_context(&self, error: ProviderError) -> BridgeError {
        if let Some(text) = self.provider.error_text() {
            tracing::warn!("{}: {}", self.endpoint, text);
        }
        BridgeError::Provider(error)
    }
}

impl<P: DebugProvider> MemoryTransport for RemoteTransport<P> {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn open(&mut self) -> Result<(), BridgeError> {
        if self.connected {
            return Ok(());
        }

        self.provider
            .connect(&self.endpoint)
            .map_err(|e| self.with_context(e))?;
        self.connected = true;

        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            self.provider.detach();
            self.connected = false;
        }
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), BridgeError> {
        self.provider
            .read_memory(address, data)
            .map_err(|e| self.with_context(e))
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), BridgeError> {
        self.provider
            .write_memory(address, data)
            .map_err(|e| self.with_context(e))
    }

    fn flush(&mut self) -> Result<(), BridgeError> {
        self.provider.flush().map_err(|e| self.with_context(e))
    }

    fn handle_unexpected_messages(&mut self) -> Result<(), BridgeError> {
        self.provider
            .handle_unexpected_messages()
            .map_err(|e| self.with_context(e))
    }

    fn execute_command(&mut self, command: &str) -> Result<(), BridgeError> {
        self.provider
            .execute_command(command)
            .map_err(|e| self.with_context(e))
    }
}
