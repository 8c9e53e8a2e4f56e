use std::fmt;

/// Diagnostic code of the most recent failed bridge operation.
///
/// The code is kept by the [`MemoryBridge`](crate::bridge::MemoryBridge) so that a front end
/// can show a short status line after a failed exchange without inspecting the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// No error since the last successful call.
    #[default]
    NoError,
    /// A message was not received in time.
    ReceiveTimeout,
    /// A message could not be sent in time.
    SendTimeout,
    /// A function was called with invalid parameters.
    BadInputData,
    /// The connection was closed by the other side.
    ConnectionClosed,
    /// An unknown or unexpected response was received.
    BadResponse,
    /// The embedded system rejected the command.
    Nack,
    /// The remote-debug provider reported an error.
    ProviderReportedError,
    /// The serial port could not be opened.
    CannotOpenPort,
    /// Framing, parity or overrun error, or a corrupted echo.
    ReceiveError,
    /// The operation is not supported by the active transport.
    Unsupported,
}

impl ErrorCode {
    /// A short description for a single status line.
    pub fn short_text(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "",
            ErrorCode::ReceiveTimeout => "receive timeout",
            ErrorCode::SendTimeout => "send timeout",
            ErrorCode::BadInputData => "bad function parameter",
            ErrorCode::ConnectionClosed => "connection closed",
            ErrorCode::BadResponse => "bad response",
            ErrorCode::Nack => "command rejected (NACK)",
            ErrorCode::ProviderReportedError => "error reported by the debug provider",
            ErrorCode::CannotOpenPort => "port closed",
            ErrorCode::ReceiveError => "receive error",
            ErrorCode::Unsupported => "not supported",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_text())
    }
}
