//! Serial transport speaking the RTEcom protocol.
//!
//! The embedded system only answers commands, it never sends anything on its own. Every
//! exchange therefore starts by discarding whatever is still queued on the line, then a
//! [`CommandPacket`] is sent and the answer is collected.
//!
//! In half-duplex mode (single wire UART) every transmitted byte is received back. The
//! echo is compared with the sent packet to detect collisions on the line.

pub mod protocol;

use std::fmt;
use std::io;
use std::time::Duration;

use crate::bridge::{BridgeError, MemoryTransport};
use crate::config::SerialConfig;
use crate::error::ErrorCode;

use protocol::{Command, CommandPacket, Response, PACKET_LEN, RESYNC_PATTERN};

/// Time to wait after a corrupted echo before the line is purged, so that the rest of a
/// garbled frame has arrived.
pub const BAD_RESPONSE_DELAY: Duration = Duration::from_millis(30);

/// Timeout used when draining bytes that are already queued.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// A byte oriented, bidirectional serial line.
///
/// Implemented for real ports by [`PortLine`] and by the simulated target used in tests.
pub trait SerialLine: Send {
    /// Writes all bytes, failing when the line does not accept them within `timeout`.
    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;

    /// Reads whatever is available, waiting at most `timeout` for the first byte.
    ///
    /// Returns `Ok(0)` if nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Number of received bytes waiting to be read.
    fn bytes_waiting(&mut self) -> io::Result<usize>;

    /// Discards the contents of the receive and transmit buffers.
    fn purge(&mut self) -> io::Result<()>;
}

/// A [`SerialLine`] backed by an operating system serial port.
pub struct PortLine {
    port: Box<dyn serialport::SerialPort>,
}

impl fmt::Debug for PortLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLine")
            .field("name", &self.port.name())
            .finish()
    }
}

impl PortLine {
    /// Opens the port described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self, SerialError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(serialport::FlowControl::None)
            .timeout(config.receive_timeout())
            .open()
            .map_err(|source| SerialError::CannotOpen {
                port: config.port.clone(),
                source,
            })?;

        Ok(Self { port })
    }
}

impl SerialLine for PortLine {
    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)?;
        io::Write::write_all(&mut self.port, data)?;
        io::Write::flush(&mut self.port)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout)?;
        match io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn bytes_waiting(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn purge(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

/// Which part of an exchange was being received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, docsplay::Display)]
pub enum ReceiveKind {
    /// echo
    Echo,
    /// data
    Data,
    /// response
    Response,
}

/// Errors of the serial transport.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum SerialError {
    /// Bad parameter: {0}
    BadInput(&'static str),

    /// The serial port is not open.
    NotOpen,

    /// Could not open serial port '{port}'.
    CannotOpen {
        /// Name of the port.
        port: String,
        /// Error reported by the operating system.
        #[source]
        source: serialport::Error,
    },

    /// Could not send the command.
    Send(#[source] io::Error),

    /// Timeout while receiving the {kind}: got {received} of {expected} bytes.
    ReceiveTimeout {
        /// Part of the exchange.
        kind: ReceiveKind,
        /// Bytes received before the timeout.
        received: usize,
        /// Bytes expected.
        expected: usize,
    },

    /// Error while receiving data.
    Receive(#[source] io::Error),

    /// The echo of the sent packet does not match (line collision or noise).
    EchoMismatch,

    /// The embedded system rejected the {0} command.
    Nack(Command),

    /// Unexpected response byte {0:#04x}.
    BadResponse(u8),
}

impl SerialError {
    /// The diagnostic code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SerialError::BadInput(_) => ErrorCode::BadInputData,
            SerialError::NotOpen | SerialError::CannotOpen { .. } => ErrorCode::CannotOpenPort,
            SerialError::Send(_) => ErrorCode::SendTimeout,
            SerialError::ReceiveTimeout { .. } => ErrorCode::ReceiveTimeout,
            SerialError::Receive(_) | SerialError::EchoMismatch => ErrorCode::ReceiveError,
            SerialError::Nack(_) => ErrorCode::Nack,
            SerialError::BadResponse(_) => ErrorCode::BadResponse,
        }
    }
}

type Opener = Box<dyn FnMut(&SerialConfig) -> Result<Box<dyn SerialLine>, SerialError> + Send>;

/// Memory transport over a serial line.
///
/// Addresses are relative to the start of the `g_rtedbg` structure.
pub struct SerialTransport {
    config: SerialConfig,
    line: Option<Box<dyn SerialLine>>,
    opener: Opener,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .field("open", &self.line.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Creates a transport for the operating system port named in `config`.
    ///
    /// The port is opened by [`MemoryTransport::open`].
    pub fn new(config: SerialConfig) -> Self {
        Self::with_opener(config, |config| {
            PortLine::open(config).map(|line| Box::new(line) as Box<dyn SerialLine>)
        })
    }

    /// Creates a transport that obtains its line from `opener`.
    pub fn with_opener(
        config: SerialConfig,
        opener: impl FnMut(&SerialConfig) -> Result<Box<dyn SerialLine>, SerialError> + Send + 'static,
    ) -> Self {
        Self {
            config,
            line: None,
            opener: Box::new(opener),
        }
    }

    /// The line configuration.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn line(&mut self) -> Result<&mut Box<dyn SerialLine>, SerialError> {
        self.line.as_mut().ok_or(SerialError::NotOpen)
    }

    /// Sends a command packet and verifies the echo in half-duplex mode.
    pub fn send_command(
        &mut self,
        command: Command,
        address: u32,
        data: u32,
    ) -> Result<(), SerialError> {
        let packet = CommandPacket::new(command, address, data);
        tracing::trace!("Sending {}", packet);

        self.purge_and_log()?;

        let bytes = packet.to_bytes();
        let send_timeout = self.config.send_timeout();
        self.line()?
            .write_all(&bytes, send_timeout)
            .map_err(SerialError::Send)?;

        if self.config.half_duplex {
            let mut echo = [0u8; PACKET_LEN];
            let echo_timeout = self.config.echo_timeout();
            self.receive_exact(&mut echo, echo_timeout, ReceiveKind::Echo)?;

            if echo != bytes {
                tracing::warn!("Echo mismatch: sent {:02X?}, received {:02X?}", bytes, echo);
                std::thread::sleep(BAD_RESPONSE_DELAY);
                self.line()?.purge().map_err(SerialError::Receive)?;
                return Err(SerialError::EchoMismatch);
            }
        }

        Ok(())
    }

    /// Fills `buf` completely. Each read waits at most `timeout` for more data.
    fn receive_exact(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        kind: ReceiveKind,
    ) -> Result<(), SerialError> {
        let expected = buf.len();
        let line = self.line()?;

        let mut received = 0;
        while received < expected {
            let n = line
                .read(&mut buf[received..], timeout)
                .map_err(SerialError::Receive)?;

            if n == 0 {
                return Err(SerialError::ReceiveTimeout {
                    kind,
                    received,
                    expected,
                });
            }
            received += n;
        }

        Ok(())
    }

    /// Reads one block of at most [`SerialConfig::max_chunk_len`] bytes at `offset`.
    pub fn read_block(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), SerialError> {
        if buf.is_empty() || buf.len() > self.config.max_chunk_len() {
            return Err(SerialError::BadInput("read block length out of range"));
        }

        self.send_command(Command::ReadRtedbg, offset, buf.len() as u32)?;

        let timeout = self.config.receive_timeout();
        self.receive_exact(buf, timeout, ReceiveKind::Data)
    }

    /// Writes a single word at the word aligned `offset`.
    pub fn write_word(&mut self, offset: u32, value: u32) -> Result<(), SerialError> {
        if offset % 4 != 0 {
            return Err(SerialError::BadInput("write address must be word aligned"));
        }

        let command = Command::WriteRtedbg;
        self.send_command(command, offset / 4, value)?;

        let mut answer = [0u8; 1];
        let timeout = self.config.receive_timeout();
        self.receive_exact(&mut answer, timeout, ReceiveKind::Response)?;

        match Response::classify(answer[0], command) {
            Response::Ack => Ok(()),
            Response::Nack => Err(SerialError::Nack(command)),
            Response::Bad(byte) => {
                self.purge_and_log()?;
                Err(SerialError::BadResponse(byte))
            }
        }
    }

    fn read_chunks(&mut self, offset: u32, data: &mut [u8]) -> Result<(), SerialError> {
        let chunk_len = self.config.max_chunk_len();
        let mut address = offset;

        for chunk in data.chunks_mut(chunk_len) {
            self.read_block(address, chunk)?;
            address += chunk.len() as u32;
        }

        Ok(())
    }

    fn write_words(&mut self, offset: u32, data: &[u8]) -> Result<(), SerialError> {
        for (index, word) in data.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.write_word(offset + 4 * index as u32, value)?;
        }

        Ok(())
    }

    /// Reads `data.len()` bytes starting at `offset`, split into protocol sized chunks.
    ///
    /// A failing chunk aborts the read and the line is resynchronized.
    pub fn read_memory(&mut self, offset: u32, data: &mut [u8]) -> Result<(), SerialError> {
        if data.is_empty() {
            return Err(SerialError::BadInput("nothing to read"));
        }

        let result = self.read_chunks(offset, data);
        if result.is_err() {
            self.resynchronize();
        }
        result
    }

    /// Writes word aligned `data` to the word aligned `offset` one word at a time.
    pub fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), SerialError> {
        if offset % 4 != 0 || data.is_empty() || data.len() % 4 != 0 {
            return Err(SerialError::BadInput(
                "write address and length must be word aligned",
            ));
        }

        let result = self.write_words(offset, data);
        if result.is_err() {
            self.resynchronize();
        }
        result
    }

    /// Brings the packet parser of the embedded system back to its idle state.
    ///
    /// The fill pattern is never a valid command, so the firmware drops it. Errors are
    /// logged and otherwise ignored.
    pub fn resynchronize(&mut self) {
        let half_duplex = self.config.half_duplex;
        let send_timeout = self.config.send_timeout();
        let echo_timeout = self.config.echo_timeout();

        let Some(line) = self.line.as_mut() else {
            return;
        };

        tracing::warn!("Resynchronizing the serial line");

        if let Err(e) = line.write_all(&RESYNC_PATTERN, send_timeout) {
            tracing::warn!("Could not send the resync pattern: {e}");
        }

        if half_duplex {
            let mut echo = [0u8; PACKET_LEN];
            let mut received = 0;
            while received < echo.len() {
                match line.read(&mut echo[received..], echo_timeout) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received += n,
                }
            }
        }

        if let Err(e) = line.purge() {
            tracing::warn!("Could not purge the serial line: {e}");
        }
    }

    /// Drains bytes that arrived outside of an exchange and logs them.
    pub fn purge_and_log(&mut self) -> Result<(), SerialError> {
        let line = self.line()?;

        let waiting = line.bytes_waiting().map_err(SerialError::Receive)?;
        if waiting == 0 {
            return Ok(());
        }

        let mut stale = vec![0u8; waiting];
        let n = line
            .read(&mut stale, DRAIN_TIMEOUT)
            .map_err(SerialError::Receive)?;
        stale.truncate(n);

        tracing::warn!("Discarding {} unexpected bytes", stale.len());
        tracing::trace!("Unexpected bytes: {:02X?}", stale);

        line.purge().map_err(SerialError::Receive)
    }
}

impl MemoryTransport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.port
    }

    fn open(&mut self) -> Result<(), BridgeError> {
        if self.line.is_some() {
            return Ok(());
        }

        tracing::info!(
            "Opening serial port {} at {} baud",
            self.config.port,
            self.config.baud_rate
        );
        let line = (self.opener)(&self.config)?;
        self.line = Some(line);
        self.purge_and_log()?;

        Ok(())
    }

    fn close(&mut self) {
        if self.line.take().is_some() {
            tracing::debug!("Serial port {} closed", self.config.port);
        }
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), BridgeError> {
        Ok(SerialTransport::read_memory(self, address, data)?)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), BridgeError> {
        Ok(SerialTransport::write_memory(self, address, data)?)
    }

    fn flush(&mut self) -> Result<(), BridgeError> {
        Ok(self.purge_and_log()?)
    }

    fn handle_unexpected_messages(&mut self) -> Result<(), BridgeError> {
        Ok(self.purge_and_log()?)
    }

    fn execute_command(&mut self, _command: &str) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported(
            "commands are only possible with a remote-debug provider",
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake_target::{LineFault, SimulatedLine, TargetState};
    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn transport(state: &TargetState, half_duplex: bool, max_message_size: u32) -> SerialTransport {
        let mut config = SerialConfig::new("sim");
        config.half_duplex = half_duplex;
        config.max_message_size = max_message_size;

        let state = state.clone();
        let mut transport = SerialTransport::with_opener(config, move |config| {
            Ok(Box::new(SimulatedLine::new(state.clone(), config.half_duplex)) as Box<dyn SerialLine>)
        });
        MemoryTransport::open(&mut transport).unwrap();
        transport
    }

    #[test]
    fn write_then_read_returns_written_word() {
        let state = TargetState::with_capacity(0, 64);
        let mut transport = transport(&state, false, 65520);
        let mut rng = rand::thread_rng();

        for _ in 0..32 {
            let offset = 24 + 4 * rng.gen_range(0..64u32);
            let value: u32 = rng.gen();

            transport.write_word(offset, value).unwrap();

            let mut read_back = [0u8; 4];
            transport.read_memory(offset, &mut read_back).unwrap();
            assert_eq!(u32::from_le_bytes(read_back), value);
        }
    }

    #[test]
    fn chunked_read_equals_single_read() {
        let state = TargetState::with_capacity(0, 1024);
        state.fill_random();

        let mut single = vec![0u8; 4096 + 24];
        transport(&state, false, 65520)
            .read_memory(0, &mut single)
            .unwrap();

        let mut chunked = vec![0u8; 4096 + 24];
        transport(&state, false, 256)
            .read_memory(0, &mut chunked)
            .unwrap();

        assert_eq!(single, chunked);
        assert_eq!(single, state.snapshot());
        assert_eq!(state.read_commands(), 1 + 17);
    }

    #[test]
    fn half_duplex_echo_is_consumed() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, true, 65520);

        transport.write_word(4, 0x3).unwrap();

        let mut filter = [0u8; 4];
        transport.read_memory(4, &mut filter).unwrap();
        assert_eq!(u32::from_le_bytes(filter), 0x3);
    }

    #[test]
    fn corrupted_echo_fails_and_resynchronizes() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, true, 65520);

        for byte in 0..PACKET_LEN {
            state.inject_fault(LineFault::CorruptEcho(byte));

            let mut data = [0u8; 8];
            let error = transport.read_memory(0, &mut data).unwrap_err();
            assert!(matches!(error, SerialError::EchoMismatch), "byte {byte}: {error:?}");
            assert_eq!(error.code(), ErrorCode::ReceiveError);
            assert_eq!(state.resync_patterns_seen(), byte + 1);

            // The line is usable again afterwards.
            transport.read_memory(0, &mut data).unwrap();
            assert_eq!(data[..], state.snapshot()[..8]);
        }
    }

    #[test]
    fn failing_chunk_aborts_the_read() {
        let state = TargetState::with_capacity(0, 1024);
        let mut transport = transport(&state, false, 256);

        state.inject_fault(LineFault::DropResponse);

        let mut data = vec![0u8; 4096 + 24];
        let error = transport.read_memory(0, &mut data).unwrap_err();
        assert!(matches!(
            error,
            SerialError::ReceiveTimeout {
                kind: ReceiveKind::Data,
                ..
            }
        ));
        assert_eq!(state.read_commands(), 1, "remaining chunks are not requested");
        assert_eq!(state.resync_patterns_seen(), 1);
    }

    #[test]
    fn rejected_word_stops_a_multi_word_write() {
        // 32 buffer words: the structure ends at offset 152.
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);
        let writes = state.write_count();

        let data: Vec<u8> = [1u32, 2, 3, 4].iter().flat_map(|w| w.to_le_bytes()).collect();
        let error = transport.write_memory(144, &data).unwrap_err();

        assert!(matches!(error, SerialError::Nack(Command::WriteRtedbg)));
        assert_eq!(state.write_count(), writes + 2, "the fourth word is never sent");
        assert_eq!(state.word(144), 1);
        assert_eq!(state.word(148), 2);
        assert_eq!(state.resync_patterns_seen(), 1);
    }

    #[test]
    fn missing_acknowledge_stops_a_multi_word_write() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);
        let writes = state.write_count();

        state.inject_fault(LineFault::DropResponse);

        let error = transport.write_memory(24, &[0xAB; 16]).unwrap_err();
        assert!(matches!(
            error,
            SerialError::ReceiveTimeout {
                kind: ReceiveKind::Response,
                ..
            }
        ));
        assert_eq!(state.write_count(), writes + 1);
        assert_eq!(state.word(28), 0);
        assert_eq!(state.resync_patterns_seen(), 1);
    }

    #[test]
    fn write_outside_structure_is_rejected() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);

        let error = transport.write_word(4 * 1000, 1).unwrap_err();
        assert!(matches!(error, SerialError::Nack(Command::WriteRtedbg)));
        assert_eq!(error.code(), ErrorCode::Nack);
    }

    #[test]
    fn missing_response_is_a_timeout() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);

        state.inject_fault(LineFault::DropResponse);

        let error = transport.write_word(4, 0).unwrap_err();
        assert!(matches!(
            error,
            SerialError::ReceiveTimeout {
                kind: ReceiveKind::Response,
                received: 0,
                expected: 1
            }
        ));
    }

    #[test]
    fn stale_bytes_are_drained_before_a_command() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);

        state.inject_fault(LineFault::StaleBytes(vec![0x55, 0xAA, 0x0F]));
        transport.write_word(4, 0x7).unwrap();

        assert_eq!(state.word(4), 0x7);
    }

    #[test]
    fn unaligned_writes_are_bad_input() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);

        assert!(matches!(
            transport.write_memory(2, &[0; 4]),
            Err(SerialError::BadInput(_))
        ));
        assert!(matches!(
            transport.write_memory(4, &[0; 6]),
            Err(SerialError::BadInput(_))
        ));
        assert_eq!(state.resync_patterns_seen(), 0);
    }

    #[test]
    fn commands_are_refused() {
        let state = TargetState::with_capacity(0, 32);
        let mut transport = transport(&state, false, 65520);

        assert!(matches!(
            transport.execute_command("monitor reset"),
            Err(BridgeError::Unsupported(_))
        ));
    }
}
