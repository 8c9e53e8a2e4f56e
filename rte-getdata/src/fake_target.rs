#![allow(missing_docs)] // Don't require docs for test code
//! A simulated embedded system holding a `g_rtedbg` structure.
//!
//! The memory is shared between a [`FakeTarget`] (reached like a remote-debug provider,
//! absolute addresses) and a [`SimulatedLine`] (speaking the serial protocol, addresses
//! relative to the structure). Both record what the host did, so tests can check the
//! order of operations and inject faults.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use zerocopy::IntoBytes;

use crate::bridge::{MemoryBridge, MemoryTransport};
use crate::config::SerialConfig;
use crate::header::{ConfigWord, TargetControlHeader, FILTER_OFFSET, HEADER_SIZE};
use crate::provider::{DebugProvider, ProviderError, RemoteTransport};
use crate::serial::protocol::{Command, CommandPacket, ACK, PACKET_LEN, RESYNC_PATTERN};
use crate::serial::{SerialLine, SerialTransport};

/// Configuration word of a freshly initialized simulated target: six header words,
/// message filtering, filter-off and single shot support.
pub const DEFAULT_CONFIG: u32 = 0x0600_0007;

/// Timestamp frequency of the simulated target.
pub const DEFAULT_TIMESTAMP_FREQUENCY: u32 = 72_000_000;

/// An access performed through the [`FakeTarget`] provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect(String),
    Detach,
    Read { address: u32, len: usize },
    Write { address: u32, data: Vec<u8> },
    Command(String),
}

/// A fault the [`SimulatedLine`] injects into the next matching exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFault {
    /// Corrupt the given byte in the echo of the next packet (half-duplex only).
    CorruptEcho(usize),
    /// Execute the next command but do not answer.
    DropResponse,
    /// Bytes that are waiting on the line right now.
    StaleBytes(Vec<u8>),
}

#[derive(Debug)]
struct Inner {
    base: u32,
    memory: Vec<u8>,
    operations: Vec<Operation>,
    faults: VecDeque<LineFault>,
    rx: VecDeque<u8>,
    firmware_filter: Option<u32>,
    rejected_commands: Vec<String>,
    writes: usize,
    read_commands: usize,
    resyncs: usize,
}

impl Inner {
    fn range(&self, offset: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len)?;
        (end <= self.memory.len()).then_some(start..end)
    }

    fn read(&mut self, offset: u32, len: usize) -> Option<Vec<u8>> {
        let range = self.range(offset, len)?;
        let data = self.memory[range.clone()].to_vec();

        // The firmware turns logging back on while the host is still busy.
        if range.end == self.memory.len() {
            if let Some(filter) = self.firmware_filter.take() {
                self.put_word(FILTER_OFFSET, filter);
            }
        }

        Some(data)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        let Some(range) = self.range(offset, data.len()) else {
            return false;
        };
        self.memory[range].copy_from_slice(data);
        self.writes += 1;
        true
    }

    fn put_word(&mut self, offset: u32, value: u32) {
        let start = offset as usize;
        self.memory[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn take_fault(&mut self, wanted: &LineFault) -> bool {
        match self.faults.iter().position(|fault| fault == wanted) {
            Some(index) => {
                self.faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn take_echo_corruption(&mut self) -> Option<usize> {
        let index = self
            .faults
            .iter()
            .position(|fault| matches!(fault, LineFault::CorruptEcho(_)))?;

        match self.faults.remove(index) {
            Some(LineFault::CorruptEcho(byte)) => Some(byte),
            _ => None,
        }
    }
}

/// Shared memory and bookkeeping of the simulated target.
#[derive(Debug, Clone)]
pub struct TargetState(Arc<Mutex<Inner>>);

impl TargetState {
    /// A target with an initialized structure at `base` and a buffer of `words` words.
    pub fn with_capacity(base: u32, words: u32) -> Self {
        let header = TargetControlHeader::new(
            ConfigWord::from(DEFAULT_CONFIG),
            DEFAULT_TIMESTAMP_FREQUENCY,
            0,
            words,
        );
        Self::with_header(base, header)
    }

    /// A target with the given header and a zeroed buffer.
    pub fn with_header(base: u32, header: TargetControlHeader) -> Self {
        let mut memory = header.as_bytes().to_vec();
        memory.resize(HEADER_SIZE + header.buffer_size() as usize * 4, 0);

        Self(Arc::new(Mutex::new(Inner {
            base,
            memory,
            operations: Vec::new(),
            faults: VecDeque::new(),
            rx: VecDeque::new(),
            firmware_filter: None,
            rejected_commands: Vec::new(),
            writes: 0,
            read_commands: 0,
            resyncs: 0,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap()
    }

    /// Fills the circular buffer with random data, leaving the header alone.
    pub fn fill_random(&self) {
        let mut inner = self.lock();
        rand::thread_rng().fill_bytes(&mut inner.memory[HEADER_SIZE..]);
    }

    /// Copy of the complete structure.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().memory.clone()
    }

    /// The current header.
    pub fn header(&self) -> TargetControlHeader {
        let inner = self.lock();
        TargetControlHeader::from_prefix(&inner.memory).unwrap()
    }

    /// Word at `offset` from the start of the structure.
    pub fn word(&self, offset: u32) -> u32 {
        let inner = self.lock();
        let start = offset as usize;
        u32::from_le_bytes(inner.memory[start..start + 4].try_into().unwrap())
    }

    /// Sets the word at `offset` from the start of the structure, as the firmware would.
    pub fn set_word(&self, offset: u32, value: u32) {
        self.lock().put_word(offset, value);
    }

    /// After the next read that reaches the end of the structure, the firmware writes
    /// `filter` into the filter word.
    pub fn reenable_filter_after_copy(&self, filter: u32) {
        self.lock().firmware_filter = Some(filter);
    }

    /// Makes the provider reject `command`.
    pub fn reject_command(&self, command: &str) {
        self.lock().rejected_commands.push(command.to_string());
    }

    /// Queues a line fault.
    pub fn inject_fault(&self, fault: LineFault) {
        let mut inner = self.lock();
        match fault {
            LineFault::StaleBytes(bytes) => inner.rx.extend(bytes),
            fault => inner.faults.push_back(fault),
        }
    }

    /// Operations performed through the provider.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Provider writes only.
    pub fn provider_writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Write { address, data } => Some((*address, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of successful writes through either interface.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of read commands received on the serial line.
    pub fn read_commands(&self) -> usize {
        self.lock().read_commands
    }

    /// Number of resync patterns received on the serial line.
    pub fn resync_patterns_seen(&self) -> usize {
        self.lock().resyncs
    }
}

/// The simulated target reached through a remote-debug provider.
#[derive(Debug)]
pub struct FakeTarget {
    state: TargetState,
    connected: bool,
}

impl FakeTarget {
    pub const ENDPOINT: &'static str = "localhost:2331";

    pub fn new(state: TargetState) -> Self {
        Self {
            state,
            connected: false,
        }
    }

    /// A provider transport to `state`, connecting to [`Self::ENDPOINT`].
    pub fn transport(state: &TargetState) -> Box<dyn MemoryTransport> {
        Box::new(RemoteTransport::new(
            FakeTarget::new(state.clone()),
            Self::ENDPOINT,
        ))
    }

    fn offset(&self, address: u32, inner: &Inner) -> Result<u32, ProviderError> {
        address
            .checked_sub(inner.base)
            .ok_or_else(|| ProviderError::Reported(format!("cannot access {address:#010x}")))
    }

    fn ensure_connected(&self) -> Result<(), ProviderError> {
        if self.connected {
            Ok(())
        } else {
            Err(ProviderError::ConnectionClosed)
        }
    }
}

impl DebugProvider for FakeTarget {
    fn connect(&mut self, endpoint: &str) -> Result<(), ProviderError> {
        self.state
            .lock()
            .operations
            .push(Operation::Connect(endpoint.to_string()));
        self.connected = true;
        Ok(())
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), ProviderError> {
        self.ensure_connected()?;
        let mut inner = self.state.lock();
        inner.operations.push(Operation::Read {
            address,
            len: data.len(),
        });

        let offset = self.offset(address, &inner)?;
        let bytes = inner
            .read(offset, data.len())
            .ok_or_else(|| ProviderError::Reported(format!("cannot access {address:#010x}")))?;
        data.copy_from_slice(&bytes);
        Ok(())
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ProviderError> {
        self.ensure_connected()?;
        let mut inner = self.state.lock();
        inner.operations.push(Operation::Write {
            address,
            data: data.to_vec(),
        });

        let offset = self.offset(address, &inner)?;
        if inner.write(offset, data) {
            Ok(())
        } else {
            Err(ProviderError::Reported(format!(
                "cannot access {address:#010x}"
            )))
        }
    }

    fn detach(&mut self) {
        self.state.lock().operations.push(Operation::Detach);
        self.connected = false;
    }

    fn execute_command(&mut self, command: &str) -> Result<(), ProviderError> {
        self.ensure_connected()?;
        let mut inner = self.state.lock();
        inner.operations.push(Operation::Command(command.to_string()));

        if inner.rejected_commands.iter().any(|c| c == command) {
            return Err(ProviderError::Reported(format!("'{command}' failed")));
        }
        Ok(())
    }
}

/// A serial line connected to the simulated target's RTEcom command handler.
///
/// Reads never block: when no byte is queued, they report a timeout at once.
#[derive(Debug)]
pub struct SimulatedLine {
    state: TargetState,
    half_duplex: bool,
    packet: Vec<u8>,
}

impl SimulatedLine {
    pub fn new(state: TargetState, half_duplex: bool) -> Self {
        Self {
            state,
            half_duplex,
            packet: Vec::with_capacity(PACKET_LEN),
        }
    }

    fn execute(inner: &mut Inner, bytes: &[u8; PACKET_LEN]) {
        let packet = match CommandPacket::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!("Simulated target drops packet: {e}");
                return;
            }
        };

        let answer = match packet.command {
            Command::ReadRtedbg => {
                inner.read_commands += 1;
                match inner.read(packet.address, packet.data as usize) {
                    Some(data) => data,
                    None => return,
                }
            }
            Command::WriteRtedbg => {
                let written = packet
                    .address
                    .checked_mul(4)
                    .is_some_and(|offset| inner.write(offset, &packet.data.to_le_bytes()));
                vec![if written { ACK } else { packet.command as u8 }]
            }
            other => vec![other as u8],
        };

        if !inner.take_fault(&LineFault::DropResponse) {
            inner.rx.extend(answer);
        }
    }
}

impl SerialLine for SimulatedLine {
    fn write_all(&mut self, data: &[u8], _timeout: Duration) -> io::Result<()> {
        let mut inner = self.state.lock();

        if data == RESYNC_PATTERN {
            inner.resyncs += 1;
        }

        if self.half_duplex {
            let mut echo = data.to_vec();
            if data.len() == PACKET_LEN {
                if let Some(byte) = inner.take_echo_corruption() {
                    echo[byte % PACKET_LEN] ^= 0x5A;
                }
            }
            inner.rx.extend(echo);
        }

        for &byte in data {
            // The command byte of a packet is never 0xFF, so leading fill bytes are skipped.
            if self.packet.is_empty() && byte == 0xFF {
                continue;
            }

            self.packet.push(byte);
            if let Ok(bytes) = <[u8; PACKET_LEN]>::try_from(self.packet.as_slice()) {
                self.packet.clear();
                Self::execute(&mut inner, &bytes);
            }
        }

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut inner = self.state.lock();
        let n = buf.len().min(inner.rx.len());
        for (slot, byte) in buf.iter_mut().zip(inner.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bytes_waiting(&mut self) -> io::Result<usize> {
        Ok(self.state.lock().rx.len())
    }

    fn purge(&mut self) -> io::Result<()> {
        self.state.lock().rx.clear();
        self.packet.clear();
        Ok(())
    }
}

/// A bridge to `state` through the provider interface.
pub fn open_bridge(state: &TargetState) -> MemoryBridge {
    MemoryBridge::open(FakeTarget::transport(state), false).unwrap()
}

/// A bridge to `state` through the serial protocol.
pub fn open_serial_bridge(state: &TargetState, half_duplex: bool) -> MemoryBridge {
    let mut config = SerialConfig::new("simulated");
    config.half_duplex = half_duplex;

    let line_state = state.clone();
    let transport = SerialTransport::with_opener(config, move |config| {
        Ok(Box::new(SimulatedLine::new(line_state.clone(), config.half_duplex)) as Box<dyn SerialLine>)
    });

    MemoryBridge::open(Box::new(transport), false).unwrap()
}
