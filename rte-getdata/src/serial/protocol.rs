//! Packet format of the RTEcom serial protocol.
//!
//! The host always sends a fixed 10 byte packet:
//!
//! | byte | content                                         |
//! |------|-------------------------------------------------|
//! | 0    | command                                         |
//! | 1    | checksum: `0x0F` XOR the eight bytes that follow |
//! | 2..6 | address or word index (little endian)           |
//! | 6..10| length or data word (little endian)             |
//!
//! Write commands are answered with a single byte. `0x0F` (the checksum seed) is an ACK,
//! the echoed command byte is a NACK. Read commands are answered with exactly the
//! requested number of bytes. A packet with a bad checksum is not answered at all.

use std::fmt;

/// Seed of the packet checksum. The same value is used as the ACK byte.
pub const CHECKSUM_SEED: u8 = 0x0F;

/// Positive acknowledge sent by the embedded system.
pub const ACK: u8 = CHECKSUM_SEED;

/// Length of every packet sent by the host.
pub const PACKET_LEN: usize = 10;

/// Maximum length of a data block the embedded system sends in one response.
pub const MAX_RECEIVE_LEN: usize = 65536 - 16;

/// Fill pattern sent to bring the embedded system's packet parser back to a known state.
pub const RESYNC_PATTERN: [u8; PACKET_LEN] = [0xFF; PACKET_LEN];

/// Commands understood by the embedded system.
///
/// Only [`Command::WriteRtedbg`] and [`Command::ReadRtedbg`] are mandatory for the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Write a 32-bit word into the `g_rtedbg` structure. The address is a word index.
    WriteRtedbg = 0,
    /// Read bytes from the `g_rtedbg` structure. The address is relative to its start.
    ReadRtedbg = 1,
    /// Read bytes from an absolute address.
    Read = 2,
    /// Write a 32-bit value to an absolute address.
    Write32 = 3,
    /// Write a 16-bit value to an absolute address.
    Write16 = 4,
    /// Write an 8-bit value to an absolute address.
    Write8 = 5,
}

impl TryFrom<u8> for Command {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::WriteRtedbg),
            1 => Ok(Command::ReadRtedbg),
            2 => Ok(Command::Read),
            3 => Ok(Command::Write32),
            4 => Ok(Command::Write16),
            5 => Ok(Command::Write8),
            other => Err(PacketError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::WriteRtedbg => "WRITE_RTEDBG",
            Command::ReadRtedbg => "READ_RTEDBG",
            Command::Read => "READ",
            Command::Write32 => "WRITE32",
            Command::Write16 => "WRITE16",
            Command::Write8 => "WRITE8",
        };
        f.write_str(name)
    }
}

/// Error while decoding a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum PacketError {
    /// Unknown command byte {0:#04x}.
    UnknownCommand(u8),

    /// Bad packet checksum: expected {expected:#04x}, found {found:#04x}.
    BadChecksum {
        /// Checksum computed over the payload.
        expected: u8,
        /// Checksum carried by the packet.
        found: u8,
    },
}

/// Computes the packet checksum over the address and data bytes.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(CHECKSUM_SEED, |acc, byte| acc ^ byte)
}

/// A single host to target packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    /// The command to execute.
    pub command: Command,
    /// Address, word index or offset, depending on the command.
    pub address: u32,
    /// Length for reads, value for writes.
    pub data: u32,
}

impl CommandPacket {
    /// Creates a new packet.
    pub fn new(command: Command, address: u32, data: u32) -> Self {
        Self {
            command,
            address,
            data,
        }
    }

    /// The checksum carried in byte 1 of the encoded packet.
    pub fn checksum(&self) -> u8 {
        checksum(&self.payload())
    }

    fn payload(&self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.address.to_le_bytes());
        payload[4..].copy_from_slice(&self.data.to_le_bytes());
        payload
    }

    /// Encodes the packet for transmission.
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut bytes = [0u8; PACKET_LEN];
        bytes[0] = self.command as u8;
        bytes[1] = self.checksum();
        bytes[2..].copy_from_slice(&self.payload());
        bytes
    }

    /// Decodes a packet as the embedded system does, verifying the checksum.
    pub fn from_bytes(bytes: &[u8; PACKET_LEN]) -> Result<Self, PacketError> {
        let command = Command::try_from(bytes[0])?;
        let expected = checksum(&bytes[2..]);
        if expected != bytes[1] {
            return Err(PacketError::BadChecksum {
                expected,
                found: bytes[1],
            });
        }

        let address = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let data = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);

        Ok(Self {
            command,
            address,
            data,
        })
    }
}

impl fmt::Display for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{ address: {:#X}, data: {:#X} }}",
            self.command, self.address, self.data
        )
    }
}

/// Classification of the single response byte to a write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The command was executed.
    Ack,
    /// The command was rejected, e.g. the index is outside of the structure.
    Nack,
    /// Anything else. The byte stream is out of sync.
    Bad(u8),
}

impl Response {
    /// Classifies `byte` as the answer to `command`.
    pub fn classify(byte: u8, command: Command) -> Self {
        if byte == ACK {
            Response::Ack
        } else if byte == command as u8 {
            Response::Nack
        } else {
            Response::Bad(byte)
        }
    }
}
