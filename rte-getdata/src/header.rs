//! Header of the `g_rtedbg` logging structure.
//!
//! The structure starts with six little endian words, followed by the circular buffer:
//!
//! | offset | field                 |
//! |--------|-----------------------|
//! | 0      | `last_index`          |
//! | 4      | `filter`              |
//! | 8      | `rte_cfg`             |
//! | 12     | `timestamp_frequency` |
//! | 16     | `filter_copy`         |
//! | 20     | `buffer_size` (words) |

use std::fmt;

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bridge::{BridgeError, MemoryBridge};

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Offset of `last_index`.
pub const INDEX_OFFSET: u32 = 0;

/// Offset of the message filter word.
pub const FILTER_OFFSET: u32 = 4;

/// Offset of the configuration word.
pub const CONFIG_OFFSET: u32 = 8;

/// Smallest plausible size of the complete structure in bytes.
pub const MIN_BUFFER_SIZE: u32 = 80;

/// Largest plausible size of the complete structure in bytes.
pub const MAX_BUFFER_SIZE: u32 = 2_100_000;

/// Address of the field at `offset` in the structure at `structure_address`.
pub fn field_address(structure_address: u32, offset: u32) -> Result<u32, BridgeError> {
    structure_address
        .checked_add(offset)
        .ok_or(BridgeError::BadInput("address beyond the 32-bit address space"))
}

/// Header words as they are laid out in target memory.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TargetControlHeader {
    last_index: U32,
    filter: U32,
    rte_cfg: U32,
    timestamp_frequency: U32,
    filter_copy: U32,
    buffer_size: U32,
}

const_assert_eq!(std::mem::size_of::<TargetControlHeader>(), HEADER_SIZE);

bitfield::bitfield! {
    /// The `rte_cfg` configuration word.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ConfigWord(u32);
    impl Debug;
    /// Message filtering is compiled into the firmware.
    pub msg_filtering, set_msg_filtering: 0;
    /// The firmware keeps the previous filter in `filter_copy` when it disables logging.
    pub filter_off, set_filter_off: 1;
    /// The firmware supports single shot logging.
    pub single_shot_enabled, set_single_shot_enabled: 2;
    /// Single shot logging is active.
    pub single_shot_active, set_single_shot_active: 3;
    /// Long timestamps are in use.
    pub long_timestamp, set_long_timestamp: 4;
    pub u8, reserved, _: 7, 5;
    /// Divider exponent of the timestamp timer.
    pub u8, timestamp_shift, set_timestamp_shift: 11, 8;
    /// Number of bits used for the format id.
    pub u8, fmt_id_bits, set_fmt_id_bits: 15, 12;
    pub u8, reserved2, _: 23, 16;
    /// Header size in 32-bit words.
    pub u8, header_words, set_header_words: 31, 24;
}

impl From<u32> for ConfigWord {
    fn from(raw: u32) -> Self {
        ConfigWord(raw)
    }
}

impl From<ConfigWord> for u32 {
    fn from(value: ConfigWord) -> Self {
        value.0
    }
}

/// Errors in the header read from the target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum HeaderError {
    /// Invalid header configuration word {cfg:#010x}. Check that the structure address is correct and that rte_init() has been called.
    Invalid {
        /// The configuration word.
        cfg: u32,
    },

    /// The buffer size in the header is too small ({0} < {MIN_BUFFER_SIZE} bytes). Check that the structure address is correct and that rte_init() has been called.
    TooSmall(u64),

    /// The buffer size in the header is too large ({0} > {MAX_BUFFER_SIZE} bytes). Check that the structure address is correct and that rte_init() has been called.
    TooLarge(u64),
}

impl TargetControlHeader {
    /// Creates a header for a freshly initialized structure.
    pub fn new(cfg: ConfigWord, timestamp_frequency: u32, filter_copy: u32, buffer_words: u32) -> Self {
        Self {
            last_index: U32::new(0),
            filter: U32::new(0),
            rte_cfg: U32::new(cfg.into()),
            timestamp_frequency: U32::new(timestamp_frequency),
            filter_copy: U32::new(filter_copy),
            buffer_size: U32::new(buffer_words),
        }
    }

    /// Decodes the header from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(header, _)| header)
    }

    /// Reads the header from the structure at `address`.
    pub fn read(bridge: &mut MemoryBridge, address: u32) -> Result<Self, BridgeError> {
        let mut bytes = [0u8; HEADER_SIZE];
        bridge.read_memory(address, &mut bytes)?;

        Self::from_prefix(&bytes).ok_or(BridgeError::BadInput("short header"))
    }

    /// Last write index into the circular buffer.
    pub fn last_index(&self) -> u32 {
        self.last_index.get()
    }

    /// Active message filter, zero when logging is disabled.
    pub fn filter(&self) -> u32 {
        self.filter.get()
    }

    /// Replaces the filter value.
    pub fn set_filter(&mut self, filter: u32) {
        self.filter = U32::new(filter);
    }

    /// The raw configuration word.
    pub fn rte_cfg(&self) -> u32 {
        self.rte_cfg.get()
    }

    /// The decoded configuration word.
    pub fn config(&self) -> ConfigWord {
        ConfigWord(self.rte_cfg())
    }

    /// Replaces the configuration word.
    pub fn set_config(&mut self, cfg: ConfigWord) {
        self.rte_cfg = U32::new(cfg.into());
    }

    /// Clock frequency of the timestamp timer in Hz.
    pub fn timestamp_frequency(&self) -> u32 {
        self.timestamp_frequency.get()
    }

    /// Filter value saved by the firmware when it disabled logging.
    pub fn filter_copy(&self) -> u32 {
        self.filter_copy.get()
    }

    /// Capacity of the circular buffer in 32-bit words.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.get()
    }

    /// Checks the configuration word for plausibility.
    pub fn validate(&self) -> Result<(), HeaderError> {
        let cfg = self.config();

        if usize::from(cfg.header_words()) * 4 != HEADER_SIZE
            || cfg.reserved() != 0
            || cfg.reserved2() != 0
        {
            return Err(HeaderError::Invalid { cfg: cfg.0 });
        }

        Ok(())
    }

    /// Size of the complete structure (header and buffer) in bytes, checked against the
    /// plausible bounds.
    pub fn transfer_size(&self) -> Result<u32, HeaderError> {
        let size = u64::from(self.buffer_size()) * 4 + HEADER_SIZE as u64;

        if size < u64::from(MIN_BUFFER_SIZE) {
            Err(HeaderError::TooSmall(size))
        } else if size > u64::from(MAX_BUFFER_SIZE) {
            Err(HeaderError::TooLarge(size))
        } else {
            Ok(size as u32)
        }
    }

    /// Timestamp counting frequency in MHz.
    pub fn timestamp_mhz(&self) -> f64 {
        let divider = (1u64 << self.config().timestamp_shift()) as f64;
        f64::from(self.timestamp_frequency()) / 1e6 / divider
    }

    /// Fill level of the circular buffer in percent, meaningful in single shot mode.
    pub fn buffer_usage_percent(&self) -> u32 {
        let size = u64::from(self.buffer_size().saturating_sub(4).max(1));
        let usage = (100 * u64::from(self.last_index()) + size / 2) / size;
        usage.min(100) as u32
    }

    /// Whether the target currently logs in single shot mode.
    pub fn is_single_shot(&self) -> bool {
        let cfg = self.config();
        cfg.single_shot_enabled() && cfg.single_shot_active()
    }
}

impl fmt::Debug for TargetControlHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetControlHeader")
            .field("last_index", &self.last_index())
            .field("filter", &format_args!("{:#010x}", self.filter()))
            .field("rte_cfg", &format_args!("{:#010x}", self.rte_cfg()))
            .field("timestamp_frequency", &self.timestamp_frequency())
            .field("filter_copy", &format_args!("{:#010x}", self.filter_copy()))
            .field("buffer_size", &self.buffer_size())
            .finish()
    }
}

impl fmt::Display for TargetControlHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.config();

        write!(
            f,
            "Circular buffer size: {} words, last index: {}, timestamp frequency: {} MHz, long timestamps {}, {} mode",
            self.buffer_size(),
            self.last_index(),
            self.timestamp_mhz(),
            if cfg.long_timestamp() { "enabled" } else { "disabled" },
            if self.is_single_shot() { "single shot" } else { "post-mortem" },
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    fn valid_config() -> ConfigWord {
        let mut cfg = ConfigWord(0);
        cfg.set_header_words(6);
        cfg.set_msg_filtering(true);
        cfg
    }

    fn header(cfg: u32, buffer_words: u32) -> TargetControlHeader {
        TargetControlHeader::new(ConfigWord(cfg), 72_000_000, 0, buffer_words)
    }

    #[test]
    fn layout_matches_target_memory() {
        let header = TargetControlHeader::new(valid_config(), 0x0A0B_0C0D, 0x11, 1024);
        let bytes = header.as_bytes();

        assert_eq!(&bytes[8..12], &valid_config().0.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&bytes[16..20], &[0x11, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &1024u32.to_le_bytes());
        assert_eq!(TargetControlHeader::from_prefix(bytes), Some(header));
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(TargetControlHeader::from_prefix(&[0; 20]), None);
    }

    #[test_case(0x0600_0001 => Ok(()); "valid")]
    #[test_case(0x0500_0001 => Err(HeaderError::Invalid { cfg: 0x0500_0001 }); "wrong header size")]
    #[test_case(0x0600_0021 => Err(HeaderError::Invalid { cfg: 0x0600_0021 }); "reserved bit set")]
    #[test_case(0x0601_0001 => Err(HeaderError::Invalid { cfg: 0x0601_0001 }); "reserved2 bit set")]
    #[test_case(0xFFFF_FFFF => Err(HeaderError::Invalid { cfg: 0xFFFF_FFFF }); "erased memory")]
    fn validation(cfg: u32) -> Result<(), HeaderError> {
        header(cfg, 1024).validate()
    }

    #[test_case(1024 => Ok(4120); "typical")]
    #[test_case(14 => Ok(80); "smallest")]
    #[test_case(13 => Err(HeaderError::TooSmall(76)); "too small")]
    #[test_case(524_994 => Ok(2_100_000); "largest")]
    #[test_case(524_995 => Err(HeaderError::TooLarge(2_100_004)); "too large")]
    #[test_case(u32::MAX => Err(HeaderError::TooLarge(17_179_869_204)); "no overflow")]
    fn size_bounds(buffer_words: u32) -> Result<u32, HeaderError> {
        header(valid_config().0, buffer_words).transfer_size()
    }

    #[test]
    fn field_address_does_not_wrap() {
        assert_eq!(field_address(0x2000_0000, FILTER_OFFSET).unwrap(), 0x2000_0004);
        assert!(matches!(
            field_address(0xFFFF_FFFC, CONFIG_OFFSET),
            Err(BridgeError::BadInput(_))
        ));
    }

    #[test]
    fn timestamp_frequency_honours_the_shift() {
        let mut cfg = valid_config();
        cfg.set_timestamp_shift(2);
        let header = TargetControlHeader::new(cfg, 80_000_000, 0, 1024);

        assert_eq!(header.timestamp_mhz(), 20.0);
    }

    #[test]
    fn buffer_usage_is_capped() {
        let mut bytes = header(valid_config().0, 104).as_bytes().to_vec();
        bytes[..4].copy_from_slice(&50u32.to_le_bytes());
        let half = TargetControlHeader::from_prefix(&bytes).unwrap();
        assert_eq!(half.buffer_usage_percent(), 50);

        bytes[..4].copy_from_slice(&500u32.to_le_bytes());
        let over = TargetControlHeader::from_prefix(&bytes).unwrap();
        assert_eq!(over.buffer_usage_percent(), 100);
    }
}
