//! Logging mode changes and the buffer reset policy.
//!
//! In post-mortem mode the firmware overwrites the oldest messages once the circular
//! buffer is full. In single shot mode it stops logging after the buffer has been filled
//! once, so the index must be reset to restart logging.

use std::fmt;

use crate::bridge::{BridgeError, MemoryBridge};
use crate::config::TransferParameters;
use crate::filter;
use crate::header::{
    field_address, ConfigWord, HeaderError, TargetControlHeader, CONFIG_OFFSET, HEADER_SIZE,
    INDEX_OFFSET, MIN_BUFFER_SIZE,
};

/// Errors while changing the logging mode.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ModeError {
    /// Single shot logging is not enabled in the firmware.
    SingleShotUnsupported,

    /// The timestamp frequency must not be zero.
    ZeroFrequency,

    /// The size of the structure must be given to initialize it.
    SizeRequired,

    /// The structure size must be divisible by 4 and at least {MIN_BUFFER_SIZE} bytes, got {0}.
    BadSize(u32),

    /// Invalid logging structure header.
    Header(#[from] HeaderError),

    /// Could not access the target.
    Bridge(#[from] BridgeError),
}

/// Result of a successful mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Single shot logging was enabled and restarted.
    SingleShotStarted,
    /// Post-mortem logging was already active and has been restarted.
    PostMortemRestarted,
    /// Single shot logging was switched off, post-mortem logging restarted.
    SwitchedToPostMortem,
}

impl fmt::Display for ModeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModeChange::SingleShotStarted => "Single shot logging mode enabled and restarted.",
            ModeChange::PostMortemRestarted => "Post-mortem mode restarted.",
            ModeChange::SwitchedToPostMortem => {
                "Post-mortem logging mode enabled and restarted."
            }
        })
    }
}

/// Applies the buffer reset policy after the buffer has been read or the mode changed.
///
/// With `clear` the circular buffer is filled with `0xFFFFFFFF`. The write index is reset
/// when the buffer was cleared or single shot logging is active, so that logging
/// restarts at the beginning of the buffer.
pub fn reset_buffer(
    bridge: &mut MemoryBridge,
    structure_address: u32,
    header: &TargetControlHeader,
    clear: bool,
) -> Result<(), BridgeError> {
    if clear {
        let fill = vec![0xFF; header.buffer_size() as usize * 4];
        tracing::info!("Clearing the circular buffer ({} bytes)", fill.len());
        bridge.write_memory(field_address(structure_address, HEADER_SIZE as u32)?, &fill)?;
    }

    if clear || header.is_single_shot() {
        erase_index(bridge, structure_address)?;
    }

    Ok(())
}

fn erase_index(bridge: &mut MemoryBridge, structure_address: u32) -> Result<(), BridgeError> {
    bridge.write_word(field_address(structure_address, INDEX_OFFSET)?, 0)
}

/// Switches the logging mode of a running target.
#[derive(Debug)]
pub struct ModeController<'a> {
    params: &'a TransferParameters,
}

impl<'a> ModeController<'a> {
    pub fn new(params: &'a TransferParameters) -> Self {
        Self { params }
    }

    fn load_header(&self, bridge: &mut MemoryBridge) -> Result<TargetControlHeader, ModeError> {
        let header = TargetControlHeader::read(bridge, self.params.start_address)?;
        header.validate()?;
        header.transfer_size()?;
        Ok(header)
    }

    fn write_config(
        &self,
        bridge: &mut MemoryBridge,
        cfg: ConfigWord,
    ) -> Result<(), BridgeError> {
        bridge.write_word(field_address(self.params.start_address, CONFIG_OFFSET)?, cfg.into())
    }

    fn restore_filter(
        &self,
        bridge: &mut MemoryBridge,
        previous: u32,
        header: &TargetControlHeader,
    ) -> Result<(), BridgeError> {
        let value = filter::restore_value(previous, Some(header), self.params.filter);
        filter::write(bridge, self.params.start_address, value)
    }

    /// Enables single shot logging and restarts logging at the start of the buffer.
    ///
    /// Nothing is written if the header cannot be read or the firmware does not support
    /// single shot logging.
    pub fn switch_to_single_shot(&self, bridge: &mut MemoryBridge) -> Result<ModeChange, ModeError> {
        let mut header = self.load_header(bridge)?;

        let mut cfg = header.config();
        if !cfg.single_shot_enabled() {
            return Err(ModeError::SingleShotUnsupported);
        }

        let previous = filter::pause_logging(bridge, self.params.start_address)?;

        cfg.set_single_shot_active(true);
        header.set_config(cfg);
        self.write_config(bridge, cfg)?;

        reset_buffer(
            bridge,
            self.params.start_address,
            &header,
            self.params.clear_buffer,
        )?;
        self.restore_filter(bridge, previous, &header)?;

        tracing::info!("{}", ModeChange::SingleShotStarted);
        Ok(ModeChange::SingleShotStarted)
    }

    /// Disables single shot logging if it was active and restarts post-mortem logging.
    pub fn switch_to_post_mortem(&self, bridge: &mut MemoryBridge) -> Result<ModeChange, ModeError> {
        let mut header = self.load_header(bridge)?;
        let previous = filter::pause_logging(bridge, self.params.start_address)?;

        let mut cfg = header.config();
        let was_single_shot = cfg.single_shot_active();
        if was_single_shot {
            cfg.set_single_shot_active(false);
            header.set_config(cfg);
            self.write_config(bridge, cfg)?;
        }

        reset_buffer(
            bridge,
            self.params.start_address,
            &header,
            self.params.clear_buffer,
        )?;

        if let Err(e) = erase_index(bridge, self.params.start_address) {
            tracing::warn!("The buffer index may not be reset properly: {e}");
        }

        self.restore_filter(bridge, previous, &header)?;

        let change = if was_single_shot {
            ModeChange::SwitchedToPostMortem
        } else {
            ModeChange::PostMortemRestarted
        };
        tracing::info!("{change}");
        Ok(change)
    }

    /// Writes a fresh header for firmware that does not call `rte_init()`.
    ///
    /// The capacity follows from the configured structure size, the filter backup and the
    /// filter enabled afterwards from the configured filter value.
    pub fn initialize_structure(
        &self,
        bridge: &mut MemoryBridge,
        cfg: u32,
        timestamp_frequency: u32,
    ) -> Result<TargetControlHeader, ModeError> {
        if timestamp_frequency == 0 {
            return Err(ModeError::ZeroFrequency);
        }
        let size = self.params.size;
        if size == 0 {
            return Err(ModeError::SizeRequired);
        }
        if size < MIN_BUFFER_SIZE || size % 4 != 0 {
            return Err(ModeError::BadSize(size));
        }

        let filter = self.params.filter.unwrap_or(0);
        let words = (size - HEADER_SIZE as u32) / 4;
        let header =
            TargetControlHeader::new(ConfigWord::from(cfg), timestamp_frequency, filter, words);
        header.transfer_size()?;

        filter::write(bridge, self.params.start_address, 0)?;
        bridge.write_memory(self.params.start_address, zerocopy::IntoBytes::as_bytes(&header))?;
        reset_buffer(
            bridge,
            self.params.start_address,
            &header,
            self.params.clear_buffer,
        )?;

        if filter != 0 {
            filter::write(bridge, self.params.start_address, filter)?;
        }

        tracing::info!("The logging structure has been initialized");
        Ok(header)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake_target::{self, TargetState};
    use crate::header::FILTER_OFFSET;
    use pretty_assertions::assert_eq;

    const BASE: u32 = 0x2000_0000;

    fn params() -> TransferParameters {
        TransferParameters {
            start_address: BASE,
            ..Default::default()
        }
    }

    #[test]
    fn single_shot_transition() {
        let state = TargetState::with_capacity(BASE, 256);
        state.set_word(INDEX_OFFSET, 500);
        state.set_word(FILTER_OFFSET, 0x3);
        let mut bridge = fake_target::open_bridge(&state);

        let params = params();
        let change = ModeController::new(&params)
            .switch_to_single_shot(&mut bridge)
            .unwrap();

        assert_eq!(change, ModeChange::SingleShotStarted);
        assert!(state.header().config().single_shot_active());
        assert_eq!(state.word(INDEX_OFFSET), 0);
        assert_eq!(state.word(FILTER_OFFSET), 0x3);

        let writes: Vec<u32> = state.provider_writes().iter().map(|(a, _)| a - BASE).collect();
        assert_eq!(writes, vec![FILTER_OFFSET, CONFIG_OFFSET, INDEX_OFFSET, FILTER_OFFSET]);
    }

    #[test]
    fn single_shot_needs_firmware_support() {
        let mut cfg = ConfigWord::from(fake_target::DEFAULT_CONFIG);
        cfg.set_single_shot_enabled(false);
        let header = TargetControlHeader::new(cfg, 1_000_000, 0, 256);
        let state = TargetState::with_header(BASE, header);
        let mut bridge = fake_target::open_bridge(&state);

        let params = params();
        let result = ModeController::new(&params).switch_to_single_shot(&mut bridge);

        assert!(matches!(result, Err(ModeError::SingleShotUnsupported)));
        assert!(state.provider_writes().is_empty());
    }

    #[test]
    fn post_mortem_clears_buffer_and_mode() {
        let mut cfg = ConfigWord::from(fake_target::DEFAULT_CONFIG);
        cfg.set_single_shot_active(true);
        let state = TargetState::with_header(BASE, TargetControlHeader::new(cfg, 1_000_000, 0, 64));
        state.fill_random();
        state.set_word(INDEX_OFFSET, 17);
        state.set_word(FILTER_OFFSET, 0x8000_0000);
        let mut bridge = fake_target::open_bridge(&state);

        let params = TransferParameters {
            clear_buffer: true,
            ..params()
        };
        let change = ModeController::new(&params)
            .switch_to_post_mortem(&mut bridge)
            .unwrap();

        assert_eq!(change, ModeChange::SwitchedToPostMortem);
        assert!(!state.header().config().single_shot_active());
        assert_eq!(state.word(INDEX_OFFSET), 0);
        assert_eq!(state.word(FILTER_OFFSET), 0x8000_0000);
        assert!(state.snapshot()[HEADER_SIZE..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn post_mortem_restart_keeps_config() {
        let state = TargetState::with_capacity(BASE, 64);
        state.set_word(INDEX_OFFSET, 9);
        let mut bridge = fake_target::open_bridge(&state);

        let params = params();
        let change = ModeController::new(&params)
            .switch_to_post_mortem(&mut bridge)
            .unwrap();

        assert_eq!(change, ModeChange::PostMortemRestarted);
        assert_eq!(state.header().rte_cfg(), fake_target::DEFAULT_CONFIG);
        assert_eq!(state.word(INDEX_OFFSET), 0);
    }

    #[test]
    fn reset_policy_leaves_post_mortem_index_alone() {
        let state = TargetState::with_capacity(BASE, 64);
        state.set_word(INDEX_OFFSET, 33);
        let mut bridge = fake_target::open_bridge(&state);

        reset_buffer(&mut bridge, BASE, &state.header(), false).unwrap();

        assert_eq!(state.word(INDEX_OFFSET), 33);
        assert!(state.provider_writes().is_empty());
    }

    #[test]
    fn initialize_writes_fresh_header() {
        let state = TargetState::with_capacity(BASE, 64);
        state.set_word(CONFIG_OFFSET, 0xFFFF_FFFF);
        let mut bridge = fake_target::open_bridge(&state);

        let params = TransferParameters {
            size: 64 * 4 + HEADER_SIZE as u32,
            filter: Some(0x1),
            clear_buffer: true,
            ..params()
        };
        ModeController::new(&params)
            .initialize_structure(&mut bridge, fake_target::DEFAULT_CONFIG, 48_000_000)
            .unwrap();

        let header = state.header();
        assert_eq!(header.rte_cfg(), fake_target::DEFAULT_CONFIG);
        assert_eq!(header.timestamp_frequency(), 48_000_000);
        assert_eq!(header.buffer_size(), 64);
        assert_eq!(header.filter_copy(), 0x1);
        assert_eq!(header.filter(), 0x1);
        assert_eq!(header.last_index(), 0);
    }

    #[test]
    fn initialize_requires_size_and_frequency() {
        let state = TargetState::with_capacity(BASE, 64);
        let mut bridge = fake_target::open_bridge(&state);

        let params = params();
        let controller = ModeController::new(&params);
        assert!(matches!(
            controller.initialize_structure(&mut bridge, 0x0600_0001, 0),
            Err(ModeError::ZeroFrequency)
        ));
        assert!(matches!(
            controller.initialize_structure(&mut bridge, 0x0600_0001, 1_000_000),
            Err(ModeError::SizeRequired)
        ));
    }

    #[test]
    fn initialize_rejects_implausible_size() {
        let state = TargetState::with_capacity(BASE, 64);
        let mut bridge = fake_target::open_bridge(&state);

        for size in [16, 76, 82] {
            let params = TransferParameters {
                size,
                ..params()
            };
            let result = ModeController::new(&params).initialize_structure(
                &mut bridge,
                fake_target::DEFAULT_CONFIG,
                1_000_000,
            );
            assert!(
                matches!(result, Err(ModeError::BadSize(s)) if s == size),
                "size {size}: {result:?}"
            );
        }
        assert!(state.provider_writes().is_empty());
    }
}
