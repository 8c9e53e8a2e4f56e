//! Handling of the message filter word.
//!
//! The firmware only logs a message when its filter bit is set. Writing zero pauses
//! logging, which keeps the circular buffer stable while it is copied to the host.

use std::fs;
use std::io;
use std::path::Path;

use crate::bridge::{BridgeError, MemoryBridge};
use crate::header::{field_address, TargetControlHeader, FILTER_OFFSET};

/// Reads the live filter of the structure at `structure_address`.
pub fn read(bridge: &mut MemoryBridge, structure_address: u32) -> Result<u32, BridgeError> {
    bridge.read_word(field_address(structure_address, FILTER_OFFSET)?)
}

/// Writes the filter of the structure at `structure_address`.
pub fn write(
    bridge: &mut MemoryBridge,
    structure_address: u32,
    value: u32,
) -> Result<(), BridgeError> {
    bridge.write_word(field_address(structure_address, FILTER_OFFSET)?, value)
}

/// Pauses logging and returns the filter value that was active before.
///
/// Nothing is written if logging is already paused.
pub fn pause_logging(
    bridge: &mut MemoryBridge,
    structure_address: u32,
) -> Result<u32, BridgeError> {
    let previous = read(bridge, structure_address)?;

    if previous != 0 {
        write(bridge, structure_address, 0)?;
        tracing::debug!("Logging paused, previous filter {previous:#010x}");
    }

    Ok(previous)
}

/// The filter value to write once a transfer or mode change is complete.
///
/// A user supplied value always wins, zero included. Otherwise the value from before
/// the pause is restored. If that was zero and the firmware keeps a backup of the filter
/// (filter-off support), the backup is used.
pub fn restore_value(
    previous: u32,
    header: Option<&TargetControlHeader>,
    user_filter: Option<u32>,
) -> u32 {
    if let Some(value) = user_filter {
        return value;
    }

    match header {
        Some(header) if previous == 0 && header.config().filter_off() => header.filter_copy(),
        _ => previous,
    }
}

/// Names of the 32 message filters, read from a text file with one name per line.
///
/// The first line names filter 0 (the most significant filter bit). Empty lines mark
/// unused filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterNames {
    names: Vec<String>,
}

impl FilterNames {
    /// Loads the names from `path`.
    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Parses the file contents.
    pub fn parse(text: &str) -> Self {
        Self {
            names: text.lines().take(32).map(|l| l.trim().to_string()).collect(),
        }
    }

    /// The name of filter `number`, if one is defined.
    pub fn name(&self, number: u8) -> Option<&str> {
        self.names
            .get(usize::from(number))
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// Numbers of the filters enabled in `filter`. Filter 0 is the most significant bit.
pub fn enabled(filter: u32) -> impl Iterator<Item = u8> {
    (0..32u8).filter(move |number| filter & (0x8000_0000 >> number) != 0)
}

/// Describes the filters enabled in `filter`, by name if `names` are available.
pub fn describe(filter: u32, names: Option<&FilterNames>) -> String {
    if filter == 0 {
        return "Message filter is zero (data logging disabled).".to_string();
    }

    let mut text = format!("Enabled message filters ({filter:#010X}): ");
    match names {
        Some(names) => {
            for number in enabled(filter) {
                if let Some(name) = names.name(number) {
                    text.push_str(&format!("\n{number:2} - {name}"));
                }
            }
        }
        None => {
            let numbers: Vec<String> = enabled(filter).map(|n| n.to_string()).collect();
            text.push_str(&numbers.join(", "));
        }
    }

    text
}
