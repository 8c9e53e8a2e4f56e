//! Snapshot of the circular logging buffer.
//!
//! The firmware keeps logging while the host copies the buffer, so a consistent snapshot
//! needs the firmware's cooperation. Logging is paused by clearing the message filter,
//! the structure is copied, the filter is checked to still be zero and finally restored:
//!
//! 1. drain unexpected data on the connection,
//! 2. read the filter and pause logging,
//! 3. read and check the header, adapt the transfer size,
//! 4. wait for the configured delay,
//! 5. copy header and buffer,
//! 6. write the snapshot to the output file with the original filter value,
//! 7. check that logging is still paused,
//! 8. reset the buffer if configured and restore the filter,
//! 9. run the post-processing command.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use crate::bridge::{BridgeError, MemoryBridge};
use crate::config::TransferParameters;
use crate::filter::{self, FilterNames};
use crate::header::{HeaderError, TargetControlHeader, FILTER_OFFSET};
use crate::mode;

/// How often writing the output file is retried while it is locked by another program.
pub const FILE_RETRIES: usize = 9;

/// Delay between attempts to write the output file.
pub const FILE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors of a transfer.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TransferError {
    /// Could not access the target.
    Bridge(#[from] BridgeError),

    /// Invalid logging structure header.
    Header(#[from] HeaderError),

    /// Could not write file '{path}'.
    Output {
        /// The output file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The message filter was enabled again by the firmware ({filter:#010x}) while data was transferred. The data in '{path}' may be partially corrupted.
    LoggingReenabled {
        /// The filter value found after the transfer.
        filter: u32,
        /// The output file, which is kept.
        path: PathBuf,
    },

    /// Could not restore the message filter.
    FilterRestore(#[source] BridgeError),

    /// Message filtering is disabled in the firmware.
    FilteringDisabled,
}

/// Host copy of the logging structure.
#[derive(Debug, Default)]
pub struct MirrorBuffer {
    data: Vec<u8>,
}

impl MirrorBuffer {
    /// Makes the buffer exactly `len` bytes long.
    ///
    /// A buffer of a different size is released before the new one is allocated, the
    /// structure may take up to a few megabytes.
    pub fn resize(&mut self, len: usize) {
        if self.data.len() != len {
            self.data = Vec::new();
            self.data = vec![0; len];
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replaces the filter word of the copied header.
    fn patch_filter(&mut self, value: u32) {
        let start = FILTER_OFFSET as usize;
        if let Some(word) = self.data.get_mut(start..start + 4) {
            word.copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Result of the post-processing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The command finished successfully.
    Completed,
    /// The command exited with an error, the code if there was one.
    Failed(Option<i32>),
    /// The command could not be started.
    NotStarted(String),
}

/// Summary of a successful transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Number of bytes copied from the target.
    pub bytes: usize,
    /// Time spent copying.
    pub elapsed: Duration,
    /// The output file.
    pub output: PathBuf,
    /// The header as read before the copy.
    pub header: TargetControlHeader,
    /// Result of the post-processing command, if one is configured.
    pub hook: Option<HookOutcome>,
}

impl TransferReport {
    /// Transfer rate in kB/s.
    pub fn throughput_kbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs / 1024.0
        } else {
            f64::INFINITY
        }
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes written to \"{}\" in {:.1} ms ({:.1} kB/s)",
            self.bytes,
            self.output.display(),
            self.elapsed.as_secs_f64() * 1000.0,
            self.throughput_kbps()
        )
    }
}

/// Logging state of the target, as shown while a persistent connection is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingStatus {
    /// Last write index.
    pub last_index: u32,
    /// Active filter.
    pub filter: u32,
    /// Buffer fill level in percent, only in single shot mode.
    pub usage_percent: Option<u32>,
}

impl fmt::Display for LoggingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index: {:6}, filter: {:#010X}", self.last_index, self.filter)?;
        if let Some(usage) = self.usage_percent {
            write!(f, ", {usage}% used")?;
        }
        Ok(())
    }
}

/// Transfer of the logging structure, reusable for repeated snapshots.
#[derive(Debug)]
pub struct Transfer {
    params: TransferParameters,
    header: Option<TargetControlHeader>,
    mirror: MirrorBuffer,
    previous_filter: u32,
}

impl Transfer {
    pub fn new(params: TransferParameters) -> Self {
        Self {
            params,
            header: None,
            mirror: MirrorBuffer::default(),
            previous_filter: 0,
        }
    }

    /// The parameters, with the size discovered from the last header read.
    pub fn parameters(&self) -> &TransferParameters {
        &self.params
    }

    /// The header read most recently.
    pub fn header(&self) -> Option<&TargetControlHeader> {
        self.header.as_ref()
    }

    /// The host copy of the last snapshot.
    pub fn mirror(&self) -> &MirrorBuffer {
        &self.mirror
    }

    /// Reads and checks the header, adapting the transfer size and the mirror buffer.
    pub fn load_header(
        &mut self,
        bridge: &mut MemoryBridge,
    ) -> Result<TargetControlHeader, TransferError> {
        let header = TargetControlHeader::read(bridge, self.params.start_address)?;
        header.validate()?;
        let size = header.transfer_size()?;

        if self.params.size != size {
            if self.params.size != 0 {
                tracing::info!("Logging structure size changed to {size} bytes");
            }
            self.params.size = size;
        }
        self.mirror.resize(size as usize);

        self.header = Some(header);
        Ok(header)
    }

    /// Header information for display, including the enabled filters.
    pub fn describe_header(
        &mut self,
        bridge: &mut MemoryBridge,
        names: Option<&FilterNames>,
    ) -> Result<String, TransferError> {
        let header = self.load_header(bridge)?;

        let filters = if header.config().msg_filtering() {
            filter::describe(header.filter(), names)
        } else {
            "Message filtering disabled in the firmware.".to_string()
        };

        Ok(format!("{header}\n{filters}"))
    }

    /// Reads the current index, filter and fill level.
    pub fn logging_status(
        &mut self,
        bridge: &mut MemoryBridge,
    ) -> Result<LoggingStatus, TransferError> {
        bridge.handle_unexpected_messages()?;
        let header = self.load_header(bridge)?;

        Ok(LoggingStatus {
            last_index: header.last_index(),
            filter: header.filter(),
            usage_percent: header
                .is_single_shot()
                .then(|| header.buffer_usage_percent()),
        })
    }

    /// Sets a new filter value on the target. The value is also used for later restores.
    pub fn set_filter(&mut self, bridge: &mut MemoryBridge, value: u32) -> Result<(), TransferError> {
        let header = self.load_header(bridge)?;
        if !header.config().msg_filtering() {
            return Err(TransferError::FilteringDisabled);
        }

        self.params.filter = Some(value);
        filter::write(bridge, self.params.start_address, value)?;
        tracing::info!("Message filter set to {value:#010X}");

        Ok(())
    }

    /// Value written to the filter word once the snapshot has been taken.
    fn restore_value(&self) -> u32 {
        filter::restore_value(self.previous_filter, self.header.as_ref(), self.params.filter)
    }

    fn restore_filter(&self, bridge: &mut MemoryBridge) -> Result<(), BridgeError> {
        filter::write(bridge, self.params.start_address, self.restore_value())
    }

    /// Restores the filter after a failure, keeping the original error.
    fn restore_after_failure(&self, bridge: &mut MemoryBridge) {
        if let Err(e) = self.restore_filter(bridge) {
            tracing::warn!("Could not restore the message filter: {e}");
        }
    }

    /// Takes a snapshot of the logging structure and writes it to the output file.
    #[tracing::instrument(skip_all, fields(output = %self.params.output.display()))]
    pub fn run(&mut self, bridge: &mut MemoryBridge) -> Result<TransferReport, TransferError> {
        let address = self.params.start_address;

        bridge.handle_unexpected_messages()?;

        self.previous_filter = filter::pause_logging(bridge, address)?;
        let header = self.load_header(bridge)?;

        if self.params.delay_ms > 0 {
            tracing::debug!("Delay {} ms", self.params.delay_ms);
            std::thread::sleep(Duration::from_millis(self.params.delay_ms));
        }

        let start = Instant::now();
        if let Err(e) = bridge.read_memory(address, self.mirror.as_mut_slice()) {
            tracing::error!("Could not read the logging structure: {e}");
            self.restore_after_failure(bridge);
            return Err(e.into());
        }
        let elapsed = start.elapsed();

        self.mirror.patch_filter(self.previous_filter);
        if let Err(source) = write_output(&self.params.output, self.mirror.as_slice()) {
            self.restore_after_failure(bridge);
            return Err(TransferError::Output {
                path: self.params.output.clone(),
                source,
            });
        }
        tracing::info!("Data written to \"{}\"", self.params.output.display());

        let filter_after = match filter::read(bridge, address) {
            Ok(value) => value,
            Err(e) => {
                self.restore_after_failure(bridge);
                return Err(e.into());
            }
        };
        if filter_after != 0 {
            tracing::error!("Logging was enabled by the firmware during the transfer");
            self.restore_after_failure(bridge);
            return Err(TransferError::LoggingReenabled {
                filter: filter_after,
                path: self.params.output.clone(),
            });
        }

        if let Err(e) = mode::reset_buffer(bridge, address, &header, self.params.clear_buffer) {
            tracing::warn!("Circular buffer not properly cleared: {e}");
        }

        self.restore_filter(bridge)
            .map_err(TransferError::FilterRestore)?;

        let hook = self.params.decode_hook.as_deref().map(run_hook);

        Ok(TransferReport {
            bytes: self.mirror.len(),
            elapsed,
            output: self.params.output.clone(),
            header,
            hook,
        })
    }
}

/// Writes the snapshot, retrying while the file is locked by another program.
fn write_output(path: &Path, data: &[u8]) -> io::Result<()> {
    write_with_retry(path, data, |path, data| fs::write(path, data))
}

fn write_with_retry(
    path: &Path,
    data: &[u8],
    mut write: impl FnMut(&Path, &[u8]) -> io::Result<()>,
) -> io::Result<()> {
    let mut attempts = 0;
    loop {
        match write(path, data) {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && attempts < FILE_RETRIES => {
                attempts += 1;
                tracing::debug!("Output file locked, retry {attempts}");
                std::thread::sleep(FILE_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

/// Runs the post-processing command through the system shell.
fn run_hook(command: &str) -> HookOutcome {
    tracing::info!("Starting '{command}'");

    let status = if cfg!(windows) {
        process::Command::new("cmd").args(["/C", command]).status()
    } else {
        process::Command::new("sh").args(["-c", command]).status()
    };

    match status {
        Ok(status) if status.success() => HookOutcome::Completed,
        Ok(status) => {
            tracing::warn!("'{command}' failed with {status}");
            HookOutcome::Failed(status.code())
        }
        Err(e) => {
            tracing::warn!("'{command}' could not be started: {e}");
            HookOutcome::NotStarted(e.to_string())
        }
    }
}
