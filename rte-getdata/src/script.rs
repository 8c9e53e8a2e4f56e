//! Command files executed after the connection has been opened.
//!
//! Each line holds one command. Lines starting with `#` are handled by this crate, all
//! other lines are passed to the remote-debug provider (for example `monitor reset`):
//!
//! ```text
//! ## comment
//! #delay 100
//! #init 0x06000007 72000000
//! #filter FFFFFFFF
//! #echo Logging restarted
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{BridgeError, MemoryBridge};
use crate::mode::ModeController;
use crate::transfer::Transfer;

/// A single line of a command file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCommand {
    /// `## ...`
    Comment,
    /// `#delay MS`: wait, then discard data received meanwhile.
    Delay(u64),
    /// `#init CFG FREQ`: initialize the logging structure.
    Init {
        /// Configuration word.
        cfg: u32,
        /// Timestamp frequency in Hz.
        timestamp_frequency: u32,
    },
    /// `#filter HEX`: set the message filter.
    Filter(u32),
    /// `#echo TEXT`: show a text.
    Echo(String),
    /// An internal command with missing or invalid parameters.
    Invalid {
        /// The line.
        line: String,
        /// What is wrong.
        reason: &'static str,
    },
    /// An unknown internal command.
    Unknown(String),
    /// Anything else, executed by the debug provider.
    Provider(String),
}

fn parse_hex(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16).ok()
}

impl ScriptCommand {
    /// Parses a line. Empty lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let invalid = |reason| ScriptCommand::Invalid {
            line: line.to_string(),
            reason,
        };

        let command = if line.starts_with("##") {
            ScriptCommand::Comment
        } else if let Some(arg) = line.strip_prefix("#delay ") {
            match arg.trim().parse() {
                Ok(ms) => ScriptCommand::Delay(ms),
                Err(_) => invalid("the delay must be a decimal number of milliseconds"),
            }
        } else if let Some(args) = line.strip_prefix("#init ") {
            let mut args = args.split_whitespace();
            let cfg = args.next().and_then(parse_hex);
            let frequency = args.next().and_then(|f| f.parse().ok());
            match (cfg, frequency) {
                (Some(cfg), Some(timestamp_frequency)) => ScriptCommand::Init {
                    cfg,
                    timestamp_frequency,
                },
                _ => invalid(
                    "#init needs the config word (hex) and the timestamp frequency (decimal)",
                ),
            }
        } else if let Some(arg) = line.strip_prefix("#filter ") {
            match parse_hex(arg) {
                Some(value) => ScriptCommand::Filter(value),
                None => invalid("the filter must be a hexadecimal value"),
            }
        } else if let Some(text) = line.strip_prefix("#echo ") {
            ScriptCommand::Echo(text.to_string())
        } else if line.starts_with('#') {
            ScriptCommand::Unknown(line.to_string())
        } else {
            ScriptCommand::Provider(line.to_string())
        };

        Some(command)
    }
}

/// Errors that stop a command file.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ScriptError {
    /// Could not read command file '{path}'.
    Open {
        /// The command file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Command '{command}' failed.
    Command {
        /// The failing line.
        command: String,
        /// The provider error.
        #[source]
        source: BridgeError,
    },
}

/// Executes the command file at `path`. `#echo` texts are passed to `echo`.
pub fn run_script(
    path: &Path,
    bridge: &mut MemoryBridge,
    transfer: &mut Transfer,
    echo: impl FnMut(&str),
) -> Result<(), ScriptError> {
    let text = fs::read_to_string(path).map_err(|source| ScriptError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!("Executing command file \"{}\"", path.display());
    run_commands(&text, bridge, transfer, echo)
}

/// Executes the commands in `text`, stopping at the first failing provider command.
///
/// Failing internal commands are reported and skipped.
pub fn run_commands(
    text: &str,
    bridge: &mut MemoryBridge,
    transfer: &mut Transfer,
    mut echo: impl FnMut(&str),
) -> Result<(), ScriptError> {
    // Discard data left over from before, e.g. after a target reset.
    if let Err(e) = bridge.handle_unexpected_messages() {
        tracing::warn!("Could not drain the connection: {e}");
    }

    for command in text.lines().filter_map(ScriptCommand::parse) {
        if !matches!(command, ScriptCommand::Comment | ScriptCommand::Echo(_)) {
            tracing::debug!("Command: {command:?}");
        }

        match command {
            ScriptCommand::Comment => {}
            ScriptCommand::Delay(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                if let Err(e) = bridge.flush() {
                    tracing::warn!("Could not flush the connection: {e}");
                }
            }
            ScriptCommand::Init {
                cfg,
                timestamp_frequency,
            } => {
                let controller = ModeController::new(transfer.parameters());
                if let Err(e) = controller.initialize_structure(bridge, cfg, timestamp_frequency)
                {
                    tracing::error!("Could not initialize the logging structure: {e}");
                }
            }
            ScriptCommand::Filter(value) => {
                if let Err(e) = transfer.set_filter(bridge, value) {
                    tracing::error!("Could not set the message filter: {e}");
                }
            }
            ScriptCommand::Echo(text) => echo(&text),
            ScriptCommand::Invalid { line, reason } => {
                tracing::warn!("\"{line}\": {reason}");
            }
            ScriptCommand::Unknown(line) => {
                tracing::warn!("\"{line}\": unknown command");
            }
            ScriptCommand::Provider(line) => {
                bridge
                    .execute_command(&line)
                    .map_err(|source| ScriptError::Command {
                        command: line,
                        source,
                    })?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TransferParameters;
    use crate::fake_target::{self, Operation, TargetState};
    use crate::header::FILTER_OFFSET;
    use test_case::test_case;

    const BASE: u32 = 0x2000_0000;

    #[test_case("## note" => Some(ScriptCommand::Comment); "comment")]
    #[test_case("#delay 250" => Some(ScriptCommand::Delay(250)); "delay")]
    #[test_case("#filter 0x80000001" => Some(ScriptCommand::Filter(0x8000_0001)); "filter with prefix")]
    #[test_case("#filter ffff" => Some(ScriptCommand::Filter(0xFFFF)); "filter without prefix")]
    #[test_case("#init 6000007 72000000" => Some(ScriptCommand::Init { cfg: 0x0600_0007, timestamp_frequency: 72_000_000 }); "init")]
    #[test_case("#echo Hello" => Some(ScriptCommand::Echo("Hello".into())); "echo")]
    #[test_case("#reset" => Some(ScriptCommand::Unknown("#reset".into())); "unknown")]
    #[test_case("monitor reset\r" => Some(ScriptCommand::Provider("monitor reset".into())); "provider command")]
    #[test_case("" => None; "empty")]
    fn parse(line: &str) -> Option<ScriptCommand> {
        ScriptCommand::parse(line)
    }

    #[test]
    fn init_without_frequency_is_invalid() {
        assert!(matches!(
            ScriptCommand::parse("#init 6000007"),
            Some(ScriptCommand::Invalid { .. })
        ));
    }

    #[test]
    fn script_runs_internal_and_provider_commands() {
        let state = TargetState::with_capacity(BASE, 64);
        let mut bridge = fake_target::open_bridge(&state);
        let mut transfer = Transfer::new(TransferParameters {
            start_address: BASE,
            ..Default::default()
        });

        let mut echoed = Vec::new();
        run_commands(
            "## restart\nmonitor reset\n#filter 0x5\n#echo done\n#bogus\n",
            &mut bridge,
            &mut transfer,
            |text| echoed.push(text.to_string()),
        )
        .unwrap();

        assert_eq!(echoed, vec!["done".to_string()]);
        assert_eq!(state.word(FILTER_OFFSET), 0x5);
        assert!(state
            .operations()
            .contains(&Operation::Command("monitor reset".into())));
    }

    #[test]
    fn failing_provider_command_stops_the_script() {
        let state = TargetState::with_capacity(BASE, 64);
        state.reject_command("monitor halt");
        let mut bridge = fake_target::open_bridge(&state);
        let mut transfer = Transfer::new(TransferParameters {
            start_address: BASE,
            ..Default::default()
        });

        let error = run_commands(
            "monitor halt\n#filter 0x5\n",
            &mut bridge,
            &mut transfer,
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(error, ScriptError::Command { ref command, .. } if command == "monitor halt"));
        assert_eq!(state.word(FILTER_OFFSET), 0);
    }

    #[test]
    fn serial_transport_refuses_provider_commands() {
        let state = TargetState::with_capacity(0, 64);
        let mut bridge = fake_target::open_serial_bridge(&state, false);
        let mut transfer = Transfer::new(TransferParameters::default());

        let error = run_commands("monitor reset\n", &mut bridge, &mut transfer, |_| {}).unwrap_err();

        assert!(matches!(
            error,
            ScriptError::Command {
                source: BridgeError::Unsupported(_),
                ..
            }
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let state = TargetState::with_capacity(BASE, 64);
        let mut bridge = fake_target::open_bridge(&state);
        let mut transfer = Transfer::new(TransferParameters::default());

        let error = run_script(
            Path::new("/nonexistent/start.cmd"),
            &mut bridge,
            &mut transfer,
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(error, ScriptError::Open { .. }));
    }
}
