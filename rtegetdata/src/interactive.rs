//! Persistent connection driven by commands typed on stdin.

use std::io::{self, BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use rte_getdata::filter::FilterNames;
use rte_getdata::script;
use rte_getdata::{MemoryBridge, Transfer};

use crate::Command;

/// How often the logging status is refreshed while no command is entered.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

const HELP: &str = "\
Commands:
  <Enter>, t  Transfer the logging data
  h           Show the header of the logging structure
  s           Restart logging in single shot mode
  p           Restart logging in post-mortem mode
  f HEX       Set the message filter
  r           Reconnect
  0           Repeat the start command file
  1 .. 9      Execute the commands in 1.cmd .. 9.cmd
  ?           Show this help
  q           Quit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Command(Command),
    Reconnect,
    StartScript,
    Script(PathBuf),
    Help,
    Quit,
    Invalid(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, arg) = match line.split_once(char::is_whitespace) {
            Some((word, arg)) => (word, arg.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "" | "t" => Input::Command(Command::Transfer),
            "h" => Input::Command(Command::Header),
            "s" => Input::Command(Command::SingleShot),
            "p" => Input::Command(Command::PostMortem),
            "f" => match crate::parse_hex(arg) {
                Ok(value) => Input::Command(Command::Filter { value }),
                Err(_) => Input::Invalid(format!("'{arg}' is not a hexadecimal filter value")),
            },
            "r" => Input::Reconnect,
            "0" => Input::StartScript,
            "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9" => {
                Input::Script(PathBuf::from(format!("{word}.cmd")))
            }
            "?" => Input::Help,
            "q" => Input::Quit,
            _ => Input::Invalid(format!("Unknown command '{line}', enter '?' for help")),
        }
    }
}

/// Executes commands until `q` is entered or stdin is closed.
pub fn run(
    bridge: &mut MemoryBridge,
    transfer: &mut Transfer,
    start: Option<&Path>,
    names: Option<&FilterNames>,
) -> anyhow::Result<()> {
    let input = stdin_channel();
    println!("Enter '?' for a list of commands.");

    loop {
        let line = match input.recv_timeout(STATUS_INTERVAL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                show_status(bridge, transfer);
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        eprintln!();

        let result = match Input::parse(&line) {
            Input::Command(command) => crate::execute(&command, bridge, transfer, names),
            Input::Reconnect => bridge.reconnect().map_err(Into::into),
            Input::StartScript => match start {
                Some(path) => run_script(path, bridge, transfer),
                None => Err(anyhow::anyhow!(
                    "No start command file given, use --start to set one"
                )),
            },
            Input::Script(path) => run_script(&path, bridge, transfer),
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Quit => return Ok(()),
            Input::Invalid(message) => {
                eprintln!("{message}");
                Ok(())
            }
        };

        if let Err(e) = result {
            eprintln!("Could not execute command: {e:#}");
        }
    }
}

fn run_script(path: &Path, bridge: &mut MemoryBridge, transfer: &mut Transfer) -> anyhow::Result<()> {
    script::run_script(path, bridge, transfer, |text| println!("{text}"))?;
    Ok(())
}

/// Overwrites the status line with the current index, filter and buffer usage.
fn show_status(bridge: &mut MemoryBridge, transfer: &mut Transfer) {
    match transfer.logging_status(bridge) {
        Ok(status) => {
            let mut stderr = io::stderr();
            let _ = write!(stderr, "\r{status}    ");
            let _ = stderr.flush();
        }
        Err(e) => tracing::debug!("Could not read the logging status: {e}"),
    }
}

fn stdin_channel() -> Receiver<String> {
    let (tx, rx) = channel();

    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    eprintln!("Error reading from stdin, input disabled: {err}");
                    break;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case("" => Input::Command(Command::Transfer); "enter")]
    #[test_case("T" => Input::Command(Command::Transfer); "upper case")]
    #[test_case("h" => Input::Command(Command::Header); "header")]
    #[test_case("f 0x80000000" => Input::Command(Command::Filter { value: 0x8000_0000 }); "filter")]
    #[test_case("f  ff" => Input::Command(Command::Filter { value: 0xFF }); "filter without prefix")]
    #[test_case("0" => Input::StartScript; "start script")]
    #[test_case("3" => Input::Script(PathBuf::from("3.cmd")); "numbered script")]
    #[test_case("q" => Input::Quit; "quit")]
    fn parse(line: &str) -> Input {
        Input::parse(line)
    }

    #[test]
    fn filter_needs_hex_value() {
        assert!(matches!(Input::parse("f xyz"), Input::Invalid(_)));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(
            Input::parse("benchmark"),
            Input::Invalid("Unknown command 'benchmark', enter '?' for help".into())
        );
    }
}
