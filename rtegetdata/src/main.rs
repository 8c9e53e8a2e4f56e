mod interactive;
mod logging;
mod port;
mod settings;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use rte_getdata::config::TransportConfig;
use rte_getdata::filter::FilterNames;
use rte_getdata::mode::ModeController;
use rte_getdata::script;
use rte_getdata::serial::SerialTransport;
use rte_getdata::transfer::HookOutcome;
use rte_getdata::{MemoryBridge, Transfer};

use crate::logging::LevelFilter;
use crate::port::PortSpec;
use crate::settings::Settings;

/// Parses a hexadecimal number, with or without the `0x` prefix.
pub(crate) fn parse_hex(text: &str) -> Result<u32, std::num::ParseIntError> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16)
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "rtegetdata",
    version,
    about = "Transfer the RTEdbg logging data (g_rtedbg structure) from a running embedded system to the host."
)]
struct Opts {
    #[clap(
        short,
        long,
        help = "Serial port and line settings, e.g. 'COM7=115200' or '/dev/ttyUSB0=250000E2'."
    )]
    port: Option<PortSpec>,

    #[clap(
        short,
        long,
        value_parser = parse_hex,
        help = "Address of the g_rtedbg structure (hex). Must be zero for the serial port."
    )]
    address: Option<u32>,

    #[clap(
        short,
        long,
        value_parser = parse_hex,
        help = "Size of the g_rtedbg structure in bytes (hex). Zero or missing reads it from the header."
    )]
    size: Option<u32>,

    #[clap(
        short,
        long,
        value_parser = parse_hex,
        help = "Message filter (hex) set after the transfer instead of restoring the previous one."
    )]
    filter: Option<u32>,

    #[clap(short, long, help = "Fill the circular buffer with 0xFFFFFFFF after the transfer.")]
    clear: bool,

    #[clap(short, long, help = "Delay in ms between pausing the logging and the transfer.")]
    delay: Option<u64>,

    #[clap(short, long, help = "Output file for the logging data. Defaults to 'data.bin'.")]
    output: Option<PathBuf>,

    #[clap(long, help = "Command executed after each successful transfer, e.g. a decode script.")]
    decode: Option<String>,

    #[clap(
        short = 'P',
        long,
        help = "Keep the connection open and wait for commands on stdin."
    )]
    persistent: bool,

    #[clap(long, help = "Command file executed after the connection has been opened.")]
    start: Option<PathBuf>,

    #[clap(long, help = "Text file with the message filter names, one per line.")]
    filter_names: Option<PathBuf>,

    #[clap(long, help = "Every transmitted byte is received back (single wire connection).")]
    half_duplex: bool,

    #[clap(long, help = "Largest data block requested with one read command.")]
    msg_size: Option<u32>,

    #[clap(long, help = "Receive timeout of the serial port in ms.")]
    timeout: Option<u64>,

    #[clap(long, help = "Raise the host priority while the connection is open.")]
    priority: bool,

    #[clap(long, help = "Config file (.toml, .json, .yaml) with default settings.")]
    config: Option<PathBuf>,

    #[clap(long, help = "Write a detailed log to this file.")]
    log_file: Option<PathBuf>,

    #[clap(long, value_enum, help = "Log level for messages on stderr. Overrides RUST_LOG.")]
    log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, clap::Subcommand)]
pub(crate) enum Command {
    /// Copy the logging structure to the output file (default).
    Transfer,
    /// Show the header of the logging structure.
    Header,
    /// Show the buffer index, the message filter and the buffer usage.
    Status,
    /// Enable single shot logging and restart logging.
    SingleShot,
    /// Disable single shot logging and restart post-mortem logging.
    PostMortem,
    /// Set the message filter.
    Filter {
        #[clap(value_parser = parse_hex, help = "New filter value (hex).")]
        value: u32,
    },
    /// Initialize the logging structure for firmware that does not call rte_init().
    Init {
        #[clap(value_parser = parse_hex, help = "Configuration word (hex).")]
        cfg: u32,
        #[clap(help = "Timestamp timer frequency in Hz.")]
        frequency: u32,
    },
}

impl Opts {
    /// Command line values take precedence over the config file and the environment.
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = &self.port {
            port.apply(&mut settings.serial);
        }
        if self.half_duplex {
            settings.serial.half_duplex = true;
        }
        if let Some(size) = self.msg_size {
            settings.serial.max_message_size = size;
        }
        if let Some(timeout) = self.timeout {
            settings.serial.receive_timeout_ms = timeout;
        }

        let transfer = &mut settings.transfer;
        if let Some(address) = self.address {
            transfer.start_address = address;
        }
        if let Some(size) = self.size {
            transfer.size = size;
        }
        if self.filter.is_some() {
            transfer.filter = self.filter;
        }
        if self.clear {
            transfer.clear_buffer = true;
        }
        if let Some(delay) = self.delay {
            transfer.delay_ms = delay;
        }
        if let Some(output) = &self.output {
            transfer.output.clone_from(output);
        }
        if self.decode.is_some() {
            transfer.decode_hook.clone_from(&self.decode);
        }
        if self.persistent {
            transfer.persistent = true;
        }

        if self.priority {
            settings.elevated_priority = true;
        }
        if self.start.is_some() {
            settings.start.clone_from(&self.start);
        }
        if self.filter_names.is_some() {
            settings.filter_names.clone_from(&self.filter_names);
        }
    }
}

fn main() {
    let opts = Opts::parse();

    let code = match run(opts) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e:?}");
            1
        }
    };

    std::process::exit(code);
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let _log_guard = logging::setup_logging(opts.log_file.as_deref(), opts.log_level)?;

    let mut settings = Settings::load(opts.config.as_deref())?;
    opts.apply(&mut settings);

    let session = settings.session();
    session.validate()?;

    let TransportConfig::Serial(serial) = session.transport else {
        anyhow::bail!("Only the serial transport is available from the command line");
    };

    let names = settings
        .filter_names
        .as_deref()
        .map(|path| {
            FilterNames::load(path)
                .with_context(|| format!("Could not read filter names from {path:?}"))
        })
        .transpose()?;

    let mut bridge = MemoryBridge::open(
        Box::new(SerialTransport::new(serial)),
        session.elevated_priority,
    )
    .context("Could not open the connection")?;
    let mut transfer = Transfer::new(session.transfer);

    if let Some(start) = &settings.start {
        script::run_script(start, &mut bridge, &mut transfer, |text| println!("{text}"))?;
    }

    let command = opts.command.clone().unwrap_or(Command::Transfer);

    if settings.transfer.persistent {
        if opts.command.is_some() {
            execute(&command, &mut bridge, &mut transfer, names.as_ref())?;
        }
        interactive::run(
            &mut bridge,
            &mut transfer,
            settings.start.as_deref(),
            names.as_ref(),
        )
    } else {
        execute(&command, &mut bridge, &mut transfer, names.as_ref())
    }
}

pub(crate) fn execute(
    command: &Command,
    bridge: &mut MemoryBridge,
    transfer: &mut Transfer,
    names: Option<&FilterNames>,
) -> anyhow::Result<()> {
    match command {
        Command::Transfer => {
            let report = transfer.run(bridge)?;
            println!("{report}");

            match &report.hook {
                Some(HookOutcome::Failed(Some(code))) => {
                    eprintln!("The decode command exited with code {code}")
                }
                Some(HookOutcome::Failed(None)) => eprintln!("The decode command was terminated"),
                Some(HookOutcome::NotStarted(e)) => {
                    eprintln!("The decode command could not be started: {e}")
                }
                Some(HookOutcome::Completed) | None => {}
            }
        }
        Command::Header => println!("{}", transfer.describe_header(bridge, names)?),
        Command::Status => println!("{}", transfer.logging_status(bridge)?),
        Command::SingleShot => {
            let change = ModeController::new(transfer.parameters()).switch_to_single_shot(bridge)?;
            println!("{change}");
        }
        Command::PostMortem => {
            let change = ModeController::new(transfer.parameters()).switch_to_post_mortem(bridge)?;
            println!("{change}");
        }
        Command::Filter { value } => {
            transfer.set_filter(bridge, *value)?;
            println!("Message filter set to {value:#010X}");
        }
        Command::Init { cfg, frequency } => {
            let header = ModeController::new(transfer.parameters())
                .initialize_structure(bridge, *cfg, *frequency)?;
            println!("Logging structure initialized\n{header}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rte_getdata::config::Parity;

    #[test]
    fn command_line_overrides_settings() {
        let opts = Opts::parse_from([
            "rtegetdata",
            "--port",
            "COM3=115200O",
            "--filter",
            "0x3",
            "--size",
            "1018",
            "-c",
            "-P",
            "header",
        ]);

        let mut settings = Settings::default();
        settings.transfer.delay_ms = 20;
        opts.apply(&mut settings);

        assert_eq!(settings.serial.port, "COM3");
        assert_eq!(settings.serial.baud_rate, 115_200);
        assert_eq!(settings.serial.parity, Parity::Odd);
        assert_eq!(settings.transfer.filter, Some(3));
        assert_eq!(settings.transfer.size, 0x1018);
        assert_eq!(settings.transfer.delay_ms, 20);
        assert!(settings.transfer.clear_buffer);
        assert!(settings.transfer.persistent);
        assert_eq!(opts.command, Some(Command::Header));
    }

    #[test]
    fn init_takes_hex_config_and_decimal_frequency() {
        let opts = Opts::parse_from(["rtegetdata", "init", "6000007", "72000000"]);
        assert_eq!(
            opts.command,
            Some(Command::Init {
                cfg: 0x0600_0007,
                frequency: 72_000_000
            })
        );
    }

    #[test]
    fn clap_definition_is_valid() {
        use clap::CommandFactory;
        Opts::command().debug_assert();
    }
}
