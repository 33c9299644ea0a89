//! Reference command-line shell over [`pigro::orchestrator`] (§6A): wires a
//! [`structopt`] CLI, a [`simplelog`] terminal logger, and a real serial port
//! to the orchestrator, draining its event stream until the action ends.

use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info, warn};
use simplelog::{Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use pigro::link::SerialLink;
use pigro::orchestrator::{Action, Event, Orchestrator};

#[derive(Debug, StructOpt)]
#[structopt(name = "pigro", about = "Host-side AVR/ARM chip programmer")]
struct Options {
    /// Project file describing the target device and firmware image.
    #[structopt(long, default_value = "pigro.ini", env = "PIGRO_PROJECT")]
    project: PathBuf,

    /// Serial port the bridge microcontroller is attached to.
    #[structopt(long, env = "PIGRO_PORT")]
    port: String,

    /// Configure log level.
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    action: CliAction,
}

#[derive(Debug, StructOpt)]
enum CliAction {
    /// Read and report chip identification.
    Info,
    /// Report firmware image statistics without touching hardware.
    Stat,
    /// Verify flash contents against the project's firmware image.
    Check,
    /// Erase then write the project's firmware image.
    Write,
    /// Erase the whole chip.
    Erase,
    /// Read fuse bytes (AVR only).
    ReadFuse,
    /// Write fuse bytes from the project file (AVR only).
    WriteFuse,
    /// Read back the whole chip and write it out as an Intel HEX file.
    Read {
        /// Destination file for the Intel HEX dump.
        #[structopt(long, default_value = "dump.hex")]
        out: PathBuf,
    },
    /// Run chip-info as a connectivity smoke test.
    Test,
}

impl From<&CliAction> for Action {
    fn from(action: &CliAction) -> Self {
        match action {
            CliAction::Info => Action::Info,
            CliAction::Stat => Action::Stat,
            CliAction::Check => Action::Check,
            CliAction::Write => Action::Write,
            CliAction::Erase => Action::Erase,
            CliAction::ReadFuse => Action::ReadFuse,
            CliAction::WriteFuse => Action::WriteFuse,
            CliAction::Read { .. } => Action::Read,
            CliAction::Test => Action::Test,
        }
    }
}

fn main() -> ExitCode {
    let opts = Options::from_args();
    TermLogger::init(opts.log_level, LogConfig::default(), TerminalMode::Mixed).unwrap();

    let port = opts.port.clone();
    let handle = Orchestrator::spawn(move || SerialLink::open(&port));
    handle.submit(opts.project.clone(), Action::from(&opts.action));

    let mut exit_ok = true;
    for event in handle.events() {
        match event {
            Event::Started => info!("session started"),
            Event::Stopped => break,
            Event::SessionStarted(major, minor) => info!("bridge protocol {major}.{minor}"),
            Event::BeginProgress(done, total) => info!("progress: {done}/{total}"),
            Event::ReportProgress(done) => info!("progress: {done}"),
            Event::ReportMessage(msg) => info!("{msg}"),
            Event::ChipInfo(info_str) => info!("chip: {info_str}"),
            Event::DataReady(hex_text) => {
                if let CliAction::Read { out } = &opts.action {
                    if let Err(e) = std::fs::write(out, hex_text) {
                        error!("failed to write {}: {e}", out.display());
                        exit_ok = false;
                    } else {
                        info!("wrote {}", out.display());
                    }
                }
            }
            Event::ReportResult(msg) => info!("result: {msg}"),
            Event::ReportException(msg) => {
                warn!("exception: {msg}");
                exit_ok = false;
            }
            Event::EndProgress => {}
        }
    }

    if exit_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
