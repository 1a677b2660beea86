use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use healthlog::cancel::Cancellation;
use healthlog::memory::PortMemory;
use healthlog::ports::{PortRegistry, SystemPorts};
use healthlog::session::SerialConnector;
use healthlog::{Config, LocalClock, PortChoice, RunMode, RunOutcome};

/// Waits for a serial telemetry device to be plugged in, then logs its JSON
/// output to CSV (or streams it to the console with --live).
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Baud rate of the device.
    #[arg(long, default_value_t = healthlog::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// How long to log for, in seconds.
    #[arg(long, value_parser = parse_seconds, default_value = "10", conflicts_with = "live")]
    duration: Duration,

    /// Print records to the console until Ctrl-C instead of logging to CSV.
    #[arg(long)]
    live: bool,

    /// CSV file to log to (truncated on every run).
    #[arg(short, long, default_value = healthlog::DEFAULT_OUTPUT_PATH)]
    output: PathBuf,

    /// Where to remember the last connected device.
    #[arg(long, default_value = healthlog::DEFAULT_MEMORY_PATH)]
    memory_file: PathBuf,

    /// Reconnect to the last used device without asking.
    #[arg(long, conflicts_with = "detect_new")]
    use_last: bool,

    /// Wait for a newly plugged in device without asking.
    #[arg(long)]
    detect_new: bool,

    /// Give up waiting for a new device after this many seconds.
    #[arg(long, value_parser = parse_seconds)]
    hotplug_timeout: Option<Duration>,

    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Delay between detecting a device and opening it.
    #[arg(long, default_value_t = 2000)]
    settle_ms: u64,

    #[arg(long, default_value_t = 1000)]
    read_timeout_ms: u64,

    /// List the currently visible serial ports and exit.
    #[arg(long)]
    list_ports: bool,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{value}': {e}"))
}

impl Args {
    fn config(&self) -> Config {
        Config {
            baud_rate: self.baud,
            mode: if self.live {
                RunMode::Live
            } else {
                RunMode::Duration(self.duration)
            },
            output_path: self.output.clone(),
            memory_path: self.memory_file.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            hotplug_timeout: self.hotplug_timeout,
            settle_delay: Duration::from_millis(self.settle_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    fn port_choice(&self) -> PortChoice {
        if self.use_last {
            return PortChoice::UseLast;
        }
        if self.detect_new {
            return PortChoice::DetectNew;
        }
        let Some(last) = PortMemory::new(&self.memory_file).load() else {
            return PortChoice::DetectNew;
        };
        if !std::io::stdin().is_terminal() {
            info!(
                "Not asking about last device {last} (stdin is not a terminal), pass --use-last to reuse it"
            );
            return PortChoice::DetectNew;
        }
        prompt_port_choice(&last)
    }
}

fn prompt_port_choice(last: &str) -> PortChoice {
    eprint!("Last device was {last}. Use it again? [Y/n] (n: wait for a new device) ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return PortChoice::DetectNew;
    }
    match answer.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => PortChoice::UseLast,
        _ => PortChoice::DetectNew,
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Before ctrlc spawns its thread, see LocalClock.
    let clock = LocalClock::detect();

    if args.list_ports {
        return match SystemPorts.list_ports() {
            Ok(ports) => {
                for port in ports {
                    println!("{port}");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e}");
                ExitCode::from(2)
            }
        };
    }

    info!("healthlog v{}", env!("CARGO_PKG_VERSION"));
    let config = args.config();
    // Ask before installing the Ctrl-C handler, so that Ctrl-C at the prompt
    // still simply kills us.
    let choice = args.port_choice();

    let cancellation = Cancellation::new();
    let handler_cancellation = cancellation.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_cancellation.cancel()) {
        warn!("Unable to install Ctrl-C handler: {e}");
    }

    let mut stdout = std::io::stdout();
    match healthlog::run(
        &config,
        choice,
        &SystemPorts,
        &SerialConnector,
        &clock,
        &cancellation,
        &mut stdout,
    ) {
        Ok(summary) => {
            if summary.outcome == RunOutcome::Interrupted {
                info!(
                    "Stopped after {} record(s) ({} invalid)",
                    summary.stats.records, summary.stats.invalid_frames
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
