pub mod cancel;
pub mod frame;
pub mod memory;
pub mod ports;
pub mod session;
pub mod sink;

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use cancel::Cancellation;
use frame::{decode_frame, line_to_text};
use memory::PortMemory;
use ports::{DeviceIdentifier, EnumerationError, HotplugError, PortRegistry};
use session::{ConnectionError, Connector, OpenError, ReadOutcome, Session, Transport};
use sink::{CsvSink, Printer, RecordSink, SinkError};

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_OUTPUT_PATH: &str = "health_log.csv";
pub const DEFAULT_MEMORY_PATH: &str = ".healthlog_last_port";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunMode {
    /// Log to CSV until the duration has elapsed.
    Duration(Duration),
    /// Print to the console until interrupted.
    Live,
}

/// What to do when a previously used port is remembered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PortChoice {
    UseLast,
    DetectNew,
}

/// Everything a run needs to know up front. Defaults match what the
/// telemetry firmware expects (9600 baud, newline-delimited JSON).
#[derive(Clone, Debug)]
pub struct Config {
    pub baud_rate: u32,
    pub mode: RunMode,
    pub output_path: PathBuf,
    pub memory_path: PathBuf,
    pub poll_interval: Duration,
    /// None means wait for a device indefinitely (or until cancelled).
    pub hotplug_timeout: Option<Duration>,
    pub settle_delay: Duration,
    pub read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            baud_rate: DEFAULT_BAUD_RATE,
            mode: RunMode::Duration(DEFAULT_DURATION),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            memory_path: PathBuf::from(DEFAULT_MEMORY_PATH),
            poll_interval: DEFAULT_POLL_INTERVAL,
            hotplug_timeout: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Fatal errors. Anything that goes wrong with an individual frame is not an
/// Error, see frame::DecodeWarning.
#[derive(Debug)]
pub enum Error {
    Enumeration(EnumerationError),
    HotplugTimeout(Duration),
    Connection(ConnectionError),
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Live mode only: in duration mode the echo is best effort.
    Console(std::io::Error),
    /// The device went away (or the transport failed) mid-stream.
    Disconnected {
        port: DeviceIdentifier,
        reason: String,
    },
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Connection(_) => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Enumeration(e) => e.fmt(f),
            Error::HotplugTimeout(timeout) => write!(
                f,
                "no new serial device appeared within {:.1}s",
                timeout.as_secs_f64()
            ),
            Error::Connection(e) => e.fmt(f),
            Error::Output { path, source } => {
                write!(f, "unable to write {}: {source}", path.display())
            }
            Error::Console(e) => write!(f, "unable to write to console: {e}"),
            Error::Disconnected { port, reason } => {
                write!(f, "lost connection to {port}: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Enumeration(e) => Some(e),
            Error::Connection(e) => Some(e),
            Error::Output { source, .. } => Some(source),
            Error::Console(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EnumerationError> for Error {
    fn from(e: EnumerationError) -> Self {
        Error::Enumeration(e)
    }
}

/// LocalClock produces the row timestamps. The local offset must be looked
/// up before any other threads exist (time refuses to do so afterwards on
/// most unixes), so construct this first thing in main.
#[derive(Clone, Copy, Debug)]
pub struct LocalClock {
    offset: time::UtcOffset,
}

impl LocalClock {
    pub fn detect() -> LocalClock {
        match time::UtcOffset::current_local_offset() {
            Ok(offset) => LocalClock { offset },
            Err(e) => {
                warn!("Unable to determine local timezone ({e}), using UTC timestamps");
                LocalClock::with_offset(time::UtcOffset::UTC)
            }
        }
    }

    pub fn with_offset(offset: time::UtcOffset) -> LocalClock {
        LocalClock { offset }
    }

    pub fn format(&self, date_time: time::OffsetDateTime) -> String {
        let format = time::macros::format_description!(
            version = 2,
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        );
        // Formatting a complete OffsetDateTime with numeric components only
        // has no failure mode in practice.
        date_time
            .to_offset(self.offset)
            .format(&format)
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> String {
        self.format(time::OffsetDateTime::now_utc())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum RunState {
    Scanning,
    AwaitingDevice,
    Connecting,
    Streaming,
    Closed,
}

fn enter(state: RunState) {
    debug!("run state: {state:?}");
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamStats {
    pub records: usize,
    pub invalid_frames: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamEnd {
    DeadlineReached,
    Cancelled,
}

/// Reads and decodes frames from `session` into `sink` until `deadline`
/// passes or `cancellation` is tripped. Records get a timestamp iff `clock`
/// is provided.
///
/// Bad frames (blank lines included) are logged and skipped. Only a failing
/// transport, or a sink that can't be written, stop the loop early.
/// `output_path` names the log when the sink fails to persist a record.
pub fn stream<T: Transport>(
    session: &mut Session<T>,
    sink: &mut dyn RecordSink,
    deadline: Option<Instant>,
    clock: Option<&LocalClock>,
    cancellation: &Cancellation,
    output_path: &std::path::Path,
) -> Result<(StreamEnd, StreamStats), Error> {
    let mut stats = StreamStats::default();
    loop {
        if cancellation.is_cancelled() {
            return Ok((StreamEnd::Cancelled, stats));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok((StreamEnd::DeadlineReached, stats));
            }
        }

        // read_line blocks for at most the read timeout, which is what keeps
        // the deadline and cancellation checks above responsive.
        let raw = match session.read_line() {
            Ok(ReadOutcome::Line(raw)) => raw,
            Ok(ReadOutcome::Idle) => continue,
            Ok(ReadOutcome::Closed) => {
                return Err(Error::Disconnected {
                    port: session.id().to_string(),
                    reason: "end of stream".to_string(),
                })
            }
            Err(e) => {
                return Err(Error::Disconnected {
                    port: session.id().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let line = line_to_text(&raw);
        match decode_frame(&line) {
            Ok(mut record) => {
                if let Some(clock) = clock {
                    record.set_timestamp(clock.timestamp());
                }
                match sink.accept(&record) {
                    Ok(()) => {}
                    Err(SinkError::Output(source)) => {
                        return Err(Error::Output {
                            path: output_path.to_path_buf(),
                            source,
                        })
                    }
                    Err(SinkError::Console(e)) => return Err(Error::Console(e)),
                }
                stats.records += 1;
            }
            Err(warning) => {
                warn!("{warning}");
                stats.invalid_frames += 1;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunOutcome {
    /// Duration elapsed.
    Completed,
    /// Cancelled while streaming.
    Interrupted,
    /// Cancelled before a device was connected.
    Aborted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub port: Option<DeviceIdentifier>,
    pub stats: StreamStats,
}

impl RunSummary {
    fn aborted(port: Option<DeviceIdentifier>) -> RunSummary {
        RunSummary {
            outcome: RunOutcome::Aborted,
            port,
            stats: StreamStats::default(),
        }
    }
}

/// Picks the device to use: the remembered one if requested (and known),
/// otherwise the next one to be plugged in. Returns None if cancelled.
fn select_port(
    config: &Config,
    choice: PortChoice,
    memory: &PortMemory,
    registry: &dyn PortRegistry,
    cancellation: &Cancellation,
) -> Result<Option<DeviceIdentifier>, Error> {
    if choice == PortChoice::UseLast {
        match memory.load() {
            Some(port) => {
                info!("Using last device {port}");
                return Ok(Some(port));
            }
            None => warn!(
                "No previously used device recorded in {}, detecting a new one",
                memory.path().display()
            ),
        }
    }

    enter(RunState::Scanning);
    info!("Scanning for serial ports...");
    let baseline = registry.list_ports()?;
    debug!("baseline ports: {baseline:?}");

    enter(RunState::AwaitingDevice);
    match ports::wait_for_new_port(
        registry,
        &baseline,
        config.poll_interval,
        config.hotplug_timeout,
        cancellation,
    ) {
        Ok(port) => {
            info!("New device detected on {port}");
            Ok(Some(port))
        }
        Err(HotplugError::Cancelled) => Ok(None),
        Err(HotplugError::TimedOut(timeout)) => Err(Error::HotplugTimeout(timeout)),
        Err(HotplugError::Enumeration(e)) => Err(Error::Enumeration(e)),
    }
}

/// Runs one complete acquisition: select a device, connect, and stream its
/// telemetry to the CSV log (duration mode) or the console (live mode).
///
/// `console` receives the record echo; diagnostics go through `log`.
pub fn run<C: Connector + ?Sized>(
    config: &Config,
    choice: PortChoice,
    registry: &dyn PortRegistry,
    connector: &C,
    clock: &LocalClock,
    cancellation: &Cancellation,
    console: &mut dyn Write,
) -> Result<RunSummary, Error> {
    let memory = PortMemory::new(&config.memory_path);
    let Some(port) = select_port(config, choice, &memory, registry, cancellation)? else {
        info!("Cancelled while waiting for a device");
        enter(RunState::Closed);
        return Ok(RunSummary::aborted(None));
    };

    enter(RunState::Connecting);
    let mut session = match Session::open(
        connector,
        &port,
        config.baud_rate,
        config.read_timeout,
        config.settle_delay,
        cancellation,
    ) {
        Ok(session) => session,
        Err(OpenError::Cancelled) => {
            enter(RunState::Closed);
            return Ok(RunSummary::aborted(Some(port)));
        }
        Err(OpenError::Failed(e)) => {
            enter(RunState::Closed);
            return Err(Error::Connection(e));
        }
    };

    if let Err(e) = memory.save(&port) {
        warn!(
            "Unable to remember {port} in {}: {e}",
            memory.path().display()
        );
    }

    enter(RunState::Streaming);
    let streamed = match config.mode {
        RunMode::Duration(duration) => {
            let output = |source| Error::Output {
                path: config.output_path.clone(),
                source,
            };
            let file = std::fs::File::create(&config.output_path).map_err(output)?;
            let mut sink = CsvSink::new(BufWriter::new(file), &mut *console).map_err(output)?;
            info!(
                "Logging JSON data to {} for {} seconds...",
                config.output_path.display(),
                duration.as_secs_f64()
            );
            // Overflow means the deadline is unreachable, i.e. run until
            // cancelled.
            let deadline = Instant::now().checked_add(duration);
            let streamed = stream(
                &mut session,
                &mut sink,
                deadline,
                Some(clock),
                cancellation,
                &config.output_path,
            );
            let finished = sink.finish().map_err(|e| match e {
                SinkError::Output(source) => output(source),
                SinkError::Console(e) => Error::Console(e),
            });
            streamed.and_then(|streamed| finished.map(|_| streamed))
        }
        RunMode::Live => {
            let mut printer = Printer::new(&mut *console);
            info!("Streaming JSON data from {port}, press Ctrl-C to stop...");
            // Printer only fails with SinkError::Console, so the output path
            // never ends up in an error.
            let streamed = stream(
                &mut session,
                &mut printer,
                None,
                None,
                cancellation,
                &config.output_path,
            );
            streamed
        }
    };

    session.close();
    enter(RunState::Closed);

    let (end, stats) = match streamed {
        Ok(streamed) => streamed,
        Err(e) => {
            error!("Stopped streaming from {port}");
            return Err(e);
        }
    };
    if stats.invalid_frames > 0 {
        info!("Skipped {} invalid frame(s)", stats.invalid_frames);
    }
    if let RunMode::Duration(_) = config.mode {
        info!(
            "Logging complete ({} record(s)). File saved as {}",
            stats.records,
            config.output_path.display()
        );
    }
    Ok(RunSummary {
        outcome: match end {
            StreamEnd::DeadlineReached => RunOutcome::Completed,
            StreamEnd::Cancelled => RunOutcome::Interrupted,
        },
        port: Some(port),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::scratch_path;
    use crate::ports::tests::ScriptedPorts;
    use crate::session::tests::{data, Chunk, FakeConnector, FakeTransport};
    use crate::sink::tests::BrokenPipe;

    fn test_config(name: &str, mode: RunMode) -> Config {
        Config {
            mode,
            output_path: scratch_path(&format!("{name}.csv")),
            memory_path: scratch_path(&format!("{name}.port")),
            poll_interval: Duration::from_millis(1),
            hotplug_timeout: Some(Duration::from_secs(5)),
            settle_delay: Duration::ZERO,
            ..Config::default()
        }
    }

    fn utc_clock() -> LocalClock {
        LocalClock::with_offset(time::UtcOffset::UTC)
    }

    fn is_timestamp(s: &str) -> bool {
        // YYYY-MM-DD HH:MM:SS
        s.len() == 19
            && s.chars().enumerate().all(|(i, c)| match i {
                4 | 7 => c == '-',
                10 => c == ' ',
                13 | 16 => c == ':',
                _ => c.is_ascii_digit(),
            })
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.mode, RunMode::Duration(Duration::from_secs(10)));
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.settle_delay, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.hotplug_timeout, None);
    }

    #[test]
    fn test_clock_format() {
        let clock = LocalClock::with_offset(time::macros::offset!(+2));
        let date_time = time::macros::datetime!(2024-07-09 22:05:03 UTC);
        assert_eq!(clock.format(date_time), "2024-07-10 00:05:03");
        assert!(is_timestamp(&utc_clock().timestamp()));
    }

    #[test]
    fn test_stream_skips_invalid_frames() {
        let mut session = Session::new(
            "/dev/fake",
            FakeTransport::new(vec![
                data("not json\n"),
                data("{\"bpm\": 72, \"spo2\": 98}\n"),
                data("[1,2]\n\n"),
                data("{\"bpm\": 7"),
                Chunk::Timeout,
                data("3}\n{\"trunc"),
                data("\n{\"steps\": 5}\n"),
            ])
            .idle_after(Duration::from_millis(5)),
        );
        let mut sink = CsvSink::new(Vec::new(), Vec::new()).unwrap();
        let (end, stats) = stream(
            &mut session,
            &mut sink,
            Some(Instant::now() + Duration::from_millis(200)),
            Some(&utc_clock()),
            &Cancellation::new(),
            std::path::Path::new("unused.csv"),
        )
        .unwrap();
        assert_eq!(end, StreamEnd::DeadlineReached);
        assert_eq!(
            stats,
            StreamStats {
                records: 3,
                // The blank line counts too.
                invalid_frames: 4
            }
        );

        let (csv, _) = sink.into_inner();
        let csv = String::from_utf8(csv).unwrap();
        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(rows.len(), 4);
        let cells: Vec<Vec<&str>> = rows[1..].iter().map(|row| row.split(',').collect()).collect();
        for row in &cells {
            assert!(is_timestamp(row[0]), "bad timestamp in {row:?}");
        }
        assert_eq!(cells[0][1..], ["72", "98", "", "", "", ""]);
        assert_eq!(cells[1][1..], ["73", "", "", "", "", ""]);
        assert_eq!(cells[2][1..], ["", "", "5", "", "", ""]);
    }

    #[test]
    fn test_stream_duration_bound() {
        // A constant trickle of data must not keep the loop alive, and a
        // quiet port must not end it early.
        let duration = Duration::from_millis(150);
        let mut session = Session::new(
            "/dev/fake",
            FakeTransport::new(vec![data("{\"bpm\": 60}\n"); 5])
                .idle_after(Duration::from_millis(10)),
        );
        let mut printer = Printer::new(Vec::new());
        let start = Instant::now();
        let (end, stats) = stream(
            &mut session,
            &mut printer,
            Some(start + duration),
            None,
            &Cancellation::new(),
            std::path::Path::new("unused.csv"),
        )
        .unwrap();
        assert!(start.elapsed() >= duration);
        assert_eq!(end, StreamEnd::DeadlineReached);
        assert_eq!(stats.records, 5);
    }

    #[test]
    fn test_stream_cancelled() {
        let cancellation = Cancellation::new();
        let remote = cancellation.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let mut session = Session::new(
            "/dev/fake",
            FakeTransport::new(vec![data("{\"bpm\": 60}\n")]).idle_after(Duration::from_millis(5)),
        );
        let mut printer = Printer::new(Vec::new());
        let (end, stats) = stream(
            &mut session,
            &mut printer,
            None,
            None,
            &cancellation,
            std::path::Path::new("unused.csv"),
        )
        .unwrap();
        canceller.join().unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(stats.records, 1);
        // Live mode doesn't add timestamps.
        assert_eq!(
            String::from_utf8(printer.into_inner()).unwrap(),
            "{\"bpm\":60}\n"
        );
    }

    #[test]
    fn test_stream_disconnect() {
        let mut session = Session::new("/dev/fake", FakeTransport::new(vec![data("{}\n")]));
        let mut printer = Printer::new(Vec::new());
        let result = stream(
            &mut session,
            &mut printer,
            None,
            None,
            &Cancellation::new(),
            std::path::Path::new("unused.csv"),
        );
        match result {
            Err(Error::Disconnected { port, .. }) => assert_eq!(port, "/dev/fake"),
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert_eq!(printer.count(), 1);
    }

    #[test]
    fn test_run_detects_new_device_and_logs() {
        let config = test_config("run-detect", RunMode::Duration(Duration::from_millis(100)));
        let registry = ScriptedPorts::new(&[
            &["/dev/ttyS0"],
            &["/dev/ttyS0"],
            &["/dev/ttyS0", "/dev/ttyUSB0"],
        ]);
        let transport = FakeTransport::new(vec![
            data("{\"bpm\": 72, \"spo2\": 98}\n"),
            data("not json\n"),
            data("{\"fall\": true, \"lat\": -33.9, \"lng\": 151.2, \"extra\": 1}\n"),
        ])
        .idle_after(Duration::from_millis(5));
        let dropped = transport.dropped.clone();
        let connector = FakeConnector::new(transport);
        let mut console = Vec::new();

        let summary = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut console,
        )
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(
            summary.stats,
            StreamStats {
                records: 2,
                invalid_frames: 1
            }
        );
        assert_eq!(
            connector.opened.take(),
            Some(("/dev/ttyUSB0".to_string(), 9600))
        );
        assert!(dropped.get(), "session must be closed");

        let csv = std::fs::read_to_string(&config.output_path).unwrap();
        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(rows[0], "timestamp,bpm,spo2,steps,fall,lat,lng");
        assert_eq!(rows.len(), 3);
        assert!(rows[1].ends_with(",72,98,,,,"), "got {}", rows[1]);
        assert!(rows[2].ends_with(",,,,true,-33.9,151.2"), "got {}", rows[2]);
        assert_eq!(String::from_utf8(console).unwrap().lines().count(), 2);

        assert_eq!(
            PortMemory::new(&config.memory_path).load().as_deref(),
            Some("/dev/ttyUSB0")
        );
        std::fs::remove_file(&config.output_path).unwrap();
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_reuses_last_port() {
        let config = test_config("run-reuse", RunMode::Duration(Duration::from_millis(30)));
        PortMemory::new(&config.memory_path).save("COM9").unwrap();
        // An enumeration failure would be fatal, so this also proves that
        // reuse skips scanning entirely.
        let registry = ScriptedPorts::failing("must not be called");
        let connector =
            FakeConnector::new(FakeTransport::new(vec![]).idle_after(Duration::from_millis(5)));

        let summary = run(
            &config,
            PortChoice::UseLast,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(summary.port.as_deref(), Some("COM9"));
        assert_eq!(registry.calls.get(), 0);
        assert_eq!(
            std::fs::read_to_string(&config.output_path).unwrap(),
            "timestamp,bpm,spo2,steps,fall,lat,lng\n"
        );
        std::fs::remove_file(&config.output_path).unwrap();
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_use_last_without_memory_detects() {
        let config = test_config("run-no-memory", RunMode::Duration(Duration::from_millis(10)));
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyACM0"]]);
        let connector =
            FakeConnector::new(FakeTransport::new(vec![]).idle_after(Duration::from_millis(5)));
        let summary = run(
            &config,
            PortChoice::UseLast,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(summary.port.as_deref(), Some("/dev/ttyACM0"));
        std::fs::remove_file(&config.output_path).unwrap();
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_connection_failure_creates_no_log() {
        let config = test_config("run-connect-fail", RunMode::Duration(Duration::from_secs(10)));
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyUSB7"]]);
        let connector = FakeConnector::unavailable();
        let result = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut Vec::new(),
        );
        match result {
            Err(e @ Error::Connection(_)) => assert_eq!(e.exit_code(), 1),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert!(!config.output_path.exists());
        assert!(!config.memory_path.exists(), "failed ports are not remembered");
    }

    #[test]
    fn test_run_enumeration_failure() {
        let config = test_config("run-enum-fail", RunMode::Live);
        let registry = ScriptedPorts::failing("permission denied");
        let result = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &FakeConnector::unavailable(),
            &utc_clock(),
            &Cancellation::new(),
            &mut Vec::new(),
        );
        match result {
            Err(e @ Error::Enumeration(_)) => assert_eq!(e.exit_code(), 2),
            other => panic!("expected enumeration error, got {other:?}"),
        }
    }

    #[test]
    fn test_run_cancelled_while_waiting() {
        let config = test_config("run-cancel-wait", RunMode::Live);
        let registry = ScriptedPorts::new(&[&["/dev/ttyS0"]]);
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let summary = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &FakeConnector::unavailable(),
            &utc_clock(),
            &cancellation,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(summary, RunSummary::aborted(None));
    }

    #[test]
    fn test_run_live_mode_interrupted() {
        let config = test_config("run-live", RunMode::Live);
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyUSB0"]]);
        let connector = FakeConnector::new(
            FakeTransport::new(vec![data("{\"spo2\": 95}\n"), data("oops\n")])
                .idle_after(Duration::from_millis(5)),
        );
        let cancellation = Cancellation::new();
        let remote = cancellation.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let mut console = Vec::new();
        let summary = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &cancellation,
            &mut console,
        )
        .unwrap();
        canceller.join().unwrap();

        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(
            summary.stats,
            StreamStats {
                records: 1,
                invalid_frames: 1
            }
        );
        assert_eq!(String::from_utf8(console).unwrap(), "{\"spo2\":95}\n");
        assert!(!config.output_path.exists(), "live mode persists nothing");
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_disconnect_keeps_logged_rows() {
        let config = test_config("run-unplugged", RunMode::Duration(Duration::from_secs(30)));
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyUSB0"]]);
        let connector = FakeConnector::new(FakeTransport::new(vec![
            data("{\"steps\": 3}\n"),
            Chunk::Fail(std::io::ErrorKind::BrokenPipe),
        ]));
        let result = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut Vec::new(),
        );
        match result {
            Err(e @ Error::Disconnected { .. }) => assert_eq!(e.exit_code(), 2),
            other => panic!("expected disconnect, got {other:?}"),
        }
        let csv = std::fs::read_to_string(&config.output_path).unwrap();
        assert_eq!(csv.lines().count(), 2);
        std::fs::remove_file(&config.output_path).unwrap();
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_unbounded_duration_until_cancelled() {
        let config = test_config("run-forever", RunMode::Duration(Duration::MAX));
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyUSB0"]]);
        let connector = FakeConnector::new(
            FakeTransport::new(vec![data("{\"bpm\": 66}\n")]).idle_after(Duration::from_millis(5)),
        );
        let cancellation = Cancellation::new();
        let remote = cancellation.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let summary = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &cancellation,
            &mut Vec::new(),
        )
        .unwrap();
        canceller.join().unwrap();

        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(summary.stats.records, 1);
        std::fs::remove_file(&config.output_path).unwrap();
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_logs_despite_console_failure() {
        let config = test_config("run-no-console", RunMode::Duration(Duration::from_millis(100)));
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyUSB0"]]);
        let connector = FakeConnector::new(
            FakeTransport::new(vec![
                data("{\"bpm\": 70}\n"),
                data("{\"bpm\": 71}\n"),
                data("{\"bpm\": 72}\n"),
            ])
            .idle_after(Duration::from_millis(5)),
        );
        let summary = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut BrokenPipe,
        )
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.stats.records, 3);
        let csv = std::fs::read_to_string(&config.output_path).unwrap();
        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[3].ends_with(",72,,,,,"), "got {}", rows[3]);
        std::fs::remove_file(&config.output_path).unwrap();
        std::fs::remove_file(&config.memory_path).unwrap();
    }

    #[test]
    fn test_run_live_console_failure() {
        let config = test_config("run-live-no-console", RunMode::Live);
        let registry = ScriptedPorts::new(&[&[], &["/dev/ttyUSB0"]]);
        let connector = FakeConnector::new(
            FakeTransport::new(vec![data("{\"spo2\": 95}\n")]).idle_after(Duration::from_millis(5)),
        );
        let result = run(
            &config,
            PortChoice::DetectNew,
            &registry,
            &connector,
            &utc_clock(),
            &Cancellation::new(),
            &mut BrokenPipe,
        );
        match result {
            Err(e @ Error::Console(_)) => {
                assert_eq!(e.exit_code(), 2);
                assert!(!e.to_string().contains(".csv"), "got {e}");
            }
            other => panic!("expected console error, got {other:?}"),
        }
        assert!(!config.output_path.exists());
        std::fs::remove_file(&config.memory_path).unwrap();
    }
}
