use std::io::Write;

use log::warn;
use serde_json::Value;

use crate::frame::{TelemetryRecord, RECOGNISED_FIELDS, TIMESTAMP_FIELD};

pub const CSV_HEADER: &str = "timestamp,bpm,spo2,steps,fall,lat,lng";

/// SinkError says which destination refused a record.
#[derive(Debug)]
pub enum SinkError {
    /// The persistent log.
    Output(std::io::Error),
    /// The console, for sinks whose only job is to print.
    Console(std::io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Output(e) => write!(f, "unable to write log: {e}"),
            SinkError::Console(e) => write!(f, "unable to write to console: {e}"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Output(e) | SinkError::Console(e) => Some(e),
        }
    }
}

/// RecordSink consumes decoded records. Both implementations echo records to
/// the console; only CsvSink persists them.
pub trait RecordSink {
    fn accept(&mut self, record: &TelemetryRecord) -> Result<(), SinkError>;

    /// Number of records accepted so far.
    fn count(&self) -> usize;

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Renders one value as a CSV cell. Missing and null values are empty,
/// strings are written raw, everything else as compact JSON.
pub fn csv_cell(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => return String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if text.contains([',', '"', '\r', '\n']) {
        let mut quoted = String::with_capacity(text.len() + 2);
        quoted.push('"');
        for c in text.chars() {
            if c == '"' {
                quoted.push('"');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    } else {
        text
    }
}

pub fn csv_row(record: &TelemetryRecord) -> String {
    let mut row = csv_cell(record.get(TIMESTAMP_FIELD));
    for field in RECOGNISED_FIELDS {
        row.push(',');
        row.push_str(&csv_cell(record.get(field)));
    }
    row
}

/// CsvSink writes one row per record (header first), and echoes each record
/// to `console`. The echo is best effort: once the console can't be written
/// it is turned off and logging carries on.
pub struct CsvSink<W: Write, C: Write> {
    writer: W,
    console: C,
    echo: bool,
    rows: usize,
}

impl<W: Write, C: Write> CsvSink<W, C> {
    pub fn new(mut writer: W, console: C) -> std::io::Result<CsvSink<W, C>> {
        writeln!(writer, "{CSV_HEADER}")?;
        writer.flush()?;
        Ok(CsvSink {
            writer,
            console,
            echo: true,
            rows: 0,
        })
    }

    fn echo(&mut self, record: &TelemetryRecord) {
        if !self.echo {
            return;
        }
        if let Err(e) = writeln!(self.console, "{record}") {
            warn!("Unable to echo records to the console, continuing to log: {e}");
            self.echo = false;
        }
    }

    pub fn into_inner(self) -> (W, C) {
        (self.writer, self.console)
    }
}

impl<W: Write, C: Write> RecordSink for CsvSink<W, C> {
    fn accept(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        writeln!(self.writer, "{}", csv_row(record)).map_err(SinkError::Output)?;
        // Flush per row: an unplugged device or a kill shouldn't cost us
        // everything that was buffered.
        self.writer.flush().map_err(SinkError::Output)?;
        self.rows += 1;
        self.echo(record);
        Ok(())
    }

    fn count(&self) -> usize {
        self.rows
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush().map_err(SinkError::Output)?;
        if self.echo {
            if let Err(e) = self.console.flush() {
                warn!("Unable to flush console: {e}");
            }
        }
        Ok(())
    }
}

/// Printer only echoes records, it keeps nothing.
pub struct Printer<C: Write> {
    console: C,
    printed: usize,
}

impl<C: Write> Printer<C> {
    pub fn new(console: C) -> Printer<C> {
        Printer {
            console,
            printed: 0,
        }
    }

    pub fn into_inner(self) -> C {
        self.console
    }
}

impl<C: Write> RecordSink for Printer<C> {
    fn accept(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        writeln!(self.console, "{record}").map_err(SinkError::Console)?;
        self.console.flush().map_err(SinkError::Console)?;
        self.printed += 1;
        Ok(())
    }

    fn count(&self) -> usize {
        self.printed
    }
}
