use std::ops::Range;

use chrono::{TimeZone, Utc};

use crate::model::{Level, Record};

/// The record-formatter plug-in contract: `format(record,
/// buffer) → byte_range`. The formatter pool calls this once per surviving
/// record, appending into a pooled buffer; a formatter is never asked to
/// truncate or split its own output, so `buffer` only ever grows.
pub trait RecordFormatter: Send + Sync {
    /// Appends `record`'s rendering (read from `source` via its
    /// `line_range`) to `buffer` and returns the byte range written.
    /// A formatter failure returns `None`; the caller counts it `invalid`
    /// and moves on rather than failing the run.
    fn format(&self, record: &Record, source: &[u8], buffer: &mut Vec<u8>) -> Option<Range<usize>>;
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Debug => "DEBUG",
        Level::Info => "INFO",
        Level::Warning => "WARNING",
        Level::Error => "ERROR",
        Level::Unknown => "UNKNOWN",
    }
}

/// Writes `<rfc3339 millis> <LEVEL> <raw line>\n` — the one concrete
/// formatter this crate ships. `raw line` is the source bytes the record's
/// `line_range` covers, trailing newline stripped and re-added so the sink's
/// whole-record-write guarantee holds regardless of how the source was
/// terminated.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl RecordFormatter for PlainFormatter {
    fn format(&self, record: &Record, source: &[u8], buffer: &mut Vec<u8>) -> Option<Range<usize>> {
        let start = buffer.len();
        let datetime = Utc.timestamp_millis_opt(record.timestamp).single()?;
        let line = trim_newline(&source[record.line_range.clone()]);

        buffer.extend_from_slice(datetime.to_rfc3339_opts(chrono::SecondsFormat::Millis, true).as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(level_label(record.level).as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(line);
        buffer.push(b'\n');

        Some(start..buffer.len())
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    match bytes.strip_suffix(b"\n") {
        Some(rest) => rest.strip_suffix(b"\r").unwrap_or(rest),
        None => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_formatter_writes_timestamp_level_and_line() {
        let formatter = PlainFormatter;
        let source = b"hello world\n";
        let record = Record::new(0, false, Level::Info, 0..source.len());
        let mut buffer = Vec::new();
        let range = formatter.format(&record, source, &mut buffer).unwrap();
        let text = std::str::from_utf8(&buffer[range]).unwrap();
        assert_eq!(text, "1970-01-01T00:00:00.000Z INFO hello world\n");
    }

    #[test]
    fn plain_formatter_appends_without_clobbering_prior_contents() {
        let formatter = PlainFormatter;
        let source = b"line one\n";
        let record = Record::new(5, false, Level::Debug, 0..source.len());
        let mut buffer = b"prefix".to_vec();
        let range = formatter.format(&record, source, &mut buffer).unwrap();
        assert_eq!(range.start, 6);
        assert!(buffer.starts_with(b"prefix"));
    }
}
