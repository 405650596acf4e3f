use std::ops::Range;

use serde_json::Value;
use thiserror::Error;

use crate::model::Level;
use crate::source::timestamp::TimestampExtractor;

#[derive(Debug, Error)]
pub enum RecordParserError {
    #[error("invalid pattern parser configuration: {0}")]
    Timestamp(#[from] crate::source::timestamp::TimestampError),
}

/// A single parsed line, before the parser pool resolves timestamp
/// inheritance and builds a `model::Record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub timestamp: Option<i64>,
    pub level: Level,
    pub line_range: Range<usize>,
}

/// Result of parsing one raw block's worth of bytes: the lines that became
/// records plus the `valid`/`invalid` counts, which always satisfy
/// `valid + invalid == k` (the number of lines the block was split into).
#[derive(Debug, Default)]
pub struct ParsedLines {
    pub records: Vec<RawRecord>,
    pub valid_count: u64,
    pub invalid_count: u64,
}

/// The record-parser plug-in contract: `parse(bytes) →
/// {records, valid_count, invalid_count}`.
pub trait RecordParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> ParsedLines;
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = Range<usize>> + '_ {
    let mut start = 0;
    std::iter::from_fn(move || {
        if start >= bytes.len() {
            return None;
        }
        match bytes[start..].iter().position(|&b| b == b'\n') {
            Some(rel) => {
                let end = start + rel + 1;
                let range = start..end;
                start = end;
                Some(range)
            }
            None => {
                let range = start..bytes.len();
                start = bytes.len();
                Some(range)
            }
        }
    })
}

/// One JSON object per line, reading a configurable timestamp field (epoch
/// milliseconds) and level field (matched case-insensitively against
/// `debug|info|warning|error`, anything else maps to `Level::Unknown`).
/// Lines that fail to parse as JSON, or are missing the timestamp field,
/// count `invalid` but do not abort the block.
#[derive(Debug, Clone)]
pub struct JsonLineParser {
    pub timestamp_field: String,
    pub level_field: String,
}

impl JsonLineParser {
    pub fn new(timestamp_field: impl Into<String>, level_field: impl Into<String>) -> Self {
        Self {
            timestamp_field: timestamp_field.into(),
            level_field: level_field.into(),
        }
    }

    fn level_from_value(value: &Value) -> Level {
        let text = match value.as_str() {
            Some(s) => s,
            None => return Level::Unknown,
        };
        match text.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Level::Debug,
            "info" | "information" => Level::Info,
            "warning" | "warn" => Level::Warning,
            "error" | "err" | "fatal" | "critical" => Level::Error,
            _ => Level::Unknown,
        }
    }

    fn timestamp_from_value(value: &Value) -> Option<i64> {
        if let Some(n) = value.as_i64() {
            return Some(n);
        }
        if let Some(f) = value.as_f64() {
            return Some(f as i64);
        }
        value.as_str().and_then(|s| s.parse::<i64>().ok())
    }
}

impl RecordParser for JsonLineParser {
    fn parse(&self, bytes: &[u8]) -> ParsedLines {
        let mut out = ParsedLines::default();
        for line_range in split_lines(bytes) {
            let trimmed = trim_newline(&bytes[line_range.clone()]);
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(trimmed) {
                Ok(Value::Object(map)) => {
                    let timestamp = map
                        .get(&self.timestamp_field)
                        .and_then(Self::timestamp_from_value);
                    let level = map
                        .get(&self.level_field)
                        .map(Self::level_from_value)
                        .unwrap_or(Level::Unknown);
                    out.records.push(RawRecord {
                        timestamp,
                        level,
                        line_range,
                    });
                    out.valid_count += 1;
                }
                _ => out.invalid_count += 1,
            }
        }
        out
    }
}

/// Regex with a named `ts` capture plus a level-keyword scan, generalizing
/// `TimestampExtractor` into a full `RecordParser`. A line that the pattern
/// doesn't match at all is still admitted as a record with no timestamp
/// (the parser pool will inherit one) unless `require_match` is set, in
/// which case it counts `invalid`.
pub struct PatternLineParser {
    extractor: TimestampExtractor,
    level_keywords: Vec<(String, Level)>,
    require_match: bool,
}

impl PatternLineParser {
    pub fn new(pattern: &str, format: &str, require_match: bool) -> Result<Self, RecordParserError> {
        Ok(Self {
            extractor: TimestampExtractor::new(pattern, format)?,
            level_keywords: vec![
                ("ERROR".to_string(), Level::Error),
                ("FATAL".to_string(), Level::Error),
                ("WARN".to_string(), Level::Warning),
                ("INFO".to_string(), Level::Info),
                ("DEBUG".to_string(), Level::Debug),
            ],
            require_match,
        })
    }

    fn scan_level(&self, line: &str) -> Level {
        for (keyword, level) in &self.level_keywords {
            if line.contains(keyword.as_str()) {
                return *level;
            }
        }
        Level::Unknown
    }
}

impl RecordParser for PatternLineParser {
    fn parse(&self, bytes: &[u8]) -> ParsedLines {
        let mut out = ParsedLines::default();
        for line_range in split_lines(bytes) {
            let trimmed = trim_newline(&bytes[line_range.clone()]);
            if trimmed.is_empty() {
                continue;
            }
            let line = match std::str::from_utf8(trimmed) {
                Ok(s) => s,
                Err(_) => {
                    out.invalid_count += 1;
                    continue;
                }
            };
            match self.extractor.extract_millis(line) {
                Ok(timestamp) => {
                    if timestamp.is_none() && self.require_match {
                        out.invalid_count += 1;
                        continue;
                    }
                    out.records.push(RawRecord {
                        timestamp,
                        level: self.scan_level(line),
                        line_range,
                    });
                    out.valid_count += 1;
                }
                Err(_) => out.invalid_count += 1,
            }
        }
        out
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
    fn json_line_parser_parses_timestamp_and_level() {
        let parser = JsonLineParser::new("ts", "level");
        let input = b"{\"ts\": 1000, \"level\": \"error\", \"msg\": \"boom\"}\n{\"ts\": 900, \"level\": \"info\"}\n";
        let parsed = parser.parse(input);
        assert_eq!(parsed.valid_count, 2);
        assert_eq!(parsed.invalid_count, 0);
        assert_eq!(parsed.records[0].timestamp, Some(1000));
        assert_eq!(parsed.records[0].level, Level::Error);
        assert_eq!(parsed.records[1].timestamp, Some(900));
    }

    #[test]
    fn json_line_parser_counts_malformed_lines_invalid() {
        let parser = JsonLineParser::new("ts", "level");
        let input = b"not json\n{\"ts\": 1}\n";
        let parsed = parser.parse(input);
        assert_eq!(parsed.invalid_count, 1);
        assert_eq!(parsed.valid_count, 1);
    }

    #[test]
    fn pattern_line_parser_extracts_epoch_and_level_keyword() {
        let parser = PatternLineParser::new(r"^(?P<ts>\d{10})", "epoch", false).unwrap();
        let input = b"1733280131 ERROR something broke\n1733280132 nothing to see\n";
        let parsed = parser.parse(input);
        assert_eq!(parsed.valid_count, 2);
        assert_eq!(parsed.records[0].level, Level::Error);
        assert_eq!(parsed.records[0].timestamp, Some(1_733_280_131_000));
        assert_eq!(parsed.records[1].level, Level::Unknown);
    }

    #[test]
    fn pattern_line_parser_require_match_rejects_unmatched_lines() {
        let parser = PatternLineParser::new(r"^(?P<ts>\d{10})", "epoch", true).unwrap();
        let input = b"no timestamp here\n";
        let parsed = parser.parse(input);
        assert_eq!(parsed.invalid_count, 1);
        assert_eq!(parsed.valid_count, 0);
    }
}
