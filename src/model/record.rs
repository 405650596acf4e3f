use std::ops::Range;

/// Severity of a parsed log record.
///
/// `Unknown` covers lines a record parser recognized as a record but could
/// not classify — it is distinct from a parse failure, which never becomes
/// a `Record` at all (it is counted in `BlockIndex.lines.invalid` instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Unknown,
}

impl Level {
    /// The bit this level contributes to `BlockIndex.flags`'s low byte.
    /// `Unknown` contributes no bit — a block index's level mask describes
    /// only the *known* severities it contains.
    pub fn flag_bit(self) -> u64 {
        match self {
            Level::Debug => 0x01,
            Level::Info => 0x02,
            Level::Warning => 0x04,
            Level::Error => 0x08,
            Level::Unknown => 0x00,
        }
    }
}

/// A parsed log entry.
///
/// `timestamp` is always a resolved value: a record parser may report no
/// timestamp for a given line, in which case the parser pool resolves it to
/// the nearest prior record's timestamp within the same block.
/// `inherited` records whether that resolution happened, purely for
/// diagnostics — it does not affect ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: i64,
    pub inherited: bool,
    pub level: Level,
    pub line_range: Range<usize>,
}

impl Record {
    pub fn new(timestamp: i64, inherited: bool, level: Level, line_range: Range<usize>) -> Self {
        Self {
            timestamp,
            inherited,
            level,
            line_range,
        }
    }
}
