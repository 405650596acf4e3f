use crate::model::{BlockIndex, Record};

/// The filter plug-in contract.
///
/// A filter is consulted at two granularities: once per block (against its
/// `BlockIndex` summary, cheap, used by the reader's pre-filter and the
/// pusher's block-level filter) and once per record (used by the parser
/// pool). Re-applying the record filter downstream of a pass at block level
/// is a no-op fast path: a block that already passed `accept_block` cannot
/// contain a record `accept_record` would reject without also having
/// updated the block's own level mask.
pub trait Filter: Send + Sync {
    fn accept_block(&self, index: &BlockIndex) -> bool;
    fn accept_record(&self, record: &Record) -> bool;

    /// True for a filter that accepts everything, letting the parser pool's
    /// fast path skip per-record filtering entirely.
    fn is_null(&self) -> bool {
        false
    }
}

/// Combines a level bitmask with an optional closed `[start, end]`
/// millisecond timestamp window. This is the one concrete filter this
/// crate ships; `BlockIndex::admitted_by` does the actual bit/range work
/// so the block-level and record-level checks can never disagree.
#[derive(Debug, Clone, Copy)]
pub struct LevelWindowFilter {
    pub level_mask: u64,
    pub window: Option<(i64, i64)>,
}

impl LevelWindowFilter {
    pub fn new(level_mask: u64, window: Option<(i64, i64)>) -> Self {
        Self { level_mask, window }
    }

    /// A filter that accepts everything — the "null filter" the parser
    /// pool's fast path checks for.
    pub fn all() -> Self {
        Self {
            level_mask: crate::model::block::flags::LEVEL_MASK,
            window: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.level_mask == crate::model::block::flags::LEVEL_MASK && self.window.is_none()
    }
}

impl Filter for LevelWindowFilter {
    fn accept_block(&self, index: &BlockIndex) -> bool {
        index.admitted_by(self.level_mask, self.window)
    }

    fn is_null(&self) -> bool {
        LevelWindowFilter::is_null(self)
    }

    fn accept_record(&self, record: &Record) -> bool {
        if record.level.flag_bit() != 0 && self.level_mask & record.level.flag_bit() == 0 {
            return false;
        }
        match self.window {
            Some((lo, hi)) => record.timestamp >= lo && record.timestamp <= hi,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::block::flags;
    use crate::model::Level;

    #[test]
    fn null_filter_accepts_everything() {
        let filter = LevelWindowFilter::all();
        assert!(filter.is_null());
        let record = Record::new(0, false, Level::Error, 0..1);
        assert!(filter.accept_record(&record));
    }

    #[test]
    fn level_window_filter_rejects_wrong_level() {
        let filter = LevelWindowFilter::new(flags::LEVEL_ERROR, None);
        let record = Record::new(0, false, Level::Info, 0..1);
        assert!(!filter.accept_record(&record));
    }

    #[test]
    fn level_window_filter_rejects_outside_window() {
        let filter = LevelWindowFilter::new(flags::LEVEL_MASK, Some((100, 200)));
        let record = Record::new(50, false, Level::Info, 0..1);
        assert!(!filter.accept_record(&record));
    }
}
