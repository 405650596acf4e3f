use crate::model::record::Record;

/// Bits of `BlockIndex.flags`.
pub mod flags {
    pub const LEVEL_DEBUG: u64 = 0x01;
    pub const LEVEL_INFO: u64 = 0x02;
    pub const LEVEL_WARNING: u64 = 0x04;
    pub const LEVEL_ERROR: u64 = 0x08;
    pub const LEVEL_MASK: u64 = 0xFF;
    pub const SORTED: u64 = 0x100;
    pub const BINARY: u64 = 0x8000_0000_0000_0000;

    /// Bits a conforming producer may ever set. A reader that finds a bit
    /// outside this mask set has found a `ContractViolation`.
    pub const DEFINED_MASK: u64 = LEVEL_MASK | SORTED | BINARY;
}

/// Line accounting for a block: `valid + invalid` always equals the number
/// of lines the reader split the block into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    pub valid: u64,
    pub invalid: u64,
}

/// Timestamp extent of a block's surviving records.
///
/// `present == false` means no surviving record had a resolvable timestamp;
/// such a block is admitted for every time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRange {
    pub present: bool,
    pub min: i64,
    pub max: i64,
}

impl TimestampRange {
    pub const ABSENT: TimestampRange = TimestampRange {
        present: false,
        min: 0,
        max: 0,
    };

    pub fn single(ts: i64) -> Self {
        Self {
            present: true,
            min: ts,
            max: ts,
        }
    }

    /// Widen this range to also cover `ts`.
    pub fn extend(&mut self, ts: i64) {
        if self.present {
            self.min = self.min.min(ts);
            self.max = self.max.max(ts);
        } else {
            *self = Self::single(ts);
        }
    }

    /// Merge two ranges, as `BlockIndex::merge` must when a block is split
    /// or combined upstream of the pipeline (e.g. persistent index rebuild).
    pub fn merge(self, other: Self) -> Self {
        match (self.present, other.present) {
            (true, true) => TimestampRange {
                present: true,
                min: self.min.min(other.min),
                max: self.max.max(other.max),
            },
            (true, false) => self,
            (false, true) => other,
            (false, false) => Self::ABSENT,
        }
    }
}

/// Compact descriptor of a block, independent of whether the block's bytes
/// or records are currently materialized. Serialized verbatim into the
/// persistent index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndex {
    pub flags: u64,
    pub lines: LineCounts,
    pub timestamps: TimestampRange,
}

impl BlockIndex {
    pub fn empty() -> Self {
        Self {
            flags: 0,
            lines: LineCounts::default(),
            timestamps: TimestampRange::ABSENT,
        }
    }

    pub fn sorted(&self) -> bool {
        self.flags & flags::SORTED != 0
    }

    pub fn set_sorted(&mut self, sorted: bool) {
        if sorted {
            self.flags |= flags::SORTED;
        } else {
            self.flags &= !flags::SORTED;
        }
    }

    /// Levels present in the block, as a bitmask restricted to the low
    /// byte.
    pub fn level_mask(&self) -> u64 {
        self.flags & flags::LEVEL_MASK
    }

    /// Reject frames whose flags carry bits outside the defined mask —
    /// the "readers MUST reject frames whose unknown flag bits
    /// are set outside the reserved ranges".
    pub fn validate_flags(flags: u64) -> Result<(), crate::error::ContractViolation> {
        if flags & !self::flags::DEFINED_MASK != 0 {
            Err(crate::error::ContractViolation::ReservedFlagBits { flags })
        } else {
            Ok(())
        }
    }

    /// Does this block's index pass the given level mask and timestamp
    /// window? Used identically by the parser's fast path, the pusher's
    /// block-level filter, and the reader's persistent-index pre-filter
    /// — one predicate, three call sites.
    pub fn admitted_by(&self, level_mask: u64, window: Option<(i64, i64)>) -> bool {
        if self.level_mask() & level_mask == 0 && self.level_mask() != 0 {
            return false;
        }
        match (window, self.timestamps.present) {
            (Some((lo, hi)), true) => self.timestamps.min <= hi && self.timestamps.max >= lo,
            // No timestamps in the block, or no window configured: admit.
            _ => true,
        }
    }
}

/// A contiguous range of source bytes plus everything derived from it.
///
/// `bytes` and `records` are only populated while some stage is actively
/// holding the block's payload; a block travelling as metadata-only
/// (the stream/compressed archive path) carries `bytes: None`,
/// `records: Vec::new()` and reaches into the `BlockStore` via its
/// `generation` instead.
#[derive(Debug, Clone)]
pub struct Block {
    pub generation: u64,
    pub offset: u64,
    pub size: u64,
    pub bytes: Option<Vec<u8>>,
    pub records: Vec<Record>,
    pub index: BlockIndex,
    /// Set instead of `bytes` when this block's payload was archived into
    /// the `BlockStore` (stream / compressed modes, the archive
    /// step). The formatter reacquires bytes through the store before
    /// rendering, then releases the handle.
    pub store_handle: Option<crate::store::BlockHandle>,
    /// This source chain's release sequence number, assigned by the pusher
    /// at the moment it releases the block (not before) — `0` for every
    /// block before that point. Distinct from `generation` (read order):
    /// the pusher releases in `timestamps.min` order, which can diverge
    /// from read order, so the merger needs this separate, strictly
    /// release-ordered sequence to reconstruct the pusher's true release
    /// order out of the formatter pool's arbitrary completion order.
    pub release_seq: u64,
}

impl Block {
    pub fn new(generation: u64, offset: u64, size: u64, bytes: Vec<u8>) -> Self {
        Self {
            generation,
            offset,
            size,
            bytes: Some(bytes),
            records: Vec::new(),
            index: BlockIndex::empty(),
            store_handle: None,
            release_seq: 0,
        }
    }

    /// A block whose bytes live in the `BlockStore` under `handle` rather
    /// than inline ( archive step).
    pub fn archived(
        generation: u64,
        offset: u64,
        size: u64,
        records: Vec<Record>,
        index: BlockIndex,
        handle: crate::store::BlockHandle,
    ) -> Self {
        Self {
            generation,
            offset,
            size,
            bytes: None,
            records,
            index,
            store_handle: Some(handle),
            release_seq: 0,
        }
    }

    /// Byte slice of a single record, panics if `bytes` isn't materialized.
    /// Callers on the formatter path always reacquire bytes (from the
    /// BlockStore, in stream/compressed modes) before calling this.
    pub fn record_text<'a>(&'a self, record: &Record) -> &'a [u8] {
        let bytes = self
            .bytes
            .as_deref()
            .expect("record_text called on a block with no materialized bytes");
        &bytes[record.line_range.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_range_extend_from_absent() {
        let mut range = TimestampRange::ABSENT;
        range.extend(10);
        assert_eq!(range, TimestampRange::single(10));
        range.extend(5);
        assert_eq!(range.min, 5);
        assert_eq!(range.max, 10);
    }

    #[test]
    fn validate_flags_rejects_unknown_bits() {
        assert!(BlockIndex::validate_flags(flags::SORTED | flags::LEVEL_ERROR).is_ok());
        assert!(BlockIndex::validate_flags(1 << 10).is_err());
    }

    #[test]
    fn admitted_by_honors_level_and_window() {
        let mut idx = BlockIndex::empty();
        idx.flags |= flags::LEVEL_INFO;
        idx.timestamps = TimestampRange { present: true, min: 10, max: 20 };

        assert!(idx.admitted_by(flags::LEVEL_INFO, Some((0, 30))));
        assert!(!idx.admitted_by(flags::LEVEL_ERROR, Some((0, 30))));
        assert!(!idx.admitted_by(flags::LEVEL_INFO, Some((100, 200))));
        assert!(idx.admitted_by(flags::LEVEL_INFO, None));
    }

    #[test]
    fn admitted_by_admits_blocks_with_no_timestamps() {
        let mut idx = BlockIndex::empty();
        idx.flags |= flags::LEVEL_INFO;
        assert!(idx.admitted_by(flags::LEVEL_INFO, Some((0, 1))));
    }
}
