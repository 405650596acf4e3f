//! The parser pool: splits a raw block into records, applies
//! the record-level filter, computes `BlockIndex`, and — in stream /
//! compressed modes — archives the surviving bytes into the `BlockStore`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::filter::Filter;
use crate::model::block::flags;
use crate::model::{Block, BlockIndex, LineCounts, Record, TimestampRange};
use crate::pipeline::CancellationToken;
use crate::source::reader::RawBlock;
use crate::source::record_parser::{RawRecord, RecordParser};
use crate::store::BlockStore;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("block store error: {0}")]
    Store(#[from] crate::error::BlockError),
}

/// One parser output: either a surviving block (inline bytes, or archived
/// into the `BlockStore`), or a tombstone for a block with zero surviving
/// records / a structurally failed block — the pusher still needs to know
/// this `generation` was accounted for — a dropped block is still counted.
pub enum ParserOutput {
    Block(Block),
    Dropped { generation: u64 },
}

impl ParserOutput {
    pub fn generation(&self) -> u64 {
        match self {
            ParserOutput::Block(b) => b.generation,
            ParserOutput::Dropped { generation } => *generation,
        }
    }
}

/// Whether this source archives surviving bytes into the `BlockStore`
/// (stream / compressed modes) or leaves them inline (regular file mode,
/// where blocks can be re-read on demand from the seekable source).
pub enum ArchiveMode {
    Inline,
    Archive(Arc<BlockStore>),
}

/// Tracks, across all parser workers, the greatest `timestamps.max` seen so
/// far — used by the compressed-mode chronological shortcut.
/// A conservative instrument: under concurrent out-of-order completion it
/// may fail to recognize an eligible block as such (falling back to
/// archiving it), but it will never wrongly skip archiving a block that
/// could still be superseded.
#[derive(Default)]
pub struct ChronologicalTracker {
    max_seen: AtomicI64,
}

impl ChronologicalTracker {
    pub fn new() -> Self {
        Self {
            max_seen: AtomicI64::new(i64::MIN),
        }
    }

    /// Returns true if `min` is at or past every max this tracker has
    /// observed so far, then folds `max` into that running bound.
    pub fn observe(&self, min: i64, max: i64) -> bool {
        let prev = self.max_seen.load(Ordering::SeqCst);
        let eligible = min >= prev;
        self.max_seen.fetch_max(max, Ordering::SeqCst);
        eligible
    }
}

/// Resolves each record's timestamp: a present value is kept; an absent one
/// inherits the nearest prior record's timestamp within the block. Leading
/// records with nothing to inherit backward-fill from the first record in
/// the block that does have a timestamp; a block with no timestamped
/// records at all resolves every record to `0`.
fn resolve_timestamps(raw: &[RawRecord]) -> Vec<(i64, bool)> {
    let mut resolved: Vec<Option<i64>> = raw.iter().map(|r| r.timestamp).collect();
    let mut inherited = vec![false; raw.len()];
    let mut last = None;
    for i in 0..resolved.len() {
        match resolved[i] {
            Some(ts) => last = Some(ts),
            None => {
                if let Some(ts) = last {
                    resolved[i] = Some(ts);
                    inherited[i] = true;
                }
            }
        }
    }
    if let Some(first_known) = resolved.iter().flatten().next().copied() {
        for i in 0..resolved.len() {
            if resolved[i].is_none() {
                resolved[i] = Some(first_known);
                inherited[i] = true;
            }
        }
    }
    resolved
        .into_iter()
        .zip(inherited)
        .map(|(ts, inh)| (ts.unwrap_or(0), inh))
        .collect()
}

fn build_index(records: &[Record]) -> BlockIndex {
    let mut flags_value = 0u64;
    let mut timestamps = TimestampRange::ABSENT;
    let mut sorted = true;
    let mut prev_ts: Option<i64> = None;

    for record in records {
        flags_value |= record.level.flag_bit();
        timestamps.extend(record.timestamp);
        if let Some(prev) = prev_ts {
            if record.timestamp < prev {
                sorted = false;
            }
        }
        prev_ts = Some(record.timestamp);
    }

    if sorted {
        flags_value |= flags::SORTED;
    }

    BlockIndex {
        flags: flags_value,
        lines: LineCounts::default(),
        timestamps,
    }
}

/// One unit of parser work: parse `raw`, apply the record filter, compute
/// the resulting `BlockIndex`, and either archive or pass through inline.
pub fn parse_block(
    raw: RawBlock,
    record_parser: &dyn RecordParser,
    filter: &dyn Filter,
    archive: &ArchiveMode,
    tracker: &ChronologicalTracker,
    cancel: &CancellationToken,
) -> Result<ParserOutput, ParserError> {
    let parsed = record_parser.parse(&raw.bytes);
    let resolved = resolve_timestamps(&parsed.records);

    let fast_path = filter.is_null();
    let mut records = Vec::with_capacity(parsed.records.len());
    for (raw_record, (timestamp, inherited)) in parsed.records.iter().zip(resolved) {
        let record = Record::new(timestamp, inherited, raw_record.level, raw_record.line_range.clone());
        if fast_path || filter.accept_record(&record) {
            records.push(record);
        }
    }

    if records.is_empty() {
        debug!(generation = raw.generation, "parser dropped block: no surviving records");
        return Ok(ParserOutput::Dropped {
            generation: raw.generation,
        });
    }

    let mut index = build_index(&records);
    index.lines = LineCounts {
        valid: parsed.valid_count,
        invalid: parsed.invalid_count,
    };

    match archive {
        ArchiveMode::Inline => Ok(ParserOutput::Block(Block {
            generation: raw.generation,
            offset: raw.offset,
            size: raw.size,
            bytes: Some(raw.bytes),
            records,
            index,
            store_handle: None,
            release_seq: 0,
        })),
        ArchiveMode::Archive(store) => {
            if index.sorted() && tracker.observe(index.timestamps.min, index.timestamps.max) {
                // Chronological shortcut: never revisited, skip archiving.
                return Ok(ParserOutput::Block(Block {
                    generation: raw.generation,
                    offset: raw.offset,
                    size: raw.size,
                    bytes: Some(raw.bytes),
                    records,
                    index,
                    store_handle: None,
                    release_seq: 0,
                }));
            }

            let mut compact = Vec::with_capacity(raw.bytes.len());
            let mut rebased = Vec::with_capacity(records.len());
            for record in &records {
                let start = compact.len();
                compact.extend_from_slice(&raw.bytes[record.line_range.clone()]);
                let end = compact.len();
                rebased.push(Record::new(record.timestamp, record.inherited, record.level, start..end));
            }

            let max_ts = if index.timestamps.present {
                Some(index.timestamps.max)
            } else {
                None
            };

            // §4.6: the archive must never grow the store past its configured
            // cap. Block until capacity frees up (another block's watermark
            // advances and releases its bytes) or cancellation fires.
            if !store.wait_for_capacity(compact.len() as u64, cancel) {
                return Ok(ParserOutput::Dropped {
                    generation: raw.generation,
                });
            }

            let handle = store.put(raw.generation, &compact, max_ts)?;

            Ok(ParserOutput::Block(Block::archived(
                raw.generation,
                raw.offset,
                raw.size,
                rebased,
                index,
                handle,
            )))
        }
    }
}

/// Runs one parser worker: pulls raw blocks, parses/filters/archives them,
/// forwards parser output, until the input channel closes or cancellation
/// fires.
pub fn run_parser_worker(
    input: &Receiver<RawBlock>,
    output: &Sender<ParserOutput>,
    record_parser: &dyn RecordParser,
    filter: &dyn Filter,
    archive: &ArchiveMode,
    tracker: &ChronologicalTracker,
    cancel: &CancellationToken,
) -> Result<(), ParserError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let raw = match input.recv() {
            Ok(raw) => raw,
            Err(_) => return Ok(()),
        };
        let generation = raw.generation;
        match parse_block(raw, record_parser, filter, archive, tracker, cancel) {
            Ok(out) => {
                if output.send(out).is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(generation, error = %err, "dropping structurally-failed block");
                if output
                    .send(ParserOutput::Dropped { generation })
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::LevelWindowFilter;
    use crate::model::Level;
    use crate::source::record_parser::PatternLineParser;

    fn raw(generation: u64, bytes: &[u8]) -> RawBlock {
        RawBlock {
            generation,
            offset: 0,
            size: bytes.len() as u64,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn drops_block_with_no_surviving_records() {
        let parser = PatternLineParser::new(r"^(?P<ts>\d{10})", "epoch", false).unwrap();
        let filter = LevelWindowFilter::new(flags::LEVEL_ERROR, None);
        let tracker = ChronologicalTracker::new();
        let out = parse_block(
            raw(0, b"1700000000 INFO nothing interesting\n"),
            &parser,
            &filter,
            &ArchiveMode::Inline,
            &tracker,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(matches!(out, ParserOutput::Dropped { generation: 0 }));
    }

    #[test]
    fn inline_mode_keeps_records_and_bytes() {
        let parser = PatternLineParser::new(r"^(?P<ts>\d{10})", "epoch", false).unwrap();
        let filter = LevelWindowFilter::all();
        let tracker = ChronologicalTracker::new();
        let out = parse_block(
            raw(3, b"1700000000 ERROR boom\n1700000010 INFO ok\n"),
            &parser,
            &filter,
            &ArchiveMode::Inline,
            &tracker,
            &CancellationToken::new(),
        )
        .unwrap();
        match out {
            ParserOutput::Block(block) => {
                assert_eq!(block.records.len(), 2);
                assert!(block.bytes.is_some());
                assert_eq!(block.records[0].level, Level::Error);
                assert!(block.index.sorted());
            }
            ParserOutput::Dropped { .. } => panic!("expected a block"),
        }
    }

    #[test]
    fn archive_mode_stores_bytes_and_rebases_ranges() {
        let parser = PatternLineParser::new(r"^(?P<ts>\d{10})", "epoch", false).unwrap();
        let filter = LevelWindowFilter::all();
        let tracker = ChronologicalTracker::new();
        let store = Arc::new(BlockStore::new(1 << 20));
        let out = parse_block(
            raw(1, b"1700000010 INFO first\n1700000000 INFO second\n"),
            &parser,
            &filter,
            &ArchiveMode::Archive(store.clone()),
            &tracker,
            &CancellationToken::new(),
        )
        .unwrap();
        match out {
            ParserOutput::Block(block) => {
                assert!(block.bytes.is_none());
                let handle = block.store_handle.expect("archived block has a handle");
                let bytes = store.get(handle).unwrap();
                assert_eq!(&bytes[block.records[0].line_range.clone()], b"1700000010 INFO first\n");
                assert!(!block.index.sorted());
            }
            ParserOutput::Dropped { .. } => panic!("expected a block"),
        }
    }

    #[test]
    fn chronological_tracker_admits_strictly_increasing_ranges() {
        let tracker = ChronologicalTracker::new();
        assert!(tracker.observe(0, 9));
        assert!(tracker.observe(10, 19));
        assert!(!tracker.observe(15, 25));
    }

    #[test]
    fn timestamp_inheritance_fills_forward_then_backfills_leading_gap() {
        let raw_records = vec![
            RawRecord {
                timestamp: None,
                level: Level::Info,
                line_range: 0..1,
            },
            RawRecord {
                timestamp: Some(100),
                level: Level::Info,
                line_range: 1..2,
            },
            RawRecord {
                timestamp: None,
                level: Level::Info,
                line_range: 2..3,
            },
        ];
        let resolved = resolve_timestamps(&raw_records);
        assert_eq!(resolved, vec![(100, true), (100, false), (100, true)]);
    }
}
