//! The merger: the pipeline's sole chronological-ordering
//! point. Maintains a bounded "workspace" of in-flight formatted blocks, a
//! min-heap over their current heads, and a monotonically advancing
//! watermark; a record is only ever emitted once the watermark proves no
//! block still to arrive could precede it.
//!
//! A run with several configured sources gives each its own
//! Reader→Parsers→Pusher→Formatters chain (`generation` is only ever
//! comparable within one source's chain), all feeding this one merger.
//! Blocks are keyed by `(source_index, generation)` so two sources' same-
//! numbered generations never collide; the tie-break rule —
//! "ascending generation" — applies within a source, and falls back to
//! ascending `source_index` (i.e. declaration order in the config) across
//! sources, a deterministic extension recorded in DESIGN.md.
//!
//! With several sources live at once, the watermark cannot simply track
//! the maximum `timestamps.min` seen so far: a fast source could race
//! ahead and push the watermark past timestamps a slower, not-yet-heard-
//! from source is still going to deliver. Instead each source has its own
//! floor (its latest released block's `timestamps.min`, `None` until it
//! has delivered anything), and the global watermark is the minimum floor
//! across every source that hasn't finished — a source that has finished
//! (`MergeEvent::SourceDone`) stops constraining it, the same way a
//! depleted input in a k-way merge drops out of the candidate set.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::Write;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::pipeline::formatter::{FormattedBlock, FormattedRecord, MergeEvent};
use crate::pipeline::CancellationToken;
use crate::store::BlockStore;

#[derive(Debug, Error)]
pub enum MergerError {
    #[error("failed writing merged output: {0}")]
    Sink(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeStats {
    pub records_emitted: u64,
    pub blocks_merged: u64,
    pub invalid_records: u64,
}

type BlockKey = (u32, u64);

/// One in-flight block: its rendered bytes, its records reordered to
/// ascending timestamp (a no-op reorder when the block was already
/// `sorted`), and a cursor into that order.
struct ActiveBlock {
    buffer: Vec<u8>,
    records: Vec<FormattedRecord>,
    order: Vec<usize>,
    next: usize,
}

impl ActiveBlock {
    fn head_index(&self) -> usize {
        self.order[self.next]
    }

    fn head_timestamp(&self) -> i64 {
        self.records[self.head_index()].timestamp
    }

    fn head_range(&self) -> std::ops::Range<usize> {
        self.records[self.head_index()].range.clone()
    }

    fn is_exhausted(&self) -> bool {
        self.next >= self.order.len()
    }
}

/// Per-source state the watermark computation needs: the floor this source
/// has established so far (`None` until it delivers its first block with a
/// resolvable timestamp), whether the source chain has fully drained, and
/// the release-sequence reorder buffer that protects the floor from the
/// formatter pool's arbitrary arrival order.
///
/// A source's formatter pool has several workers draining one queue and
/// pushing into the shared `q4` queue the merger reads (§5: "Formatter →
/// Merger: arrival order is arbitrary"). A later-released block that
/// happens to render faster can physically arrive before an
/// earlier-released one that's still being rendered; trusting *arrival*
/// order to advance the floor would let that faster block's larger
/// `timestamps.min` jump the watermark ahead of a smaller timestamp still
/// in flight. `next_seq`/`pending` reconstruct the pusher's true release
/// order (`Block::release_seq`, strictly contiguous from zero per source)
/// out of that arbitrary arrival order — the same "buffer until the next
/// expected one shows up" shape as the pusher's own reorder buffer, keyed
/// by release sequence instead of generation.
#[derive(Default)]
struct SourceState {
    floor: Option<i64>,
    done: bool,
    next_seq: u64,
    pending: HashMap<u64, FormattedBlock>,
}

/// Runs the merger to completion: drains `input` until it closes, writing
/// chronologically-ordered record bytes to `sink`. `num_sources` is the
/// number of source chains feeding `input`; every index in `0..num_sources`
/// is assumed live (constrains the watermark) until its
/// `MergeEvent::SourceDone` arrives. `store`, if any of the run's sources
/// archive into a shared `BlockStore`, is told the watermark's progress so
/// it can free entries that were released but held back by an earlier
/// watermark.
pub fn run_merger<W: Write>(
    input: &Receiver<MergeEvent>,
    sink: &mut W,
    num_sources: u32,
    store: Option<&Arc<BlockStore>>,
    cancel: &CancellationToken,
) -> Result<MergeStats, MergerError> {
    let mut active: HashMap<BlockKey, ActiveBlock> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(i64, u32, u64)>> = BinaryHeap::new();
    let mut sources: Vec<SourceState> = (0..num_sources).map(|_| SourceState::default()).collect();
    let mut watermark = i64::MIN;
    let mut closed = false;
    let mut stats = MergeStats::default();

    loop {
        if cancel.is_cancelled() {
            return Ok(stats);
        }

        while let Some(&Reverse((ts, source_index, generation))) = heap.peek() {
            if !closed && ts > watermark {
                break;
            }
            heap.pop();
            emit_one(&mut active, (source_index, generation), sink, &mut heap, &mut stats)?;
        }

        if closed && heap.is_empty() {
            return Ok(stats);
        }

        match input.recv() {
            Ok(MergeEvent::Block(source_index, formatted)) => {
                stats.blocks_merged += 1;
                stats.invalid_records += formatted.invalid;
                if let Some(state) = sources.get_mut(source_index as usize) {
                    state.pending.insert(formatted.release_seq, formatted);
                    while let Some(next) = state.pending.remove(&state.next_seq) {
                        state.next_seq += 1;
                        let floor_candidate = next.timestamps_min;
                        ingest(&mut active, &mut heap, source_index, next);
                        if let Some(min) = floor_candidate {
                            state.floor = Some(state.floor.map_or(min, |f| f.max(min)));
                        }
                    }
                }
                watermark = recompute_watermark(&sources, watermark);
                if let Some(store) = store {
                    store.advance_watermark(watermark);
                }
            }
            Ok(MergeEvent::SourceDone(source_index)) => {
                if let Some(state) = sources.get_mut(source_index as usize) {
                    state.done = true;
                }
                watermark = recompute_watermark(&sources, watermark);
                if sources.iter().all(|s| s.done) {
                    closed = true;
                    watermark = i64::MAX;
                }
                if let Some(store) = store {
                    store.advance_watermark(watermark);
                }
            }
            Err(_) => {
                closed = true;
                watermark = i64::MAX;
            }
        }
    }
}

/// The watermark is the minimum floor across every source that hasn't
/// finished; a finished source can never lower it further. Monotonic: a
/// source's floor only rises (see `ingest`), and a source leaving the
/// "live" set can only raise the minimum, never lower it — but we still
/// clamp against the previous value defensively, since a live source with
/// `floor: None` contributes `i64::MIN` and must never be allowed to pull
/// an already-advanced watermark back down.
fn recompute_watermark(sources: &[SourceState], previous: i64) -> i64 {
    let candidate = sources
        .iter()
        .filter(|s| !s.done)
        .map(|s| s.floor.unwrap_or(i64::MIN))
        .min()
        .unwrap_or(i64::MAX);
    candidate.max(previous)
}

/// Folds a newly-arrived block into the workspace. Within one source,
/// `timestamps.min` is non-decreasing across arrivals (the pusher's
/// release contract) — the caller uses that same value to update the
/// source's watermark floor.
fn ingest(
    active: &mut HashMap<BlockKey, ActiveBlock>,
    heap: &mut BinaryHeap<Reverse<(i64, u32, u64)>>,
    source_index: u32,
    formatted: FormattedBlock,
) {
    if formatted.records.is_empty() {
        return;
    }

    let mut order: Vec<usize> = (0..formatted.records.len()).collect();
    if !formatted.sorted {
        order.sort_by_key(|&i| formatted.records[i].timestamp);
    }

    let generation = formatted.generation;
    let block = ActiveBlock {
        buffer: formatted.buffer,
        records: formatted.records,
        order,
        next: 0,
    };
    let head_ts = block.head_timestamp();
    active.insert((source_index, generation), block);
    heap.push(Reverse((head_ts, source_index, generation)));
}

fn emit_one<W: Write>(
    active: &mut HashMap<BlockKey, ActiveBlock>,
    key: BlockKey,
    sink: &mut W,
    heap: &mut BinaryHeap<Reverse<(i64, u32, u64)>>,
    stats: &mut MergeStats,
) -> Result<(), MergerError> {
    let exhausted = {
        let block = active
            .get_mut(&key)
            .expect("heap entry for a block not in the workspace");
        let range = block.head_range();
        // Each formatted record is written whole (records are never split
        // across writes), so a short write here would be a bug in `sink`,
        // not something to retry around.
        sink.write_all(&block.buffer[range])?;
        stats.records_emitted += 1;
        block.next += 1;
        block.is_exhausted()
    };

    if exhausted {
        active.remove(&key);
    } else {
        let block = &active[&key];
        heap.push(Reverse((block.head_timestamp(), key.0, key.1)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    /// `release_seq` is the pusher's release-sequence number (strictly
    /// contiguous from zero per source), independent of `generation` — the
    /// tests exercise them diverging on purpose, the way an out-of-order
    /// formatter pool arrival would.
    fn formatted(release_seq: u64, generation: u64, sorted: bool, pairs: &[(i64, &str)]) -> FormattedBlock {
        let mut buffer = Vec::new();
        let mut records = Vec::new();
        for (ts, text) in pairs {
            let start = buffer.len();
            buffer.extend_from_slice(text.as_bytes());
            records.push(FormattedRecord {
                timestamp: *ts,
                range: start..buffer.len(),
            });
        }
        let min = pairs.iter().map(|(ts, _)| *ts).min();
        let max = pairs.iter().map(|(ts, _)| *ts).max();
        FormattedBlock {
            generation,
            release_seq,
            buffer,
            records,
            sorted,
            timestamps_min: min,
            timestamps_max: max,
            invalid: 0,
        }
    }

    #[test]
    fn interleaves_two_sorted_blocks_chronologically() {
        let (tx, rx) = unbounded();
        tx.send(MergeEvent::Block(0, formatted(0, 0, true, &[(10, "a\n"), (30, "c\n")]))).unwrap();
        tx.send(MergeEvent::Block(0, formatted(1, 1, true, &[(20, "b\n"), (40, "d\n")]))).unwrap();
        drop(tx);

        let mut out = Vec::new();
        let stats = run_merger(&rx, &mut out, 1, None, &CancellationToken::new()).unwrap();
        assert_eq!(out, b"a\nb\nc\nd\n");
        assert_eq!(stats.records_emitted, 4);
    }

    #[test]
    fn reorders_an_unsorted_block_before_merging() {
        let (tx, rx) = unbounded();
        tx.send(MergeEvent::Block(0, formatted(0, 0, false, &[(30, "c\n"), (10, "a\n"), (20, "b\n")])))
            .unwrap();
        drop(tx);

        let mut out = Vec::new();
        run_merger(&rx, &mut out, 1, None, &CancellationToken::new()).unwrap();
        assert_eq!(out, b"a\nb\nc\n");
    }

    #[test]
    fn ties_break_by_ascending_generation_within_a_source() {
        let (tx, rx) = unbounded();
        tx.send(MergeEvent::Block(0, formatted(0, 5, true, &[(100, "late-gen\n")]))).unwrap();
        tx.send(MergeEvent::Block(0, formatted(1, 2, true, &[(100, "early-gen\n")]))).unwrap();
        drop(tx);

        let mut out = Vec::new();
        run_merger(&rx, &mut out, 1, None, &CancellationToken::new()).unwrap();
        assert_eq!(out, b"early-gen\nlate-gen\n");
    }

    #[test]
    fn ties_across_sources_break_by_ascending_source_index() {
        let (tx, rx) = unbounded();
        tx.send(MergeEvent::Block(1, formatted(0, 0, true, &[(100, "source-one\n")]))).unwrap();
        tx.send(MergeEvent::Block(0, formatted(0, 0, true, &[(100, "source-zero\n")]))).unwrap();
        drop(tx);

        let mut out = Vec::new();
        run_merger(&rx, &mut out, 2, None, &CancellationToken::new()).unwrap();
        assert_eq!(out, b"source-zero\nsource-one\n");
    }

    #[test]
    fn watermark_holds_back_records_past_the_next_blocks_floor() {
        let (tx, rx) = unbounded();
        // First block's min (10) becomes the watermark floor; its own
        // record at ts=50 must wait for a block whose min proves 50 is
        // safe, or for the channel to close.
        tx.send(MergeEvent::Block(0, formatted(0, 0, true, &[(10, "a\n"), (50, "z\n")]))).unwrap();
        tx.send(MergeEvent::Block(0, formatted(1, 1, true, &[(20, "b\n")]))).unwrap();
        drop(tx);

        let mut out = Vec::new();
        run_merger(&rx, &mut out, 1, None, &CancellationToken::new()).unwrap();
        // Closing the channel unconditionally admits whatever remains, in
        // heap order, so "z" still lands last.
        assert_eq!(out, b"a\nb\nz\n");
    }

    #[test]
    fn a_live_source_with_no_blocks_yet_holds_back_a_faster_sources_records() {
        let (tx, rx) = unbounded();
        // Source 0 delivers a block spanning ts 10..30; source 1 hasn't
        // delivered anything yet, so its floor is unknown and the
        // watermark must not advance past source 0's own floor (10) until
        // source 1 reports in.
        tx.send(MergeEvent::Block(0, formatted(0, 0, true, &[(10, "a\n"), (30, "c\n")]))).unwrap();

        // Drain what's admissible so far without closing the channel.
        let mut out = Vec::new();
        let handle = std::thread::spawn({
            let rx = rx.clone();
            move || run_merger(&rx, &mut out, 2, None, &CancellationToken::new()).map(|s| (s, out))
        });

        // Give the merger a moment to ingest the first block, then signal
        // that source 1 produced nothing and is done.
        std::thread::sleep(std::time::Duration::from_millis(20));
        tx.send(MergeEvent::SourceDone(1)).unwrap();
        drop(tx);

        let (stats, out) = handle.join().unwrap().unwrap();
        assert_eq!(out, b"a\nc\n");
        assert_eq!(stats.records_emitted, 2);
    }
}
