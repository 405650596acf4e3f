//! The formatter pool: reacquires a block's bytes (from the
//! `BlockStore` in stream/compressed modes, or straight from the block
//! itself in file mode), renders each surviving record through the
//! configured `RecordFormatter`, and hands the rendered buffer to the
//! merger.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::warn;

use crate::format::RecordFormatter;
use crate::model::Block;
use crate::pipeline::CancellationToken;
use crate::store::BlockStore;

#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("block store error: {0}")]
    Store(#[from] crate::error::BlockError),
}

/// One rendered record: its resolved timestamp (the merge key) and the byte
/// range within the block's shared `buffer` that holds its rendering.
#[derive(Debug, Clone)]
pub struct FormattedRecord {
    pub timestamp: i64,
    pub range: Range<usize>,
}

/// A fully-rendered block, ready for the merger. Carries enough of the
/// original block's `BlockIndex` (`sorted`, `timestamps.min/max`) for the
/// merger to skip re-sorting already-sorted blocks and to drive the
/// `BlockStore` watermark without reaching back into the block model.
pub struct FormattedBlock {
    pub generation: u64,
    /// The source chain's release sequence number, carried through from
    /// `Block::release_seq`. The merger uses this — not arrival order at
    /// its shared input queue, which is arbitrary across a pool of
    /// formatter workers — to reconstruct the pusher's true release order.
    pub release_seq: u64,
    pub buffer: Vec<u8>,
    pub records: Vec<FormattedRecord>,
    pub sorted: bool,
    pub timestamps_min: Option<i64>,
    pub timestamps_max: Option<i64>,
    pub invalid: u64,
}

/// What arrives on the merger's shared input queue: either a rendered
/// block tagged with the source chain it came from, or a signal that a
/// whole source chain has drained for good. The merger needs the latter to
/// compute a correct watermark across several sources running at
/// different speeds — see `pipeline::merger`'s module doc.
pub enum MergeEvent {
    Block(u32, FormattedBlock),
    SourceDone(u32),
}

/// Tracks how many formatter workers are still alive for one source chain.
/// The last one to exit emits `MergeEvent::SourceDone` so the merger learns
/// that source will never produce another floor-lowering block.
pub struct FormatterWorkerGroup {
    remaining: AtomicUsize,
}

impl FormatterWorkerGroup {
    pub fn new(worker_count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(worker_count),
        }
    }
}

/// Renders one block: reacquires its bytes if archived, formats every
/// record, and releases the `BlockStore` handle once done — the block's
/// single pass through the formatter is also its single release. A block
/// travels through the pipeline with one live owner at a time, so one
/// `put` and one `release` bracket its whole lifetime.
pub fn format_block(
    block: Block,
    formatter: &dyn RecordFormatter,
    store: Option<&Arc<BlockStore>>,
) -> Result<FormattedBlock, FormatterError> {
    let source: Vec<u8> = match (&block.bytes, block.store_handle) {
        (Some(bytes), _) => bytes.clone(),
        (None, Some(handle)) => {
            let store = store.expect("archived block without a configured BlockStore");
            let bytes = store.get(handle)?;
            store.release(handle);
            bytes
        }
        (None, None) => Vec::new(),
    };

    let mut buffer = Vec::with_capacity(source.len());
    let mut records = Vec::with_capacity(block.records.len());
    let mut invalid = 0u64;

    for record in &block.records {
        match formatter.format(record, &source, &mut buffer) {
            Some(range) => records.push(FormattedRecord {
                timestamp: record.timestamp,
                range,
            }),
            None => invalid += 1,
        }
    }

    Ok(FormattedBlock {
        generation: block.generation,
        release_seq: block.release_seq,
        buffer,
        records,
        sorted: block.index.sorted(),
        timestamps_min: if block.index.timestamps.present {
            Some(block.index.timestamps.min)
        } else {
            None
        },
        timestamps_max: if block.index.timestamps.present {
            Some(block.index.timestamps.max)
        } else {
            None
        },
        invalid,
    })
}

/// Runs one formatter worker: pulls pushed blocks, formats them, forwards
/// the result tagged with `source_index` (so a merger shared across several
/// sources' chains can tell same-numbered generations from different
/// sources apart), until the input channel closes or cancellation fires.
/// When this is the last live worker in `group`, also emits
/// `MergeEvent::SourceDone` so the merger stops waiting on this source's
/// floor.
pub fn run_formatter_worker(
    source_index: u32,
    input: &Receiver<Block>,
    output: &Sender<MergeEvent>,
    formatter: &dyn RecordFormatter,
    store: Option<&Arc<BlockStore>>,
    group: &Arc<FormatterWorkerGroup>,
    cancel: &CancellationToken,
) -> Result<(), FormatterError> {
    let result = run_formatter_worker_inner(source_index, input, output, formatter, store, cancel);
    if group.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        let _ = output.send(MergeEvent::SourceDone(source_index));
    }
    result
}

fn run_formatter_worker_inner(
    source_index: u32,
    input: &Receiver<Block>,
    output: &Sender<MergeEvent>,
    formatter: &dyn RecordFormatter,
    store: Option<&Arc<BlockStore>>,
    cancel: &CancellationToken,
) -> Result<(), FormatterError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let block = match input.recv() {
            Ok(block) => block,
            Err(_) => return Ok(()),
        };
        let generation = block.generation;
        match format_block(block, formatter, store) {
            Ok(formatted) => {
                if output.send(MergeEvent::Block(source_index, formatted)).is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(generation, error = %err, "dropping block that failed to format");
            }
        }
    }
}
