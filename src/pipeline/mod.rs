//! Wires the staged pipeline together: one Reader→Parsers→Pusher→Formatters
//! chain per configured source, all feeding a single Merger. Every stage
//! runs as an OS thread inside one scoped region so the run can be joined
//! and its errors collected without `'static` bounds on borrowed
//! config/filter/formatter values.

pub mod backpressure;
pub mod cancel;
pub mod channel;
pub mod formatter;
pub mod merger;
pub mod parser;
pub mod pusher;

pub use backpressure::BackpressureConfig;
pub use cancel::CancellationToken;
pub use channel::create_channel;
pub use merger::MergeStats;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::types::{Config, RecordParserConfig, SourceConfig, SourceModeConfig};
use crate::error::ReaderError;
use crate::filter::{Filter, LevelWindowFilter};
use crate::format::{PlainFormatter, RecordFormatter};
use crate::index;
use crate::source::reader::{BlockReader, CompressedBlockReader, FileBlockReader, RawBlock, StreamBlockReader};
use crate::source::record_parser::{JsonLineParser, PatternLineParser, RecordParser, RecordParserError};
use crate::store::BlockStore;

use formatter::{run_formatter_worker, FormatterError, FormatterWorkerGroup, MergeEvent};
use merger::{run_merger, MergerError};
use parser::{run_parser_worker, ArchiveMode, ChronologicalTracker, ParserError, ParserOutput};
use pusher::{run_pusher, PusherError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("pusher error: {0}")]
    Pusher(#[from] PusherError),

    #[error("formatter error: {0}")]
    Formatter(#[from] FormatterError),

    #[error("merger error: {0}")]
    Merger(#[from] MergerError),

    #[error("invalid record-parser configuration: {0}")]
    RecordParser(#[from] RecordParserError),

    #[error("index error: {0}")]
    Index(#[from] index::IndexError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline worker thread panicked")]
    WorkerPanicked,
}

fn build_record_parser(cfg: &RecordParserConfig) -> Result<Box<dyn RecordParser>, PipelineError> {
    match cfg {
        RecordParserConfig::Json {
            timestamp_field,
            level_field,
        } => Ok(Box::new(JsonLineParser::new(timestamp_field.clone(), level_field.clone()))),
        RecordParserConfig::Pattern {
            pattern,
            format,
            require_match,
        } => Ok(Box::new(PatternLineParser::new(pattern, format, *require_match)?)),
    }
}

fn load_source_index(path: &Path) -> Result<index::Root, PipelineError> {
    let mut file = File::open(path)?;
    Ok(index::read_index(&mut file)?)
}

fn open_reader(source: &SourceConfig, target_size: u64, filter: &dyn Filter) -> Result<Box<dyn BlockReader>, PipelineError> {
    match &source.mode {
        SourceModeConfig::File { path } => {
            let mut reader = FileBlockReader::open(path, target_size)?;
            if let Some(index_path) = &source.index_path {
                let root = load_source_index(index_path)?;
                reader = reader.with_index(&root, filter);
            }
            Ok(Box::new(reader))
        }
        SourceModeConfig::Stream { path } => {
            let target = target_size;
            match path {
                Some(path) => {
                    let file = File::open(path).map_err(|err| ReaderError::SourceIo {
                        path: path.clone(),
                        source: err,
                    })?;
                    Ok(Box::new(StreamBlockReader::new(file, target)))
                }
                None => Ok(Box::new(StreamBlockReader::new(std::io::stdin(), target))),
            }
        }
        SourceModeConfig::Compressed { path } => {
            let file = File::open(path).map_err(|err| ReaderError::SourceIo {
                path: path.clone(),
                source: err,
            })?;
            let mut reader = CompressedBlockReader::new(file);
            if let Some(index_path) = &source.index_path {
                let root = load_source_index(index_path)?;
                reader = reader.with_index(&root, filter);
            }
            Ok(Box::new(reader))
        }
    }
}

fn archives(source: &SourceConfig) -> bool {
    !matches!(source.mode, SourceModeConfig::File { .. })
}

/// Pulls raw blocks from `reader` until exhaustion, cancellation, or error.
fn run_reader(
    mut reader: Box<dyn BlockReader>,
    output: &crossbeam_channel::Sender<RawBlock>,
    cancel: &CancellationToken,
) -> Result<(), ReaderError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match reader.next_block()? {
            Some(block) => {
                if output.send(block).is_err() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}

/// Runs every stage of one source's chain (reader, parser pool, pusher,
/// formatter pool) on `scope`, sending its formatted output, tagged with
/// `source_index`, into the run's shared merge queue.
#[allow(clippy::too_many_arguments)]
fn spawn_source_chain<'a>(
    scope: &'a std::thread::Scope<'a, '_>,
    source_index: u32,
    source: &'a SourceConfig,
    record_parser: Arc<dyn RecordParser>,
    filter: Arc<dyn Filter>,
    record_formatter: Arc<dyn RecordFormatter>,
    bp: BackpressureConfig,
    parser_workers: usize,
    formatter_workers: usize,
    block_target_bytes: u64,
    store: Arc<BlockStore>,
    q4_tx: crossbeam_channel::Sender<MergeEvent>,
    cancel: CancellationToken,
    errors: &'a std::sync::Mutex<Vec<PipelineError>>,
) -> Result<(), PipelineError> {
    let target_size = source.block_target_bytes.unwrap_or(block_target_bytes);
    let archive_mode = if archives(source) {
        ArchiveMode::Archive(store.clone())
    } else {
        ArchiveMode::Inline
    };
    let reader = open_reader(source, target_size, filter.as_ref())?;

    let (q1_tx, q1_rx) = create_channel::<RawBlock>(bp.q1);
    let (q2_tx, q2_rx) = create_channel::<ParserOutput>(bp.q2);
    let (q3_tx, q3_rx) = create_channel::<crate::model::Block>(bp.q3);

    {
        let cancel = cancel.clone();
        let errors = errors;
        scope.spawn(move || {
            if let Err(err) = run_reader(reader, &q1_tx, &cancel) {
                cancel.cancel();
                errors.lock().unwrap().push(PipelineError::from(err));
            }
        });
    }

    let tracker = Arc::new(ChronologicalTracker::new());
    for _ in 0..parser_workers {
        let q1_rx = q1_rx.clone();
        let q2_tx = q2_tx.clone();
        let record_parser = record_parser.clone();
        let filter = filter.clone();
        let archive_mode_ref = match &archive_mode {
            ArchiveMode::Inline => ArchiveMode::Inline,
            ArchiveMode::Archive(s) => ArchiveMode::Archive(s.clone()),
        };
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        scope.spawn(move || {
            if let Err(err) = run_parser_worker(
                &q1_rx,
                &q2_tx,
                record_parser.as_ref(),
                filter.as_ref(),
                &archive_mode_ref,
                &tracker,
                &cancel,
            ) {
                cancel.cancel();
                errors.lock().unwrap().push(PipelineError::from(err));
            }
        });
    }
    drop(q2_tx);

    {
        let filter = filter.clone();
        let cancel = cancel.clone();
        scope.spawn(move || {
            if let Err(err) = run_pusher(&q2_rx, &q3_tx, filter.as_ref(), &cancel) {
                cancel.cancel();
                errors.lock().unwrap().push(PipelineError::from(err));
            }
        });
    }

    let formatter_group = Arc::new(FormatterWorkerGroup::new(formatter_workers));
    for _ in 0..formatter_workers {
        let q3_rx = q3_rx.clone();
        let q4_tx = q4_tx.clone();
        let record_formatter = record_formatter.clone();
        let store_ref = if archives(source) { Some(store.clone()) } else { None };
        let formatter_group = formatter_group.clone();
        let cancel = cancel.clone();
        scope.spawn(move || {
            if let Err(err) = run_formatter_worker(
                source_index,
                &q3_rx,
                &q4_tx,
                record_formatter.as_ref(),
                store_ref.as_ref(),
                &formatter_group,
                &cancel,
            ) {
                cancel.cancel();
                errors.lock().unwrap().push(PipelineError::from(err));
            }
        });
    }

    Ok(())
}

/// Runs a complete merge for `config`, writing formatted, chronologically
/// ordered output to `config.output.path` or stdout. Returns once every
/// source has been fully drained and merged.
pub fn run_pipeline(config: &Config, cancel: &CancellationToken) -> Result<MergeStats, PipelineError> {
    let filter: Arc<dyn Filter> = Arc::new(LevelWindowFilter::new(
        config.filter.level_mask(),
        config.filter.window_millis(),
    ));
    let record_formatter: Arc<dyn RecordFormatter> = Arc::new(PlainFormatter);
    let bp = config.pipeline.backpressure();
    let store = Arc::new(BlockStore::new(bp.block_store_cap_bytes));

    let record_parsers: Vec<Arc<dyn RecordParser>> = config
        .sources
        .iter()
        .map(|s| build_record_parser(&s.record_parser).map(Arc::from))
        .collect::<Result<_, _>>()?;

    let (q4_tx, q4_rx) = create_channel::<MergeEvent>(bp.q4);
    let num_sources = config.sources.len() as u32;
    let errors: std::sync::Mutex<Vec<PipelineError>> = std::sync::Mutex::new(Vec::new());

    let mut sink: Box<dyn Write + Send> = match &config.output.path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(std::io::stdout())),
    };

    let stats = std::thread::scope(|scope| -> Result<MergeStats, PipelineError> {
        for (i, source) in config.sources.iter().enumerate() {
            spawn_source_chain(
                scope,
                i as u32,
                source,
                record_parsers[i].clone(),
                filter.clone(),
                record_formatter.clone(),
                bp,
                config.pipeline.resolved_parser_workers(),
                config.pipeline.resolved_formatter_workers(),
                config.pipeline.block_target_bytes,
                store.clone(),
                q4_tx.clone(),
                cancel.clone(),
                &errors,
            )?;
        }
        drop(q4_tx);

        info!(sources = config.sources.len(), "pipeline started");
        let stats = run_merger(&q4_rx, &mut sink, num_sources, Some(&store), cancel)?;
        Ok(stats)
    })?;

    sink.flush()?;

    if let Some(err) = errors.into_inner().unwrap().into_iter().next() {
        return Err(err);
    }

    info!(
        records_emitted = stats.records_emitted,
        blocks_merged = stats.blocks_merged,
        invalid_records = stats.invalid_records,
        "pipeline finished"
    );
    Ok(stats)
}
