use std::path::PathBuf;
use thiserror::Error;

/// Top-level error returned by the CLI entry point.
///
/// Aggregates the per-module error enums via `#[from]`, one `thiserror`
/// enum per concern rather than a single flat error type.
#[derive(Debug, Error)]
pub enum LogmergeError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Run(#[from] crate::cli::run::RunError),
}

/// Unrecoverable read failure; fails the run.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to read source {path}: {source}")]
    SourceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory-map {path}: {source}")]
    Mmap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),

    #[error("cancelled")]
    Cancelled,
}

/// A structurally-failed block. Local to one block — the block is dropped,
/// a diagnostic logged, and the pipeline continues.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("decompression failed for generation {generation}: {source}")]
    Decompress {
        generation: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed block frame for generation {generation}: {reason}")]
    MalformedFrame { generation: u64, reason: String },
}

/// A bug in the pipeline's own invariants, not an input error. Always fatal.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error(
        "pusher released block generation {generation} with timestamps.min {released_min} \
         before previously released block generation {prior_generation} (min {prior_min})"
    )]
    PusherOutOfOrder {
        generation: u64,
        released_min: i64,
        prior_generation: u64,
        prior_min: i64,
    },

    #[error(
        "formatted block generation {generation} arrived with timestamps.min {observed_min} \
         below the merger watermark {watermark}"
    )]
    BelowWatermark {
        generation: u64,
        observed_min: i64,
        watermark: i64,
    },

    #[error("block index flags 0x{flags:016x} set reserved bits outside the defined mask")]
    ReservedFlagBits { flags: u64 },
}
