use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::block::flags;

/// Top-level configuration for a `logmerge` run: one or more sources, the
/// output filter, the worker-pool sizes, and the block store cap. Loaded
/// from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Label used only in diagnostics.
    pub id: String,
    #[serde(flatten)]
    pub mode: SourceModeConfig,
    pub record_parser: RecordParserConfig,
    /// Target block size in bytes before extending to the next newline.
    /// Overrides `pipeline.block_target_bytes` for this source only.
    pub block_target_bytes: Option<u64>,
    /// Path to a persistent index file used to pre-filter
    /// blocks in file / compressed-file modes. Optional — without one the
    /// reader has no pre-filter and reads every block.
    pub index_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SourceModeConfig {
    /// Regular, seekable file; blocks are re-readable on demand.
    File { path: PathBuf },
    /// Non-seekable stream: a named FIFO/file path, or standard input when
    /// `path` is omitted.
    Stream { path: Option<PathBuf> },
    /// Seekable but block-costly-to-decompress container.
    Compressed { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordParserConfig {
    /// One JSON object per line (`JsonLineParser`).
    Json {
        #[serde(default = "default_ts_field")]
        timestamp_field: String,
        #[serde(default = "default_level_field")]
        level_field: String,
    },
    /// Regex `ts` capture plus level-keyword scan (`PatternLineParser`).
    Pattern {
        pattern: String,
        format: String,
        #[serde(default)]
        require_match: bool,
    },
}

fn default_ts_field() -> String {
    "timestamp".to_string()
}

fn default_level_field() -> String {
    "level".to_string()
}

/// The one concrete filter this crate ships (`filter::LevelWindowFilter`):
/// a level mask plus an optional closed timestamp window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub levels: Vec<LevelName>,
    pub window: Option<WindowConfig>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LevelName::Debug,
                LevelName::Info,
                LevelName::Warning,
                LevelName::Error,
            ],
            window: None,
        }
    }
}

impl FilterConfig {
    /// Level bits the low byte of `BlockIndex.flags` uses.
    /// `Unknown` records have no bit and are always admitted on level.
    pub fn level_mask(&self) -> u64 {
        self.levels.iter().fold(0u64, |mask, level| mask | level.flag_bit())
    }

    pub fn window_millis(&self) -> Option<(i64, i64)> {
        self.window.as_ref().map(|w| (w.start_ms, w.end_ms))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LevelName {
    Debug,
    Info,
    Warning,
    Error,
}

impl LevelName {
    fn flag_bit(self) -> u64 {
        match self {
            LevelName::Debug => flags::LEVEL_DEBUG,
            LevelName::Info => flags::LEVEL_INFO,
            LevelName::Warning => flags::LEVEL_WARNING,
            LevelName::Error => flags::LEVEL_ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Worker-pool sizes, queue capacities, and the BlockStore cap.
/// Queue capacities default to the "Typical" ratios (`Q1=2N, Q2=4N, Q3=4M,
/// Q4=2M`) unless explicitly overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub parser_workers: Option<usize>,
    pub formatter_workers: Option<usize>,
    pub block_target_bytes: u64,
    pub block_store_cap_bytes: u64,
    pub q1_capacity: Option<usize>,
    pub q2_capacity: Option<usize>,
    pub q3_capacity: Option<usize>,
    pub q4_capacity: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parser_workers: None,
            formatter_workers: None,
            block_target_bytes: 1024 * 1024,
            block_store_cap_bytes: crate::pipeline::backpressure::DEFAULT_BLOCK_STORE_CAP_BYTES,
            q1_capacity: None,
            q2_capacity: None,
            q3_capacity: None,
            q4_capacity: None,
        }
    }
}

impl PipelineConfig {
    pub fn resolved_parser_workers(&self) -> usize {
        self.parser_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn resolved_formatter_workers(&self) -> usize {
        self.formatter_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn backpressure(&self) -> crate::pipeline::backpressure::BackpressureConfig {
        let mut cfg = crate::pipeline::backpressure::BackpressureConfig::for_worker_counts(
            self.resolved_parser_workers(),
            self.resolved_formatter_workers(),
        );
        if let Some(q1) = self.q1_capacity {
            cfg.q1 = q1;
        }
        if let Some(q2) = self.q2_capacity {
            cfg.q2 = q2;
        }
        if let Some(q3) = self.q3_capacity {
            cfg.q3 = q3;
        }
        if let Some(q4) = self.q4_capacity {
            cfg.q4 = q4;
        }
        cfg.block_store_cap_bytes = self.block_store_cap_bytes;
        cfg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where merged, formatted records are written. `None` means stdout.
    pub path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { path: None }
    }
}
