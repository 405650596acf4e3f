use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info};

use crate::config;
use crate::pipeline::{run_pipeline, CancellationToken, PipelineError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no config file found; pass --config or create ~/.config/logmerge/config.yml")]
    NoConfig,

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Loads the config at `config_path` and runs one merge to completion,
/// writing the chronologically-ordered, formatted output to the configured
/// sink. Logs a one-line summary on success and a loud `error!` before
/// returning on a fatal failure.
pub fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let path = config_path.ok_or(RunError::NoConfig)?;
    info!(path = %path.display(), "loading config");
    let cfg = config::load_config(&path)?;

    let cancel = CancellationToken::new();
    match run_pipeline(&cfg, &cancel) {
        Ok(stats) => {
            info!(
                records_emitted = stats.records_emitted,
                blocks_merged = stats.blocks_merged,
                invalid_records = stats.invalid_records,
                "run complete"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "run failed");
            Err(err.into())
        }
    }
}
