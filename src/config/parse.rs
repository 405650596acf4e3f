use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

use super::types::{Config, SourceConfig, SourceModeConfig};
use crate::config::{expand_env_vars, expand_tilde};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in '{path}': {source}")]
    Yaml {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let mut file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string)
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let yaml_string = expand_env_vars(&yaml_string);

    let mut config: Config = serde_yaml::from_str(&yaml_string).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    expand_paths(&mut config);
    validate(&config)?;
    Ok(config)
}

fn expand_paths(config: &mut Config) {
    for source in &mut config.sources {
        source.mode = match std::mem::replace(&mut source.mode, SourceModeConfig::Stream { path: None }) {
            SourceModeConfig::File { path } => SourceModeConfig::File {
                path: expand_tilde(&path),
            },
            SourceModeConfig::Stream { path } => SourceModeConfig::Stream {
                path: path.map(|p| expand_tilde(&p)),
            },
            SourceModeConfig::Compressed { path } => SourceModeConfig::Compressed {
                path: expand_tilde(&path),
            },
        };
        source.index_path = source.index_path.as_deref().map(expand_tilde);
    }
    if let Some(path) = config.output.path.take() {
        config.output.path = Some(expand_tilde(&path));
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.sources.is_empty() {
        return Err(ConfigError::Validation("at least one source is required".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for source in &config.sources {
        if !seen.insert(source.id.clone()) {
            return Err(ConfigError::Validation(format!(
                "duplicate source id '{}'",
                source.id
            )));
        }
        validate_source(source)?;
    }
    if let Some(window) = &config.filter.window {
        if window.start_ms > window.end_ms {
            return Err(ConfigError::Validation(format!(
                "filter window start_ms {} is after end_ms {}",
                window.start_ms, window.end_ms
            )));
        }
    }
    Ok(())
}

fn validate_source(source: &SourceConfig) -> Result<(), ConfigError> {
    match &source.mode {
        SourceModeConfig::Stream { path: None } => Ok(()),
        SourceModeConfig::File { path } | SourceModeConfig::Compressed { path } => {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "source '{}' has an empty path",
                    source.id
                )));
            }
            Ok(())
        }
        SourceModeConfig::Stream { path: Some(path) } => {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "source '{}' has an empty path",
                    source.id
                )));
            }
            Ok(())
        }
    }
}
