pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use parse::{load_config, ConfigError};
pub use types::Config;

/// Expands environment variables in a string. Supports `$env{VAR_NAME}`
/// syntax; an unset variable is left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(text, |caps: &regex::Captures| {
        let var_name = caps.get(1).unwrap().as_str();
        std::env::var(var_name).unwrap_or_else(|_| caps.get(0).unwrap().as_str().to_string())
    })
    .to_string()
}

/// Expands a leading `~` to the user's home directory. Returns the path
/// unchanged if it doesn't start with `~` or the home directory can't be
/// determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if path_str.starts_with("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(&path_str[2..]);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }
    path.to_path_buf()
}

/// Resolves the config file path: explicit argument, else
/// `~/.config/logmerge/config.yml`, else `/etc/logmerge/config.yml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }
    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/logmerge/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }
    let system_config = PathBuf::from("/etc/logmerge/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_vars_substitutes_set_variable() {
        std::env::set_var("LOGMERGE_TEST_VAR", "value");
        assert_eq!(expand_env_vars("path/$env{LOGMERGE_TEST_VAR}/x"), "path/value/x");
        std::env::remove_var("LOGMERGE_TEST_VAR");
    }

    #[test]
    fn expand_env_vars_leaves_unset_variable() {
        assert_eq!(
            expand_env_vars("$env{LOGMERGE_UNSET_VAR}"),
            "$env{LOGMERGE_UNSET_VAR}"
        );
    }

    #[test]
    fn expand_tilde_joins_home_dir() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")), home.join("x"));
        }
    }

    #[test]
    fn expand_tilde_leaves_absolute_path() {
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }
}
