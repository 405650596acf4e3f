/// The starter config written by `logmerge config init`, heavily commented
/// so a new user can uncomment their way to a working setup.
pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGMERGE CONFIGURATION
# =============================================================================
# Config file locations (in order of precedence):
#   1. Path specified via --config
#   2. ~/.config/logmerge/config.yml
#   3. /etc/logmerge/config.yml

# =============================================================================
# SOURCES
# =============================================================================
# Each source is ingested in one of three modes:
#   file       - seekable regular file, blocks re-readable on demand
#   stream     - non-seekable byte source (omit `path` to read stdin)
#   compressed - seekable container, blocks decompressed on demand

sources:
  - id: app_log
    mode: file
    path: /var/log/app/app.log
    record_parser:
      kind: pattern
      pattern: '^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z)'
      format: iso8601
      require_match: false

  # - id: app_stream
  #   mode: stream
  #   record_parser:
  #     kind: json
  #     timestamp_field: timestamp
  #     level_field: level

# =============================================================================
# FILTER
# =============================================================================
# Records are emitted only if their level is in `levels` and their
# timestamp (if present) falls inside `window`. Omit `window` to admit
# every timestamp.

filter:
  levels: [info, warning, error]
  # window:
  #   start_ms: 0
  #   end_ms: 9999999999999

# =============================================================================
# PIPELINE
# =============================================================================
# Worker pool sizes default to the number of logical cores. Queue
# capacities default to Q1=2N, Q2=4N, Q3=4M, Q4=2M (N parser workers,
# M formatter workers) and rarely need overriding.

pipeline:
  block_target_bytes: 1048576
  block_store_cap_bytes: 268435456
  # parser_workers: 4
  # formatter_workers: 4

# =============================================================================
# OUTPUT
# =============================================================================
# Omit `path` to write merged records to stdout.

output:
  path: null
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Config;

    #[test]
    fn starter_config_parses_as_valid_yaml() {
        let yaml = generate_starter_config();
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].id, "app_log");
    }
}
