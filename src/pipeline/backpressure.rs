/// Queue capacities and the BlockStore byte cap that together bound total
/// pipeline memory. Defaults follow the typical ratios: `Q1=2N, Q2=4N,
/// Q3=4M, Q4=2M`.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    /// Reader → Parsers.
    pub q1: usize,
    /// Parsers → Pusher.
    pub q2: usize,
    /// Pusher → Formatters.
    pub q3: usize,
    /// Formatters → Merger.
    pub q4: usize,
    pub block_store_cap_bytes: u64,
}

/// 256 MiB, the stated default BlockStore cap.
pub const DEFAULT_BLOCK_STORE_CAP_BYTES: u64 = 256 * 1024 * 1024;

impl BackpressureConfig {
    pub fn for_worker_counts(parser_workers: usize, formatter_workers: usize) -> Self {
        Self {
            q1: 2 * parser_workers,
            q2: 4 * parser_workers,
            q3: 4 * formatter_workers,
            q4: 2 * formatter_workers,
            block_store_cap_bytes: DEFAULT_BLOCK_STORE_CAP_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_follow_typical_defaults() {
        let cfg = BackpressureConfig::for_worker_counts(4, 2);
        assert_eq!(cfg.q1, 8);
        assert_eq!(cfg.q2, 16);
        assert_eq!(cfg.q3, 8);
        assert_eq!(cfg.q4, 4);
    }
}
