use serde::{Deserialize, Serialize};

/// Block cache sizing, in blocks. `soft_limit` (`S`) is the steady-state
/// target the writer thread trims down to; `hard_limit` (`H`) is the
/// producer-side backpressure bound on in-flight unwritten blocks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    pub soft_limit: usize,
    pub hard_limit: usize,
}

impl CacheConfig {
    #[must_use]
    pub const fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self { soft_limit, hard_limit }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { soft_limit: 1024, hard_limit: 2048 }
    }
}
