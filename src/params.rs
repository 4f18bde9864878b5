use serde::{Deserialize, Serialize};

/// HNSW tuning for the bundled index.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Params {
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Candidate list size while searching; raised to `2k` when smaller.
    pub ef_search: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Host-mode session settings.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Threads executing decoded commands against the index.
    pub workers: usize,
}

impl SessionConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(workers)
    }
}
