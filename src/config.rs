//! # Engine Configuration
//!
//! Explicit configuration passed at engine construction. There is no global
//! state; the binary maps command-line flags onto this struct.

use std::path::PathBuf;
use std::thread;

/// Default bound on download attempts per piece task.
pub const DEFAULT_MAX_TRY: usize = 50;

/// Tunables of the download engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Folder prepended to every file path written by the engine
    pub download_folder: PathBuf,
    /// Maximum download attempts per piece before the torrent errors out
    pub max_try: usize,
    /// Worker thread count override; `None` selects one thread per available
    /// core minus one, with a floor of one
    pub workers: Option<usize>,
}

impl Config {
    /// Number of worker threads to launch.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let concurrency = thread::available_parallelism().map_or(1, |n| n.get());
            concurrency.saturating_sub(1).max(1)
        })
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            download_folder: PathBuf::from("."),
            max_try: DEFAULT_MAX_TRY,
            workers: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_honors_override() {
        let config = Config {
            workers: Some(3),
            ..Config::default()
        };
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn worker_count_has_a_floor_of_one() {
        let config = Config::default();
        assert!(config.worker_count() >= 1);
    }
}
