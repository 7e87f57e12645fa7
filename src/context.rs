use crate::config::Config;
use crate::stats::Stats;
use std::sync::Arc;

/// Carries configuration and the root statistics scope into every operation.
///
/// Nothing in the crate reaches for global state: arrays, directory loads,
/// consolidation and queries all take a `&Context` and record into child
/// scopes of [`Context::storage_stats`].
#[derive(Debug, Clone)]
pub struct Context {
    config: Config,
    stats: Arc<Stats>,
    storage_stats: Arc<Stats>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Context {
    pub fn new(config: Config) -> Self {
        let stats = Stats::new("Context");
        let storage_stats = stats.child("StorageManager");
        Self {
            config,
            stats,
            storage_stats,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Root scope, `Context`.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// `Context.StorageManager`, parent of per-operation scopes.
    pub fn storage_stats(&self) -> &Arc<Stats> {
        &self.storage_stats
    }
}
