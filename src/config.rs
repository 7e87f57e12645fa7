/// Which read strategy serves global-order queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderKind {
    /// Heap-based k-way merge that pauses when the memory budget runs out.
    #[default]
    GlobalOrder,
    /// Materializes all visible cells, sorts and deduplicates them up front.
    Legacy,
}

/// Configuration shared by every operation run through a [`crate::Context`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Total memory a single query may use (default: 5GB)
    pub memory_budget: u64,

    /// Share of `memory_budget` available for decoded tiles (default: 0.5)
    pub ratio_tiles: f64,

    /// Reader used for global-order queries (default: GlobalOrder)
    pub reader: ReaderKind,

    /// Consolidation configuration
    pub consolidation: ConsolidationConfig,
}

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Keep every cell version with its write time in a timestamp file (default: true)
    pub with_timestamps: bool,

    /// Greedy planner closes a node once it would grow past this many bytes (default: 256MB)
    pub target_fragment_size: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            with_timestamps: true,
            target_fragment_size: 256 * 1024 * 1024, // 256MB
        }
    }
}

impl ConsolidationConfig {
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.with_timestamps = enabled;
        self
    }

    pub fn target_fragment_size(mut self, size: u64) -> Self {
        self.target_fragment_size = size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_budget: 5 * 1024 * 1024 * 1024, // 5GB
            ratio_tiles: 0.5,
            reader: ReaderKind::GlobalOrder,
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-query memory budget in bytes
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Set the share of the budget reserved for tiles, clamped to `[0, 1]`
    pub fn ratio_tiles(mut self, ratio: f64) -> Self {
        self.ratio_tiles = ratio.clamp(0.0, 1.0);
        self
    }

    /// Select the global-order read strategy
    pub fn reader(mut self, kind: ReaderKind) -> Self {
        self.reader = kind;
        self
    }

    /// Configure consolidation settings
    pub fn consolidation(mut self, config: ConsolidationConfig) -> Self {
        self.consolidation = config;
        self
    }

    /// Bytes of decoded tile data a query may hold at once.
    pub fn tile_budget(&self) -> u64 {
        (self.memory_budget as f64 * self.ratio_tiles) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.memory_budget, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.ratio_tiles, 0.5);
        assert_eq!(config.reader, ReaderKind::GlobalOrder);
        assert!(config.consolidation.with_timestamps);
        assert_eq!(config.consolidation.target_fragment_size, 256 * 1024 * 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .memory_budget(2000)
            .ratio_tiles(0.25)
            .reader(ReaderKind::Legacy)
            .consolidation(
                ConsolidationConfig::default()
                    .with_timestamps(false)
                    .target_fragment_size(4096),
            );

        assert_eq!(config.memory_budget, 2000);
        assert_eq!(config.tile_budget(), 500);
        assert_eq!(config.reader, ReaderKind::Legacy);
        assert!(!config.consolidation.with_timestamps);
        assert_eq!(config.consolidation.target_fragment_size, 4096);
    }

    #[test]
    fn test_ratio_is_clamped() {
        assert_eq!(Config::new().ratio_tiles(3.0).ratio_tiles, 1.0);
        assert_eq!(Config::new().ratio_tiles(-1.0).ratio_tiles, 0.0);
    }
}
