pub mod array;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod directory;
pub mod encoding;
pub mod error;
pub mod fragment;
pub mod query;
pub mod stats;
pub mod vacuum;

pub use array::{Array, ArraySchema, Attribute, Cell, CellSize, Dimension, Layout, OpenMode};
pub use config::{Config, ConsolidationConfig, ReaderKind};
pub use consolidation::{consolidate, ConsolidationParams};
pub use context::Context;
pub use directory::{list_fragments, ArrayDirectory, DirectoryMode, FragmentDescriptor};
pub use error::{Error, Result};
pub use fragment::FragmentName;
pub use query::{Query, QueryResults, QueryStatus};
pub use stats::Stats;
pub use vacuum::{vacuum, VacuumSummary};
