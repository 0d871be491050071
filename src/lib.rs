// GST Hierarchy Analysis - Core Library
// Exposes the analysis engine for the CLI, the API server, and tests

pub mod error;
pub mod config;
pub mod parser;     // Record Loader
pub mod graph;      // Entity arena + traversal
pub mod cache;      // SQLite parse cache
pub mod resolver;   // Entity Resolver
pub mod aggregator;
pub mod classifier;
pub mod exporter;   // Snapshot + atomic publish
pub mod summary;    // Dashboard aggregates
pub mod pipeline;

#[cfg(feature = "tui")]
pub mod ui;

// Re-export commonly used types
pub use error::{AnalysisError, AnalysisResult};
pub use config::{AnalysisConfig, ColumnMapping};
pub use parser::{
    Cell, Direction, TransactionRecord, ParsedSheet, LoaderSettings,
    RowSource, SourceFormat, detect_format, get_source, load_file, parse_rows,
};
pub use graph::{EntityGraph, EntityNode, Ratio, SaleDetail, Status, VisibleNode};
pub use cache::ParseCache;
pub use resolver::{
    FileIndex, RecordProvider, DirectoryProvider, MemoryProvider, ResolveResult,
    resolve, select_root,
};
pub use aggregator::{aggregate_records, apply_aggregates, EntityTotals};
pub use classifier::{Classifier, ClassificationSummary, RiskWeights, ThresholdBand};
pub use exporter::{GraphSnapshot, NodeRecord, SnapshotWriter};
pub use summary::{AnalysisSummary, ContaminationDistribution};
pub use pipeline::{analyze, run, run_with_provider, AnalysisOutcome, RunMetrics};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
