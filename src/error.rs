// 🚨 Error taxonomy for the analysis pipeline
//
// Row- and entity-scoped errors are absorbed by the stage that produces them.
// Everything else aborts the run before a snapshot is published.

use thiserror::Error;

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// A required column could not be parsed. Row-scoped, recoverable.
    #[error("malformed row {row} in {file}: {reason}")]
    MalformedRow {
        file: String,
        row: usize,
        reason: String,
    },

    /// Entity is referenced but has no spreadsheet. Entity-scoped, recoverable.
    #[error("no spreadsheet found for entity {pan}")]
    MissingFile { pan: String },

    /// A node is reachable from itself through parent links.
    #[error("cycle detected in entity graph: {}", cycle.join(" → "))]
    CyclicGraph { cycle: Vec<String> },

    /// children/parents lists disagree for an edge.
    #[error("asymmetric link between {parent} and {child}")]
    LinkAsymmetry { parent: String, child: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("analysis exceeded its deadline during {stage}")]
    Timeout { stage: &'static str },

    #[error("failed to read spreadsheet {file}: {reason}")]
    Spreadsheet { file: String, reason: String },

    #[error("another run is publishing to {0}")]
    SnapshotLocked(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Cache(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    /// Recoverable errors are logged and skipped; the run continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalysisError::MalformedRow { .. } | AnalysisError::MissingFile { .. }
        )
    }

    pub fn malformed(file: &str, row: usize, reason: impl Into<String>) -> Self {
        AnalysisError::MalformedRow {
            file: file.to_string(),
            row,
            reason: reason.into(),
        }
    }
}
