// ⚠️ Error Taxonomy
// Fatal conditions are errors. Recoverable ones (contradictory selections,
// missing groups) are values plus a warning, see resolver.rs and loader.rs.

use thiserror::Error;

/// Main error type for postprocessing
#[derive(Error, Debug)]
pub enum PostprocError {
    // Aggregation errors
    #[error("Aggregation is only defined over region or sector, got: {0}")]
    InvalidAggregationDimension(String),

    #[error("Unsupported reduction: {0}")]
    UnsupportedReduction(String),

    // Baseline invariant - a bug if it ever surfaces
    #[error("Baseline out of sync on dimension '{dim}': dataset has {data} labels, baseline has {baseline}")]
    DimensionMismatch {
        dim: String,
        data: usize,
        baseline: usize,
    },

    #[error("Dataset has no baseline")]
    MissingBaseline,

    // Frame errors
    #[error("Unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("Label {label} not found on dimension '{dim}'")]
    MissingLabel { dim: String, label: String },

    #[error("Shape mismatch for '{name}': {reason}")]
    ShapeMismatch { name: String, reason: String },

    #[error("Variable already exists: {0}")]
    DuplicateVariable(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    // Agent identity errors
    #[error("Malformed agent name '{0}': expected '<sector>:<region>'")]
    MalformedAgentName(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Region group cycle through '{0}'")]
    RegionGroupCycle(String),

    // Store errors
    #[error("Invalid time units: {0}")]
    InvalidTimeUnits(String),

    #[error("Corrupt store: {0}")]
    CorruptStore(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, PostprocError>;

impl PostprocError {
    pub fn missing_label(dim: &str, label: impl std::fmt::Display) -> Self {
        PostprocError::MissingLabel {
            dim: dim.to_string(),
            label: label.to_string(),
        }
    }

    pub fn shape(name: &str, reason: impl Into<String>) -> Self {
        PostprocError::ShapeMismatch {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that indicate a broken internal invariant rather than bad input
    pub fn is_internal(&self) -> bool {
        matches!(self, PostprocError::DimensionMismatch { .. })
    }
}
