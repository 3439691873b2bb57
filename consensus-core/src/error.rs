use thiserror::Error;

/// Errors surfaced by the aggregation core.
///
/// Chain corruption is deliberately absent: the ledger reports it as a
/// [`crate::ledger::ChainReport`] so that historical damage never blocks
/// new appends.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("Malformed output from '{agent_id}': {reason}")]
    MalformedInput { agent_id: String, reason: String },

    #[error("Insufficient specialists: {available} usable output(s), at least {required} required")]
    InsufficientSpecialists { required: usize, available: usize },

    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("Outcome already recorded for case: {0}")]
    AlreadyRecorded(String),

    #[error("Prediction already recorded for case: {0}")]
    DuplicatePrediction(String),

    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<AggregationError>,
    },

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rule table error: {0}")]
    RuleTable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AggregationError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AggregationError::MalformedInput { .. } => "malformed_input",
            AggregationError::InsufficientSpecialists { .. } => "insufficient_specialists",
            AggregationError::NotFound(_) => "not_found",
            AggregationError::AlreadyRecorded(_) => "already_recorded",
            AggregationError::DuplicatePrediction(_) => "duplicate_prediction",
            AggregationError::StageFailed { source, .. } => source.kind(),
            AggregationError::StageNotFound(_) => "stage_not_found",
            AggregationError::ContextError(_) => "context_error",
            AggregationError::Config(_) => "config",
            AggregationError::RuleTable(_) => "rule_table",
            AggregationError::Storage(_) => "storage",
            AggregationError::Serialization(_) => "serialization",
        }
    }

    /// Innermost error, looking through stage wrappers.
    pub fn root(&self) -> &AggregationError {
        match self {
            AggregationError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, AggregationError>;
