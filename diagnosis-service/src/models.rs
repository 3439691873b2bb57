use consensus_core::{
    AgentOutput, AggregationError, AuditEntry, ConsensusResult, Explanation, SafetyReport,
    StageRecord, intake::DroppedOutput,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One case as submitted for aggregation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateCaseRequest {
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<AgentOutput>,
}

/// Everything produced for a case by a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub consensus: ConsensusResult,
    pub safety: SafetyReport,
    pub explanation: Explanation,
    pub audit_entry: AuditEntry,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<DroppedOutput>,
    pub stages: Vec<StageRecord>,
}

/// Serializable account of a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub case_id: String,
    pub stage: Option<String>,
    pub kind: String,
    pub reason: String,
}

impl StageFailure {
    pub fn from_error(case_id: impl Into<String>, error: &AggregationError) -> Self {
        let stage = match error {
            AggregationError::StageFailed { stage, .. } => Some(stage.clone()),
            _ => None,
        };
        Self {
            case_id: case_id.into(),
            stage,
            kind: error.kind().to_string(),
            reason: error.root().to_string(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "case {} failed at '{}': {}", self.case_id, stage, self.reason),
            None => write!(f, "case {} failed: {}", self.case_id, self.reason),
        }
    }
}

impl std::error::Error for StageFailure {}
