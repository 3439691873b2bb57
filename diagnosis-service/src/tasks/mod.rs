// Per-case aggregation stages, run in order by the workflow
pub mod classify_evidence;
pub mod consensus;
pub mod explain;
pub mod record;
pub mod safety_review;

pub use classify_evidence::ClassifyEvidenceTask;
pub use consensus::ConsensusTask;
pub use explain::ExplainTask;
pub use record::RecordTask;
pub use safety_review::SafetyReviewTask;

/// Keys under which stages exchange data in the case context
pub mod context_keys {
    pub const CASE: &str = "case";
    pub const AGENT_OUTPUTS: &str = "agent_outputs";
    pub const ADMISSION: &str = "admission";
    pub const ANNOTATED: &str = "annotated";
    pub const CONSENSUS: &str = "consensus";
    pub const SAFETY: &str = "safety";
    pub const EXPLANATION: &str = "explanation";
    pub const AUDIT_ENTRY: &str = "audit_entry";
}
