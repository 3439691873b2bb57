pub mod calibration;
pub mod config;
pub mod consensus;
pub mod context;
pub mod error;
pub mod evidence;
pub mod explain;
pub mod intake;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod rules;
pub mod safety;
pub mod stage;
pub mod storage;

// Re-export commonly used types
pub use calibration::{BucketAccuracy, CalibrationSnapshot, CalibrationSummary, CalibrationTracker};
pub use config::{AggregationConfig, CalibrationConfig, SpecialistProfile, SpecialistRegistry};
pub use consensus::ConsensusEngine;
pub use context::CaseContext;
pub use error::{AggregationError, Result};
pub use evidence::{AnnotatedOutput, EvidenceClassifier};
pub use explain::ExplainabilityEngine;
pub use intake::{Admission, admit};
pub use ledger::{AuditLedger, ChainReport, GENESIS_HASH};
pub use models::*;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineRun, StageRecord};
pub use rules::{Contraindication, RuleTable};
pub use safety::SafetyReviewer;
pub use stage::{NextStage, Stage, StageResult};
pub use storage::{
    AuditRecord, AuditStore, CalibrationStore, InMemoryAuditStore, InMemoryCalibrationStore,
    JsonlAuditStore, JsonlCalibrationStore,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const PE: &str = "Pulmonary Embolism";

    /// The engines wired by hand, the way the service pipeline runs them.
    #[test]
    fn engines_compose_end_to_end() {
        let config = Arc::new(AggregationConfig::default());
        let rules = Arc::new(RuleTable::embedded());
        let outputs = vec![
            AgentOutput::new("radiologist")
                .with_diagnosis(PE, 0.98)
                .with_finding(Finding::present("Filling defect in left pulmonary artery")),
            AgentOutput::new("pulmonologist").with_diagnosis("PE", 0.4),
            AgentOutput::new("cardiologist").with_diagnosis("Pericarditis", 0.6),
            AgentOutput::new("pathologist").with_diagnosis("Pneumonia", 0.5),
        ];

        let admission = admit(outputs, &config, &rules).unwrap();
        let annotated =
            EvidenceClassifier::new(rules).annotate_all(&admission.outputs, &config.specialists);
        let consensus = ConsensusEngine::new(config.clone()).merge(&annotated);
        let tracker = CalibrationTracker::in_memory(config.calibration.bucket_width);
        let safety = SafetyReviewer::new(config.clone()).review(
            &consensus,
            &admission.outputs,
            &tracker.snapshot(),
        );
        let explanation = ExplainabilityEngine::new(config).explain(&consensus, &safety, &annotated);

        assert_eq!(consensus.top_diagnosis, PE);
        assert_eq!(consensus.confidence, 0.98);
        assert_eq!(consensus.certainty, Certainty::Confirmed);
        assert_eq!(consensus.agreement_score, 0.5);
        assert!(!safety.contradiction);
        assert!(safety.critical_flags.contains(PE));

        let total: f64 = explanation.reasoning_chain.iter().map(|s| s.confidence_delta).sum();
        assert!((total - consensus.confidence).abs() < 1e-12);

        let ledger = AuditLedger::in_memory();
        let fingerprint = ledger::fingerprint(&admission.outputs).unwrap();
        let entry = ledger.append("CASE-1", &fingerprint, &consensus, &safety).unwrap();
        assert_eq!(entry.result_summary.top_diagnosis, PE);
        assert!(ledger.verify(..).unwrap().valid);

        tracker.record_prediction("CASE-1", PE, consensus.confidence).unwrap();
        tracker.record_outcome("CASE-1", true).unwrap();
        assert_eq!(tracker.bucket_accuracy(Some(PE), 0.98).sample_count, 1);
    }
}
