use crate::tasks::*;
use consensus_core::{
    AggregationConfig, AuditLedger, CalibrationTracker, ConsensusEngine, EvidenceClassifier,
    ExplainabilityEngine, Pipeline, PipelineBuilder, Result, RuleTable, SafetyReviewer, Stage,
};
use std::sync::Arc;

pub const PIPELINE_ID: &str = "case_aggregation";

/// Classify, merge, review, explain, then record
pub fn build_aggregation_pipeline(
    config: Arc<AggregationConfig>,
    rules: Arc<RuleTable>,
    ledger: Arc<AuditLedger>,
    calibration: Arc<CalibrationTracker>,
) -> Result<Pipeline> {
    let classify_task = Arc::new(ClassifyEvidenceTask::new(
        config.clone(),
        EvidenceClassifier::new(rules.clone()),
    ));
    let classify_id = classify_task.id().to_string();

    let consensus_task = Arc::new(ConsensusTask::new(ConsensusEngine::new(config.clone())));
    let consensus_id = consensus_task.id().to_string();

    let safety_task = Arc::new(SafetyReviewTask::new(
        SafetyReviewer::new(config.clone()).with_rules(rules),
        calibration.clone(),
    ));
    let safety_id = safety_task.id().to_string();

    let explain_task = Arc::new(ExplainTask::new(ExplainabilityEngine::new(config)));
    let explain_id = explain_task.id().to_string();

    let record_task = Arc::new(RecordTask::new(ledger, calibration));
    let record_id = record_task.id().to_string();

    PipelineBuilder::new(PIPELINE_ID)
        .add_stage(classify_task)
        .add_stage(consensus_task)
        .add_stage(safety_task)
        .add_stage(explain_task)
        .add_stage(record_task)
        .add_edge(&classify_id, &consensus_id)
        .add_edge(&consensus_id, &safety_id)
        .add_edge(&safety_id, &explain_id)
        .add_edge(&explain_id, &record_id)
        .build()
}
