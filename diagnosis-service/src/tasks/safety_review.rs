use async_trait::async_trait;
use consensus_core::{
    Admission, CalibrationTracker, CaseContext, ConsensusResult, Result, SafetyReviewer, Stage,
    StageResult,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::tasks::context_keys;

/// Reviews the merged diagnosis against safety rules and calibration history
pub struct SafetyReviewTask {
    reviewer: SafetyReviewer,
    calibration: Arc<CalibrationTracker>,
}

impl SafetyReviewTask {
    pub const ID: &'static str = "safety_review";

    pub fn new(reviewer: SafetyReviewer, calibration: Arc<CalibrationTracker>) -> Self {
        Self {
            reviewer,
            calibration,
        }
    }
}

#[async_trait]
impl Stage for SafetyReviewTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: CaseContext) -> Result<StageResult> {
        let consensus: ConsensusResult = context.require(context_keys::CONSENSUS)?;
        let admission: Admission = context.require(context_keys::ADMISSION)?;

        let snapshot = self.calibration.snapshot();
        let report = self
            .reviewer
            .review(&consensus, &admission.outputs, &snapshot);

        if report.needs_human_review {
            warn!(
                case_id = %context.case_id(),
                risk = ?report.risk_level,
                reasons = ?report.review_reasons,
                "Case flagged for human review"
            );
        } else {
            info!(case_id = %context.case_id(), risk = ?report.risk_level, "Safety review passed");
        }

        let note = format!(
            "risk {:?}, final confidence {:.2}",
            report.risk_level,
            report.final_confidence(&consensus)
        )
        .to_lowercase();
        context.set(context_keys::SAFETY, &report)?;
        Ok(StageResult::proceed(note))
    }
}
