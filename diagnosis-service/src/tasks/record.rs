use async_trait::async_trait;
use consensus_core::{
    Admission, AggregationError, AuditLedger, CalibrationTracker, Case, CaseContext,
    ConsensusResult, Result, SafetyReport, Stage, StageResult, ledger,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::tasks::context_keys;

/// What the input fingerprint covers
#[derive(Serialize)]
struct FingerprintInput<'a> {
    sections: &'a BTreeMap<String, String>,
    outputs: Vec<&'a consensus_core::AgentOutput>,
}

/// Feeds the calibration journal, then seals the decision into the audit ledger
pub struct RecordTask {
    ledger: Arc<AuditLedger>,
    calibration: Arc<CalibrationTracker>,
}

impl RecordTask {
    pub const ID: &'static str = "record";

    pub fn new(ledger: Arc<AuditLedger>, calibration: Arc<CalibrationTracker>) -> Self {
        Self {
            ledger,
            calibration,
        }
    }
}

#[async_trait]
impl Stage for RecordTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: CaseContext) -> Result<StageResult> {
        let case: Case = context.require(context_keys::CASE)?;
        let admission: Admission = context.require(context_keys::ADMISSION)?;
        let consensus: ConsensusResult = context.require(context_keys::CONSENSUS)?;
        let safety: SafetyReport = context.require(context_keys::SAFETY)?;

        let mut outputs: Vec<_> = admission.outputs.iter().collect();
        outputs.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let fingerprint = ledger::fingerprint(&FingerprintInput {
            sections: &case.sections,
            outputs,
        })?;

        // Journal before sealing; a retry tolerates the duplicate prediction.
        // Raw confidence, the value the reviewer buckets by.
        match self.calibration.record_prediction(
            &case.case_id,
            &consensus.top_diagnosis,
            consensus.confidence,
        ) {
            Ok(_) => {}
            Err(AggregationError::DuplicatePrediction(case_id)) => {
                warn!(case_id = %case_id, "Prediction already tracked, keeping the first one");
            }
            Err(e) => return Err(e),
        }

        let entry = self
            .ledger
            .append(&case.case_id, &fingerprint, &consensus, &safety)?;
        context.set(context_keys::AUDIT_ENTRY, &entry)?;

        info!(
            case_id = %case.case_id,
            audit_id = %entry.audit_id,
            sequence = entry.sequence_number,
            "Decision recorded"
        );
        Ok(StageResult::finish(format!(
            "sealed as {} (#{})",
            entry.audit_id, entry.sequence_number
        )))
    }
}
