use consensus_core::{
    Admission, AggregationConfig, AuditEntry, AuditLedger, AuditStore, CalibrationRecord,
    CalibrationStore, CalibrationSummary, CalibrationTracker, Case, CaseContext, ChainReport,
    ConsensusResult, Explanation, InMemoryAuditStore, InMemoryCalibrationStore, JsonlAuditStore,
    JsonlCalibrationStore, Pipeline, Result, RuleTable, SafetyReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::models::{AggregateCaseRequest, CaseReport, StageFailure};
use crate::tasks::context_keys;
use crate::workflow::build_aggregation_pipeline;

pub const DEFAULT_AUDIT_LEDGER_PATH: &str = "data/audit-ledger.jsonl";
pub const DEFAULT_CALIBRATION_PATH: &str = "data/calibration.jsonl";

/// Entry point for callers: aggregates cases and exposes the audit and
/// calibration records behind them.
pub struct DiagnosisService {
    config: Arc<AggregationConfig>,
    pipeline: Pipeline,
    ledger: Arc<AuditLedger>,
    calibration: Arc<CalibrationTracker>,
}

impl DiagnosisService {
    pub fn new(
        config: AggregationConfig,
        rules: RuleTable,
        audit_store: Arc<dyn AuditStore>,
        calibration_store: Arc<dyn CalibrationStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let ledger = Arc::new(AuditLedger::new(audit_store)?);
        let calibration = Arc::new(CalibrationTracker::new(
            calibration_store,
            config.calibration.bucket_width,
        )?);
        let pipeline = build_aggregation_pipeline(
            config.clone(),
            Arc::new(rules),
            ledger.clone(),
            calibration.clone(),
        )?;

        Ok(Self {
            config,
            pipeline,
            ledger,
            calibration,
        })
    }

    pub fn in_memory(config: AggregationConfig) -> Result<Self> {
        let rules = config.load_rules()?;
        Self::new(
            config,
            rules,
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(InMemoryCalibrationStore::new()),
        )
    }

    /// File-backed service configured from the environment.
    pub fn from_env() -> Result<Self> {
        let config = AggregationConfig::from_env()?;
        let rules = config.load_rules()?;
        let ledger_path = env_path("AUDIT_LEDGER_PATH", DEFAULT_AUDIT_LEDGER_PATH);
        let calibration_path = env_path("CALIBRATION_PATH", DEFAULT_CALIBRATION_PATH);

        info!(
            ledger = %ledger_path.display(),
            calibration = %calibration_path.display(),
            rules = %rules.version,
            "Opening diagnosis service stores"
        );
        Self::new(
            config,
            rules,
            Arc::new(JsonlAuditStore::open(&ledger_path)?),
            Arc::new(JsonlCalibrationStore::open(&calibration_path)?),
        )
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Run one case through the pipeline and collect what each stage produced.
    pub async fn aggregate_case(
        &self,
        request: AggregateCaseRequest,
    ) -> std::result::Result<CaseReport, StageFailure> {
        let case = Case::new(request.case_id, request.sections);
        let case_id = case.case_id.clone();
        info!(case_id = %case_id, outputs = request.outputs.len(), "Aggregating case");

        self.run_case(case, request.outputs).await.map_err(|e| {
            let failure = StageFailure::from_error(&case_id, &e);
            error!(
                case_id = %case_id,
                stage = ?failure.stage,
                kind = %failure.kind,
                "Case aggregation failed"
            );
            failure
        })
    }

    async fn run_case(
        &self,
        case: Case,
        outputs: Vec<consensus_core::AgentOutput>,
    ) -> Result<CaseReport> {
        let context = CaseContext::new(case.case_id.clone());
        context.set(context_keys::CASE, &case)?;
        context.set(context_keys::AGENT_OUTPUTS, &outputs)?;

        let run = self.pipeline.run(context.clone()).await?;

        let admission: Admission = context.require(context_keys::ADMISSION)?;
        let consensus: ConsensusResult = context.require(context_keys::CONSENSUS)?;
        let safety: SafetyReport = context.require(context_keys::SAFETY)?;
        let explanation: Explanation = context.require(context_keys::EXPLANATION)?;
        let audit_entry: AuditEntry = context.require(context_keys::AUDIT_ENTRY)?;

        Ok(CaseReport {
            case_id: case.case_id,
            consensus,
            safety,
            explanation,
            audit_entry,
            dropped: admission.dropped,
            stages: run.trail,
        })
    }

    /// Attach the real outcome to a previously aggregated case.
    pub fn submit_ground_truth(&self, case_id: &str, outcome: bool) -> Result<CalibrationRecord> {
        self.calibration.record_outcome(case_id.trim(), outcome)
    }

    pub fn audit_trail(&self, case_id: &str) -> Result<Vec<AuditEntry>> {
        self.ledger.entries_for_case(case_id.trim())
    }

    /// Verify the chain between two sequence numbers, both inclusive.
    pub fn verify_ledger(&self, from: Option<u64>, to: Option<u64>) -> Result<ChainReport> {
        self.ledger
            .verify(from.unwrap_or(1)..=to.unwrap_or(u64::MAX))
    }

    pub fn calibration_summary(&self) -> CalibrationSummary {
        self.calibration.summary()
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}
