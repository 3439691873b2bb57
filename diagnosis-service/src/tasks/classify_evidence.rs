use async_trait::async_trait;
use consensus_core::{
    AgentOutput, AggregationConfig, CaseContext, EvidenceClassifier, Result, Stage, StageResult,
    admit,
};
use std::sync::Arc;
use tracing::info;

use crate::tasks::context_keys;

/// Admits the specialist outputs and tags every finding
pub struct ClassifyEvidenceTask {
    config: Arc<AggregationConfig>,
    classifier: EvidenceClassifier,
}

impl ClassifyEvidenceTask {
    pub const ID: &'static str = "classify_evidence";

    pub fn new(config: Arc<AggregationConfig>, classifier: EvidenceClassifier) -> Self {
        Self { config, classifier }
    }
}

#[async_trait]
impl Stage for ClassifyEvidenceTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: CaseContext) -> Result<StageResult> {
        let outputs: Vec<AgentOutput> = context.require(context_keys::AGENT_OUTPUTS)?;
        let received = outputs.len();

        let admission = admit(outputs, &self.config, self.classifier.rules())?;
        let annotated = self
            .classifier
            .annotate_all(&admission.outputs, &self.config.specialists);
        let definitive = annotated.iter().filter(|a| a.output.is_definitive).count();

        info!(
            case_id = %context.case_id(),
            received,
            admitted = admission.outputs.len(),
            definitive,
            "Evidence classified"
        );

        let note = format!(
            "{} of {} specialist output(s) admitted, {} definitive",
            admission.outputs.len(),
            received,
            definitive
        );
        context.set(context_keys::ADMISSION, &admission)?;
        context.set(context_keys::ANNOTATED, &annotated)?;
        Ok(StageResult::proceed(note))
    }
}
