use async_trait::async_trait;
use consensus_core::{
    AnnotatedOutput, CaseContext, ConsensusResult, ExplainabilityEngine, Result, SafetyReport,
    Stage, StageResult,
};
use tracing::debug;

use crate::tasks::context_keys;

pub struct ExplainTask {
    engine: ExplainabilityEngine,
}

impl ExplainTask {
    pub const ID: &'static str = "explain";

    pub fn new(engine: ExplainabilityEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Stage for ExplainTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: CaseContext) -> Result<StageResult> {
        let consensus: ConsensusResult = context.require(context_keys::CONSENSUS)?;
        let safety: SafetyReport = context.require(context_keys::SAFETY)?;
        let annotated: Vec<AnnotatedOutput> = context.require(context_keys::ANNOTATED)?;

        let explanation = self.engine.explain(&consensus, &safety, &annotated);
        debug!(case_id = %context.case_id(), summary = %explanation.one_line, "Explanation built");

        let note = explanation.one_line.clone();
        context.set(context_keys::EXPLANATION, &explanation)?;
        Ok(StageResult::proceed(note))
    }
}
