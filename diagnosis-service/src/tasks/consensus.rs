use async_trait::async_trait;
use consensus_core::{
    AnnotatedOutput, CaseContext, ConsensusEngine, Result, Stage, StageResult,
};
use tracing::info;

use crate::tasks::context_keys;

pub struct ConsensusTask {
    engine: ConsensusEngine,
}

impl ConsensusTask {
    pub const ID: &'static str = "consensus";

    pub fn new(engine: ConsensusEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Stage for ConsensusTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: CaseContext) -> Result<StageResult> {
        let annotated: Vec<AnnotatedOutput> = context.require(context_keys::ANNOTATED)?;
        let consensus = self.engine.merge(&annotated);

        info!(
            case_id = %context.case_id(),
            top = %consensus.top_diagnosis,
            confidence = consensus.confidence,
            certainty = %consensus.certainty,
            "Consensus merged"
        );

        let note = match &consensus.override_agent {
            Some(agent) => format!("{} confirmed by {}", consensus.top_diagnosis, agent),
            None => format!(
                "{} at {:.2} ({})",
                consensus.top_diagnosis, consensus.confidence, consensus.certainty
            ),
        };
        context.set(context_keys::CONSENSUS, &consensus)?;
        Ok(StageResult::proceed(note))
    }
}
