use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::{
    context::CaseContext,
    error::{AggregationError, Result},
    stage::{NextStage, Stage},
};

/// Guard against edge cycles.
const MAX_STEPS: usize = 64;

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&CaseContext) -> bool + Send + Sync>;

/// Edge between stages in the pipeline
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

/// Record of one executed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub trail: Vec<StageRecord>,
}

/// A fixed graph of stages run once per case
pub struct Pipeline {
    pub id: String,
    stages: HashMap<String, Arc<dyn Stage>>,
    edges: Vec<Edge>,
    start: String,
}

impl Pipeline {
    /// Run the pipeline from its start stage until a stage ends it or no
    /// edge leads on. A failing stage is reported as `StageFailed`.
    pub async fn run(&self, context: CaseContext) -> Result<PipelineRun> {
        let mut run = PipelineRun::default();
        let mut current = self.start.clone();

        for _ in 0..MAX_STEPS {
            let stage = self
                .stages
                .get(&current)
                .ok_or_else(|| AggregationError::StageNotFound(current.clone()))?;

            debug!(pipeline = %self.id, case_id = %context.case_id(), stage = %current, "Running stage");
            let result = match stage.run(context.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    error!(case_id = %context.case_id(), stage = %current, error = %e, "Stage failed");
                    return Err(AggregationError::StageFailed {
                        stage: current,
                        source: Box::new(e),
                    });
                }
            };
            run.trail.push(StageRecord {
                stage: current.clone(),
                note: result.note,
            });

            let next = match result.next {
                NextStage::End => None,
                NextStage::GoTo(target) => {
                    if !self.stages.contains_key(&target) {
                        return Err(AggregationError::StageNotFound(target));
                    }
                    Some(target)
                }
                NextStage::Continue => self.find_next_stage(&current, &context),
            };

            match next {
                Some(next) => current = next,
                None => {
                    info!(
                        pipeline = %self.id,
                        case_id = %context.case_id(),
                        stages = run.trail.len(),
                        "Pipeline completed"
                    );
                    return Ok(run);
                }
            }
        }

        Err(AggregationError::StageFailed {
            stage: current,
            source: Box::new(AggregationError::ContextError(format!(
                "pipeline exceeded {} steps",
                MAX_STEPS
            ))),
        })
    }

    /// Find the next stage based on edges and conditions
    pub fn find_next_stage(&self, current: &str, context: &CaseContext) -> Option<String> {
        self.edges
            .iter()
            .filter(|edge| edge.from == current)
            .find(|edge| edge.condition.as_ref().is_none_or(|condition| condition(context)))
            .map(|edge| edge.to.clone())
    }

    pub fn start_stage(&self) -> &str {
        &self.start
    }
}

/// Builder for creating pipelines
pub struct PipelineBuilder {
    id: String,
    stages: HashMap<String, Arc<dyn Stage>>,
    edges: Vec<Edge>,
    start: Option<String>,
}

impl PipelineBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stages: HashMap::new(),
            edges: Vec::new(),
            start: None,
        }
    }

    /// Add a stage; the first one added is the default start.
    pub fn add_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let id = stage.id().to_string();
        if self.start.is_none() {
            self.start = Some(id.clone());
        }
        self.stages.insert(id, stage);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Edges are tried in insertion order; add conditional ones first.
    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&CaseContext) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    pub fn set_start(mut self, stage_id: impl Into<String>) -> Self {
        self.start = Some(stage_id.into());
        self
    }

    /// Fails if the start or any edge endpoint names an unknown stage.
    pub fn build(self) -> Result<Pipeline> {
        let start = self
            .start
            .ok_or_else(|| AggregationError::StageNotFound("<start>".to_string()))?;
        for id in std::iter::once(&start).chain(self.edges.iter().flat_map(|e| [&e.from, &e.to])) {
            if !self.stages.contains_key(id) {
                return Err(AggregationError::StageNotFound(id.clone()));
            }
        }
        Ok(Pipeline {
            id: self.id,
            stages: self.stages,
            edges: self.edges,
            start,
        })
    }
}
