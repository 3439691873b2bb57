use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{context::CaseContext, error::Result};

/// Result of a stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Short human-readable note for the stage trail
    pub note: Option<String>,
    /// Where to go next
    pub next: NextStage,
}

impl StageResult {
    pub fn new(note: Option<String>, next: NextStage) -> Self {
        Self { note, next }
    }

    /// Follow the outgoing edges.
    pub fn proceed(note: impl Into<String>) -> Self {
        Self::new(Some(note.into()), NextStage::Continue)
    }

    pub fn finish(note: impl Into<String>) -> Self {
        Self::new(Some(note.into()), NextStage::End)
    }
}

/// Defines what should happen after a stage completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextStage {
    /// Continue along the first matching edge
    Continue,
    /// Jump to a specific stage by ID
    GoTo(String),
    /// Stop the pipeline
    End,
}

/// One step of the per-case pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique identifier for this stage
    fn id(&self) -> &str;

    /// Execute the stage against the case context
    async fn run(&self, context: CaseContext) -> Result<StageResult>;
}
