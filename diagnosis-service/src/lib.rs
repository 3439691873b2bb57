pub mod models;
pub mod service;
pub mod tasks;
pub mod workflow;

pub use models::*;
pub use service::DiagnosisService;
pub use workflow::{PIPELINE_ID, build_aggregation_pipeline};
