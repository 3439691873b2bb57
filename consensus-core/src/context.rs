use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{AggregationError, Result};

/// Per-case scratch space shared between pipeline stages.
///
/// Owned by one case; dropped once the case's audit entry is written.
#[derive(Clone, Debug)]
pub struct CaseContext {
    case_id: Arc<str>,
    data: Arc<DashMap<String, Value>>,
}

impl CaseContext {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: Arc::from(case_id.into()),
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|e| AggregationError::ContextError(format!("cannot store '{}': {}", key, e)))?;
        self.data.insert(key, value);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Like `get`, but a missing or mistyped value is an error.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| AggregationError::ContextError(format!("'{}' is not set", key)))?;
        serde_json::from_value(value)
            .map_err(|e| AggregationError::ContextError(format!("'{}' has the wrong shape: {}", key, e)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip_and_require() {
        let ctx = CaseContext::new("CASE-1");
        ctx.set("confidence", 0.75).unwrap();
        assert_eq!(ctx.get::<f64>("confidence"), Some(0.75));
        assert_eq!(ctx.require::<f64>("confidence").unwrap(), 0.75);

        assert!(matches!(
            ctx.require::<f64>("missing"),
            Err(AggregationError::ContextError(_))
        ));
        assert!(ctx.require::<Vec<String>>("confidence").is_err());
    }

    #[test]
    fn clones_share_state() {
        let ctx = CaseContext::new("CASE-1");
        let other = ctx.clone();
        other.set("k", "v").unwrap();
        assert!(ctx.contains("k"));
        assert!(ctx.remove("k").is_some());
        assert!(!other.contains("k"));
        assert_eq!(other.case_id(), "CASE-1");
    }
}
