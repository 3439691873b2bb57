//! Calibration Tracker: prediction/outcome pairs and per-bucket accuracy.
//!
//! State is rebuilt by replaying the store's event journal. Writes take a
//! single lock per tracker; readers work from a cloned snapshot.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{AggregationError, Result};
use crate::models::CalibrationRecord;
use crate::storage::{CalibrationEvent, CalibrationStore, InMemoryCalibrationStore};

/// Absorbs float error so 0.3 lands in the 0.3-0.4 bucket.
const BUCKET_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketAccuracy {
    /// `None` when the bucket has no labelled samples.
    pub empirical_accuracy: Option<f64>,
    pub sample_count: usize,
    pub range_start: f64,
    pub range_end: f64,
}

impl BucketAccuracy {
    /// Nominal confidence of the bucket.
    pub fn midpoint(&self) -> f64 {
        (self.range_start + self.range_end) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub range_start: f64,
    pub range_end: f64,
    pub samples: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub calibration_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub bucket_width: f64,
    pub total_predictions: usize,
    pub labelled: usize,
    pub overall_accuracy: Option<f64>,
    pub mean_calibration_error: Option<f64>,
    pub buckets: Vec<BucketSummary>,
}

fn bucket_count(width: f64) -> usize {
    ((1.0 / width).ceil() as usize).max(1)
}

fn bucket_index(confidence: f64, width: f64) -> usize {
    let idx = (confidence.clamp(0.0, 1.0) / width + BUCKET_EPSILON).floor() as usize;
    idx.min(bucket_count(width) - 1)
}

/// Bounds snapped to six decimals so `6 * 0.1` reports as `0.6`.
fn bucket_bounds(idx: usize, width: f64) -> (f64, f64) {
    let snap = |x: f64| (x * 1e6).round() / 1e6;
    let start = idx as f64 * width;
    (snap(start), snap((start + width).min(1.0)))
}

/// Immutable view of the labelled records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    bucket_width: f64,
    records: Vec<CalibrationRecord>,
}

impl CalibrationSnapshot {
    /// Unlabelled records are ignored.
    pub fn new(bucket_width: f64, records: Vec<CalibrationRecord>) -> Self {
        Self {
            bucket_width,
            records: records
                .into_iter()
                .filter(|r| r.actual_outcome.is_some())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mean outcome of labelled records in the bucket containing
    /// `confidence`, restricted to `diagnosis` when given.
    pub fn bucket_accuracy(&self, diagnosis: Option<&str>, confidence: f64) -> BucketAccuracy {
        let width = self.bucket_width;
        let idx = bucket_index(confidence, width);
        let (range_start, range_end) = bucket_bounds(idx, width);

        let (samples, correct) = self
            .records
            .iter()
            .filter(|r| diagnosis.is_none_or(|d| r.predicted_diagnosis.eq_ignore_ascii_case(d)))
            .filter(|r| bucket_index(r.predicted_confidence, width) == idx)
            .fold((0usize, 0usize), |(n, c), r| {
                (n + 1, c + usize::from(r.actual_outcome == Some(true)))
            });

        BucketAccuracy {
            empirical_accuracy: (samples > 0).then(|| correct as f64 / samples as f64),
            sample_count: samples,
            range_start,
            range_end,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    records: Vec<CalibrationRecord>,
    index: HashMap<String, usize>,
}

impl TrackerState {
    fn apply(&mut self, event: CalibrationEvent) -> Result<()> {
        match event {
            CalibrationEvent::Prediction {
                case_id,
                diagnosis,
                confidence,
                ..
            } => {
                if self.index.contains_key(&case_id) {
                    return Err(AggregationError::DuplicatePrediction(case_id));
                }
                self.index.insert(case_id.clone(), self.records.len());
                self.records.push(CalibrationRecord {
                    case_id,
                    predicted_confidence: confidence,
                    predicted_diagnosis: diagnosis,
                    actual_outcome: None,
                });
            }
            CalibrationEvent::Outcome { case_id, outcome, .. } => {
                let idx = self.check_outcome(&case_id)?;
                self.records[idx].actual_outcome = Some(outcome);
            }
        }
        Ok(())
    }

    fn check_outcome(&self, case_id: &str) -> Result<usize> {
        let idx = *self
            .index
            .get(case_id)
            .ok_or_else(|| AggregationError::NotFound(case_id.to_string()))?;
        if self.records[idx].actual_outcome.is_some() {
            return Err(AggregationError::AlreadyRecorded(case_id.to_string()));
        }
        Ok(idx)
    }
}

pub struct CalibrationTracker {
    store: Arc<dyn CalibrationStore>,
    state: RwLock<TrackerState>,
    bucket_width: f64,
}

impl CalibrationTracker {
    /// Replay the store's journal. Inconsistent events are skipped with a
    /// warning rather than failing startup.
    pub fn new(store: Arc<dyn CalibrationStore>, bucket_width: f64) -> Result<Self> {
        let mut state = TrackerState::default();
        for event in store.events()? {
            if let Err(e) = state.apply(event) {
                warn!(error = %e, "Skipping inconsistent calibration event");
            }
        }
        info!(records = state.records.len(), "Calibration tracker ready");
        Ok(Self {
            store,
            state: RwLock::new(state),
            bucket_width,
        })
    }

    pub fn in_memory(bucket_width: f64) -> Self {
        Self {
            store: Arc::new(InMemoryCalibrationStore::new()),
            state: RwLock::new(TrackerState::default()),
            bucket_width,
        }
    }

    pub fn record_prediction(
        &self,
        case_id: &str,
        diagnosis: &str,
        confidence: f64,
    ) -> Result<CalibrationRecord> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.index.contains_key(case_id) {
            return Err(AggregationError::DuplicatePrediction(case_id.to_string()));
        }
        let event = CalibrationEvent::Prediction {
            case_id: case_id.to_string(),
            diagnosis: diagnosis.to_string(),
            confidence,
            recorded_at: Utc::now(),
        };
        self.store.append(&event)?;
        state.apply(event)?;
        let idx = state.records.len() - 1;
        Ok(state.records[idx].clone())
    }

    /// Set the outcome of a recorded prediction, exactly once.
    pub fn record_outcome(&self, case_id: &str, outcome: bool) -> Result<CalibrationRecord> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let idx = state.check_outcome(case_id)?;
        self.store.append(&CalibrationEvent::Outcome {
            case_id: case_id.to_string(),
            outcome,
            recorded_at: Utc::now(),
        })?;
        state.records[idx].actual_outcome = Some(outcome);
        info!(case_id = %case_id, outcome, "Ground truth recorded");
        Ok(state.records[idx].clone())
    }

    pub fn record(&self, case_id: &str) -> Option<CalibrationRecord> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.index.get(case_id).map(|idx| state.records[*idx].clone())
    }

    pub fn bucket_accuracy(&self, diagnosis: Option<&str>, confidence: f64) -> BucketAccuracy {
        self.snapshot().bucket_accuracy(diagnosis, confidence)
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        let records = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .clone();
        CalibrationSnapshot::new(self.bucket_width, records)
    }

    /// Every populated bucket across all diagnoses.
    pub fn summary(&self) -> CalibrationSummary {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let width = self.bucket_width;
        let mut counts = vec![(0usize, 0usize); bucket_count(width)];
        for record in &state.records {
            if let Some(outcome) = record.actual_outcome {
                let slot = &mut counts[bucket_index(record.predicted_confidence, width)];
                slot.0 += 1;
                slot.1 += usize::from(outcome);
            }
        }

        let buckets: Vec<BucketSummary> = counts
            .iter()
            .enumerate()
            .filter(|(_, (samples, _))| *samples > 0)
            .map(|(idx, (samples, correct))| {
                let (range_start, range_end) = bucket_bounds(idx, width);
                let accuracy = *correct as f64 / *samples as f64;
                BucketSummary {
                    range_start,
                    range_end,
                    samples: *samples,
                    correct: *correct,
                    accuracy,
                    calibration_error: (accuracy - (range_start + range_end) / 2.0).abs(),
                }
            })
            .collect();

        let labelled: usize = buckets.iter().map(|b| b.samples).sum();
        let correct: usize = buckets.iter().map(|b| b.correct).sum();
        CalibrationSummary {
            bucket_width: width,
            total_predictions: state.records.len(),
            labelled,
            overall_accuracy: (labelled > 0).then(|| correct as f64 / labelled as f64),
            mean_calibration_error: (!buckets.is_empty()).then(|| {
                buckets.iter().map(|b| b.calibration_error).sum::<f64>() / buckets.len() as f64
            }),
            buckets,
        }
    }
}
