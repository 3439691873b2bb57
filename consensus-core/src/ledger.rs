//! Audit Ledger: an append-only, SHA-256 hash-chained record of decisions.
//!
//! Links are re-derived from stored hashes on every verification; the
//! only in-memory state is the chain head, rebuilt from the store on
//! construction.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AuditEntry, ConsensusResult, ResultSummary, SafetyReport};
use crate::storage::{AuditRecord, AuditStore, InMemoryAuditStore};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Outcome of `verify`. Corruption is reported, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub valid: bool,
    pub first_invalid_sequence: Option<u64>,
    pub entries_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct ChainHead {
    last_sequence: u64,
    last_hash: String,
}

pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    head: Mutex<ChainHead>,
}

/// Every entry field except `hash`, in stored order.
#[derive(Serialize)]
struct HashedFields<'a> {
    audit_id: &'a str,
    case_id: &'a str,
    sequence_number: u64,
    timestamp: &'a str,
    input_fingerprint: &'a str,
    result_summary: &'a ResultSummary,
    prev_hash: &'a str,
}

/// `sha256(canonical_json(fields except hash) || prev_hash)` as hex.
pub fn compute_hash(entry: &AuditEntry) -> Result<String> {
    let fields = HashedFields {
        audit_id: &entry.audit_id,
        case_id: &entry.case_id,
        sequence_number: entry.sequence_number,
        timestamp: &entry.timestamp,
        input_fingerprint: &entry.input_fingerprint,
        result_summary: &entry.result_summary,
        prev_hash: &entry.prev_hash,
    };
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&fields)?);
    hasher.update(entry.prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of the canonical JSON of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&serde_json::to_vec(value)?))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

impl ResultSummary {
    pub fn from_decision(consensus: &ConsensusResult, safety: &SafetyReport) -> Self {
        Self {
            top_diagnosis: consensus.top_diagnosis.clone(),
            confidence: round4(consensus.confidence),
            certainty: consensus.certainty,
            override_agent: consensus.override_agent.clone(),
            agreement_score: round4(consensus.agreement_score),
            adjusted_confidence: safety.adjusted_confidence.map(round4),
            adjusted_certainty: safety.adjusted_certainty,
            contradiction: safety.contradiction,
            critical_flags: safety.critical_flags.iter().cloned().collect(),
            calibration_warning: safety.calibration_warning.clone(),
        }
    }
}

impl AuditLedger {
    /// Attach to a store, rebuilding the chain head from its last record.
    pub fn new(store: Arc<dyn AuditStore>) -> Result<Self> {
        let records = store.records()?;
        let last_hash = match records.last() {
            None => GENESIS_HASH.to_string(),
            Some(AuditRecord::Entry { entry, .. }) => entry.hash.clone(),
            Some(AuditRecord::Unreadable { raw, .. }) => {
                warn!("Last ledger record is unreadable, chaining onto its raw digest");
                sha256_hex(raw.as_bytes())
            }
        };
        Ok(Self {
            store,
            head: Mutex::new(ChainHead {
                last_sequence: records.len() as u64,
                last_hash,
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryAuditStore::new()),
            head: Mutex::new(ChainHead {
                last_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    /// Seal a decision into the chain. Appends are serialized.
    pub fn append(
        &self,
        case_id: &str,
        input_fingerprint: &str,
        consensus: &ConsensusResult,
        safety: &SafetyReport,
    ) -> Result<AuditEntry> {
        let mut head = self.head.lock().unwrap_or_else(|e| e.into_inner());

        let raw_id = Uuid::new_v4().simple().to_string();
        let mut entry = AuditEntry {
            audit_id: format!("AUDIT-{}", raw_id[..12].to_uppercase()),
            case_id: case_id.to_string(),
            sequence_number: head.last_sequence + 1,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            input_fingerprint: input_fingerprint.to_string(),
            result_summary: ResultSummary::from_decision(consensus, safety),
            prev_hash: head.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = compute_hash(&entry)?;

        self.store.append(&entry)?;
        head.last_sequence = entry.sequence_number;
        head.last_hash = entry.hash.clone();

        info!(
            case_id = %entry.case_id,
            audit_id = %entry.audit_id,
            sequence = entry.sequence_number,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Every entry for `case_id`, in insertion order.
    pub fn entries_for_case(&self, case_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .store
            .records()?
            .into_iter()
            .filter_map(|record| match record {
                AuditRecord::Entry { entry, .. } if entry.case_id == case_id => Some(entry),
                _ => None,
            })
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }

    /// Check the chain over the given sequence range.
    ///
    /// Each entry is checked for its position, the integrity of its stored
    /// text, its own hash, and its link to the previous stored hash. The
    /// earliest failing sequence number is reported.
    pub fn verify(&self, range: impl RangeBounds<u64>) -> Result<ChainReport> {
        let records = self.store.records()?;
        let total = records.len() as u64;

        let start = match range.start_bound() {
            Bound::Included(n) => (*n).max(1),
            Bound::Excluded(n) => n.saturating_add(1).max(1),
            Bound::Unbounded => 1,
        };
        let end = match range.end_bound() {
            Bound::Included(n) => (*n).min(total),
            Bound::Excluded(n) => n.saturating_sub(1).min(total),
            Bound::Unbounded => total,
        };

        let mut checked = 0;
        for sequence in start..=end {
            if sequence > total {
                break;
            }
            checked += 1;
            let idx = (sequence - 1) as usize;
            let expected_prev = if idx == 0 {
                GENESIS_HASH.to_string()
            } else {
                stored_hash(&records[idx - 1])
            };
            if let Err(reason) = check_record(&records[idx], sequence, &expected_prev) {
                warn!(sequence, reason = %reason, "Audit chain corruption detected");
                return Ok(ChainReport {
                    valid: false,
                    first_invalid_sequence: Some(sequence),
                    entries_checked: checked,
                    reason: Some(reason),
                });
            }
        }

        Ok(ChainReport {
            valid: true,
            first_invalid_sequence: None,
            entries_checked: checked,
            reason: None,
        })
    }
}

fn stored_hash(record: &AuditRecord) -> String {
    match record {
        AuditRecord::Entry { entry, .. } => entry.hash.clone(),
        AuditRecord::Unreadable { raw, .. } => sha256_hex(raw.as_bytes()),
    }
}

fn check_record(
    record: &AuditRecord,
    sequence: u64,
    expected_prev: &str,
) -> std::result::Result<(), String> {
    let (entry, raw) = match record {
        AuditRecord::Entry { entry, raw } => (entry, raw),
        AuditRecord::Unreadable { reason, .. } => return Err(format!("unreadable record: {}", reason)),
    };

    if entry.sequence_number != sequence {
        return Err(format!(
            "sequence number {} stored at position {}",
            entry.sequence_number, sequence
        ));
    }
    if let Some(raw) = raw {
        let canonical = serde_json::to_string(entry).map_err(|e| e.to_string())?;
        if canonical != *raw {
            return Err("stored text differs from its canonical form".to_string());
        }
    }
    let recomputed = compute_hash(entry).map_err(|e| e.to_string())?;
    if recomputed != entry.hash {
        return Err("hash does not match entry contents".to_string());
    }
    if entry.prev_hash != expected_prev {
        return Err("prev_hash does not match previous entry".to_string());
    }
    Ok(())
}
