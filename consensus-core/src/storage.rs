use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::AuditEntry;

/// One stored ledger line.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditRecord {
    /// A parsed entry. `raw` holds the stored text when the store keeps
    /// one, so verification can tell whether the text still matches the
    /// canonical serialization of what was parsed.
    Entry {
        entry: AuditEntry,
        raw: Option<String>,
    },
    /// A line that no longer parses. Kept so `verify` can point at it.
    Unreadable {
        position: u64,
        raw: String,
        reason: String,
    },
}

impl AuditRecord {
    pub fn entry(&self) -> Option<&AuditEntry> {
        match self {
            AuditRecord::Entry { entry, .. } => Some(entry),
            AuditRecord::Unreadable { .. } => None,
        }
    }
}

/// Append-only store of audit entries, ordered by insertion.
pub trait AuditStore: Send + Sync {
    /// Persist one entry. Must not return before the entry is durable.
    fn append(&self, entry: &AuditEntry) -> Result<()>;
    /// Snapshot of every record in insertion order.
    fn records(&self) -> Result<Vec<AuditRecord>>;
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Event journal behind the calibration tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CalibrationEvent {
    Prediction {
        case_id: String,
        diagnosis: String,
        confidence: f64,
        recorded_at: DateTime<Utc>,
    },
    Outcome {
        case_id: String,
        outcome: bool,
        recorded_at: DateTime<Utc>,
    },
}

pub trait CalibrationStore: Send + Sync {
    fn append(&self, event: &CalibrationEvent) -> Result<()>;
    fn events(&self) -> Result<Vec<CalibrationEvent>>;
}

/// In-memory implementation of AuditStore
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with tampered records in tests.
    pub fn with_records(records: Vec<AuditRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.push(AuditRecord::Entry {
            entry: entry.clone(),
            raw: None,
        });
        Ok(())
    }

    fn records(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

/// In-memory implementation of CalibrationStore
#[derive(Debug, Default)]
pub struct InMemoryCalibrationStore {
    events: RwLock<Vec<CalibrationEvent>>,
}

impl InMemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CalibrationStore for InMemoryCalibrationStore {
    fn append(&self, event: &CalibrationEvent) -> Result<()> {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn events(&self) -> Result<Vec<CalibrationEvent>> {
        Ok(self.events.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Append-only file of newline-delimited JSON values.
#[derive(Debug)]
struct JsonlFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFile {
    /// Open (creating if needed) and return the existing non-empty lines.
    fn open(path: &Path) -> Result<(Self, Vec<String>)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<String> = text
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect();

        // A torn final write must not swallow the next line.
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            warn!(path = %path.display(), "Journal does not end with a newline, terminating last line");
            file.write_all(b"\n")?;
            file.flush()?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            },
            lines,
        ))
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

/// Ledger persisted as one canonical JSON object per line.
#[derive(Debug)]
pub struct JsonlAuditStore {
    journal: JsonlFile,
    records: RwLock<Vec<AuditRecord>>,
}

impl JsonlAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, lines) = JsonlFile::open(path.as_ref())?;
        let records: Vec<AuditRecord> = lines
            .into_iter()
            .enumerate()
            .map(|(idx, raw)| parse_audit_line(idx as u64 + 1, raw))
            .collect();

        let unreadable = records
            .iter()
            .filter(|r| matches!(r, AuditRecord::Unreadable { .. }))
            .count();
        if unreadable > 0 {
            warn!(path = %journal.path.display(), unreadable, "Ledger contains unreadable lines");
        }
        info!(path = %journal.path.display(), entries = records.len(), "Opened audit ledger");

        Ok(Self {
            journal,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.journal.path
    }
}

fn parse_audit_line(position: u64, raw: String) -> AuditRecord {
    match serde_json::from_str::<AuditEntry>(&raw) {
        Ok(entry) => AuditRecord::Entry {
            entry,
            raw: Some(raw),
        },
        Err(e) => AuditRecord::Unreadable {
            position,
            raw,
            reason: e.to_string(),
        },
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        // Hold the index lock across the write so readers never see an
        // entry that is not yet on disk.
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        self.journal.append_line(&line)?;
        records.push(AuditRecord::Entry {
            entry: entry.clone(),
            raw: Some(line),
        });
        Ok(())
    }

    fn records(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

/// Calibration journal: prediction and outcome events, one per line.
#[derive(Debug)]
pub struct JsonlCalibrationStore {
    journal: JsonlFile,
    events: RwLock<Vec<CalibrationEvent>>,
}

impl JsonlCalibrationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, lines) = JsonlFile::open(path.as_ref())?;
        let mut events = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<CalibrationEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %journal.path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping unreadable calibration event"
                ),
            }
        }
        info!(path = %journal.path.display(), events = events.len(), "Opened calibration journal");
        Ok(Self {
            journal,
            events: RwLock::new(events),
        })
    }
}

impl CalibrationStore for JsonlCalibrationStore {
    fn append(&self, event: &CalibrationEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        self.journal.append_line(&line)?;
        events.push(event.clone());
        Ok(())
    }

    fn events(&self) -> Result<Vec<CalibrationEvent>> {
        Ok(self.events.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Certainty, ResultSummary};

    fn entry(sequence_number: u64) -> AuditEntry {
        AuditEntry {
            audit_id: format!("AUDIT-{:012X}", sequence_number),
            case_id: "CASE-1".into(),
            sequence_number,
            timestamp: "2024-11-02T10:00:00.000000Z".into(),
            input_fingerprint: "ab".repeat(32),
            result_summary: ResultSummary {
                top_diagnosis: "Pulmonary Embolism".into(),
                confidence: 0.98,
                certainty: Certainty::Confirmed,
                override_agent: Some("radiologist".into()),
                agreement_score: 0.5,
                adjusted_confidence: None,
                adjusted_certainty: None,
                contradiction: false,
                critical_flags: vec!["Pulmonary Embolism".into()],
                calibration_warning: None,
            },
            prev_hash: "0".repeat(64),
            hash: "f".repeat(64),
        }
    }

    #[test]
    fn jsonl_audit_store_replays_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/ledger.jsonl");
        {
            let store = JsonlAuditStore::open(&path).unwrap();
            store.append(&entry(1)).unwrap();
            store.append(&entry(2)).unwrap();
        }
        let store = JsonlAuditStore::open(&path).unwrap();
        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].entry().unwrap(), &entry(2));
    }

    #[test]
    fn unreadable_lines_are_kept_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let good = serde_json::to_string(&entry(1)).unwrap();
        std::fs::write(&path, format!("{}\n{{not json\n", good)).unwrap();

        let store = JsonlAuditStore::open(&path).unwrap();
        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], AuditRecord::Unreadable { position: 2, .. }));
    }

    #[test]
    fn torn_last_line_does_not_swallow_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "{\"audit_id\":").unwrap();

        let store = JsonlAuditStore::open(&path).unwrap();
        store.append(&entry(2)).unwrap();
        drop(store);

        let store = JsonlAuditStore::open(&path).unwrap();
        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].entry().map(|e| e.sequence_number), Some(2));
    }

    #[test]
    fn calibration_journal_round_trips_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.jsonl");
        let event = CalibrationEvent::Outcome {
            case_id: "CASE-1".into(),
            outcome: true,
            recorded_at: Utc::now(),
        };
        JsonlCalibrationStore::open(&path).unwrap().append(&event).unwrap();
        let events = JsonlCalibrationStore::open(&path).unwrap().events().unwrap();
        assert_eq!(events, vec![event]);
    }
}
