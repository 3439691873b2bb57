use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Placeholder top diagnosis when no specialist named any diagnosis.
pub const NO_DIAGNOSIS: &str = "No significant diagnosis identified";

/// Clinical severity attached to a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

/// Diagnostic certainty, ordered from weakest to strongest
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    #[default]
    Suspected,
    Likely,
    Confirmed,
}

impl Certainty {
    /// One level weaker; `Suspected` is the floor.
    pub fn downgrade(self) -> Self {
        match self {
            Certainty::Confirmed => Certainty::Likely,
            Certainty::Likely | Certainty::Suspected => Certainty::Suspected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Certainty::Suspected => "suspected",
            Certainty::Likely => "likely",
            Certainty::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for Certainty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable case input: free-text sections addressed by key.
///
/// The core never reads the narratives; they only take part in the
/// input fingerprint recorded by the audit ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

impl Case {
    /// Create a case, assigning an identifier when the caller has none.
    pub fn new(case_id: Option<String>, sections: BTreeMap<String, String>) -> Self {
        let case_id = case_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| {
                let raw = Uuid::new_v4().simple().to_string();
                format!("CASE-{}", raw[..8].to_uppercase())
            });
        Self { case_id, sections }
    }
}

fn default_presence() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub name: String,
    #[serde(default = "default_presence")]
    pub presence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub significance: Option<String>,
}

impl Finding {
    pub fn present(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            presence: true,
            severity: None,
            significance: None,
        }
    }

    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            presence: false,
            ..Self::present(name)
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_significance(mut self, significance: impl Into<String>) -> Self {
        self.significance = Some(significance.into());
        self
    }
}

/// One specialist's independent assessment of a case.
///
/// Every field except `agent_id` may be missing on the wire; intake treats
/// missing fields as absent rather than rejecting the whole output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub diagnoses: BTreeMap<String, f64>,
    #[serde(default)]
    pub top_diagnosis: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    #[serde(default)]
    pub is_definitive: bool,
    #[serde(default)]
    pub certainty: Certainty,
}

impl AgentOutput {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            diagnoses: BTreeMap::new(),
            top_diagnosis: String::new(),
            confidence: 0.0,
            findings: Vec::new(),
            flags: BTreeSet::new(),
            is_definitive: false,
            certainty: Certainty::Suspected,
        }
    }

    /// Add a diagnosis; the first or most probable one becomes the top diagnosis.
    pub fn with_diagnosis(mut self, name: impl Into<String>, probability: f64) -> Self {
        let name = name.into();
        let current_top = self.diagnoses.get(&self.top_diagnosis).copied();
        if current_top.is_none_or(|p| probability > p) {
            self.top_diagnosis = name.clone();
            self.confidence = probability;
        }
        self.diagnoses.insert(name, probability);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn definitive(mut self) -> Self {
        self.is_definitive = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceCategory {
    Diagnostic,
    Supportive,
}

/// Classification of one `(agent_id, finding_name)` pair.
///
/// Derived on every run from the rule table and the finding itself; never
/// stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceTag {
    pub agent_id: String,
    pub finding_name: String,
    pub category: EvidenceCategory,
    pub weight: f64,
    /// Diagnoses this finding argues for when present.
    pub supports: Vec<String>,
    pub presence: bool,
    /// Set when the finding matched a gold-standard pattern.
    pub definitive: bool,
}

impl EvidenceTag {
    pub fn is_diagnostic(&self) -> bool {
        self.category == EvidenceCategory::Diagnostic
    }

    pub fn supports(&self, diagnosis: &str) -> bool {
        self.supports
            .iter()
            .any(|d| d.eq_ignore_ascii_case(diagnosis))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisScore {
    pub diagnosis: String,
    pub probability: f64,
}

/// Merged diagnosis for a case, produced once by the consensus engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub diagnoses: BTreeMap<String, f64>,
    pub top_diagnosis: String,
    pub confidence: f64,
    pub certainty: Certainty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_agent: Option<String>,
    pub agreement_score: f64,
    #[serde(default)]
    pub differential: Vec<DiagnosisScore>,
    #[serde(default)]
    pub supporting_agents: Vec<String>,
}

impl ConsensusResult {
    pub fn is_override(&self) -> bool {
        self.override_agent.is_some()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Moderate,
    High,
    Critical,
}

/// Outcome of the safety review. Adjustments only ever weaken the consensus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    pub critical_flags: BTreeSet<String>,
    pub contradiction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_certainty: Option<Certainty>,
    #[serde(default)]
    pub missing_specialists: BTreeSet<String>,
    #[serde(default)]
    pub specialist_flags: BTreeSet<String>,
    /// Treatment cautions attached to the consensus diagnosis.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cautions: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub needs_human_review: bool,
    #[serde(default)]
    pub review_reasons: Vec<String>,
}

impl SafetyReport {
    pub fn final_confidence(&self, consensus: &ConsensusResult) -> f64 {
        self.adjusted_confidence
            .map_or(consensus.confidence, |c| c.min(consensus.confidence))
    }

    pub fn final_certainty(&self, consensus: &ConsensusResult) -> Certainty {
        self.adjusted_certainty
            .map_or(consensus.certainty, |c| c.min(consensus.certainty))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contribution {
    Decisive,
    Strong,
    Moderate,
    Weak,
    Opposing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAttribution {
    pub finding: String,
    pub contribution: Contribution,
    pub weight: f64,
    pub reasoning: String,
    pub source_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Contributed,
    Confirmed,
    Overridden,
    Flagged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step_number: u32,
    pub agent: String,
    pub action: StepAction,
    pub description: String,
    pub evidence_used: Vec<String>,
    pub conclusion: String,
    pub confidence_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub evidence_attributions: Vec<EvidenceAttribution>,
    pub reasoning_chain: Vec<ReasoningStep>,
    pub one_line: String,
    pub detailed: String,
}

/// Decision summary sealed into an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub top_diagnosis: String,
    pub confidence: f64,
    pub certainty: Certainty,
    pub override_agent: Option<String>,
    pub agreement_score: f64,
    pub adjusted_confidence: Option<f64>,
    pub adjusted_certainty: Option<Certainty>,
    pub contradiction: bool,
    pub critical_flags: Vec<String>,
    pub calibration_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: String,
    pub case_id: String,
    pub sequence_number: u64,
    pub timestamp: String,
    pub input_fingerprint: String,
    pub result_summary: ResultSummary,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub case_id: String,
    pub predicted_confidence: f64,
    pub predicted_diagnosis: String,
    pub actual_outcome: Option<bool>,
}
