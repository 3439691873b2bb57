//! Declarative evidence policy.
//!
//! The classification of findings and the table of gold-standard findings
//! are data, loaded from YAML, so the policy can be audited and tested
//! without touching the engines that apply it.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{AggregationError, Result};
use crate::models::{EvidenceCategory, Severity};

const DEFAULT_RULES: &str = include_str!("../rules/default_rules.yaml");

static EMBEDDED: LazyLock<RuleTable> = LazyLock::new(|| {
    RuleTable::from_yaml_str(DEFAULT_RULES).expect("embedded rule table must be valid")
});

const CONFIRMED_SUFFIX: &str = " - confirmed";

#[derive(Debug, Deserialize)]
struct RuleTableSpec {
    version: String,
    #[serde(default = "default_weight")]
    default_weight: f64,
    #[serde(default)]
    severity_bonus: BTreeMap<Severity, f64>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    #[serde(default)]
    evidence_rules: Vec<EvidenceRuleSpec>,
    #[serde(default)]
    definitive_rules: Vec<DefinitiveRuleSpec>,
    #[serde(default)]
    contraindications: Vec<ContraindicationSpec>,
}

fn default_weight() -> f64 {
    0.1
}

#[derive(Debug, Deserialize)]
struct EvidenceRuleSpec {
    #[serde(default)]
    specialist: Option<String>,
    pattern: String,
    category: EvidenceCategory,
    weight: f64,
    #[serde(default)]
    supports: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DefinitiveRuleSpec {
    #[serde(default)]
    specialist: Option<String>,
    pattern: String,
    diagnosis: String,
    floor: f64,
}

#[derive(Debug, Deserialize)]
struct ContraindicationSpec {
    diagnosis: String,
    caution: String,
    #[serde(default)]
    conflicts_with: Vec<String>,
}

/// `(specialist, finding pattern) -> (category, base weight)`
#[derive(Debug, Clone)]
pub struct EvidenceRule {
    pub specialist: Option<String>,
    pub pattern: Regex,
    pub category: EvidenceCategory,
    pub weight: f64,
    pub supports: Vec<String>,
}

/// `(specialist, finding pattern) -> (diagnosis, confidence floor)`
#[derive(Debug, Clone)]
pub struct DefinitiveRule {
    pub specialist: Option<String>,
    pub pattern: Regex,
    pub diagnosis: String,
    pub floor: f64,
}

/// Treatment caution raised when `diagnosis` is the consensus.
#[derive(Debug, Clone, PartialEq)]
pub struct Contraindication {
    pub diagnosis: String,
    pub caution: String,
    /// Diagnoses that turn the caution into a hard contraindication.
    pub conflicts_with: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    pub version: String,
    pub default_weight: f64,
    severity_bonus: BTreeMap<Severity, f64>,
    aliases: BTreeMap<String, String>,
    evidence_rules: Vec<EvidenceRule>,
    definitive_rules: Vec<DefinitiveRule>,
    contraindications: Vec<Contraindication>,
}

impl RuleTable {
    /// The policy shipped with the crate.
    pub fn embedded() -> Self {
        EMBEDDED.clone()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
            .map_err(|e| AggregationError::RuleTable(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let spec: RuleTableSpec =
            serde_yaml::from_str(raw).map_err(|e| AggregationError::RuleTable(e.to_string()))?;

        check_unit_interval("default_weight", spec.default_weight)?;

        let aliases: BTreeMap<String, String> = spec
            .aliases
            .into_iter()
            .map(|(alias, canonical)| (alias.trim().to_lowercase(), canonical.trim().to_string()))
            .collect();

        let mut table = RuleTable {
            version: spec.version,
            default_weight: spec.default_weight,
            severity_bonus: spec.severity_bonus,
            aliases,
            evidence_rules: Vec::with_capacity(spec.evidence_rules.len()),
            definitive_rules: Vec::with_capacity(spec.definitive_rules.len()),
            contraindications: Vec::with_capacity(spec.contraindications.len()),
        };

        for rule in spec.evidence_rules {
            check_unit_interval(&format!("weight of '{}'", rule.pattern), rule.weight)?;
            let supports = rule
                .supports
                .iter()
                .map(|d| table.canonical_diagnosis(d))
                .collect();
            table.evidence_rules.push(EvidenceRule {
                specialist: normalize_specialist(rule.specialist),
                pattern: compile(&rule.pattern)?,
                category: rule.category,
                weight: rule.weight,
                supports,
            });
        }

        let mut seen = HashSet::new();
        for rule in spec.definitive_rules {
            check_unit_interval(&format!("floor of '{}'", rule.pattern), rule.floor)?;
            let key = rule.pattern.trim().to_lowercase();
            if !seen.insert(key) {
                return Err(AggregationError::RuleTable(format!(
                    "definitive pattern '{}' is listed more than once",
                    rule.pattern
                )));
            }
            let diagnosis = table.canonical_diagnosis(&rule.diagnosis);
            table.definitive_rules.push(DefinitiveRule {
                specialist: normalize_specialist(rule.specialist),
                pattern: compile(&rule.pattern)?,
                diagnosis,
                floor: rule.floor,
            });
        }

        for entry in spec.contraindications {
            let caution = entry.caution.trim().to_string();
            if caution.is_empty() {
                return Err(AggregationError::RuleTable(format!(
                    "contraindication for '{}' has no caution text",
                    entry.diagnosis
                )));
            }
            let diagnosis = table.canonical_diagnosis(&entry.diagnosis);
            let conflicts_with = entry
                .conflicts_with
                .iter()
                .map(|d| table.canonical_diagnosis(d))
                .collect();
            table.contraindications.push(Contraindication {
                diagnosis,
                caution,
                conflicts_with,
            });
        }

        Ok(table)
    }

    /// Canonical spelling of a diagnosis name.
    ///
    /// Strips a trailing " - CONFIRMED" marker and resolves aliases
    /// case-insensitively; unknown names are returned trimmed.
    pub fn canonical_diagnosis(&self, name: &str) -> String {
        let mut trimmed = name.trim();
        let lower = trimmed.to_lowercase();
        if lower.ends_with(CONFIRMED_SUFFIX) {
            trimmed = trimmed[..trimmed.len() - CONFIRMED_SUFFIX.len()].trim_end();
        }
        self.aliases
            .get(&trimmed.to_lowercase())
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }

    pub fn evidence_rule_for(&self, agent_id: &str, finding: &str) -> Option<&EvidenceRule> {
        self.evidence_rules
            .iter()
            .find(|rule| applies_to(&rule.specialist, agent_id) && rule.pattern.is_match(finding))
    }

    pub fn definitive_rule_for(&self, agent_id: &str, finding: &str) -> Option<&DefinitiveRule> {
        self.definitive_rules
            .iter()
            .find(|rule| applies_to(&rule.specialist, agent_id) && rule.pattern.is_match(finding))
    }

    pub fn severity_bonus(&self, severity: Option<Severity>) -> f64 {
        severity
            .and_then(|s| self.severity_bonus.get(&s).copied())
            .unwrap_or(0.0)
    }

    pub fn evidence_rules(&self) -> &[EvidenceRule] {
        &self.evidence_rules
    }

    pub fn definitive_rules(&self) -> &[DefinitiveRule] {
        &self.definitive_rules
    }

    pub fn contraindications_for<'a>(
        &'a self,
        diagnosis: &'a str,
    ) -> impl Iterator<Item = &'a Contraindication> + 'a {
        self.contraindications
            .iter()
            .filter(move |c| c.diagnosis.eq_ignore_ascii_case(diagnosis))
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::embedded()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AggregationError::RuleTable(format!("invalid pattern '{}': {}", pattern, e)))
}

fn check_unit_interval(what: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(AggregationError::RuleTable(format!(
            "{} must lie in (0, 1], got {}",
            what, value
        )))
    }
}

fn normalize_specialist(specialist: Option<String>) -> Option<String> {
    specialist
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

fn applies_to(specialist: &Option<String>, agent_id: &str) -> bool {
    specialist
        .as_deref()
        .is_none_or(|s| s.eq_ignore_ascii_case(agent_id))
}
