use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{AggregationError, Result};
use crate::rules::RuleTable;

/// Tunables for the whole aggregation pipeline.
///
/// Every field has a default, so a partial YAML document only needs to
/// name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Fewer admitted outputs than this fails the case.
    pub min_specialists: usize,
    /// Weighted-merge confidence at or above which certainty is `likely`.
    pub likely_threshold: f64,
    /// Merged probability above which a critical condition is flagged.
    pub critical_threshold: f64,
    /// Agreement below which specialists are considered in contradiction.
    pub contradiction_threshold: f64,
    /// Confidence cap applied on contradiction.
    pub safety_ceiling: f64,
    /// Runner-up diagnoses must exceed this to enter the differential.
    pub differential_floor: f64,
    /// Supporting evidence counts as material when the diagnosis it backs
    /// scored at least this much.
    pub materiality_threshold: f64,
    /// Diagnostic evidence at or above this weight is decisive.
    pub decisive_weight: f64,
    pub calibration: CalibrationConfig,
    pub critical_conditions: BTreeSet<String>,
    pub specialists: SpecialistRegistry,
    /// Rule table to load instead of the embedded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub bucket_width: f64,
    pub tolerance: f64,
    pub min_samples: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            bucket_width: 0.1,
            tolerance: 0.15,
            min_samples: 10,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_specialists: 1,
            likely_threshold: 0.6,
            critical_threshold: 0.3,
            contradiction_threshold: 0.5,
            safety_ceiling: 0.6,
            differential_floor: 0.15,
            materiality_threshold: 0.05,
            decisive_weight: 0.8,
            calibration: CalibrationConfig::default(),
            critical_conditions: default_critical_conditions(),
            specialists: SpecialistRegistry::default(),
            rules_path: None,
        }
    }
}

fn default_critical_conditions() -> BTreeSet<String> {
    [
        "ST-Elevation Myocardial Infarction",
        "Pulmonary Embolism",
        "Tension Pneumothorax",
        "Cardiac Tamponade",
        "Septic Shock",
        "Respiratory Failure",
        "Ventricular Arrhythmia",
        "Aortic Dissection",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl AggregationConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| AggregationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
            .map_err(|e| AggregationError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from `CONSENSUS_CONFIG` (a YAML path) if set, then apply
    /// `CONSENSUS_RULES` and `MIN_SPECIALISTS` on top.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("CONSENSUS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                info!(path = %path, "Loading aggregation config");
                Self::from_file(path.trim())?
            }
            _ => Self::default(),
        };

        if let Ok(path) = std::env::var("CONSENSUS_RULES") {
            if !path.trim().is_empty() {
                config.rules_path = Some(PathBuf::from(path.trim()));
            }
        }

        if let Ok(raw) = std::env::var("MIN_SPECIALISTS") {
            match raw.trim().parse::<usize>() {
                Ok(n) => config.min_specialists = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid MIN_SPECIALISTS"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// The configured rule table, or the embedded default.
    pub fn load_rules(&self) -> Result<RuleTable> {
        match &self.rules_path {
            Some(path) => {
                let table = RuleTable::from_file(path)?;
                info!(path = %path.display(), version = %table.version, "Loaded rule table");
                Ok(table)
            }
            None => Ok(RuleTable::embedded()),
        }
    }

    pub fn is_critical(&self, diagnosis: &str) -> bool {
        self.critical_conditions
            .iter()
            .any(|c| c.eq_ignore_ascii_case(diagnosis))
    }

    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("likely_threshold", self.likely_threshold),
            ("critical_threshold", self.critical_threshold),
            ("contradiction_threshold", self.contradiction_threshold),
            ("safety_ceiling", self.safety_ceiling),
            ("differential_floor", self.differential_floor),
            ("materiality_threshold", self.materiality_threshold),
            ("decisive_weight", self.decisive_weight),
            ("calibration.tolerance", self.calibration.tolerance),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(AggregationError::Config(format!(
                    "{} must lie in [0, 1], got {}",
                    name, value
                )));
            }
        }

        let width = self.calibration.bucket_width;
        if !(width > 0.0 && width <= 1.0) {
            return Err(AggregationError::Config(format!(
                "calibration.bucket_width must lie in (0, 1], got {}",
                width
            )));
        }

        self.specialists.validate()
    }
}

/// A specialist role as the engines see it: a tie-break priority, whether
/// its absence costs certainty, and how relevant it is per diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistProfile {
    pub id: String,
    /// Lower wins tie-breaks.
    pub priority: u32,
    #[serde(default)]
    pub carries_diagnostic_weight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_relevance: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relevance: BTreeMap<String, f64>,
}

impl SpecialistProfile {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
            carries_diagnostic_weight: false,
            base_relevance: None,
            relevance: BTreeMap::new(),
        }
    }

    pub fn diagnostic(mut self) -> Self {
        self.carries_diagnostic_weight = true;
        self
    }

    pub fn with_base_relevance(mut self, factor: f64) -> Self {
        self.base_relevance = Some(factor);
        self
    }

    pub fn with_relevance(mut self, diagnosis: impl Into<String>, factor: f64) -> Self {
        self.relevance.insert(diagnosis.into(), factor);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecialistRegistry(Vec<SpecialistProfile>);

impl Default for SpecialistRegistry {
    fn default() -> Self {
        const CAP: &str = "Community-Acquired Pneumonia";
        const STEMI: &str = "ST-Elevation Myocardial Infarction";
        const NSTEMI: &str = "Non-ST-Elevation Myocardial Infarction";
        const PE: &str = "Pulmonary Embolism";
        const ADHF: &str = "Acute Decompensated Heart Failure";
        const COPD: &str = "COPD Exacerbation";

        Self(vec![
            SpecialistProfile::new("radiologist", 0)
                .diagnostic()
                .with_base_relevance(1.0)
                .with_relevance(CAP, 1.3)
                .with_relevance(STEMI, 0.6)
                .with_relevance(NSTEMI, 0.6)
                .with_relevance(PE, 1.4)
                .with_relevance(ADHF, 1.2)
                .with_relevance(COPD, 1.0),
            SpecialistProfile::new("cardiologist", 1)
                .diagnostic()
                .with_base_relevance(1.0)
                .with_relevance(CAP, 0.5)
                .with_relevance(STEMI, 1.5)
                .with_relevance(NSTEMI, 1.4)
                .with_relevance(PE, 1.0)
                .with_relevance(ADHF, 1.2)
                .with_relevance(COPD, 0.6),
            SpecialistProfile::new("pulmonologist", 2)
                .with_base_relevance(1.0)
                .with_relevance(CAP, 1.2)
                .with_relevance(STEMI, 0.4)
                .with_relevance(NSTEMI, 0.5)
                .with_relevance(PE, 0.8)
                .with_relevance(ADHF, 0.9)
                .with_relevance(COPD, 1.4),
            SpecialistProfile::new("pathologist", 3)
                .diagnostic()
                .with_base_relevance(0.8)
                .with_relevance(CAP, 1.0)
                .with_relevance(STEMI, 1.3)
                .with_relevance(NSTEMI, 1.3)
                .with_relevance(PE, 1.0)
                .with_relevance(ADHF, 1.1)
                .with_relevance(COPD, 0.8),
        ])
    }
}

impl SpecialistRegistry {
    pub fn new(profiles: Vec<SpecialistProfile>) -> Self {
        Self(profiles)
    }

    pub fn get(&self, agent_id: &str) -> Option<&SpecialistProfile> {
        self.0.iter().find(|p| p.id.eq_ignore_ascii_case(agent_id))
    }

    pub fn profiles(&self) -> &[SpecialistProfile] {
        &self.0
    }

    /// Sort key for deterministic ordering: registered priority, then id.
    /// Unregistered agents sort after every registered one.
    pub fn rank(&self, agent_id: &str) -> (u32, String) {
        let priority = self.get(agent_id).map_or(u32::MAX, |p| p.priority);
        (priority, agent_id.to_lowercase())
    }

    /// `specialty_relevance(agent, diagnosis)`
    pub fn relevance(&self, agent_id: &str, diagnosis: &str) -> f64 {
        let Some(profile) = self.get(agent_id) else {
            return 1.0;
        };
        profile
            .relevance
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(diagnosis))
            .map(|(_, factor)| *factor)
            .or(profile.base_relevance)
            .unwrap_or(1.0)
    }

    /// Roles whose absence costs a level of certainty.
    pub fn diagnostic_roles(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|p| p.carries_diagnostic_weight)
            .map(|p| p.id.as_str())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for profile in &self.0 {
            if profile.id.trim().is_empty() {
                return Err(AggregationError::Config("specialist id may not be empty".into()));
            }
            if !seen.insert(profile.id.to_lowercase()) {
                return Err(AggregationError::Config(format!(
                    "specialist '{}' is registered twice",
                    profile.id
                )));
            }
            let factors = profile.base_relevance.into_iter().chain(profile.relevance.values().copied());
            for factor in factors {
                if !(factor > 0.0 && factor.is_finite()) {
                    return Err(AggregationError::Config(format!(
                        "relevance of '{}' must be positive, got {}",
                        profile.id, factor
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AggregationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_specialists, 1);
        assert_eq!(config.calibration.bucket_width, 0.1);
        assert!(config.is_critical("pulmonary embolism"));
        assert!(!config.is_critical("Community-Acquired Pneumonia"));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AggregationConfig::from_yaml_str(
            "min_specialists: 3\ncalibration:\n  tolerance: 0.2\n",
        )
        .unwrap();
        assert_eq!(config.min_specialists, 3);
        assert_eq!(config.calibration.tolerance, 0.2);
        assert_eq!(config.calibration.min_samples, 10);
        assert_eq!(config.safety_ceiling, 0.6);
        assert_eq!(config.specialists, SpecialistRegistry::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(AggregationConfig::from_yaml_str("safety_ceiling: 1.5\n").is_err());
        assert!(AggregationConfig::from_yaml_str("calibration:\n  bucket_width: 0\n").is_err());
        let dup = "specialists:\n  - {id: a, priority: 0}\n  - {id: A, priority: 1}\n";
        assert!(AggregationConfig::from_yaml_str(dup).is_err());
    }

    #[test]
    fn ranking_puts_unknown_agents_last() {
        let registry = SpecialistRegistry::default();
        let mut agents = vec!["oncologist", "pathologist", "radiologist", "cardiologist"];
        agents.sort_by_key(|a| registry.rank(a));
        assert_eq!(agents, vec!["radiologist", "cardiologist", "pathologist", "oncologist"]);
    }

    #[test]
    fn relevance_falls_back_from_diagnosis_to_base_to_one() {
        let registry = SpecialistRegistry::default();
        let cases = [
            ("radiologist", "Pulmonary Embolism", 1.4),
            ("cardiologist", "st-elevation myocardial infarction", 1.5),
            ("pathologist", "Sarcoidosis", 0.8),
            ("pulmonologist", "Sarcoidosis", 1.0),
            ("dermatologist", "Pulmonary Embolism", 1.0),
        ];
        for (agent, diagnosis, expected) in cases {
            assert_eq!(registry.relevance(agent, diagnosis), expected, "{agent}/{diagnosis}");
        }
    }

    #[test]
    fn registry_from_yaml_plugs_in_new_roles() {
        let yaml = r#"
specialists:
  - id: neurologist
    priority: 0
    carries_diagnostic_weight: true
    relevance:
      Stroke: 1.6
  - id: radiologist
    priority: 1
"#;
        let config = AggregationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.specialists.relevance("neurologist", "Stroke"), 1.6);
        assert_eq!(config.specialists.relevance("radiologist", "Stroke"), 1.0);
        let roles: Vec<_> = config.specialists.diagnostic_roles().collect();
        assert_eq!(roles, vec!["neurologist"]);
    }

    #[test]
    fn loads_config_and_rules_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yaml");
        std::fs::write(
            &rules,
            "version: custom\nevidence_rules:\n  - pattern: 'rash'\n    category: supportive\n    weight: 0.3\n",
        )
        .unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            format!("min_specialists: 2\nrules_path: {}\n", rules.display()),
        )
        .unwrap();

        let config = AggregationConfig::from_file(&config_path).unwrap();
        assert_eq!(config.min_specialists, 2);
        let table = config.load_rules().unwrap();
        assert_eq!(table.version, "custom");
    }
}
