//! Evidence Classifier: tags each finding as diagnostic or supportive and
//! spots gold-standard findings that license a definitive override.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SpecialistRegistry;
use crate::models::{AgentOutput, Certainty, EvidenceCategory, EvidenceTag};
use crate::rules::RuleTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitiveMatch {
    pub diagnosis: String,
    pub floor: f64,
    pub finding: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// One tag per finding, in finding order.
    pub tags: Vec<EvidenceTag>,
    pub definitive: Option<DefinitiveMatch>,
}

/// A specialist output after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedOutput {
    pub output: AgentOutput,
    pub tags: Vec<EvidenceTag>,
    /// Override candidate, set only when `output.is_definitive`.
    pub definitive_diagnosis: Option<String>,
    pub definitive_finding: Option<String>,
}

impl AnnotatedOutput {
    pub fn agent_id(&self) -> &str {
        &self.output.agent_id
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceClassifier {
    rules: Arc<RuleTable>,
}

impl EvidenceClassifier {
    pub fn new(rules: Arc<RuleTable>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn classify(&self, output: &AgentOutput) -> Classification {
        let mut tags: Vec<EvidenceTag> = output
            .findings
            .iter()
            .map(|finding| {
                let bonus = self.rules.severity_bonus(finding.severity);
                let (category, weight, supports) =
                    match self.rules.evidence_rule_for(&output.agent_id, &finding.name) {
                        Some(rule) => (rule.category, rule.weight, rule.supports.clone()),
                        None => (EvidenceCategory::Supportive, self.rules.default_weight, Vec::new()),
                    };
                EvidenceTag {
                    agent_id: output.agent_id.clone(),
                    finding_name: finding.name.clone(),
                    category,
                    weight: (weight + bonus).min(1.0),
                    supports,
                    presence: finding.presence,
                    definitive: false,
                }
            })
            .collect();

        // Highest floor wins; an absent finding is never gold-standard evidence.
        let mut best: Option<(usize, DefinitiveMatch)> = None;
        for (idx, finding) in output.findings.iter().enumerate() {
            if !finding.presence {
                continue;
            }
            if let Some(rule) = self.rules.definitive_rule_for(&output.agent_id, &finding.name) {
                if best.as_ref().is_none_or(|(_, m)| rule.floor > m.floor) {
                    best = Some((
                        idx,
                        DefinitiveMatch {
                            diagnosis: rule.diagnosis.clone(),
                            floor: rule.floor,
                            finding: finding.name.clone(),
                        },
                    ));
                }
            }
        }

        let definitive = best.map(|(idx, matched)| {
            let tag = &mut tags[idx];
            tag.category = EvidenceCategory::Diagnostic;
            tag.weight = tag.weight.max(matched.floor);
            tag.definitive = true;
            if !tag.supports(&matched.diagnosis) {
                tag.supports.push(matched.diagnosis.clone());
            }
            matched
        });

        Classification { tags, definitive }
    }

    /// Classify and apply the definitive rule to the output itself.
    pub fn annotate(&self, output: &AgentOutput) -> AnnotatedOutput {
        let Classification { tags, definitive } = self.classify(output);
        let mut output = output.clone();

        match definitive {
            Some(matched) => {
                debug!(
                    agent_id = %output.agent_id,
                    diagnosis = %matched.diagnosis,
                    finding = %matched.finding,
                    "Definitive finding matched"
                );
                output.is_definitive = true;
                output.confidence = output.confidence.max(matched.floor);
                output.certainty = Certainty::Confirmed;
                output.top_diagnosis = matched.diagnosis.clone();
                output
                    .diagnoses
                    .insert(matched.diagnosis.clone(), output.confidence);
                AnnotatedOutput {
                    output,
                    tags,
                    definitive_diagnosis: Some(matched.diagnosis),
                    definitive_finding: Some(matched.finding),
                }
            }
            None if output.is_definitive && !output.top_diagnosis.is_empty() => {
                // Specialist asserted a definitive result the rule table does not know.
                let diagnosis = output.top_diagnosis.clone();
                output.certainty = Certainty::Confirmed;
                let finding = tags
                    .iter()
                    .find(|t| t.presence && t.supports(&diagnosis))
                    .map(|t| t.finding_name.clone());
                AnnotatedOutput {
                    output,
                    tags,
                    definitive_diagnosis: Some(diagnosis),
                    definitive_finding: finding,
                }
            }
            None => {
                if output.is_definitive {
                    warn!(agent_id = %output.agent_id, "Definitive flag without a diagnosis, ignoring");
                    output.is_definitive = false;
                }
                AnnotatedOutput {
                    output,
                    tags,
                    definitive_diagnosis: None,
                    definitive_finding: None,
                }
            }
        }
    }

    /// Annotate every output, ordered by specialist priority.
    pub fn annotate_all(
        &self,
        outputs: &[AgentOutput],
        registry: &SpecialistRegistry,
    ) -> Vec<AnnotatedOutput> {
        let mut annotated: Vec<AnnotatedOutput> = outputs.iter().map(|o| self.annotate(o)).collect();
        annotated.sort_by_key(|a| registry.rank(a.agent_id()));
        annotated
    }
}

impl Default for EvidenceClassifier {
    fn default() -> Self {
        Self::new(Arc::new(RuleTable::embedded()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Finding, Severity};

    fn classifier() -> EvidenceClassifier {
        EvidenceClassifier::default()
    }

    #[test]
    fn unknown_findings_default_to_low_weight_support() {
        let output = AgentOutput::new("pathologist").with_finding(Finding::present("Mild anisocytosis"));
        let classification = classifier().classify(&output);
        let tag = &classification.tags[0];
        assert_eq!(tag.category, EvidenceCategory::Supportive);
        assert_eq!(tag.weight, 0.1);
        assert!(tag.supports.is_empty());
        assert!(classification.definitive.is_none());
    }

    #[test]
    fn severity_raises_weight_but_caps_at_one() {
        let output = AgentOutput::new("radiologist")
            .with_finding(Finding::present("Cardiomegaly").with_severity(Severity::High))
            .with_finding(
                Finding::present("Saddle embolus").with_severity(Severity::Critical),
            );
        let tags = classifier().classify(&output).tags;
        assert!((tags[0].weight - 0.55).abs() < 1e-9);
        assert_eq!(tags[1].weight, 1.0);
    }

    #[test]
    fn definitive_finding_raises_confidence_to_floor() {
        let output = AgentOutput::new("radiologist")
            .with_diagnosis("Pulmonary Embolism", 0.7)
            .with_finding(Finding::present("Filling defect in the right pulmonary artery"));
        let annotated = classifier().annotate(&output);
        assert!(annotated.output.is_definitive);
        assert_eq!(annotated.output.confidence, 0.95);
        assert_eq!(annotated.output.certainty, Certainty::Confirmed);
        assert_eq!(annotated.definitive_diagnosis.as_deref(), Some("Pulmonary Embolism"));
        assert!(annotated.tags[0].definitive);
    }

    #[test]
    fn definitive_floor_never_lowers_confidence() {
        let output = AgentOutput::new("radiologist")
            .with_diagnosis("Pulmonary Embolism", 0.98)
            .with_finding(Finding::present("Filling defect in the right pulmonary artery"));
        let annotated = classifier().annotate(&output);
        assert_eq!(annotated.output.confidence, 0.98);
        assert_eq!(annotated.output.diagnoses["Pulmonary Embolism"], 0.98);
    }

    #[test]
    fn absent_or_foreign_findings_are_not_definitive() {
        let absent = AgentOutput::new("radiologist")
            .with_diagnosis("Pneumonia", 0.6)
            .with_finding(Finding::absent("Filling defect in pulmonary artery"));
        assert!(!classifier().annotate(&absent).output.is_definitive);

        let wrong_role = AgentOutput::new("pulmonologist")
            .with_diagnosis("Pulmonary Embolism", 0.6)
            .with_finding(Finding::present("Filling defect in pulmonary artery"));
        assert!(!classifier().annotate(&wrong_role).output.is_definitive);
    }

    #[test]
    fn asserted_definitive_without_diagnosis_is_cleared() {
        let output = AgentOutput::new("cardiologist")
            .with_finding(Finding::present("Sinus rhythm"))
            .definitive();
        let annotated = classifier().annotate(&output);
        assert!(!annotated.output.is_definitive);
        assert!(annotated.definitive_diagnosis.is_none());
    }

    #[test]
    fn annotate_all_orders_by_priority() {
        let outputs = vec![
            AgentOutput::new("pathologist").with_diagnosis("CAP", 0.5),
            AgentOutput::new("radiologist").with_diagnosis("CAP", 0.6),
        ];
        let annotated = classifier().annotate_all(&outputs, &SpecialistRegistry::default());
        assert_eq!(annotated[0].agent_id(), "radiologist");
    }
}
