//! Explainability Engine: evidence attributions and a per-specialist
//! reasoning chain, rebuilt from the inputs the consensus was merged from.
//!
//! Pure and deterministic: every ordering is by a stable key, never by
//! map iteration order alone.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::AggregationConfig;
use crate::consensus::{ConsensusEngine, cmp_desc};
use crate::evidence::AnnotatedOutput;
use crate::models::{
    Contribution, ConsensusResult, EvidenceAttribution, EvidenceTag, Explanation, ReasoningStep,
    SafetyReport, StepAction,
};

const KEY_EVIDENCE_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Supporting,
    Opposing,
    Neutral,
}

#[derive(Debug, Clone)]
pub struct ExplainabilityEngine {
    config: Arc<AggregationConfig>,
}

impl ExplainabilityEngine {
    pub fn new(config: Arc<AggregationConfig>) -> Self {
        Self { config }
    }

    pub fn explain(
        &self,
        consensus: &ConsensusResult,
        safety: &SafetyReport,
        annotated: &[AnnotatedOutput],
    ) -> Explanation {
        let evidence_attributions = self.attributions(consensus, annotated);
        let reasoning_chain = self.reasoning_chain(consensus, annotated);
        let one_line = one_line(consensus, safety, &evidence_attributions);
        let detailed = detailed(consensus, safety, &evidence_attributions);
        Explanation {
            evidence_attributions,
            reasoning_chain,
            one_line,
            detailed,
        }
    }

    fn attributions(
        &self,
        consensus: &ConsensusResult,
        annotated: &[AnnotatedOutput],
    ) -> Vec<EvidenceAttribution> {
        let top = consensus.top_diagnosis.as_str();
        let registry = &self.config.specialists;

        let mut ranked: Vec<(EvidenceAttribution, (u32, String))> = annotated
            .iter()
            .flat_map(|item| item.tags.iter())
            .filter_map(|tag| {
                let direction = direction(tag, top);
                if !self.is_material(tag, direction, consensus) {
                    return None;
                }
                let contribution = self.contribution(tag, direction);
                Some((
                    EvidenceAttribution {
                        finding: tag.finding_name.clone(),
                        contribution,
                        weight: tag.weight,
                        reasoning: reasoning(tag, contribution, direction, top),
                        source_agent: tag.agent_id.clone(),
                    },
                    registry.rank(&tag.agent_id),
                ))
            })
            .collect();

        ranked.sort_by(|(a, rank_a), (b, rank_b)| {
            a.contribution
                .cmp(&b.contribution)
                .then_with(|| cmp_desc(a.weight, b.weight))
                .then_with(|| rank_a.cmp(rank_b))
                .then_with(|| a.finding.cmp(&b.finding))
        });
        ranked.into_iter().map(|(attribution, _)| attribution).collect()
    }

    /// Diagnostic evidence always counts; supportive evidence only when a
    /// diagnosis it backs carries real weight in the merge.
    fn is_material(&self, tag: &EvidenceTag, direction: Direction, consensus: &ConsensusResult) -> bool {
        if tag.is_diagnostic() || direction == Direction::Opposing {
            return true;
        }
        tag.presence
            && tag.supports.iter().any(|d| {
                consensus
                    .diagnoses
                    .iter()
                    .any(|(name, p)| name.eq_ignore_ascii_case(d) && *p >= self.config.materiality_threshold)
            })
    }

    fn contribution(&self, tag: &EvidenceTag, direction: Direction) -> Contribution {
        match direction {
            Direction::Opposing => Contribution::Opposing,
            Direction::Supporting if tag.definitive => Contribution::Decisive,
            Direction::Supporting if tag.is_diagnostic() => {
                if tag.weight >= self.config.decisive_weight {
                    Contribution::Decisive
                } else {
                    Contribution::Strong
                }
            }
            Direction::Supporting if tag.weight >= 0.5 => Contribution::Moderate,
            Direction::Neutral if tag.is_diagnostic() => Contribution::Moderate,
            Direction::Supporting | Direction::Neutral => Contribution::Weak,
        }
    }

    fn reasoning_chain(&self, consensus: &ConsensusResult, annotated: &[AnnotatedOutput]) -> Vec<ReasoningStep> {
        let mut steps = match &consensus.override_agent {
            Some(agent) => self.override_chain(agent, consensus, annotated),
            None => self.weighted_chain(consensus, annotated),
        };

        // Absorb float drift so the deltas sum exactly to the confidence.
        let total: f64 = steps.iter().map(|s| s.confidence_delta).sum();
        if let Some(first) = steps.first_mut() {
            first.confidence_delta += consensus.confidence - total;
        }
        for (idx, step) in steps.iter_mut().enumerate() {
            step.step_number = idx as u32 + 1;
        }
        steps
    }

    fn override_chain(
        &self,
        override_agent: &str,
        consensus: &ConsensusResult,
        annotated: &[AnnotatedOutput],
    ) -> Vec<ReasoningStep> {
        let top = &consensus.top_diagnosis;
        let registry = &self.config.specialists;
        let winner = annotated.iter().find(|a| a.agent_id() == override_agent);

        let mut evidence_used: Vec<String> = winner
            .and_then(|w| w.definitive_finding.clone())
            .into_iter()
            .collect();
        if let Some(winner) = winner {
            for name in supporting_findings(winner, top) {
                if !evidence_used.contains(&name) {
                    evidence_used.push(name);
                }
            }
        }

        let mut steps = vec![ReasoningStep {
            step_number: 0,
            agent: override_agent.to_string(),
            action: StepAction::Confirmed,
            description: format!("{} identified a definitive finding", title(override_agent)),
            evidence_used,
            conclusion: format!("DEFINITIVE: {} confirmed by gold-standard test", top),
            confidence_delta: consensus.confidence,
        }];

        let mut others: Vec<&AnnotatedOutput> = annotated
            .iter()
            .filter(|a| a.agent_id() != override_agent)
            .collect();
        others.sort_by_key(|a| registry.rank(a.agent_id()));
        steps.extend(others.into_iter().map(|other| ReasoningStep {
            step_number: 0,
            agent: other.agent_id().to_string(),
            action: StepAction::Overridden,
            description: format!(
                "{} assessment superseded by definitive finding",
                title(other.agent_id())
            ),
            evidence_used: present_findings(other),
            conclusion: assessed(other),
            confidence_delta: 0.0,
        }));
        steps
    }

    fn weighted_chain(&self, consensus: &ConsensusResult, annotated: &[AnnotatedOutput]) -> Vec<ReasoningStep> {
        let top = &consensus.top_diagnosis;
        let registry = &self.config.specialists;
        let merge = ConsensusEngine::new(self.config.clone()).weighted_merge(annotated);

        let mut steps: Vec<(ReasoningStep, (u32, String))> = annotated
            .iter()
            .map(|item| {
                let delta = merge.share(top, item.agent_id());
                let own_top = &item.output.top_diagnosis;
                let disagrees = !own_top.is_empty() && !own_top.eq_ignore_ascii_case(top);
                let supporting = supporting_findings(item, top);

                let (action, conclusion) = if disagrees {
                    (StepAction::Flagged, format!("Favours {} over {}", own_top, top))
                } else if !supporting.is_empty() || delta > 0.0 {
                    (StepAction::Contributed, format!("Evidence supports {}", top))
                } else {
                    (StepAction::Contributed, assessed(item))
                };
                let evidence_used = if supporting.is_empty() {
                    present_findings(item)
                } else {
                    supporting
                };

                (
                    ReasoningStep {
                        step_number: 0,
                        agent: item.agent_id().to_string(),
                        action,
                        description: format!(
                            "{} analyzed {} finding(s)",
                            title(item.agent_id()),
                            item.output.findings.len()
                        ),
                        evidence_used,
                        conclusion,
                        confidence_delta: delta,
                    },
                    registry.rank(item.agent_id()),
                )
            })
            .collect();

        steps.sort_by(|(a, rank_a), (b, rank_b)| {
            cmp_desc(a.confidence_delta, b.confidence_delta).then_with(|| rank_a.cmp(rank_b))
        });
        steps.into_iter().map(|(step, _)| step).collect()
    }
}

impl Default for ExplainabilityEngine {
    fn default() -> Self {
        Self::new(Arc::new(AggregationConfig::default()))
    }
}

fn direction(tag: &EvidenceTag, top: &str) -> Direction {
    let backs_top = tag.supports(top);
    match (tag.presence, backs_top) {
        (true, true) => Direction::Supporting,
        (false, true) => Direction::Opposing,
        (true, false) if tag.is_diagnostic() && !tag.supports.is_empty() => Direction::Opposing,
        _ => Direction::Neutral,
    }
}

fn reasoning(tag: &EvidenceTag, contribution: Contribution, direction: Direction, top: &str) -> String {
    match (contribution, direction) {
        (Contribution::Opposing, _) if !tag.presence => {
            format!("Absence of this finding argues against {}", top)
        }
        (Contribution::Opposing, _) => format!("Points toward {} rather than {}", tag.supports.join(", "), top),
        (Contribution::Decisive, _) if tag.definitive => format!("Gold-standard finding confirming {}", top),
        (Contribution::Decisive, _) => format!("High-weight diagnostic finding supporting {}", top),
        (Contribution::Strong, _) => format!("Diagnostic finding supporting {}", top),
        (Contribution::Moderate, Direction::Supporting) => format!("Supportive finding consistent with {}", top),
        (Contribution::Moderate, _) => "Diagnostic finding not specific to the consensus diagnosis".to_string(),
        (Contribution::Weak, _) => "Low-weight supportive finding".to_string(),
    }
}

/// Present findings of `item` that back `diagnosis`, strongest first.
fn supporting_findings(item: &AnnotatedOutput, diagnosis: &str) -> Vec<String> {
    let mut tags: Vec<&EvidenceTag> = item
        .tags
        .iter()
        .filter(|t| t.presence && t.supports(diagnosis))
        .collect();
    tags.sort_by(|a, b| cmp_desc(a.weight, b.weight).then_with(|| a.finding_name.cmp(&b.finding_name)));
    tags.into_iter().map(|t| t.finding_name.clone()).collect()
}

fn present_findings(item: &AnnotatedOutput) -> Vec<String> {
    item.output
        .findings
        .iter()
        .filter(|f| f.presence)
        .map(|f| f.name.clone())
        .collect()
}

fn assessed(item: &AnnotatedOutput) -> String {
    if item.output.top_diagnosis.is_empty() {
        let findings = present_findings(item);
        if findings.is_empty() {
            "No diagnosis offered".to_string()
        } else {
            format!("Findings noted: {}", findings.join(", "))
        }
    } else {
        format!("Assessed {}", item.output.top_diagnosis)
    }
}

fn title(agent_id: &str) -> String {
    let mut chars = agent_id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn one_line(consensus: &ConsensusResult, safety: &SafetyReport, attributions: &[EvidenceAttribution]) -> String {
    let top = &consensus.top_diagnosis;
    let certainty = safety.final_certainty(consensus);
    match attributions.first() {
        Some(a) if a.contribution == Contribution::Decisive => {
            format!("{} ({}) confirmed by {}", top, certainty, a.finding)
        }
        Some(a) if a.contribution != Contribution::Opposing => {
            format!("{} ({}) supported by {}", top, certainty, a.finding)
        }
        _ => format!("{} ({}) suggested by clinical presentation", top, certainty),
    }
}

fn detailed(consensus: &ConsensusResult, safety: &SafetyReport, attributions: &[EvidenceAttribution]) -> String {
    let final_confidence = safety.final_confidence(consensus);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Diagnosis: {} ({})",
        consensus.top_diagnosis,
        safety.final_certainty(consensus).as_str().to_uppercase()
    );
    if final_confidence < consensus.confidence {
        let _ = writeln!(
            out,
            "Confidence: {:.0}% (capped from {:.0}%)",
            final_confidence * 100.0,
            consensus.confidence * 100.0
        );
    } else {
        let _ = writeln!(out, "Confidence: {:.0}%", final_confidence * 100.0);
    }
    match &consensus.override_agent {
        Some(agent) => {
            let _ = writeln!(out, "Basis: definitive finding reported by {}", agent);
        }
        None => {
            let _ = writeln!(
                out,
                "Agreement: {:.0}% of specialists",
                consensus.agreement_score * 100.0
            );
        }
    }

    if !attributions.is_empty() {
        let _ = writeln!(out, "Key evidence:");
        for a in attributions.iter().take(KEY_EVIDENCE_LINES) {
            let label = format!("{:?}", a.contribution).to_uppercase();
            let _ = writeln!(out, "  - [{}] {} ({})", label, a.finding, a.source_agent);
        }
    }

    if !consensus.differential.is_empty() {
        let _ = writeln!(out, "Differential:");
        for d in &consensus.differential {
            let _ = writeln!(out, "  - {}: {:.0}%", d.diagnosis, d.probability * 100.0);
        }
    }

    let mut notes = Vec::new();
    for flag in &safety.critical_flags {
        notes.push(format!("Critical condition: {}", flag));
    }
    if safety.contradiction {
        notes.push("Specialists disagree; confidence capped".to_string());
    }
    if let Some(warning) = &safety.calibration_warning {
        notes.push(format!("Calibration: {}", warning));
    }
    if !safety.missing_specialists.is_empty() {
        let missing: Vec<&str> = safety.missing_specialists.iter().map(String::as_str).collect();
        notes.push(format!("Missing specialists: {}", missing.join(", ")));
    }
    for caution in &safety.cautions {
        notes.push(format!("Caution: {}", caution));
    }
    if !notes.is_empty() {
        let _ = writeln!(out, "Safety:");
        for note in notes {
            let _ = writeln!(out, "  - {}", note);
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceClassifier;
    use crate::models::{AgentOutput, Certainty, Finding};
    use crate::safety::SafetyReviewer;
    use crate::calibration::CalibrationSnapshot;

    const PE: &str = "Pulmonary Embolism";
    const CAP: &str = "Community-Acquired Pneumonia";

    fn run(outputs: &[AgentOutput]) -> (ConsensusResult, SafetyReport, Explanation) {
        let config = AggregationConfig::default();
        let annotated = EvidenceClassifier::default().annotate_all(outputs, &config.specialists);
        let consensus = ConsensusEngine::default().merge(&annotated);
        let raw: Vec<AgentOutput> = annotated.iter().map(|a| a.output.clone()).collect();
        let safety =
            SafetyReviewer::default().review(&consensus, &raw, &CalibrationSnapshot::new(0.1, Vec::new()));
        let explanation = ExplainabilityEngine::default().explain(&consensus, &safety, &annotated);
        (consensus, safety, explanation)
    }

    fn pe_override_panel() -> Vec<AgentOutput> {
        vec![
            AgentOutput::new("radiologist")
                .with_diagnosis(PE, 0.98)
                .with_finding(Finding::present("Filling defect in right pulmonary artery")),
            AgentOutput::new("pulmonologist")
                .with_diagnosis(PE, 0.4)
                .with_finding(Finding::present("Tachycardia"))
                .with_finding(Finding::present("Pleuritic chest pain")),
            AgentOutput::new("cardiologist")
                .with_diagnosis("Pericarditis", 0.5)
                .with_finding(Finding::present("Diffuse ST elevation")),
            AgentOutput::new("pathologist")
                .with_diagnosis(CAP, 0.5)
                .with_finding(Finding::present("Leukocytosis")),
        ]
    }

    fn weighted_panel() -> Vec<AgentOutput> {
        vec![
            AgentOutput::new("radiologist")
                .with_diagnosis(CAP, 0.8)
                .with_diagnosis(PE, 0.1)
                .with_finding(Finding::present("Right lower lobe consolidation"))
                .with_finding(Finding::absent("Pleural effusion")),
            AgentOutput::new("pulmonologist")
                .with_diagnosis(CAP, 0.6)
                .with_finding(Finding::present("Productive cough"))
                .with_finding(Finding::present("Fever")),
            AgentOutput::new("pathologist")
                .with_diagnosis(CAP, 0.55)
                .with_diagnosis("Acute Bronchitis", 0.3)
                .with_finding(Finding::present("Leukocytosis")),
            AgentOutput::new("cardiologist")
                .with_diagnosis("Atrial Fibrillation", 0.3)
                .with_finding(Finding::present("Irregularly irregular rhythm")),
        ]
    }

    fn sum_deltas(explanation: &Explanation) -> f64 {
        explanation.reasoning_chain.iter().map(|s| s.confidence_delta).sum()
    }

    #[test]
    fn override_chain_puts_the_definitive_agent_first() {
        let (consensus, _, explanation) = run(&pe_override_panel());
        let chain = &explanation.reasoning_chain;
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0].agent, "radiologist");
        assert_eq!(chain[0].action, StepAction::Confirmed);
        assert_eq!(chain[0].confidence_delta, consensus.confidence);
        assert!(chain[1..].iter().all(|s| s.action == StepAction::Overridden && s.confidence_delta == 0.0));
        assert_eq!(
            chain.iter().map(|s| s.step_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(chain[0].evidence_used[0], "Filling defect in right pulmonary artery");
    }

    #[test]
    fn override_attributions_lead_with_the_gold_standard() {
        let (_, _, explanation) = run(&pe_override_panel());
        let first = &explanation.evidence_attributions[0];
        assert_eq!(first.contribution, Contribution::Decisive);
        assert_eq!(first.source_agent, "radiologist");
        assert!(explanation.one_line.contains("confirmed by Filling defect"));
        assert!(explanation.one_line.contains("(confirmed)"));
        // ST elevation backs a different diagnosis.
        assert!(explanation
            .evidence_attributions
            .iter()
            .any(|a| a.finding == "Diffuse ST elevation" && a.contribution == Contribution::Opposing));
    }

    #[test]
    fn weighted_chain_conserves_confidence() {
        let (consensus, _, explanation) = run(&weighted_panel());
        assert_eq!(consensus.top_diagnosis, CAP);
        assert!((sum_deltas(&explanation) - consensus.confidence).abs() < 1e-12);

        let chain = &explanation.reasoning_chain;
        let cardiologist = chain.iter().find(|s| s.agent == "cardiologist").unwrap();
        assert_eq!(cardiologist.action, StepAction::Flagged);
        assert_eq!(cardiologist.confidence_delta, 0.0);
        assert_eq!(chain.last().unwrap().agent, "cardiologist");
        for pair in chain.windows(2) {
            assert!(pair[0].confidence_delta + 1e-12 >= pair[1].confidence_delta);
        }
    }

    #[test]
    fn attribution_tiers_follow_category_weight_and_direction() {
        let (_, _, explanation) = run(&weighted_panel());
        let tier = |finding: &str| {
            explanation
                .evidence_attributions
                .iter()
                .find(|a| a.finding == finding)
                .map(|a| a.contribution)
        };
        assert_eq!(tier("Right lower lobe consolidation"), Some(Contribution::Decisive));
        assert_eq!(tier("Pleural effusion"), Some(Contribution::Opposing));
        assert_eq!(tier("Productive cough"), Some(Contribution::Weak));
        assert_eq!(tier("Irregularly irregular rhythm"), Some(Contribution::Opposing));

        let order: Vec<Contribution> = explanation.evidence_attributions.iter().map(|a| a.contribution).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn explanation_is_deterministic() {
        let mut panel = weighted_panel();
        let (_, _, first) = run(&panel);
        panel.reverse();
        let (_, _, second) = run(&panel);
        assert_eq!(first, second);
    }

    #[test]
    fn detailed_text_reports_safety_outcome() {
        let panel = vec![
            AgentOutput::new("radiologist").with_diagnosis(CAP, 0.9),
            AgentOutput::new("pulmonologist").with_diagnosis("COPD Exacerbation", 0.9),
            AgentOutput::new("pathologist").with_diagnosis("Acute Bronchitis", 0.9),
        ];
        let (consensus, safety, explanation) = run(&panel);
        assert!(safety.contradiction);
        assert!(explanation.detailed.starts_with(&format!("Diagnosis: {}", consensus.top_diagnosis)));
        assert!(explanation.detailed.contains("Specialists disagree"));
        assert!(explanation.detailed.contains("Missing specialists: cardiologist"));
        assert!(explanation.one_line.contains("suggested by clinical presentation"));
        assert_eq!(safety.final_certainty(&consensus), Certainty::Suspected);
    }

    #[test]
    fn detailed_text_lists_treatment_cautions() {
        let panel = vec![
            AgentOutput::new("cardiologist").with_diagnosis("Atrial Fibrillation", 0.8),
            AgentOutput::new("radiologist").with_diagnosis("Atrial Fibrillation", 0.7),
        ];
        let (consensus, safety, explanation) = run(&panel);
        assert_eq!(consensus.top_diagnosis, "Atrial Fibrillation");
        assert_eq!(safety.cautions.len(), 1);
        assert!(explanation.detailed.contains("Caution: rate control caution in WPW syndrome"));
    }

    #[test]
    fn empty_panel_explains_the_placeholder() {
        let (consensus, _, explanation) = run(&[]);
        assert!(explanation.reasoning_chain.is_empty());
        assert!(explanation.evidence_attributions.is_empty());
        assert_eq!(sum_deltas(&explanation), consensus.confidence);
    }
}
