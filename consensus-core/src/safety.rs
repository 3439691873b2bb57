//! Safety Reviewer: flags critical conditions, caps confidence when the
//! specialists contradict each other, and annotates miscalibration.
//! Every adjustment weakens the consensus; nothing here raises it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::calibration::CalibrationSnapshot;
use crate::config::AggregationConfig;
use crate::models::{AgentOutput, ConsensusResult, NO_DIAGNOSIS, RiskLevel, SafetyReport};
use crate::rules::RuleTable;

#[derive(Debug, Clone)]
pub struct SafetyReviewer {
    config: Arc<AggregationConfig>,
    rules: Arc<RuleTable>,
}

impl SafetyReviewer {
    pub fn new(config: Arc<AggregationConfig>) -> Self {
        Self {
            config,
            rules: Arc::new(RuleTable::embedded()),
        }
    }

    /// Use `rules` for treatment cautions instead of the embedded table.
    pub fn with_rules(mut self, rules: Arc<RuleTable>) -> Self {
        self.rules = rules;
        self
    }

    pub fn review(
        &self,
        consensus: &ConsensusResult,
        outputs: &[AgentOutput],
        calibration: &CalibrationSnapshot,
    ) -> SafetyReport {
        let suspected = suspected_diagnoses(consensus, outputs);
        let mut report = SafetyReport {
            critical_flags: self.critical_flags(consensus, &suspected),
            specialist_flags: outputs
                .iter()
                .flat_map(|o| o.flags.iter().map(move |f| format!("[{}] {}", o.agent_id, f)))
                .collect(),
            ..SafetyReport::default()
        };
        let mut certainty = consensus.certainty;

        if !consensus.is_override()
            && !outputs.is_empty()
            && consensus.agreement_score < self.config.contradiction_threshold
        {
            report.contradiction = true;
            let ceiling = self.config.safety_ceiling;
            report.adjusted_confidence = Some(consensus.confidence.min(ceiling));
            if consensus.confidence > ceiling {
                certainty = certainty.downgrade();
            }
            info!(
                agreement = consensus.agreement_score,
                confidence = consensus.confidence,
                "Specialists disagree, confidence capped"
            );
        }

        report.calibration_warning = self.calibration_warning(consensus, calibration);

        // Any absent registered role costs one level; only diagnostic roles are reported.
        report.missing_specialists = self.missing_roles(outputs, true);
        let absent = self.missing_roles(outputs, false);
        if !absent.is_empty() && !consensus.is_override() {
            certainty = certainty.downgrade();
            debug!(absent = ?absent, "Registered specialists absent, certainty downgraded");
        }

        if certainty < consensus.certainty {
            report.adjusted_certainty = Some(certainty);
        }

        let conflicts = self.apply_contraindications(consensus, &suspected, &mut report);
        self.assess_risk(consensus, &conflicts, &mut report);
        debug!(
            risk = ?report.risk_level,
            critical = report.critical_flags.len(),
            contradiction = report.contradiction,
            "Safety review complete"
        );
        report
    }

    fn critical_flags(
        &self,
        consensus: &ConsensusResult,
        suspected: &BTreeMap<String, f64>,
    ) -> BTreeSet<String> {
        let mut flags = BTreeSet::new();
        if self.config.is_critical(&consensus.top_diagnosis) {
            flags.insert(consensus.top_diagnosis.clone());
        }
        for (diagnosis, probability) in suspected {
            if *probability > self.config.critical_threshold && self.config.is_critical(diagnosis) {
                flags.insert(diagnosis.clone());
            }
        }
        flags
    }

    /// Records the cautions for the top diagnosis and returns the
    /// conflicting diagnoses the panel also suspects.
    fn apply_contraindications(
        &self,
        consensus: &ConsensusResult,
        suspected: &BTreeMap<String, f64>,
        report: &mut SafetyReport,
    ) -> Vec<String> {
        let mut conflicts = Vec::new();
        for entry in self.rules.contraindications_for(&consensus.top_diagnosis) {
            report.cautions.push(entry.caution.clone());
            for conflict in &entry.conflicts_with {
                let hit = suspected.iter().any(|(name, p)| {
                    *p > self.config.critical_threshold && name.eq_ignore_ascii_case(conflict)
                });
                if hit {
                    info!(
                        diagnosis = %consensus.top_diagnosis,
                        conflict = %conflict,
                        "Contraindicated treatment suspected"
                    );
                    conflicts.push(format!("{} ({} suspected)", entry.caution, conflict));
                }
            }
        }
        conflicts
    }

    fn calibration_warning(
        &self,
        consensus: &ConsensusResult,
        calibration: &CalibrationSnapshot,
    ) -> Option<String> {
        if consensus.top_diagnosis == NO_DIAGNOSIS {
            return None;
        }
        let settings = &self.config.calibration;
        let bucket = calibration.bucket_accuracy(Some(&consensus.top_diagnosis), consensus.confidence);
        if bucket.sample_count < settings.min_samples {
            return None;
        }
        let accuracy = bucket.empirical_accuracy?;
        let nominal = bucket.midpoint();
        if (accuracy - nominal).abs() <= settings.tolerance {
            return None;
        }
        Some(format!(
            "Historical accuracy for {} at {:.0}-{:.0}% confidence is {:.0}% over {} cases (nominal {:.0}%)",
            consensus.top_diagnosis,
            bucket.range_start * 100.0,
            bucket.range_end * 100.0,
            accuracy * 100.0,
            bucket.sample_count,
            nominal * 100.0
        ))
    }

    fn missing_roles(&self, outputs: &[AgentOutput], diagnostic_only: bool) -> BTreeSet<String> {
        let present: HashSet<String> = outputs.iter().map(|o| o.agent_id.to_lowercase()).collect();
        self.config
            .specialists
            .profiles()
            .iter()
            .filter(|p| !diagnostic_only || p.carries_diagnostic_weight)
            .filter(|p| !present.contains(&p.id.to_lowercase()))
            .map(|p| p.id.clone())
            .collect()
    }

    fn assess_risk(&self, consensus: &ConsensusResult, conflicts: &[String], report: &mut SafetyReport) {
        let mut reasons = Vec::new();
        for flag in &report.critical_flags {
            reasons.push(format!("critical condition: {}", flag));
        }
        if report.contradiction {
            reasons.push(format!(
                "specialists disagree (agreement {:.0}%)",
                consensus.agreement_score * 100.0
            ));
        }
        for conflict in conflicts {
            reasons.push(format!("contraindication: {}", conflict));
        }
        for caution in &report.cautions {
            reasons.push(format!("caution: {}", caution));
        }
        if let Some(warning) = &report.calibration_warning {
            reasons.push(format!("calibration: {}", warning));
        }
        if !report.missing_specialists.is_empty() {
            let missing: Vec<&str> = report.missing_specialists.iter().map(String::as_str).collect();
            reasons.push(format!("missing diagnostic specialists: {}", missing.join(", ")));
        }

        report.risk_level = if !report.critical_flags.is_empty() {
            RiskLevel::Critical
        } else if report.contradiction || !conflicts.is_empty() {
            RiskLevel::High
        } else if report.calibration_warning.is_some() || !report.missing_specialists.is_empty() {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        };
        report.needs_human_review =
            report.risk_level >= RiskLevel::High || report.missing_specialists.len() > 1;
        report.review_reasons = reasons;
    }
}

impl Default for SafetyReviewer {
    fn default() -> Self {
        Self::new(Arc::new(AggregationConfig::default()))
    }
}

/// Highest probability any source gives each diagnosis. A definitive
/// override collapses the consensus to one name, so the per-agent
/// assessments are scanned as well.
fn suspected_diagnoses(consensus: &ConsensusResult, outputs: &[AgentOutput]) -> BTreeMap<String, f64> {
    let mut suspected: BTreeMap<String, f64> = BTreeMap::new();
    let sources = consensus
        .diagnoses
        .iter()
        .chain(outputs.iter().flat_map(|o| o.diagnoses.iter()));
    for (name, probability) in sources {
        let entry = suspected.entry(name.clone()).or_insert(0.0);
        *entry = entry.max(*probability);
    }
    suspected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusEngine;
    use crate::evidence::EvidenceClassifier;
    use crate::models::{CalibrationRecord, Certainty};
    use std::collections::BTreeMap;

    const PE: &str = "Pulmonary Embolism";
    const CAP: &str = "Community-Acquired Pneumonia";

    fn consensus(top: &str, confidence: f64, certainty: Certainty, agreement: f64) -> ConsensusResult {
        ConsensusResult {
            diagnoses: BTreeMap::from([(top.to_string(), confidence)]),
            top_diagnosis: top.to_string(),
            confidence,
            certainty,
            override_agent: None,
            agreement_score: agreement,
            differential: Vec::new(),
            supporting_agents: Vec::new(),
        }
    }

    fn full_panel() -> Vec<AgentOutput> {
        ["radiologist", "cardiologist", "pulmonologist", "pathologist"]
            .into_iter()
            .map(AgentOutput::new)
            .collect()
    }

    fn empty_snapshot() -> CalibrationSnapshot {
        CalibrationSnapshot::new(0.1, Vec::new())
    }

    #[test]
    fn flags_critical_top_and_probable_runner_ups() {
        let mut result = consensus(CAP, 0.5, Certainty::Suspected, 1.0);
        result.diagnoses.insert(PE.into(), 0.35);
        result.diagnoses.insert("Aortic Dissection".into(), 0.1);
        let report = SafetyReviewer::default().review(&result, &full_panel(), &empty_snapshot());
        assert_eq!(report.critical_flags, BTreeSet::from([PE.to_string()]));
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert!(report.needs_human_review);
    }

    #[test]
    fn contradiction_caps_and_downgrades() {
        let result = consensus(CAP, 0.75, Certainty::Likely, 1.0 / 3.0);
        let report = SafetyReviewer::default().review(&result, &full_panel(), &empty_snapshot());
        assert!(report.contradiction);
        assert_eq!(report.adjusted_confidence, Some(0.6));
        assert_eq!(report.adjusted_certainty, Some(Certainty::Suspected));
        assert_eq!(report.risk_level, RiskLevel::High);
    }

    #[test]
    fn contradiction_below_ceiling_keeps_certainty() {
        let result = consensus(CAP, 0.4, Certainty::Suspected, 0.25);
        let report = SafetyReviewer::default().review(&result, &full_panel(), &empty_snapshot());
        assert!(report.contradiction);
        assert_eq!(report.adjusted_confidence, Some(0.4));
        assert_eq!(report.adjusted_certainty, None);
    }

    #[test]
    fn override_is_exempt_from_cap_and_missing_roles() {
        let mut result = consensus(PE, 0.98, Certainty::Confirmed, 0.25);
        result.override_agent = Some("radiologist".into());
        let outputs = vec![AgentOutput::new("radiologist"), AgentOutput::new("pulmonologist")];
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert!(!report.contradiction);
        assert_eq!(report.adjusted_confidence, None);
        assert_eq!(report.adjusted_certainty, None);
        assert!(report.critical_flags.contains(PE));
        assert_eq!(report.missing_specialists.len(), 2);
    }

    #[test]
    fn missing_diagnostic_role_downgrades_once() {
        let result = consensus(CAP, 0.7, Certainty::Likely, 1.0);
        let outputs = vec![AgentOutput::new("pulmonologist")];
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert_eq!(report.missing_specialists.len(), 3);
        assert_eq!(report.adjusted_certainty, Some(Certainty::Suspected));
        assert_eq!(report.adjusted_confidence, None);
        assert!(report.needs_human_review);

        // A non-diagnostic role is not reported but still costs a level.
        let outputs: Vec<_> = full_panel()
            .into_iter()
            .filter(|o| o.agent_id != "pulmonologist")
            .collect();
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert!(report.missing_specialists.is_empty());
        assert_eq!(report.adjusted_certainty, Some(Certainty::Suspected));
        assert_eq!(report.risk_level, RiskLevel::Low);
    }

    #[test]
    fn dropping_a_dissenting_specialist_never_raises_certainty() {
        let config = Arc::new(AggregationConfig::default());
        let engine = ConsensusEngine::new(config.clone());
        let reviewer = SafetyReviewer::new(config);
        let panel = vec![
            AgentOutput::new("radiologist").with_diagnosis(CAP, 0.7),
            AgentOutput::new("cardiologist").with_diagnosis(CAP, 0.7),
            AgentOutput::new("pathologist").with_diagnosis(CAP, 0.7),
            AgentOutput::new("pulmonologist").with_diagnosis(CAP, 0.2),
        ];

        let classifier = EvidenceClassifier::default();
        let specialists = AggregationConfig::default().specialists;
        let certainty_of = |outputs: &[AgentOutput]| {
            let result = engine.merge(&classifier.annotate_all(outputs, &specialists));
            let report = reviewer.review(&result, outputs, &empty_snapshot());
            report.final_certainty(&result)
        };

        let with_all = certainty_of(&panel);
        for skip in 0..panel.len() {
            let mut partial = panel.clone();
            let removed = partial.remove(skip);
            assert!(
                certainty_of(&partial) <= with_all,
                "without {} certainty rose above {with_all}",
                removed.agent_id
            );
        }
    }

    #[test]
    fn override_still_flags_critical_diagnoses_from_other_agents() {
        let mut result = consensus(PE, 0.95, Certainty::Confirmed, 1.0 / 3.0);
        result.override_agent = Some("radiologist".into());
        let outputs = vec![
            AgentOutput::new("radiologist").with_diagnosis(PE, 0.95),
            AgentOutput::new("cardiologist").with_diagnosis("Aortic Dissection", 0.9),
            AgentOutput::new("pathologist").with_diagnosis("Aortic Dissection", 0.85),
            AgentOutput::new("pulmonologist").with_diagnosis("Asthma", 0.2),
        ];
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert!(report.critical_flags.contains("Aortic Dissection"));
        assert!(report.critical_flags.contains(PE));
        assert_eq!(report.final_certainty(&result), Certainty::Confirmed);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn contraindication_escalates_when_conflict_is_suspected() {
        const AFIB: &str = "Atrial Fibrillation";
        let result = consensus(AFIB, 0.7, Certainty::Likely, 1.0);

        let report = SafetyReviewer::default().review(&result, &full_panel(), &empty_snapshot());
        assert_eq!(report.cautions, vec!["rate control caution in WPW syndrome".to_string()]);
        assert!(report.review_reasons.iter().any(|r| r.starts_with("caution:")));
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert!(!report.needs_human_review);

        let mut outputs = full_panel();
        outputs[1] = AgentOutput::new("cardiologist").with_diagnosis("Wolff-Parkinson-White Syndrome", 0.4);
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert_eq!(report.risk_level, RiskLevel::High);
        assert!(report.needs_human_review);
        assert!(
            report
                .review_reasons
                .iter()
                .any(|r| r.starts_with("contraindication:") && r.contains("Wolff-Parkinson-White"))
        );
    }

    #[test]
    fn stemi_with_suspected_dissection_is_contraindicated() {
        let result = consensus("ST-Elevation Myocardial Infarction", 0.8, Certainty::Likely, 1.0);
        let mut outputs = full_panel();
        outputs[0] = AgentOutput::new("radiologist").with_diagnosis("Aortic Dissection", 0.6);
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert!(report.critical_flags.contains("Aortic Dissection"));
        assert!(report.needs_human_review);
        assert!(report.review_reasons.iter().any(|r| r.contains("thrombolytics")));
    }

    #[test]
    fn adjusted_confidence_never_exceeds_consensus() {
        for (confidence, agreement) in [(0.95, 0.0), (0.6, 0.2), (0.3, 0.4), (0.8, 0.9), (0.0, 0.0)] {
            let result = consensus(CAP, confidence, Certainty::Likely, agreement);
            let report = SafetyReviewer::default().review(&result, &full_panel(), &empty_snapshot());
            assert!(report.final_confidence(&result) <= confidence);
            if let Some(adjusted) = report.adjusted_confidence {
                assert!(adjusted <= confidence);
            }
        }
    }

    #[test]
    fn specialist_flags_carry_their_source() {
        let mut outputs = full_panel();
        outputs[1] = AgentOutput::new("cardiologist").with_flag("QT prolongation");
        let result = consensus(CAP, 0.5, Certainty::Suspected, 1.0);
        let report = SafetyReviewer::default().review(&result, &outputs, &empty_snapshot());
        assert!(report.specialist_flags.contains("[cardiologist] QT prolongation"));
    }

    fn labelled(n: usize, correct: usize, confidence: f64) -> Vec<CalibrationRecord> {
        (0..n)
            .map(|i| CalibrationRecord {
                case_id: format!("C{i}"),
                predicted_confidence: confidence,
                predicted_diagnosis: CAP.to_string(),
                actual_outcome: Some(i < correct),
            })
            .collect()
    }

    #[test]
    fn calibration_warning_respects_tolerance_and_sample_size() {
        // Bucket 0.7-0.8, nominal 0.75.
        let cases = [
            (0.15, 12, 5, true),   // 42% accuracy
            (0.15, 12, 9, false),  // 75%
            (0.15, 5, 0, false),   // too few samples
            (0.35, 12, 5, false),  // wide tolerance
            (0.05, 12, 11, true),  // 92%
        ];
        for (tolerance, n, correct, warns) in cases {
            let mut config = AggregationConfig::default();
            config.calibration.tolerance = tolerance;
            let reviewer = SafetyReviewer::new(Arc::new(config));
            let snapshot = CalibrationSnapshot::new(0.1, labelled(n, correct, 0.74));
            let result = consensus(CAP, 0.72, Certainty::Likely, 1.0);
            let report = reviewer.review(&result, &full_panel(), &snapshot);
            assert_eq!(
                report.calibration_warning.is_some(),
                warns,
                "tolerance {tolerance}, {correct}/{n}"
            );
            // Annotation only.
            assert_eq!(report.adjusted_confidence, None);
        }
    }
}
