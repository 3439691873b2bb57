//! Consensus Engine: merges annotated specialist outputs into one diagnosis.
//!
//! A definitive finding overrides everything else. Without one, each
//! diagnosis gets a weighted average of the probabilities the specialists
//! who named it assigned, weighted by specialty relevance and the
//! strongest diagnostic evidence each specialist brought for it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::AggregationConfig;
use crate::evidence::AnnotatedOutput;
use crate::models::{Certainty, ConsensusResult, DiagnosisScore, NO_DIAGNOSIS};

/// Scores are compared on a grid this fine; anything closer is a tie.
const SCORE_RESOLUTION: f64 = 1e12;
const MAX_DIFFERENTIAL: usize = 3;

/// One specialist's vote for one diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub agent_id: String,
    pub probability: f64,
    pub weight: f64,
}

/// Intermediate state of the weighted merge, kept so the explanation can
/// decompose the final score into per-specialist shares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedMerge {
    /// Normalized scores; they sum to at most 1.
    pub scores: BTreeMap<String, f64>,
    pub contributors: BTreeMap<String, Vec<Contributor>>,
    /// Divisor applied to the raw averages (1 unless their sum exceeded 1).
    pub normalizer: f64,
}

impl WeightedMerge {
    /// `agent`'s share of the score of `diagnosis`; shares sum to the score.
    pub fn share(&self, diagnosis: &str, agent_id: &str) -> f64 {
        let Some(contributors) = self.contributors.get(diagnosis) else {
            return 0.0;
        };
        let total: f64 = contributors.iter().map(|c| c.weight).sum();
        if total <= 0.0 {
            return 0.0;
        }
        contributors
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .map(|c| c.weight * c.probability / total / self.normalizer)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    config: Arc<AggregationConfig>,
}

impl ConsensusEngine {
    pub fn new(config: Arc<AggregationConfig>) -> Self {
        Self { config }
    }

    /// Total: never fails, an empty input yields the placeholder diagnosis.
    pub fn merge(&self, annotated: &[AnnotatedOutput]) -> ConsensusResult {
        let result = match self.select_override(annotated) {
            Some(winner) => self.override_result(winner, annotated),
            None => self.weighted_result(annotated),
        };
        debug!(
            top = %result.top_diagnosis,
            confidence = result.confidence,
            certainty = %result.certainty,
            override_agent = ?result.override_agent,
            agreement = result.agreement_score,
            "Consensus reached"
        );
        result
    }

    /// Highest confidence wins, then specialist priority.
    fn select_override<'a>(&self, annotated: &'a [AnnotatedOutput]) -> Option<&'a AnnotatedOutput> {
        let registry = &self.config.specialists;
        annotated
            .iter()
            .filter(|a| a.output.is_definitive && a.definitive_diagnosis.is_some())
            .min_by(|a, b| {
                b.output
                    .confidence
                    .total_cmp(&a.output.confidence)
                    .then_with(|| registry.rank(a.agent_id()).cmp(&registry.rank(b.agent_id())))
            })
    }

    fn override_result(&self, winner: &AnnotatedOutput, annotated: &[AnnotatedOutput]) -> ConsensusResult {
        let diagnosis = winner
            .definitive_diagnosis
            .clone()
            .unwrap_or_else(|| winner.output.top_diagnosis.clone());
        let confidence = winner.output.confidence;
        let (agreement_score, supporting_agents) = self.agreement(&diagnosis, annotated);

        ConsensusResult {
            diagnoses: BTreeMap::from([(diagnosis.clone(), confidence)]),
            top_diagnosis: diagnosis,
            confidence,
            certainty: Certainty::Confirmed,
            override_agent: Some(winner.agent_id().to_string()),
            agreement_score,
            differential: Vec::new(),
            supporting_agents,
        }
    }

    fn weighted_result(&self, annotated: &[AnnotatedOutput]) -> ConsensusResult {
        let merge = self.weighted_merge(annotated);

        let Some(top) = self.pick_top(&merge) else {
            let (agreement_score, supporting_agents) = self.agreement(NO_DIAGNOSIS, annotated);
            return ConsensusResult {
                diagnoses: BTreeMap::new(),
                top_diagnosis: NO_DIAGNOSIS.to_string(),
                confidence: 0.0,
                certainty: Certainty::Suspected,
                override_agent: None,
                agreement_score,
                differential: Vec::new(),
                supporting_agents,
            };
        };

        let confidence = merge.scores[&top];
        let certainty = if confidence >= self.config.likely_threshold {
            Certainty::Likely
        } else {
            Certainty::Suspected
        };

        let mut differential: Vec<DiagnosisScore> = merge
            .scores
            .iter()
            .filter(|(name, p)| **name != top && **p > self.config.differential_floor)
            .map(|(name, p)| DiagnosisScore {
                diagnosis: name.clone(),
                probability: *p,
            })
            .collect();
        differential.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.diagnosis.cmp(&b.diagnosis))
        });
        differential.truncate(MAX_DIFFERENTIAL);

        let (agreement_score, supporting_agents) = self.agreement(&top, annotated);

        ConsensusResult {
            diagnoses: merge.scores,
            top_diagnosis: top,
            confidence,
            certainty,
            override_agent: None,
            agreement_score,
            differential,
            supporting_agents,
        }
    }

    /// The weighted vote, without any override logic.
    pub fn weighted_merge(&self, annotated: &[AnnotatedOutput]) -> WeightedMerge {
        let registry = &self.config.specialists;
        let mut contributors: BTreeMap<String, Vec<Contributor>> = BTreeMap::new();

        for item in annotated {
            for (diagnosis, probability) in &item.output.diagnoses {
                let evidence = item
                    .tags
                    .iter()
                    .filter(|t| t.presence && t.is_diagnostic() && t.supports(diagnosis))
                    .map(|t| t.weight)
                    .fold(None::<f64>, |acc, w| Some(acc.map_or(w, |a| a.max(w))))
                    .unwrap_or(1.0);
                let weight = registry.relevance(item.agent_id(), diagnosis) * evidence;
                contributors
                    .entry(diagnosis.clone())
                    .or_default()
                    .push(Contributor {
                        agent_id: item.agent_id().to_string(),
                        probability: *probability,
                        weight,
                    });
            }
        }

        let raw: BTreeMap<String, f64> = contributors
            .iter()
            .map(|(diagnosis, votes)| {
                let total: f64 = votes.iter().map(|c| c.weight).sum();
                let score = if total > 0.0 {
                    votes.iter().map(|c| c.weight * c.probability).sum::<f64>() / total
                } else {
                    0.0
                };
                (diagnosis.clone(), score)
            })
            .collect();

        let normalizer = raw.values().sum::<f64>().max(1.0);
        let scores = raw
            .into_iter()
            .map(|(diagnosis, score)| (diagnosis, score / normalizer))
            .collect();

        WeightedMerge {
            scores,
            contributors,
            normalizer,
        }
    }

    /// Argmax; ties go to the diagnosis whose strongest contributor ranks
    /// first, then to the alphabetically first name.
    fn pick_top(&self, merge: &WeightedMerge) -> Option<String> {
        let registry = &self.config.specialists;
        let top_contributor_rank = |diagnosis: &str| {
            merge
                .contributors
                .get(diagnosis)
                .and_then(|votes| {
                    votes.iter().min_by(|a, b| {
                        (b.weight * b.probability)
                            .total_cmp(&(a.weight * a.probability))
                            .then_with(|| registry.rank(&a.agent_id).cmp(&registry.rank(&b.agent_id)))
                    })
                })
                .map(|c| registry.rank(&c.agent_id))
        };

        merge
            .scores
            .iter()
            .min_by(|(name_a, a), (name_b, b)| {
                cmp_desc(**a, **b)
                    .then_with(|| top_contributor_rank(name_a).cmp(&top_contributor_rank(name_b)))
                    .then_with(|| name_a.cmp(name_b))
            })
            .map(|(name, _)| name.clone())
    }

    fn agreement(&self, top: &str, annotated: &[AnnotatedOutput]) -> (f64, Vec<String>) {
        let registry = &self.config.specialists;
        let mut supporting: Vec<String> = annotated
            .iter()
            .filter(|a| a.output.top_diagnosis.eq_ignore_ascii_case(top))
            .map(|a| a.agent_id().to_string())
            .collect();
        supporting.sort_by_key(|a| registry.rank(a));

        let score = match annotated.len() {
            0 => 0.0,
            1 => 1.0,
            n => supporting.len() as f64 / n as f64,
        };
        (score, supporting)
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(Arc::new(AggregationConfig::default()))
    }
}

fn score_key(score: f64) -> f64 {
    (score * SCORE_RESOLUTION).round()
}

/// Order two scores descending, treating scores that share a grid cell as
/// equal. Quantizing keeps the order transitive, which `sort_by` requires.
pub(crate) fn cmp_desc(a: f64, b: f64) -> Ordering {
    score_key(b).total_cmp(&score_key(a))
}
