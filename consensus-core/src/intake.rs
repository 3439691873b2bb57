//! Admission of specialist outputs into a case.
//!
//! Malformed outputs are recovered locally: missing optional fields are
//! treated as absent and unusable outputs are dropped with a warning. Only
//! a shortfall below the configured minimum is fatal.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::config::AggregationConfig;
use crate::error::{AggregationError, Result};
use crate::models::{AgentOutput, Finding};
use crate::rules::RuleTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedOutput {
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    /// Admitted outputs in specialist-priority order.
    pub outputs: Vec<AgentOutput>,
    pub dropped: Vec<DroppedOutput>,
    /// Registered diagnostic roles that produced no admitted output.
    pub missing_roles: BTreeSet<String>,
}

pub fn admit(
    outputs: Vec<AgentOutput>,
    config: &AggregationConfig,
    rules: &RuleTable,
) -> Result<Admission> {
    let mut admitted: Vec<AgentOutput> = Vec::with_capacity(outputs.len());
    let mut dropped = Vec::new();
    let mut seen = HashSet::new();

    for raw in outputs {
        let output = match sanitize(raw, rules) {
            Ok(output) => output,
            Err(AggregationError::MalformedInput { agent_id, reason }) => {
                warn!(agent_id = %agent_id, reason = %reason, "Dropping malformed specialist output");
                dropped.push(DroppedOutput { agent_id, reason });
                continue;
            }
            Err(other) => return Err(other),
        };

        if !seen.insert(output.agent_id.clone()) {
            warn!(agent_id = %output.agent_id, "Dropping duplicate specialist output");
            dropped.push(DroppedOutput {
                agent_id: output.agent_id,
                reason: "duplicate output for this specialist".to_string(),
            });
            continue;
        }
        admitted.push(output);
    }

    if admitted.len() < config.min_specialists {
        return Err(AggregationError::InsufficientSpecialists {
            required: config.min_specialists,
            available: admitted.len(),
        });
    }

    admitted.sort_by_key(|o| config.specialists.rank(&o.agent_id));

    let missing_roles: BTreeSet<String> = config
        .specialists
        .diagnostic_roles()
        .filter(|role| !seen.contains(&role.to_lowercase()))
        .map(String::from)
        .collect();

    debug!(
        admitted = admitted.len(),
        dropped = dropped.len(),
        missing = ?missing_roles,
        "Specialist outputs admitted"
    );

    Ok(Admission {
        outputs: admitted,
        dropped,
        missing_roles,
    })
}

/// Normalize one output, or explain why it cannot be used.
pub fn sanitize(mut output: AgentOutput, rules: &RuleTable) -> Result<AgentOutput> {
    output.agent_id = output.agent_id.trim().to_lowercase();
    if output.agent_id.is_empty() {
        return Err(AggregationError::MalformedInput {
            agent_id: "<unnamed>".to_string(),
            reason: "missing agent_id".to_string(),
        });
    }

    let mut diagnoses: BTreeMap<String, f64> = BTreeMap::new();
    for (name, probability) in std::mem::take(&mut output.diagnoses) {
        if name.trim().is_empty() || probability.is_nan() {
            continue;
        }
        let name = rules.canonical_diagnosis(&name);
        let probability = probability.clamp(0.0, 1.0);
        diagnoses
            .entry(name)
            .and_modify(|p| *p = p.max(probability))
            .or_insert(probability);
    }
    output.diagnoses = diagnoses;

    output.top_diagnosis = if output.top_diagnosis.trim().is_empty() {
        argmax(&output.diagnoses).unwrap_or_default()
    } else {
        rules.canonical_diagnosis(&output.top_diagnosis)
    };

    output.findings = std::mem::take(&mut output.findings)
        .into_iter()
        .filter_map(|mut finding: Finding| {
            finding.name = finding.name.trim().to_string();
            (!finding.name.is_empty()).then_some(finding)
        })
        .collect();

    if output.diagnoses.is_empty() && output.top_diagnosis.is_empty() && output.findings.is_empty()
    {
        return Err(AggregationError::MalformedInput {
            agent_id: output.agent_id,
            reason: "no diagnoses, top diagnosis or findings".to_string(),
        });
    }

    let stated = output.diagnoses.get(&output.top_diagnosis).copied();
    output.confidence = if output.confidence.is_nan() || output.confidence <= 0.0 {
        stated.unwrap_or(0.0)
    } else {
        output.confidence.clamp(0.0, 1.0)
    };
    if stated.is_none() && !output.top_diagnosis.is_empty() && output.confidence > 0.0 {
        output
            .diagnoses
            .insert(output.top_diagnosis.clone(), output.confidence);
    }

    output.flags = std::mem::take(&mut output.flags)
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    Ok(output)
}

/// Most probable diagnosis; ties go to the alphabetically first name.
fn argmax(diagnoses: &BTreeMap<String, f64>) -> Option<String> {
    diagnoses
        .iter()
        .fold(None::<(&String, f64)>, |best, (name, p)| match best {
            Some((_, bp)) if bp >= *p => best,
            _ => Some((name, *p)),
        })
        .map(|(name, _)| name.clone())
}
