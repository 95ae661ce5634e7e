//! Risk Assessment
//!
//! Six fixed dimensions, each scored in [0, 1] and combined by weight, plus
//! the capped contribution of triggered risk rules:
//!
//! ```text
//! fixed     = Σ weight_d · score_d
//! aggregate = min(1, fixed + min(1, Σ triggered risk_factor))
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::context::ExecutionContext;
use crate::execution::step::{SkipReason, StepReport, StepStatus};
use crate::expression::VariableRef;
use crate::workflow::model::RiskProfile;

/// The fixed risk dimensions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Technical,
    Safety,
    Financial,
    Compliance,
    Execution,
    Anomaly,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::Technical,
        Dimension::Safety,
        Dimension::Financial,
        Dimension::Compliance,
        Dimension::Execution,
        Dimension::Anomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Technical => "technical",
            Dimension::Safety => "safety",
            Dimension::Financial => "financial",
            Dimension::Compliance => "compliance",
            Dimension::Execution => "execution",
            Dimension::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight per dimension. Weights must sum to 1.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct DimensionWeights {
    pub technical: f64,
    pub safety: f64,
    pub financial: f64,
    pub compliance: f64,
    pub execution: f64,
    pub anomaly: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            technical: 0.30,
            safety: 0.25,
            financial: 0.20,
            compliance: 0.15,
            execution: 0.05,
            anomaly: 0.05,
        }
    }
}

impl DimensionWeights {
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Technical => self.technical,
            Dimension::Safety => self.safety,
            Dimension::Financial => self.financial,
            Dimension::Compliance => self.compliance,
            Dimension::Execution => self.execution,
            Dimension::Anomaly => self.anomaly,
        }
    }

    pub fn sum(&self) -> f64 {
        Dimension::ALL.iter().map(|&d| self.get(d)).sum()
    }
}

/// Coarse risk level derived from the aggregate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            RiskLevel::Low
        } else if score < 0.7 {
            RiskLevel::Medium
        } else if score < 0.9 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Rounds to 4 decimal places, so band boundaries compare exactly.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// The risk outcome of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub scores: BTreeMap<Dimension, f64>,
    pub fixed_score: f64,
    pub rule_score: f64,
    pub aggregate: f64,
    pub level: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_rules: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}

impl RiskAssessment {
    /// Combines dimension scores and the (already capped) rule score.
    /// Missing dimensions score 0.
    pub fn compute(
        scores: BTreeMap<Dimension, f64>,
        weights: &DimensionWeights,
        rule_score: f64,
        triggered_rules: Vec<String>,
    ) -> Self {
        let scores: BTreeMap<Dimension, f64> = Dimension::ALL
            .iter()
            .map(|&d| (d, scores.get(&d).copied().unwrap_or(0.0).clamp(0.0, 1.0)))
            .collect();

        let fixed: f64 = scores.iter().map(|(&d, &s)| weights.get(d) * s).sum();
        let rule_score = rule_score.clamp(0.0, 1.0);
        let aggregate = round4((fixed + rule_score).min(1.0));

        Self {
            scores,
            fixed_score: round4(fixed),
            rule_score: round4(rule_score),
            aggregate,
            level: RiskLevel::from_score(aggregate),
            triggered_rules,
            assessed_at: Utc::now(),
        }
    }

    pub fn score(&self, dimension: Dimension) -> f64 {
        self.scores.get(&dimension).copied().unwrap_or(0.0)
    }
}

/// Converts a resolved value into a dimension score.
fn as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f.clamp(0.0, 1.0)),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Scores the dimensions a workflow maps to references.
///
/// Unresolvable or non-numeric references score 0 and are logged.
pub fn profile_scores(profile: &RiskProfile, ctx: &ExecutionContext) -> BTreeMap<Dimension, f64> {
    let mut scores = BTreeMap::new();
    for (&dimension, raw) in &profile.dimensions {
        let resolved = VariableRef::parse(raw).and_then(|r| r.resolve(ctx).cloned());
        let score = match resolved {
            Ok(value) => as_score(&value).unwrap_or_else(|| {
                warn!("Dimension {} reference {} is not numeric: {}", dimension, raw, value);
                0.0
            }),
            Err(e) => {
                warn!("Dimension {} scored 0: {}", dimension, e);
                0.0
            }
        };
        scores.insert(dimension, score);
    }
    scores
}

/// Execution dimension derived from the audit trail: the worst step outcome
/// (failed or dropped by error = 1, fallback = 0.5) plus 0.1 per retry
/// spread across all steps, capped at 1.
pub fn execution_score(reports: &[StepReport]) -> f64 {
    if reports.is_empty() {
        return 0.0;
    }

    let worst = reports
        .iter()
        .map(|r| match (r.status, r.skip_reason) {
            (StepStatus::Failed, _) => 1.0,
            (StepStatus::Skipped, Some(SkipReason::OnError)) => 1.0,
            (StepStatus::Skipped, Some(SkipReason::Timeout)) => 1.0,
            (StepStatus::CompletedWithFallback, _) => 0.5,
            _ => 0.0,
        })
        .fold(0.0_f64, f64::max);

    let retries: usize = reports.iter().map(|r| r.retries()).sum();
    (worst + 0.1 * retries as f64 / reports.len() as f64).min(1.0)
}
