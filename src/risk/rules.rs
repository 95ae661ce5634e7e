//! Risk Rules
//!
//! Configurable rules that add to the fixed risk score or steer routing:
//!
//! | kind         | evaluated                                   | effect                              |
//! |--------------|---------------------------------------------|-------------------------------------|
//! | `global`     | before execution, against input             | adds `risk_factor`, optional action |
//! | `step`       | after its step, against outputs so far      | adds `risk_factor`, optional action |
//! | `exception`  | after execution                             | allows auto-approval                |
//! | `escalation` | after execution                             | forces `escalate` with a tier floor |
//!
//! Conditions are parsed once through the shared [`ConditionCache`]. Every
//! evaluation is kept for audit, triggered or not.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::routing::{ApproverTier, RoutingAction};
use crate::execution::context::ExecutionContext;
use crate::expression::{CacheKey, ConditionCache};
use crate::workflow::model::WorkflowDefinition;

fn default_version() -> String {
    "1".to_string()
}

/// When a rule is evaluated and what it does.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Global,
    Step,
    Exception,
    Escalation,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::Global => "global",
            RuleKind::Step => "step",
            RuleKind::Exception => "exception",
            RuleKind::Escalation => "escalation",
        };
        f.write_str(s)
    }
}

/// A configured risk rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RiskRule {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub kind: RuleKind,

    pub condition: String,

    /// Added to the aggregate when the condition holds
    #[serde(default)]
    pub risk_factor: f64,

    /// Routing action requested when the condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RoutingAction>,

    /// Step this rule follows (step rules only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,

    /// Exception rules: auto-approve whatever the band says
    #[serde(default)]
    pub auto_approve_override: bool,

    /// Exception rules: auto-approve below this aggregate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_threshold: Option<f64>,

    /// Escalation rules: minimum approver tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_approver: Option<ApproverTier>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RiskRule {
    fn base(id: impl Into<String>, kind: RuleKind, condition: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            kind,
            condition: condition.into(),
            risk_factor: 0.0,
            action: None,
            step: None,
            auto_approve_override: false,
            auto_approve_threshold: None,
            min_approver: None,
            description: None,
        }
    }

    /// A rule evaluated against the input before any step runs.
    pub fn global(id: impl Into<String>, condition: impl Into<String>, risk_factor: f64) -> Self {
        Self {
            risk_factor,
            ..Self::base(id, RuleKind::Global, condition)
        }
    }

    /// A rule evaluated right after a step resolves.
    pub fn after_step(
        id: impl Into<String>,
        step: u32,
        condition: impl Into<String>,
        risk_factor: f64,
    ) -> Self {
        Self {
            risk_factor,
            step: Some(step),
            ..Self::base(id, RuleKind::Step, condition)
        }
    }

    /// An exception rule that allows auto-approval when it holds.
    pub fn exception(id: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            auto_approve_override: true,
            ..Self::base(id, RuleKind::Exception, condition)
        }
    }

    /// An escalation rule forcing at least the given approver tier.
    pub fn escalation(id: impl Into<String>, condition: impl Into<String>, tier: ApproverTier) -> Self {
        Self {
            min_approver: Some(tier),
            ..Self::base(id, RuleKind::Escalation, condition)
        }
    }

    /// Sets the requested routing action.
    pub fn with_action(mut self, action: RoutingAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Replaces an exception's override with a threshold.
    pub fn with_auto_approve_threshold(mut self, threshold: f64) -> Self {
        self.auto_approve_override = false;
        self.auto_approve_threshold = Some(threshold);
        self
    }
}

/// Audit record of one rule evaluation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub kind: RuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    pub condition: String,
    pub triggered: bool,
    pub contribution: f64,
    /// Input and step outputs visible to the rule
    pub snapshot: Value,
    /// Why the condition was treated as false, if it could not be evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// An action requested by a triggered rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TriggeredAction {
    pub rule_id: String,
    pub action: RoutingAction,
}

/// Everything routing needs to know about triggered rules.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RuleOutcome {
    /// Sum of triggered risk factors, capped at 1
    pub rule_score: f64,
    pub triggered: Vec<String>,
    pub actions: Vec<TriggeredAction>,
    pub auto_approve_override: bool,
    pub auto_approve_threshold: Option<f64>,
    /// Triggered exception rules
    pub exceptions: Vec<String>,
    pub escalation_floor: Option<ApproverTier>,
    /// Triggered escalation rules
    pub escalations: Vec<String>,
}

impl RuleOutcome {
    /// True if a triggered exception allows auto-approval at this score.
    pub fn exception_applies(&self, aggregate: f64) -> bool {
        self.auto_approve_override
            || self
                .auto_approve_threshold
                .map(|t| aggregate < t)
                .unwrap_or(false)
    }
}

/// Evaluates one workflow's rules during one execution.
pub struct RuleEngine {
    definition: Arc<WorkflowDefinition>,
    cache: Arc<ConditionCache>,
    evaluations: Vec<RuleEvaluation>,
}

impl RuleEngine {
    pub fn new(definition: Arc<WorkflowDefinition>, cache: Arc<ConditionCache>) -> Self {
        Self {
            definition,
            cache,
            evaluations: Vec::new(),
        }
    }

    /// Global rules, against input only. Returns how many triggered.
    pub fn evaluate_global(&mut self, ctx: &ExecutionContext) -> usize {
        self.evaluate_where(ctx, None, |r| r.kind == RuleKind::Global)
    }

    /// Step rules attached to a step that just resolved.
    pub fn evaluate_after_step(&mut self, step_number: u32, ctx: &ExecutionContext) -> usize {
        self.evaluate_where(ctx, Some(step_number), |r| {
            r.kind == RuleKind::Step && r.step == Some(step_number)
        })
    }

    /// Exception and escalation rules, against the final context.
    pub fn evaluate_final(&mut self, ctx: &ExecutionContext) -> usize {
        self.evaluate_where(ctx, None, |r| {
            matches!(r.kind, RuleKind::Exception | RuleKind::Escalation)
        })
    }

    fn evaluate_where(
        &mut self,
        ctx: &ExecutionContext,
        step_number: Option<u32>,
        select: impl Fn(&RiskRule) -> bool,
    ) -> usize {
        let definition = Arc::clone(&self.definition);
        let mut triggered = 0;
        for rule in definition.risk_rules.iter().filter(|r| select(*r)) {
            let evaluation = self.evaluate_rule(rule, step_number, ctx);
            if evaluation.triggered {
                triggered += 1;
            }
            self.evaluations.push(evaluation);
        }
        triggered
    }

    fn evaluate_rule(
        &self,
        rule: &RiskRule,
        step_number: Option<u32>,
        ctx: &ExecutionContext,
    ) -> RuleEvaluation {
        let key = CacheKey::new(
            format!("{}/rule/{}", self.definition.id, rule.id),
            format!("{}/{}", self.definition.version, rule.version),
        );

        let (triggered, anomaly) = match self.cache.get_or_parse(&key, &rule.condition) {
            Ok(condition) => match condition.try_evaluate(ctx) {
                Ok(result) => (result, None),
                Err(anomaly) => {
                    warn!("Rule '{}' treated as false: {}", rule.id, anomaly);
                    (false, Some(anomaly.to_string()))
                }
            },
            Err(e) => {
                warn!("Rule '{}' has an unparsable condition: {}", rule.id, e);
                (false, Some(e.to_string()))
            }
        };

        let contribution = if triggered { rule.risk_factor } else { 0.0 };
        debug!(
            "Rule '{}' ({}) -> {} (contribution {:.4})",
            rule.id, rule.kind, triggered, contribution
        );
        if triggered {
            info!("Risk rule '{}' triggered", rule.id);
        }

        RuleEvaluation {
            rule_id: rule.id.clone(),
            kind: rule.kind,
            step_number,
            condition: rule.condition.clone(),
            triggered,
            contribution,
            snapshot: ctx.snapshot(),
            anomaly,
            evaluated_at: Utc::now(),
        }
    }

    /// Every evaluation so far, in order.
    pub fn evaluations(&self) -> &[RuleEvaluation] {
        &self.evaluations
    }

    pub fn into_evaluations(self) -> Vec<RuleEvaluation> {
        self.evaluations
    }

    /// Folds triggered evaluations into a routing input.
    pub fn outcome(&self) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();
        let mut total = 0.0;

        for evaluation in self.evaluations.iter().filter(|e| e.triggered) {
            let Some(rule) = self
                .definition
                .risk_rules
                .iter()
                .find(|r| r.id == evaluation.rule_id)
            else {
                continue;
            };

            total += evaluation.contribution;
            outcome.triggered.push(rule.id.clone());

            if let Some(action) = rule.action {
                outcome.actions.push(TriggeredAction {
                    rule_id: rule.id.clone(),
                    action,
                });
            }

            match rule.kind {
                RuleKind::Exception => {
                    outcome.exceptions.push(rule.id.clone());
                    outcome.auto_approve_override |= rule.auto_approve_override;
                    if let Some(t) = rule.auto_approve_threshold {
                        outcome.auto_approve_threshold =
                            Some(outcome.auto_approve_threshold.map_or(t, |c: f64| c.max(t)));
                    }
                }
                RuleKind::Escalation => {
                    outcome.escalations.push(rule.id.clone());
                    let tier = rule.min_approver.unwrap_or(ApproverTier::Lead);
                    outcome.escalation_floor =
                        Some(outcome.escalation_floor.map_or(tier, |c| c.max(tier)));
                }
                RuleKind::Global | RuleKind::Step => {}
            }
        }

        outcome.rule_score = total.min(1.0);
        outcome
    }
}
