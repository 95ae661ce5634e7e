//! Routing Decisions
//!
//! Turns an aggregate risk score and the triggered rules into exactly one
//! routing action. The chosen action is the most severe of:
//! - the threshold band the aggregate falls in
//! - the band action replaced by `auto_approve` when an exception rule
//!   applies (never at or above the HITL threshold)
//! - any action named by a triggered rule
//! - `escalate`, when an escalation rule fired
//!
//! Approval-worthy outcomes carry a priority, an expiry window and a minimum
//! approver tier. Expiry breaches re-route to the next tier.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::assessment::RiskAssessment;
use super::rules::RuleOutcome;

/// Routing actions, declared in increasing severity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    AutoApprove,
    Continue,
    Warn,
    RequireReview,
    Pause,
    RequireHitl,
    Escalate,
    Block,
}

impl RoutingAction {
    /// Actions that hand the result to a human.
    pub fn requires_approval(&self) -> bool {
        matches!(
            self,
            RoutingAction::RequireReview
                | RoutingAction::Pause
                | RoutingAction::RequireHitl
                | RoutingAction::Escalate
        )
    }

    /// Default minimum approver for the action.
    pub fn default_approver(&self) -> Option<ApproverTier> {
        match self {
            RoutingAction::RequireReview | RoutingAction::Pause => Some(ApproverTier::Reviewer),
            RoutingAction::RequireHitl => Some(ApproverTier::Senior),
            RoutingAction::Escalate => Some(ApproverTier::Lead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingAction::AutoApprove => "auto_approve",
            RoutingAction::Continue => "continue",
            RoutingAction::Warn => "warn",
            RoutingAction::RequireReview => "require_review",
            RoutingAction::Pause => "pause",
            RoutingAction::RequireHitl => "require_hitl",
            RoutingAction::Escalate => "escalate",
            RoutingAction::Block => "block",
        }
    }
}

impl fmt::Display for RoutingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approver seniority, lowest first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApproverTier {
    Reviewer,
    Senior,
    Lead,
    Manager,
    Executive,
}

impl ApproverTier {
    /// The next tier up; the top tier stays where it is.
    pub fn next(&self) -> ApproverTier {
        match self {
            ApproverTier::Reviewer => ApproverTier::Senior,
            ApproverTier::Senior => ApproverTier::Lead,
            ApproverTier::Lead => ApproverTier::Manager,
            ApproverTier::Manager | ApproverTier::Executive => ApproverTier::Executive,
        }
    }
}

impl fmt::Display for ApproverTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApproverTier::Reviewer => "reviewer",
            ApproverTier::Senior => "senior",
            ApproverTier::Lead => "lead",
            ApproverTier::Manager => "manager",
            ApproverTier::Executive => "executive",
        };
        f.write_str(s)
    }
}

/// Approval priority.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn from_score(aggregate: f64) -> Self {
        if aggregate >= 0.95 {
            Priority::Urgent
        } else if aggregate >= 0.90 {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    /// Hours an approver has before the request expires.
    pub fn expiry_hours(&self) -> i64 {
        match self {
            Priority::Urgent => 4,
            Priority::High => 24,
            Priority::Normal => 72,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

/// Score thresholds for the routing bands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RoutingThresholds {
    /// Below this: auto_approve
    pub auto_approve: f64,
    /// Below this: continue; above: warn
    pub warn: f64,
    /// At or above this: require_review
    pub review: f64,
    /// At or above this: require_hitl
    pub hitl: f64,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            auto_approve: 0.3,
            warn: 0.5,
            review: 0.7,
            hitl: 0.9,
        }
    }
}

impl RoutingThresholds {
    /// True if each threshold lies in [0, 1] and they are strictly increasing.
    pub fn is_ordered(&self) -> bool {
        let t = [self.auto_approve, self.warn, self.review, self.hitl];
        t.iter().all(|v| (0.0..=1.0).contains(v)) && t.windows(2).all(|w| w[0] < w[1])
    }
}

/// The single routing outcome of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub action: RoutingAction,
    pub aggregate: f64,
    pub band_action: RoutingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_approver: Option<ApproverTier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn requires_approval(&self) -> bool {
        self.action.requires_approval()
    }

    /// Length of the approval window, if any.
    pub fn expiry_window(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - self.decided_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// The decision that replaces this one once its window has lapsed:
    /// `escalate` to the next tier with a fresh window.
    pub fn escalate_on_expiry(&self, now: DateTime<Utc>) -> RoutingDecision {
        let tier = self
            .min_approver
            .map(|t| t.next())
            .unwrap_or(ApproverTier::Lead);
        let priority = self.priority.unwrap_or(Priority::Normal);

        let mut reasons = self.reasons.clone();
        reasons.push(format!(
            "approval window expired; escalated from {} to {}",
            self.min_approver
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unassigned".to_string()),
            tier
        ));

        RoutingDecision {
            action: RoutingAction::Escalate,
            aggregate: self.aggregate,
            band_action: self.band_action,
            priority: Some(priority),
            expires_at: Some(now + Duration::hours(priority.expiry_hours())),
            min_approver: Some(tier),
            reasons,
            decided_at: now,
        }
    }
}

/// Chooses routing actions from assessments.
#[derive(Debug, Clone, Default)]
pub struct RoutingEngine {
    thresholds: RoutingThresholds,
}

impl RoutingEngine {
    pub fn new(thresholds: RoutingThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &RoutingThresholds {
        &self.thresholds
    }

    /// The action implied by the score bands alone.
    pub fn band_action(&self, aggregate: f64) -> RoutingAction {
        let t = &self.thresholds;
        if aggregate < t.auto_approve {
            RoutingAction::AutoApprove
        } else if aggregate < t.warn {
            RoutingAction::Continue
        } else if aggregate < t.review {
            RoutingAction::Warn
        } else if aggregate < t.hitl {
            RoutingAction::RequireReview
        } else {
            RoutingAction::RequireHitl
        }
    }

    /// Decides the routing action for an assessment and rule outcome.
    pub fn decide(&self, assessment: &RiskAssessment, rules: &RuleOutcome) -> RoutingDecision {
        self.decide_at(assessment, rules, Utc::now())
    }

    /// [`decide`](Self::decide) with an explicit clock.
    pub fn decide_at(
        &self,
        assessment: &RiskAssessment,
        rules: &RuleOutcome,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        let aggregate = assessment.aggregate;
        let band = self.band_action(aggregate);
        let mut action = band;
        let mut reasons = vec![format!("aggregate {:.4} falls in the {} band", aggregate, band)];

        if rules.exception_applies(aggregate) {
            if aggregate < self.thresholds.hitl {
                action = RoutingAction::AutoApprove;
                reasons.push(format!(
                    "exception rule(s) {} allow auto_approve",
                    rules.exceptions.join(", ")
                ));
            } else {
                reasons.push(format!(
                    "exception rule(s) {} ignored at or above {:.2}",
                    rules.exceptions.join(", "),
                    self.thresholds.hitl
                ));
            }
        }

        for triggered in &rules.actions {
            if triggered.action > action {
                action = triggered.action;
                reasons.push(format!("rule '{}' requires {}", triggered.rule_id, triggered.action));
            }
        }

        let mut min_approver = None;
        if let Some(floor) = rules.escalation_floor {
            if RoutingAction::Escalate > action {
                action = RoutingAction::Escalate;
            }
            min_approver = Some(floor);
            reasons.push(format!(
                "escalation rule(s) {} require at least {}",
                rules.escalations.join(", "),
                floor
            ));
        }

        let min_approver = if action.requires_approval() {
            match (action.default_approver(), min_approver) {
                (Some(default), Some(floor)) => Some(default.max(floor)),
                (default, floor) => default.or(floor),
            }
        } else {
            None
        };

        let priority = action
            .requires_approval()
            .then(|| Priority::from_score(aggregate));
        let expires_at = priority.map(|p| now + Duration::hours(p.expiry_hours()));

        info!(
            "Routing decision: {} (aggregate {:.4}, band {})",
            action, aggregate, band
        );

        RoutingDecision {
            action,
            aggregate,
            band_action: band,
            priority,
            expires_at,
            min_approver,
            reasons,
            decided_at: now,
        }
    }
}

/// Outcome returned by a human approver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected { reason: String },
    Revise { notes: String },
}

/// What an approver is asked to look at.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub execution_id: String,
    pub workflow_id: String,
    pub decision: RoutingDecision,
    pub assessment: RiskAssessment,
}

/// External party that approves, rejects or sends back results.
#[async_trait]
pub trait ApprovalActor: Send + Sync {
    /// Hands a request to the approver; the outcome arrives later.
    async fn request_approval(&self, request: ApprovalRequest);

    /// Told when a request's window lapsed and it was re-routed.
    async fn on_expiry(&self, request: &ApprovalRequest, escalation: &RoutingDecision);
}

/// Re-routes a request whose approval window has lapsed, notifying the actor.
pub async fn escalate_if_expired(
    actor: &dyn ApprovalActor,
    request: &ApprovalRequest,
    now: DateTime<Utc>,
) -> Option<RoutingDecision> {
    if !request.decision.is_expired(now) {
        return None;
    }
    let escalation = request.decision.escalate_on_expiry(now);
    warn!(
        "Approval for execution {} expired; escalating to {}",
        request.execution_id,
        escalation
            .min_approver
            .map(|t| t.to_string())
            .unwrap_or_default()
    );
    actor.on_expiry(request, &escalation).await;
    Some(escalation)
}

/// In-memory approval inbox.
#[derive(Debug, Default)]
pub struct ApprovalQueue {
    pending: Mutex<Vec<ApprovalRequest>>,
    escalations: Mutex<Vec<(String, RoutingDecision)>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests waiting for an approver.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Expiry escalations received, as (execution id, new decision).
    pub fn escalations(&self) -> Vec<(String, RoutingDecision)> {
        self.escalations
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Removes a pending request once it has been answered.
    pub fn resolve(&self, execution_id: &str) -> Option<ApprovalRequest> {
        let mut pending = self.pending.lock().ok()?;
        let index = pending.iter().position(|r| r.execution_id == execution_id)?;
        Some(pending.remove(index))
    }
}

#[async_trait]
impl ApprovalActor for ApprovalQueue {
    async fn request_approval(&self, request: ApprovalRequest) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(request);
        }
    }

    async fn on_expiry(&self, request: &ApprovalRequest, escalation: &RoutingDecision) {
        if let Ok(mut escalations) = self.escalations.lock() {
            escalations.push((request.execution_id.clone(), escalation.clone()));
        }
    }
}
