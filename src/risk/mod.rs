//! Risk Module
//!
//! Scores a finished execution and decides whether a human has to look at
//! it before the result counts.
//!
//! - [`assessment`]: fixed dimensions, weights and the aggregate score
//! - [`rules`]: global, step, exception and escalation rules
//! - [`anomaly`]: statistical outlier scoring over past runs
//! - [`routing`]: routing actions, approver tiers and the approval seam

pub mod anomaly;
pub mod assessment;
pub mod routing;
pub mod rules;

pub use anomaly::{AnomalyDetector, AnomalyScore};
pub use assessment::{Dimension, DimensionWeights, RiskAssessment, RiskLevel};
pub use routing::{
    ApprovalActor, ApprovalOutcome, ApprovalQueue, ApprovalRequest, ApproverTier, Priority,
    RoutingAction, RoutingDecision, RoutingEngine, RoutingThresholds,
};
pub use rules::{RiskRule, RuleEngine, RuleEvaluation, RuleKind, RuleOutcome};
