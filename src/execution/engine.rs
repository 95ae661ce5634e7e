//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow execution including:
//! - Preflight checks (definition, input schema, step functions)
//! - Level-by-level scheduling with a barrier between levels
//! - Bounded parallelism within a level, or one step at a time
//! - Output assembly and output schema validation
//! - Risk assessment and routing of the finished result
//! - Lifecycle events and execution records

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::expression::{resolve, resolve_value, ConditionCache};
use crate::monitoring::{EventBroadcaster, EventType, ExecutionTimeline, StreamEvent};
use crate::risk::anomaly::{AnomalyDetector, AnomalyScore};
use crate::risk::assessment::{execution_score, profile_scores, Dimension, RiskAssessment};
use crate::risk::routing::{
    ApprovalActor, ApprovalOutcome, ApprovalRequest, RoutingAction, RoutingDecision,
    RoutingEngine,
};
use crate::risk::rules::{RuleEngine, RuleEvaluation};
use crate::validation::Violation;
use crate::workflow::graph::{DependencyGraph, GraphCache};
use crate::workflow::model::WorkflowDefinition;
use crate::workflow::parser::DefinitionSource;
use crate::workflow::validator::{validate_functions, DefinitionError};

use super::context::{ContextMetadata, ExecutionContext};
use super::record::{ExecutionResult, JsonFileSink, RecordSink, StartRecord};
use super::registry::StepRegistry;
use super::retry::{FailureClassifier, RetryCoordinator, RetryPolicy};
use super::status::{ExecutionStatus, StatusTracker, TransitionError};
use super::step::{condition_key, execute_step, prepare, Preparation, StepReport, StepStatus, StepTask};

/// Root cause recorded when the caller cancels an execution.
pub const CANCELLED: &str = "execution cancelled";

/// Workflow execution engine.
///
/// Shared by any number of concurrent executions: definitions, parsed
/// conditions and dependency graphs are cached across runs, and anomaly
/// history accumulates per workflow.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use riskflow::execution::{builtin_registry, Engine};
/// use riskflow::load_definition;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = Arc::new(load_definition("beam_design.yaml")?);
///     let mut engine = Engine::new(builtin_registry());
///     engine.set_max_parallel(4);
///
///     let result = engine.execute(definition, json!({"load": 12.5})).await;
///     println!("{}", result.status);
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: EngineConfig,
    registry: Arc<StepRegistry>,
    conditions: Arc<ConditionCache>,
    graphs: GraphCache,
    retry: RetryCoordinator,
    routing: RoutingEngine,
    anomaly: Arc<AnomalyDetector>,
    events: Arc<EventBroadcaster>,
    reaper: OnceCell<JoinHandle<()>>,
    sink: Option<Arc<dyn RecordSink>>,
    approver: Option<Arc<dyn ApprovalActor>>,
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(registry: StepRegistry) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Creates an engine from a configuration.
    ///
    /// A JSON file sink is attached when `record_dir` is set.
    pub fn with_config(registry: StepRegistry, config: EngineConfig) -> Self {
        let sink: Option<Arc<dyn RecordSink>> = config
            .record_dir
            .as_ref()
            .map(|dir| Arc::new(JsonFileSink::new(dir.clone())) as Arc<dyn RecordSink>);

        Self {
            registry: Arc::new(registry),
            conditions: Arc::new(ConditionCache::new()),
            graphs: GraphCache::new(),
            retry: RetryCoordinator::new(RetryPolicy::from_config(&config.retry)),
            routing: RoutingEngine::new(config.risk.thresholds.clone()),
            anomaly: Arc::new(AnomalyDetector::new(config.risk.anomaly_min_samples)),
            events: Arc::new(EventBroadcaster::new(config.events.clone())),
            reaper: OnceCell::new(),
            sink,
            approver: None,
            config,
        }
    }

    /// Sends start and final records to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Hands results that need a human to `approver`.
    pub fn with_approval_actor(mut self, approver: Arc<dyn ApprovalActor>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Replaces the default keyword failure classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.retry = self.retry.with_classifier(classifier);
        self
    }

    /// Publishes events through a broadcaster shared with other components.
    pub fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = events;
        self.reaper = OnceCell::new();
        self
    }

    /// Shares anomaly history with other engines.
    pub fn with_anomaly_detector(mut self, anomaly: Arc<AnomalyDetector>) -> Self {
        self.anomaly = anomaly;
        self
    }

    /// Sets the maximum number of steps running at once within a level.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.config.max_parallel = max.max(1);
    }

    /// Runs every level one step at a time.
    pub fn set_sequential(&mut self, sequential: bool) {
        self.config.sequential = sequential;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn anomaly_detector(&self) -> &Arc<AnomalyDetector> {
        &self.anomaly
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Tears down an execution's event stream ahead of the idle sweep.
    pub fn close_events(&self, execution_id: &str) -> bool {
        self.events.close(execution_id)
    }

    /// Starts the idle stream sweep on first use. The sweep ends once the
    /// broadcaster is dropped.
    fn ensure_reaper(&self) {
        self.reaper.get_or_init(|| {
            let interval = self.events.reap_interval();
            debug!("Sweeping idle event streams every {:?}", interval);
            self.events.spawn_reaper(interval)
        });
    }

    /// Validates a definition and returns its (cached) dependency graph.
    pub fn plan(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<DependencyGraph>, Vec<DefinitionError>> {
        self.graphs.get_or_build(definition)
    }

    /// A fresh, time-ordered execution id.
    pub fn new_execution_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Executes a workflow with a generated execution id.
    pub async fn execute(&self, definition: Arc<WorkflowDefinition>, input: Value) -> ExecutionResult {
        self.execute_with(definition, input, ContextMetadata::default()).await
    }

    /// Executes a workflow with caller-supplied metadata. An empty
    /// `execution_id` is replaced by a generated one.
    pub async fn execute_with(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        metadata: ContextMetadata,
    ) -> ExecutionResult {
        let (result, _) = self
            .execute_traced(definition, input, metadata, CancellationToken::new())
            .await;
        result
    }

    /// Loads a definition from `source` and executes it.
    pub async fn execute_from(
        &self,
        source: &dyn DefinitionSource,
        workflow_id: &str,
        input: Value,
    ) -> crate::Result<ExecutionResult> {
        let definition = source.load(workflow_id)?;
        Ok(self.execute(definition, input).await)
    }

    /// Executes a workflow and also returns its step timeline.
    ///
    /// Cancelling `cancel` stops the execution: in-flight steps are
    /// interrupted and later levels never start. Steps that already
    /// completed are not rolled back.
    pub async fn execute_traced(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        mut metadata: ContextMetadata,
        cancel: CancellationToken,
    ) -> (ExecutionResult, ExecutionTimeline) {
        if metadata.execution_id.is_empty() {
            metadata.execution_id = Self::new_execution_id();
        }
        let cancel = cancel.child_token();
        let mut run = Run::new(metadata.execution_id.clone(), Arc::clone(&definition));

        info!(
            "Starting execution {} of {} v{} ({} steps, max parallel: {}, sequential: {})",
            run.execution_id,
            definition.label(),
            definition.version,
            definition.steps.len(),
            self.config.max_parallel,
            self.config.sequential
        );
        self.ensure_reaper();
        self.events.open(&run.execution_id);
        self.events.publish(StreamEvent::execution_started(
            &run.execution_id,
            &definition.id,
            definition.steps.len(),
        ));
        self.record_start(&run, &input);

        if let Some(graph) = self.preflight(&mut run, &input) {
            self.drive(&mut run, &graph, input, metadata, &cancel).await;
        }
        self.finish(run)
    }

    /// Applies an approver's answer to a result awaiting approval, publishes
    /// the final event and re-records the result.
    pub fn resolve_approval(
        &self,
        result: &mut ExecutionResult,
        outcome: &ApprovalOutcome,
    ) -> Result<ExecutionStatus, TransitionError> {
        let mut tracker = StatusTracker::from_history(result.status_history.clone())
            .unwrap_or_default();
        let next = tracker.resolve_approval(outcome)?;

        result.status = next;
        result.status_history = tracker.history().to_vec();
        match outcome {
            ApprovalOutcome::Approved => {
                info!("Execution {} approved", result.execution_id);
                self.events.publish(StreamEvent::execution_completed(
                    &result.execution_id,
                    next.as_str(),
                    result.decision.as_ref().map(|d| d.action.as_str()),
                ));
            }
            ApprovalOutcome::Rejected { reason } => {
                let cause = format!("approval rejected: {}", reason);
                warn!("Execution {} {}", result.execution_id, cause);
                self.events
                    .publish(StreamEvent::execution_failed(&result.execution_id, &cause));
                result.root_cause = Some(cause);
            }
            ApprovalOutcome::Revise { notes } => {
                let cause = format!("revision requested: {}", notes);
                warn!("Execution {} {}", result.execution_id, cause);
                self.events
                    .publish(StreamEvent::execution_failed(&result.execution_id, &cause));
                result.root_cause = Some(cause);
            }
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_result(result) {
                warn!("Failed to record approval for {}: {}", result.execution_id, e);
            }
        }
        Ok(next)
    }

    /// Definition, input and function checks. Any failure rejects the
    /// execution before a step runs.
    fn preflight(&self, run: &mut Run, input: &Value) -> Option<Arc<DependencyGraph>> {
        let definition = Arc::clone(&run.definition);

        let graph = match self.graphs.get_or_build(&definition) {
            Ok(graph) => graph,
            Err(errors) => {
                let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                run.reject(format!("invalid workflow definition: {}", details.join("; ")));
                return None;
            }
        };
        if !graph.covers(&definition) {
            run.reject(format!(
                "invalid workflow definition: dependency graph plans {} step(s) but {} are declared",
                graph.len(),
                definition.steps.len()
            ));
            return None;
        }

        if let Some(schema) = &definition.input_schema {
            if let Err(violations) = schema.validate(input) {
                for violation in &violations {
                    warn!("Input violation: {}", violation);
                }
                let cause = format!(
                    "input validation failed with {} violation(s)",
                    violations.len()
                );
                run.violations = violations;
                run.reject(cause);
                return None;
            }
        }

        let unknown = validate_functions(&definition, |f| self.registry.contains(f));
        if !unknown.is_empty() {
            for error in &unknown {
                warn!("{}", error);
            }
            let mut missing: Vec<&str> = unknown
                .iter()
                .filter_map(|e| match e {
                    DefinitionError::UnknownFunction { function, .. } => Some(function.as_str()),
                    _ => None,
                })
                .collect();
            missing.sort_unstable();
            missing.dedup();
            run.reject(format!("unknown step function(s): {}", missing.join(", ")));
            return None;
        }

        debug!(
            "Execution {} plan: {:?} (critical path {:?})",
            run.execution_id,
            graph.levels(),
            graph.critical_path()
        );
        Some(graph)
    }

    /// Runs every level, then assembles the output and routes the result.
    async fn drive(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        input: Value,
        metadata: ContextMetadata,
        cancel: &CancellationToken,
    ) {
        let definition = Arc::clone(&run.definition);
        run.settle(ExecutionStatus::Running);

        let mut ctx = ExecutionContext::new(&definition.steps, input, metadata);
        let mut rules = RuleEngine::new(Arc::clone(&definition), Arc::clone(&self.conditions));
        let triggered = rules.evaluate_global(&ctx);
        if triggered > 0 {
            info!("{} global risk rule(s) triggered", triggered);
        }

        let depth = graph.depth();
        for (index, level) in graph.levels().iter().enumerate() {
            if cancel.is_cancelled() {
                run.fail_once(CANCELLED.to_string());
                break;
            }

            info!("Level {}/{}: steps {:?}", index + 1, depth, level);
            let reports = self.run_level(run, index, level, &ctx, cancel).await;

            let proceed = self.merge_level(run, reports, &mut ctx, &mut rules);
            if !proceed || run.root_cause.is_some() {
                cancel.cancel();
                break;
            }
            if cancel.is_cancelled() {
                run.fail_once(CANCELLED.to_string());
                break;
            }
            info!("Level {}/{} finished", index + 1, depth);
        }

        if run.root_cause.is_none() {
            self.assemble_output(run, &ctx);
        }
        if run.root_cause.is_none() {
            self.route(run, &ctx, &mut rules).await;
        }
        run.rule_evaluations = rules.into_evaluations();
    }

    /// Prepares and runs one level, returning its reports in step order.
    ///
    /// Parameters are resolved for every step before any is started; a
    /// definition defect in any of them stops the whole level.
    async fn run_level(
        &self,
        run: &mut Run,
        index: usize,
        level: &[u32],
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Vec<StepReport> {
        let definition = Arc::clone(&run.definition);
        let mut reports = Vec::with_capacity(level.len());
        let mut ready = Vec::new();

        let undefined: Vec<u32> = level
            .iter()
            .copied()
            .filter(|&n| definition.get_step(n).is_none())
            .collect();
        if !undefined.is_empty() {
            error!(
                "Level {} plans step(s) {:?} that the definition does not declare",
                index + 1,
                undefined
            );
            run.fail_once(format!(
                "dependency graph does not match definition: undeclared step(s) {:?}",
                undefined
            ));
            return reports;
        }

        for step in level.iter().filter_map(|&n| definition.get_step(n)) {
            let number = step.step_number;
            let key = condition_key(&definition.id, &definition.version, number);
            match prepare(step, &key, ctx, &self.conditions) {
                Preparation::Resolved(report) => reports.push(report),
                Preparation::Ready(params) => match self.registry.get(&step.function) {
                    Some(function) => ready.push(StepTask {
                        execution_id: run.execution_id.clone(),
                        step: step.clone(),
                        params,
                        function,
                        retry: self.retry.clone(),
                        cancel: cancel.clone(),
                    }),
                    None => reports.push(StepReport::fatal(
                        step,
                        format!("unknown step function '{}'", step.function),
                    )),
                },
            }
        }

        if reports.iter().any(|r| r.fatal) {
            warn!(
                "Level {} has a definition defect; {} ready step(s) not started",
                index + 1,
                ready.len()
            );
            reports.sort_by_key(|r| r.step_number);
            return reports;
        }

        let finished = if self.config.sequential {
            self.run_sequential(index, ready).await
        } else {
            self.run_parallel(index, ready, &definition).await
        };

        for done in finished {
            if let Some((started, ended)) = done.span {
                let report = &done.report;
                let end = match report.status {
                    StepStatus::Completed | StepStatus::CompletedWithFallback => EventType::Completed,
                    StepStatus::Skipped => EventType::Skipped,
                    StepStatus::Failed | StepStatus::Pending => EventType::Failed,
                };
                run.timeline
                    .add_event_at(report.step_number, report.name.clone(), EventType::Started, started);
                run.timeline
                    .add_event_at(report.step_number, report.name.clone(), end, ended);
            }
            reports.push(done.report);
        }

        reports.sort_by_key(|r| r.step_number);
        reports
    }

    async fn run_sequential(&self, index: usize, ready: Vec<StepTask>) -> Vec<Finished> {
        let mut finished = Vec::with_capacity(ready.len());
        for task in ready {
            finished.push(run_task(Arc::clone(&self.events), index, task).await);
        }
        finished
    }

    async fn run_parallel(
        &self,
        index: usize,
        ready: Vec<StepTask>,
        definition: &WorkflowDefinition,
    ) -> Vec<Finished> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut in_flight = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for task in ready {
            in_flight.insert(task.step.step_number);
            let permits = Arc::clone(&permits);
            let events = Arc::clone(&self.events);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                run_task(events, index, task).await
            });
        }

        let mut finished = Vec::with_capacity(in_flight.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => {
                    in_flight.remove(&done.report.step_number);
                    finished.push(done);
                }
                Err(e) => error!("Step task ended abnormally: {}", e),
            }
        }

        for number in in_flight {
            if let Some(step) = definition.get_step(number) {
                finished.push(Finished {
                    report: StepReport::failed(step, "step task panicked"),
                    span: None,
                });
            }
        }
        finished
    }

    /// The barrier: publishes each report, stores outputs and runs step
    /// rules. Returns false if the execution must stop.
    fn merge_level(
        &self,
        run: &mut Run,
        reports: Vec<StepReport>,
        ctx: &mut ExecutionContext,
        rules: &mut RuleEngine,
    ) -> bool {
        let mut proceed = true;

        for report in reports {
            let number = report.step_number;
            self.events
                .publish(StreamEvent::step_resolved(&run.execution_id, &report));

            if report.stores_output() {
                if let Some(output) = report.output.clone() {
                    if let Err(e) = ctx.store(&report.output_variable, output) {
                        run.fail_once(format!(
                            "step {} '{}' could not store its output: {}",
                            number, report.name, e
                        ));
                        proceed = false;
                    }
                }
            }

            if report.aborts_execution() {
                run.fail_once(format!(
                    "step {} '{}' failed: {}",
                    number,
                    report.name,
                    report.error.as_deref().unwrap_or("unknown error")
                ));
                proceed = false;
            }

            let ran = report.started_at.is_some();
            run.reports.insert(number, report);
            if ran {
                rules.evaluate_after_step(number, ctx);
            }

            let (percent, resolved, total) = run.progress();
            self.events
                .publish(StreamEvent::progress(&run.execution_id, percent, resolved, total));
        }

        proceed
    }

    /// Builds the final output and checks it against the output schema.
    fn assemble_output(&self, run: &mut Run, ctx: &ExecutionContext) {
        let definition = Arc::clone(&run.definition);

        let output = match &definition.output {
            Some(mapping) => {
                let mut output = Map::new();
                for (name, reference) in mapping {
                    match resolve_value(reference, ctx) {
                        Ok(value) => {
                            output.insert(name.clone(), value);
                        }
                        Err(e) => {
                            run.fail_once(format!("output '{}': {}", name, e));
                            return;
                        }
                    }
                }
                Value::Object(output)
            }
            None => Value::Object(ctx.steps().to_map()),
        };

        if let Some(schema) = &definition.output_schema {
            if let Err(violations) = schema.validate(&output) {
                for violation in &violations {
                    warn!("Output violation: {}", violation);
                }
                run.fail_once(format!(
                    "output validation failed with {} violation(s)",
                    violations.len()
                ));
                run.violations = violations;
                return;
            }
        }

        run.output = Some(output);
    }

    /// Scores the finished execution, chooses its routing action and
    /// settles its status.
    async fn route(&self, run: &mut Run, ctx: &ExecutionContext, rules: &mut RuleEngine) {
        let definition = Arc::clone(&run.definition);
        let profile = &definition.risk;

        rules.evaluate_final(ctx);
        let outcome = rules.outcome();

        let mut scores = profile_scores(profile, ctx);
        if !scores.contains_key(&Dimension::Execution) {
            let reports: Vec<StepReport> = run.reports.values().cloned().collect();
            scores.insert(Dimension::Execution, execution_score(&reports));
        }
        if !scores.contains_key(&Dimension::Anomaly) {
            if let Some(metric) = &profile.anomaly_metric {
                let anomaly = self.observe_metric(&definition.id, metric, ctx);
                scores.insert(Dimension::Anomaly, anomaly.map(|a| a.score).unwrap_or(0.0));
                run.anomaly = anomaly;
            }
        }

        let assessment = RiskAssessment::compute(
            scores,
            &self.config.risk.weights,
            outcome.rule_score,
            outcome.triggered.clone(),
        );
        let decision = self.routing.decide(&assessment, &outcome);
        info!(
            "Execution {} risk {:.4} ({}) routed to {}",
            run.execution_id, assessment.aggregate, assessment.level, decision.action
        );

        match decision.action {
            RoutingAction::Block => {
                let blocking: Vec<&str> = outcome
                    .actions
                    .iter()
                    .filter(|a| a.action == RoutingAction::Block)
                    .map(|a| a.rule_id.as_str())
                    .collect();
                run.fail_once(format!("blocked by risk rule {}", blocking.join(", ")));
            }
            action if action.requires_approval() => {
                run.settle(ExecutionStatus::AwaitingApproval);
                match &self.approver {
                    Some(approver) => {
                        approver
                            .request_approval(ApprovalRequest {
                                execution_id: run.execution_id.clone(),
                                workflow_id: definition.id.clone(),
                                decision: decision.clone(),
                                assessment: assessment.clone(),
                            })
                            .await;
                    }
                    None => warn!(
                        "Execution {} awaits approval but no approval actor is configured",
                        run.execution_id
                    ),
                }
            }
            _ => run.settle(ExecutionStatus::Completed),
        }

        run.assessment = Some(assessment);
        run.decision = Some(decision);
    }

    /// Scores the anomaly metric against past runs, then adds it to history.
    fn observe_metric(
        &self,
        workflow_id: &str,
        metric: &str,
        ctx: &ExecutionContext,
    ) -> Option<AnomalyScore> {
        let value = match resolve(metric, ctx) {
            Ok(value) => value,
            Err(e) => {
                warn!("Anomaly metric {} unavailable: {}", metric, e);
                return None;
            }
        };
        let Some(value) = value.as_f64() else {
            warn!("Anomaly metric {} is not numeric: {}", metric, value);
            return None;
        };

        let score = self.anomaly.score(workflow_id, value);
        self.anomaly.record(workflow_id, value);
        score
    }

    fn record_start(&self, run: &Run, input: &Value) {
        let Some(sink) = &self.sink else {
            return;
        };
        let record = StartRecord {
            execution_id: run.execution_id.clone(),
            workflow_id: run.definition.id.clone(),
            workflow_version: run.definition.version.clone(),
            input: input.clone(),
            started_at: run.started_at,
        };
        if let Err(e) = sink.record_start(&record) {
            warn!("Failed to record start of {}: {}", run.execution_id, e);
        }
    }

    /// Settles anything left open, publishes the final event and records
    /// the result.
    fn finish(&self, mut run: Run) -> (ExecutionResult, ExecutionTimeline) {
        if !run.status.current().is_settled() {
            if run.root_cause.is_none() {
                run.fail_once("execution ended without a routing decision".to_string());
            }
            run.settle(ExecutionStatus::Failed);
        }

        let status = run.status.current();
        let event = match status {
            ExecutionStatus::Failed => StreamEvent::execution_failed(
                &run.execution_id,
                run.root_cause.as_deref().unwrap_or("unknown failure"),
            ),
            _ => StreamEvent::execution_completed(
                &run.execution_id,
                status.as_str(),
                run.decision.as_ref().map(|d| d.action.as_str()),
            ),
        };
        self.events.publish(event);

        let (result, timeline) = run.into_result();
        match &result.root_cause {
            Some(cause) => info!(
                "Execution {} {} after {} ms: {}",
                result.execution_id, result.status, result.duration_ms, cause
            ),
            None => info!(
                "Execution {} {} after {} ms",
                result.execution_id, result.status, result.duration_ms
            ),
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_result(&result) {
                warn!("Failed to record result of {}: {}", result.execution_id, e);
            }
        }
        (result, timeline)
    }
}

/// A step task's report with its start and end instants.
struct Finished {
    report: StepReport,
    span: Option<(Instant, Instant)>,
}

async fn run_task(events: Arc<EventBroadcaster>, level: usize, task: StepTask) -> Finished {
    events.publish(StreamEvent::step_started(
        &task.execution_id,
        task.step.step_number,
        &task.step.name,
        level,
    ));
    let started = Instant::now();
    let report = execute_step(task).await;
    Finished {
        report,
        span: Some((started, Instant::now())),
    }
}

/// State of one execution while it runs.
struct Run {
    execution_id: String,
    definition: Arc<WorkflowDefinition>,
    status: StatusTracker,
    reports: BTreeMap<u32, StepReport>,
    timeline: ExecutionTimeline,
    started_at: DateTime<Utc>,
    started: Instant,
    root_cause: Option<String>,
    violations: Vec<Violation>,
    output: Option<Value>,
    anomaly: Option<AnomalyScore>,
    assessment: Option<RiskAssessment>,
    decision: Option<RoutingDecision>,
    rule_evaluations: Vec<RuleEvaluation>,
}

impl Run {
    fn new(execution_id: String, definition: Arc<WorkflowDefinition>) -> Self {
        let reports = definition
            .steps
            .iter()
            .map(|s| (s.step_number, StepReport::pending(s)))
            .collect();
        Self {
            execution_id,
            definition,
            status: StatusTracker::new(),
            reports,
            timeline: ExecutionTimeline::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            root_cause: None,
            violations: Vec::new(),
            output: None,
            anomaly: None,
            assessment: None,
            decision: None,
            rule_evaluations: Vec::new(),
        }
    }

    fn settle(&mut self, next: ExecutionStatus) {
        if let Err(e) = self.status.transition(next) {
            error!("Execution {}: {}", self.execution_id, e);
        }
    }

    /// Fails the execution before any step has run.
    fn reject(&mut self, cause: String) {
        self.fail_once(cause);
        self.settle(ExecutionStatus::Failed);
    }

    /// Keeps the first root cause; later ones are only logged.
    fn fail_once(&mut self, cause: String) {
        match &self.root_cause {
            Some(first) => debug!(
                "Execution {}: {} (root cause already recorded: {})",
                self.execution_id, cause, first
            ),
            None => {
                error!("Execution {} failed: {}", self.execution_id, cause);
                self.root_cause = Some(cause);
            }
        }
    }

    /// (percent, resolved, total) over all steps.
    fn progress(&self) -> (u8, usize, usize) {
        let total = self.reports.len();
        let resolved = self
            .reports
            .values()
            .filter(|r| r.status != StepStatus::Pending)
            .count();
        let percent = if total == 0 { 100 } else { resolved * 100 / total };
        (percent as u8, resolved, total)
    }

    fn furthest_completed_step(&self) -> Option<u32> {
        self.reports
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    StepStatus::Completed | StepStatus::CompletedWithFallback
                )
            })
            .map(|r| r.step_number)
            .max()
    }

    fn into_result(self) -> (ExecutionResult, ExecutionTimeline) {
        let furthest_completed_step = self.furthest_completed_step();
        let result = ExecutionResult {
            execution_id: self.execution_id,
            workflow_id: self.definition.id.clone(),
            workflow_version: self.definition.version.clone(),
            status: self.status.current(),
            status_history: self.status.history().to_vec(),
            furthest_completed_step,
            root_cause: self.root_cause,
            output: self.output,
            violations: self.violations,
            steps: self.reports.into_values().collect(),
            rule_evaluations: self.rule_evaluations,
            anomaly: self.anomaly,
            assessment: self.assessment,
            decision: self.decision,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        (result, self.timeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use crate::config::EventConfig;
    use crate::execution::builtin::{builtin_registry, ECHO, SUM};
    use crate::execution::record::{ExecutionRecord, MemorySink};
    use crate::execution::registry::{StepFailure, StepInvocation};
    use crate::execution::step::SkipReason;
    use crate::monitoring::EventKind;
    use crate::risk::routing::{ApprovalQueue, Priority};
    use crate::risk::rules::RiskRule;
    use crate::validation::{Schema, SchemaType};
    use crate::workflow::model::{OnError, StepDefinition};
    use crate::workflow::parser::MemorySource;

    fn registry() -> StepRegistry {
        let mut registry = builtin_registry();
        registry.register_fn("test.fail", |_inv: StepInvocation| async move {
            Err::<Value, _>(StepFailure::permanent("invalid section"))
        });
        registry.register_fn("test.sleep", |inv: StepInvocation| async move {
            let ms = inv.param("ms").and_then(Value::as_u64).unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        });
        registry
    }

    fn engine() -> Engine {
        Engine::new(registry())
    }

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "diamond",
            vec![
                StepDefinition::new(1, "load", ECHO, "load").with_input("value", "$input.load"),
                StepDefinition::new(2, "left", SUM, "left")
                    .with_input("a", "$step1.value")
                    .with_literal("b", json!(1)),
                StepDefinition::new(3, "right", SUM, "right")
                    .with_input("a", "$step1.value")
                    .with_literal("b", json!(2)),
                StepDefinition::new(4, "join", SUM, "join")
                    .with_input("l", "$step2.total")
                    .with_input("r", "$step3.total"),
                StepDefinition::new(5, "audit", ECHO, "audit").with_input("who", "$context.actor"),
            ],
        )
    }

    /// Every dimension scored from `$input.score`.
    fn scored() -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::from_steps(
            "scored",
            vec![StepDefinition::new(1, "load", ECHO, "load").with_input("value", "$input.load")],
        );
        for dimension in Dimension::ALL {
            definition = definition.with_dimension(dimension, "$input.score");
        }
        definition
    }

    #[tokio::test]
    async fn test_diamond_runs_level_by_level() {
        let engine = engine();
        let definition = Arc::new(diamond());
        let metadata = ContextMetadata::new("exec-diamond").with_actor("eng");

        let (result, timeline) = engine
            .execute_traced(
                Arc::clone(&definition),
                json!({"load": 10}),
                metadata,
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_completed(), "{:?}", result.root_cause);
        assert_eq!(result.count(StepStatus::Completed), 5);
        assert_eq!(result.furthest_completed_step, Some(5));

        let output = result.output.as_ref().unwrap();
        assert_eq!(output["join"]["total"], json!(23.0));
        assert_eq!(output["audit"]["who"], json!("eng"));

        let graph = engine.plan(&definition).unwrap();
        assert_eq!(graph.levels(), &[vec![1, 5], vec![2, 3], vec![4]]);
        assert_eq!(graph.critical_path().len(), 3);
        assert_eq!(timeline.durations().len(), 5);
    }

    #[tokio::test]
    async fn test_input_validation_rejects_before_start() {
        let schema = Schema::of_type(SchemaType::Object)
            .with_property("load", Schema::of_type(SchemaType::Number).with_minimum(0.0))
            .require("load");
        let definition = Arc::new(diamond().with_input_schema(schema));

        let result = engine().execute(definition, json!({"load": -5})).await;

        assert!(result.is_failed());
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].to_string(), "load: value -5 is below minimum 0");
        assert_eq!(result.count(StepStatus::Pending), 5);
        assert!(result.root_cause.as_deref().unwrap().contains("input validation failed"));
        assert_eq!(
            result.status_history.iter().map(|c| c.status).collect::<Vec<_>>(),
            vec![ExecutionStatus::Pending, ExecutionStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_unknown_function_rejected() {
        let definition = WorkflowDefinition::from_steps(
            "unknown",
            vec![StepDefinition::new(1, "calc", "beam.deflection", "calc")],
        );
        let result = engine().execute(Arc::new(definition), json!({})).await;

        assert!(result.is_failed());
        assert_eq!(
            result.root_cause.as_deref(),
            Some("unknown step function(s): beam.deflection")
        );
        assert!(result.step(1).unwrap().started_at.is_none());
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let definition = WorkflowDefinition::from_steps(
            "cyclic",
            vec![
                StepDefinition::new(1, "a", ECHO, "a").with_input("x", "$step2.value"),
                StepDefinition::new(2, "b", ECHO, "b").with_input("x", "$step1.value"),
            ],
        );
        let result = engine().execute(Arc::new(definition), json!({})).await;

        assert!(result.is_failed());
        assert!(result
            .root_cause
            .as_deref()
            .unwrap()
            .starts_with("invalid workflow definition"));
        assert_eq!(result.count(StepStatus::Pending), 2);
    }

    #[tokio::test]
    async fn test_on_error_fail_aborts_at_barrier() {
        let definition = WorkflowDefinition::from_steps(
            "abort",
            vec![
                StepDefinition::new(1, "check", "test.fail", "check").on_error(OnError::Fail),
                StepDefinition::new(2, "load", ECHO, "load").with_input("v", "$input.load"),
                StepDefinition::new(3, "after", ECHO, "after").with_input("v", "$step2.v"),
            ],
        );
        let result = engine().execute(Arc::new(definition), json!({"load": 1})).await;

        assert!(result.is_failed());
        assert_eq!(result.step(1).unwrap().status, StepStatus::Failed);
        assert_eq!(result.step(2).unwrap().status, StepStatus::Completed);
        assert_eq!(result.step(3).unwrap().status, StepStatus::Pending);
        assert_eq!(
            result.root_cause.as_deref(),
            Some("step 1 'check' failed: invalid section")
        );
        assert_eq!(result.furthest_completed_step, Some(2));
        assert!(result.decision.is_none());
    }

    #[tokio::test]
    async fn test_on_error_skip_and_continue() {
        let definition = WorkflowDefinition::from_steps(
            "tolerant",
            vec![
                StepDefinition::new(1, "optional", "test.fail", "optional").on_error(OnError::Skip),
                StepDefinition::new(2, "defaulted", "test.fail", "defaulted")
                    .on_error(OnError::Continue)
                    .with_fallback(json!({"total": 0})),
                StepDefinition::new(3, "after", SUM, "after").with_input("t", "$step2.total"),
            ],
        );
        let result = engine().execute(Arc::new(definition), json!({})).await;

        assert!(!result.is_failed(), "{:?}", result.root_cause);
        let skipped = result.step(1).unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.skip_reason, Some(SkipReason::OnError));
        assert_eq!(result.step(2).unwrap().status, StepStatus::CompletedWithFallback);
        assert_eq!(result.step(3).unwrap().output, Some(json!({"total": 0.0})));

        let output = result.output.as_ref().unwrap();
        assert!(output.get("optional").is_none());
        // failed-and-skipped step drives the execution dimension to 1
        assert_eq!(result.assessment.as_ref().unwrap().score(Dimension::Execution), 1.0);
    }

    #[tokio::test]
    async fn test_condition_false_skips_step() {
        let definition = WorkflowDefinition::from_steps(
            "conditional",
            vec![
                StepDefinition::new(1, "load", ECHO, "load").with_input("v", "$input.load"),
                StepDefinition::new(2, "heavy", ECHO, "heavy")
                    .with_input("v", "$step1.v")
                    .with_condition("$input.heavy == true"),
                StepDefinition::new(3, "report", ECHO, "report").with_input("v", "$step1.v"),
            ],
        );
        let result = engine()
            .execute(Arc::new(definition), json!({"load": 3, "heavy": false}))
            .await;

        assert!(result.is_completed());
        let heavy = result.step(2).unwrap();
        assert_eq!(heavy.status, StepStatus::Skipped);
        assert_eq!(heavy.skip_reason, Some(SkipReason::Condition));
        assert!(heavy.started_at.is_none());
        assert!(result.output.as_ref().unwrap().get("heavy").is_none());
    }

    #[tokio::test]
    async fn test_missing_path_is_fatal() {
        let definition = WorkflowDefinition::from_steps(
            "defect",
            vec![
                StepDefinition::new(1, "load", ECHO, "load").with_input("v", "$input.load"),
                StepDefinition::new(2, "bad", ECHO, "bad").with_input("v", "$step1.missing"),
                StepDefinition::new(3, "good", ECHO, "good").with_input("v", "$step1.v"),
                StepDefinition::new(4, "last", ECHO, "last").with_input("v", "$step3.v"),
            ],
        );
        let result = engine().execute(Arc::new(definition), json!({"load": 1})).await;

        assert!(result.is_failed());
        let bad = result.step(2).unwrap();
        assert!(bad.fatal);
        assert_eq!(bad.status, StepStatus::Failed);
        // the defect stops its level before anything in it starts
        assert_eq!(result.step(3).unwrap().status, StepStatus::Pending);
        assert_eq!(result.step(4).unwrap().status, StepStatus::Pending);
        assert!(result.root_cause.as_deref().unwrap().starts_with("step 2 'bad' failed: parameter 'v'"));
    }

    #[tokio::test]
    async fn test_exception_rule_allows_auto_approve() {
        let definition = scored().with_rule(RiskRule::exception("standard", "$input.load == 100"));
        let result = engine()
            .execute(Arc::new(definition), json!({"load": 100, "score": 0.5}))
            .await;

        let assessment = result.assessment.clone().unwrap();
        assert_eq!(assessment.aggregate, 0.5);
        let decision = result.decision.clone().unwrap();
        assert_eq!(decision.band_action, RoutingAction::Warn);
        assert_eq!(decision.action, RoutingAction::AutoApprove);
        assert!(result.is_completed());
    }

    #[tokio::test]
    async fn test_high_risk_awaits_approval() {
        let queue = Arc::new(ApprovalQueue::new());
        let engine = engine().with_approval_actor(queue.clone());
        let definition = Arc::new(scored());

        let mut result = engine
            .execute(definition, json!({"load": 1, "score": 0.95}))
            .await;

        assert!(result.is_awaiting_approval());
        let decision = result.decision.clone().unwrap();
        assert_eq!(decision.action, RoutingAction::RequireHitl);
        assert_eq!(decision.priority, Some(Priority::Urgent));
        assert_eq!(decision.expiry_window(), Some(chrono::Duration::hours(4)));

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].execution_id, result.execution_id);

        let status = engine
            .resolve_approval(&mut result, &ApprovalOutcome::Approved)
            .unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
        assert!(result.is_completed());
        assert!(engine
            .resolve_approval(&mut result, &ApprovalOutcome::Approved)
            .is_err());
    }

    #[tokio::test]
    async fn test_rejected_approval_fails() {
        let engine = engine();
        let mut result = engine
            .execute(Arc::new(scored()), json!({"load": 1, "score": 0.8}))
            .await;
        assert_eq!(result.decision.as_ref().unwrap().action, RoutingAction::RequireReview);

        let outcome = ApprovalOutcome::Rejected {
            reason: "span exceeds code limit".to_string(),
        };
        engine.resolve_approval(&mut result, &outcome).unwrap();
        assert!(result.is_failed());
        assert_eq!(
            result.root_cause.as_deref(),
            Some("approval rejected: span exceeds code limit")
        );
    }

    #[tokio::test]
    async fn test_block_rule_fails_execution() {
        let definition = scored().with_rule(
            RiskRule::global("embargo", "$input.region == embargoed", 0.0)
                .with_action(RoutingAction::Block),
        );
        let result = engine()
            .execute(
                Arc::new(definition),
                json!({"load": 1, "score": 0.1, "region": "embargoed"}),
            )
            .await;

        assert!(result.is_failed());
        assert_eq!(result.decision.as_ref().unwrap().action, RoutingAction::Block);
        assert_eq!(result.root_cause.as_deref(), Some("blocked by risk rule embargo"));
        // steps ran; the block applies to the result
        assert_eq!(result.step(1).unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_step_rule_adds_to_aggregate() {
        let definition = WorkflowDefinition::from_steps(
            "ruled",
            vec![StepDefinition::new(1, "sum", SUM, "sum")
                .with_input("a", "$input.a")
                .with_input("b", "$input.b")],
        )
        .with_rule(RiskRule::after_step("heavy", 1, "$step1.total > 100", 0.4))
        .with_rule(RiskRule::global("never", "$input.a < 0", 0.3));

        let result = engine()
            .execute(Arc::new(definition), json!({"a": 80, "b": 40}))
            .await;

        let assessment = result.assessment.as_ref().unwrap();
        assert_eq!(assessment.rule_score, 0.4);
        assert_eq!(assessment.triggered_rules, vec!["heavy".to_string()]);
        assert_eq!(result.rule_evaluations.len(), 2);
        assert!(result
            .rule_evaluations
            .iter()
            .any(|e| e.rule_id == "never" && !e.triggered));
        assert_eq!(result.decision.as_ref().unwrap().action, RoutingAction::Continue);
    }

    #[tokio::test]
    async fn test_anomaly_scores_after_enough_history() {
        let definition = Arc::new({
            let mut d = diamond();
            d.risk.anomaly_metric = Some("$input.load".to_string());
            d
        });
        let engine = engine();

        for _ in 0..10 {
            let result = engine.execute(Arc::clone(&definition), json!({"load": 10})).await;
            assert!(result.anomaly.is_none());
        }
        let result = engine.execute(Arc::clone(&definition), json!({"load": 50})).await;
        let anomaly = result.anomaly.as_ref().unwrap();
        assert_eq!(anomaly.samples, 10);
        assert_eq!(anomaly.score, 1.0);
        assert_eq!(result.assessment.as_ref().unwrap().score(Dimension::Anomaly), 1.0);
    }

    #[tokio::test]
    async fn test_event_stream_order() {
        let engine = engine();
        let mut sub = engine.events().subscribe("exec-events");

        engine
            .execute_with(
                Arc::new(diamond()),
                json!({"load": 1}),
                ContextMetadata::new("exec-events"),
            )
            .await;

        let mut events = Vec::new();
        while let Some(event) = sub.try_next() {
            events.push(event);
        }

        assert_eq!(events.first().unwrap().event_kind, EventKind::ExecutionStarted);
        assert_eq!(events.last().unwrap().event_kind, EventKind::ExecutionCompleted);
        assert_eq!(
            events.iter().filter(|e| e.event_kind == EventKind::StepStarted).count(),
            5
        );

        let percents: Vec<u8> = events.iter().filter_map(|e| e.percent()).collect();
        assert_eq!(percents.len(), 5);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));

        // every step is started before it resolves
        for n in 1..=5u32 {
            let started = events
                .iter()
                .position(|e| e.event_kind == EventKind::StepStarted && e.step_number == Some(n));
            let resolved = events
                .iter()
                .position(|e| e.event_kind == EventKind::StepCompleted && e.step_number == Some(n));
            assert!(started.unwrap() < resolved.unwrap());
        }
    }

    #[tokio::test]
    async fn test_records_start_and_result() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine().with_sink(sink.clone());
        let result = engine.execute(Arc::new(diamond()), json!({"load": 2})).await;

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], ExecutionRecord::Started(s) if s.input == json!({"load": 2})));
        assert_eq!(sink.result(&result.execution_id), Some(result));
    }

    #[tokio::test]
    async fn test_record_dir_from_config() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            record_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let engine = Engine::with_config(registry(), config);
        let result = engine.execute(Arc::new(diamond()), json!({"load": 2})).await;

        let sink = JsonFileSink::new(dir.path());
        match sink.load(&result.execution_id).unwrap() {
            ExecutionRecord::Finished(stored) => assert_eq!(stored.status, ExecutionStatus::Completed),
            other => panic!("unexpected record {:?}", other),
        }
    }

    fn sleepers(n: u32, ms: u64) -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "sleepers",
            (1..=n)
                .map(|i| {
                    StepDefinition::new(i, format!("s{}", i), "test.sleep", format!("s{}", i))
                        .with_literal("ms", json!(ms))
                })
                .collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_level_overlaps() {
        let result = engine().execute(Arc::new(sleepers(2, 100)), json!({})).await;
        assert!(result.is_completed());
        assert!(result.duration_ms < 200, "took {} ms", result.duration_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_mode() {
        let mut engine = engine();
        engine.set_sequential(true);
        let (result, timeline) = engine
            .execute_traced(
                Arc::new(sleepers(2, 100)),
                json!({}),
                ContextMetadata::default(),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_completed());
        assert!(result.duration_ms >= 200);
        let events = timeline.events();
        assert_eq!(events[0].step_number, 1);
        assert_eq!(events[2].step_number, 2);
        assert!(events[2].timestamp >= events[1].timestamp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_parallel_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = StepRegistry::new();
        {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            registry.register_fn("test.count", move |_inv: StepInvocation| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            });
        }

        let definition = WorkflowDefinition::from_steps(
            "bounded",
            (1..=6)
                .map(|i| StepDefinition::new(i, format!("c{}", i), "test.count", format!("c{}", i)))
                .collect(),
        );
        let mut engine = Engine::new(registry);
        engine.set_max_parallel(2);
        let result = engine.execute(Arc::new(definition), json!({})).await;

        assert!(result.is_completed());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation() {
        let definition = WorkflowDefinition::from_steps(
            "cancelled",
            vec![
                StepDefinition::new(1, "slow", "test.sleep", "slow").with_literal("ms", json!(10_000)),
                StepDefinition::new(2, "next", ECHO, "next").with_input("v", "$step1.slept"),
            ],
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let (result, _) = engine()
            .execute_traced(Arc::new(definition), json!({}), ContextMetadata::default(), cancel)
            .await;

        assert!(result.is_failed());
        assert_eq!(result.root_cause.as_deref(), Some(CANCELLED));
        let slow = result.step(1).unwrap();
        assert_eq!(slow.status, StepStatus::Skipped);
        assert_eq!(slow.skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(result.step(2).unwrap().status, StepStatus::Pending);
        assert!(result.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn test_output_mapping_and_schema() {
        let mut definition = diamond();
        let mut mapping = BTreeMap::new();
        mapping.insert("total".to_string(), json!("$step4.total"));
        definition.output = Some(mapping);
        let definition = definition.with_output_schema(
            Schema::of_type(SchemaType::Object)
                .with_property("total", Schema::of_type(SchemaType::Number).with_maximum(20.0))
                .require("total"),
        );

        let result = engine().execute(Arc::new(definition), json!({"load": 10})).await;

        assert!(result.is_failed());
        assert_eq!(result.violations.len(), 1);
        assert!(result.output.is_none());
        assert!(result.root_cause.as_deref().unwrap().starts_with("output validation failed"));
        assert_eq!(result.count(StepStatus::Completed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_event_streams_reclaimed() {
        let config = EngineConfig {
            events: EventConfig {
                idle_timeout_secs: 1,
                ..EventConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = Engine::with_config(registry(), config);
        let definition = Arc::new(diamond());

        for _ in 0..3 {
            engine.execute(Arc::clone(&definition), json!({"load": 1})).await;
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(engine.events().stream_count(), 0);
    }

    #[tokio::test]
    async fn test_close_events() {
        let engine = engine();
        let result = engine.execute(Arc::new(diamond()), json!({"load": 1})).await;

        assert!(!engine.events().history(&result.execution_id).is_empty());
        assert!(engine.close_events(&result.execution_id));
        assert!(!engine.close_events(&result.execution_id));
        assert_eq!(engine.events().stream_count(), 0);
    }

    #[tokio::test]
    async fn test_redefined_workflow_is_replanned() {
        let engine = engine();
        let single = WorkflowDefinition::from_steps(
            "wf",
            vec![StepDefinition::new(1, "load", ECHO, "load").with_input("v", "$input.load")],
        );
        let result = engine.execute(Arc::new(single), json!({"load": 1})).await;
        assert!(result.is_completed());

        let double = WorkflowDefinition::from_steps(
            "wf",
            vec![
                StepDefinition::new(1, "load", ECHO, "load").with_input("v", "$input.load"),
                StepDefinition::new(2, "twice", SUM, "twice")
                    .with_input("a", "$step1.v")
                    .with_input("b", "$step1.v"),
            ],
        );
        let result = engine.execute(Arc::new(double), json!({"load": 2})).await;
        assert!(result.is_completed(), "{:?}", result.root_cause);
        assert_eq!(result.count(StepStatus::Completed), 2);
        assert_eq!(result.count(StepStatus::Pending), 0);
        assert_eq!(result.step(2).unwrap().output, Some(json!({"total": 4.0})));

        let cyclic = WorkflowDefinition::from_steps(
            "wf",
            vec![
                StepDefinition::new(1, "load", ECHO, "load").with_input("v", "$step2.total"),
                StepDefinition::new(2, "twice", SUM, "twice").with_input("a", "$step1.v"),
            ],
        );
        let result = engine.execute(Arc::new(cyclic), json!({"load": 2})).await;
        assert!(result.is_failed());
        assert!(result
            .root_cause
            .as_deref()
            .unwrap()
            .starts_with("invalid workflow definition"));
    }

    #[tokio::test]
    async fn test_execute_from_source() {
        let mut source = MemorySource::new();
        source.insert(diamond()).unwrap();

        let result = engine()
            .execute_from(&source, "diamond", json!({"load": 1}))
            .await
            .unwrap();
        assert!(result.is_completed());
        assert!(engine().execute_from(&source, "missing", json!({})).await.is_err());
    }
}
