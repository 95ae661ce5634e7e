//! Dependency Graph
//!
//! Derives the execution structure of a workflow from the references its
//! steps make to each other:
//! - Edges from `$step<N>` / `$steps.<var>` references in input mappings and
//!   step conditions
//! - Cycle detection (depth-first, any cycle is a load-time rejection)
//! - Level assignment and ordered parallel groups
//! - Critical path and estimated speedup
//!
//! Graphs are immutable and cached per workflow id and version.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info};

use super::model::{StepDefinition, WorkflowDefinition};
use super::validator::{validate_definition, DefinitionError};
use crate::expression::reference::{collect_references, Source, VariableRef};
use crate::expression::{CacheKey, Condition};

/// Cost assigned to a step when no timing is known.
pub const NOMINAL_STEP_COST: f64 = 1.0;

/// The dependency structure of one workflow definition.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// step -> steps it reads from
    dependencies: BTreeMap<u32, BTreeSet<u32>>,
    /// step -> steps that read from it
    dependents: BTreeMap<u32, BTreeSet<u32>>,
    /// step -> level (0-based)
    levels: BTreeMap<u32, usize>,
    /// level index -> steps, ascending by step number
    groups: Vec<Vec<u32>>,
    critical_path: Vec<u32>,
}

/// Step references made by one step, resolved to step numbers.
fn step_references(
    step: &StepDefinition,
    by_variable: &HashMap<&str, u32>,
    known: &BTreeSet<u32>,
) -> Result<BTreeSet<u32>, DefinitionError> {
    let mut refs: Vec<VariableRef> = Vec::new();
    for value in step.input_mapping.values() {
        collect_references(value, &mut refs).map_err(|error| DefinitionError::InvalidReference {
            step: step.step_number,
            error,
        })?;
    }

    if let Some(source) = &step.condition {
        let condition =
            Condition::parse(source).map_err(|error| DefinitionError::InvalidCondition {
                owner: format!("step {}", step.step_number),
                expression: source.clone(),
                error,
            })?;
        refs.extend(condition.expr().references().into_iter().cloned());
    }

    let mut deps = BTreeSet::new();
    for reference in refs {
        let target = match reference.source() {
            Source::Input | Source::Context => continue,
            Source::Step(n) if known.contains(n) => *n,
            Source::StepVariable(var) if by_variable.contains_key(var.as_str()) => {
                by_variable[var.as_str()]
            }
            _ => {
                return Err(DefinitionError::UnknownStepReference {
                    step: step.step_number,
                    reference: reference.to_string(),
                })
            }
        };
        deps.insert(target);
    }
    Ok(deps)
}

/// Finds a dependency cycle, returned as the steps along it with the first
/// step repeated at the end.
///
/// Depth-first with an explicit stack, visiting dependencies in ascending
/// order.
pub fn find_cycle(dependencies: &BTreeMap<u32, BTreeSet<u32>>) -> Option<Vec<u32>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let unvisited = |node: u32| -> Vec<u32> {
        dependencies
            .get(&node)
            .map(|deps| deps.iter().rev().copied().collect())
            .unwrap_or_default()
    };

    let mut marks: HashMap<u32, Mark> = HashMap::new();
    for &root in dependencies.keys() {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root, Mark::InProgress);
        let mut path = vec![root];
        let mut pending = vec![unvisited(root)];

        while let Some(next) = pending.last_mut() {
            let Some(dep) = next.pop() else {
                pending.pop();
                if let Some(done) = path.pop() {
                    marks.insert(done, Mark::Done);
                }
                continue;
            };
            match marks.get(&dep) {
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|&s| s == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(dep, Mark::InProgress);
                    path.push(dep);
                    pending.push(unvisited(dep));
                }
            }
        }
    }
    None
}

impl DependencyGraph {
    /// Builds the graph for a definition.
    ///
    /// Fails on references to unknown steps, unparsable conditions and
    /// reference cycles.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        let known: BTreeSet<u32> = definition.steps.iter().map(|s| s.step_number).collect();
        let by_variable: HashMap<&str, u32> = definition
            .steps
            .iter()
            .map(|s| (s.output_variable.as_str(), s.step_number))
            .collect();

        let mut dependencies: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for step in &definition.steps {
            let deps = step_references(step, &by_variable, &known)?;
            dependencies.insert(step.step_number, deps);
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(DefinitionError::CycleDetected { cycle });
        }

        Ok(Self::from_dependencies(dependencies))
    }

    /// Builds the graph from an acyclic dependency map.
    fn from_dependencies(dependencies: BTreeMap<u32, BTreeSet<u32>>) -> Self {
        let mut dependents: BTreeMap<u32, BTreeSet<u32>> =
            dependencies.keys().map(|&k| (k, BTreeSet::new())).collect();
        for (&step, deps) in &dependencies {
            for &dep in deps {
                dependents.entry(dep).or_default().insert(step);
            }
        }

        // Kahn order: a step is placed once every dependency has a level.
        let mut waiting: BTreeMap<u32, usize> =
            dependencies.iter().map(|(&s, deps)| (s, deps.len())).collect();
        let mut ready: VecDeque<u32> = waiting
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&s, _)| s)
            .collect();
        let mut levels: BTreeMap<u32, usize> = BTreeMap::new();
        while let Some(step) = ready.pop_front() {
            let level = dependencies
                .get(&step)
                .into_iter()
                .flatten()
                .filter_map(|dep| levels.get(dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(step, level);
            for next in dependents.get(&step).into_iter().flatten() {
                if let Some(count) = waiting.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*next);
                    }
                }
            }
        }

        let depth = levels.values().max().map(|m| m + 1).unwrap_or(0);
        let mut groups: Vec<Vec<u32>> = vec![Vec::new(); depth];
        for (&step, &level) in &levels {
            groups[level].push(step);
        }

        let mut graph = Self {
            dependencies,
            dependents,
            levels,
            groups,
            critical_path: Vec::new(),
        };
        let (path, _) = graph.longest_path(&|_| NOMINAL_STEP_COST);
        graph.critical_path = path;

        debug!("Dependency levels: {:?}", graph.groups);
        graph
    }

    /// Longest chain by total cost. Ties go to the lowest step number.
    fn longest_path(&self, cost: &dyn Fn(u32) -> f64) -> (Vec<u32>, f64) {
        let mut best: HashMap<u32, (f64, Option<u32>)> = HashMap::new();

        for group in &self.groups {
            for &step in group {
                let mut pred: Option<(u32, f64)> = None;
                for &dep in self.dependencies_of(step) {
                    let dep_cost = best.get(&dep).map(|b| b.0).unwrap_or(0.0);
                    match pred {
                        Some((_, c)) if dep_cost <= c => {}
                        _ => pred = Some((dep, dep_cost)),
                    }
                }
                let total = cost(step) + pred.map(|p| p.1).unwrap_or(0.0);
                best.insert(step, (total, pred.map(|p| p.0)));
            }
        }

        let end = self.levels.keys().fold(None, |acc: Option<(u32, f64)>, &step| {
            let total = best.get(&step).map(|b| b.0).unwrap_or(0.0);
            match acc {
                Some((_, c)) if total <= c => acc,
                _ => Some((step, total)),
            }
        });

        let Some((last, total)) = end else {
            return (Vec::new(), 0.0);
        };

        let mut path = vec![last];
        let mut current = last;
        while let Some(&(_, Some(prev))) = best.get(&current) {
            path.push(prev);
            current = prev;
        }
        path.reverse();
        (path, total)
    }

    /// Level of a step (0-based).
    pub fn level_of(&self, step_number: u32) -> Option<usize> {
        self.levels.get(&step_number).copied()
    }

    /// Ordered parallel groups, one per level.
    pub fn levels(&self) -> &[Vec<u32>] {
        &self.groups
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.groups.len()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Returns true if the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Returns true if the graph plans exactly the steps `definition` declares.
    pub fn covers(&self, definition: &WorkflowDefinition) -> bool {
        self.levels.len() == definition.steps.len()
            && definition
                .steps
                .iter()
                .all(|s| self.levels.contains_key(&s.step_number))
    }

    /// Steps a step reads from.
    pub fn dependencies_of(&self, step_number: u32) -> impl Iterator<Item = &u32> {
        self.dependencies
            .get(&step_number)
            .into_iter()
            .flat_map(|deps| deps.iter())
    }

    /// Steps that read from a step.
    pub fn dependents_of(&self, step_number: u32) -> impl Iterator<Item = &u32> {
        self.dependents
            .get(&step_number)
            .into_iter()
            .flat_map(|deps| deps.iter())
    }

    /// Steps with no dependencies.
    pub fn roots(&self) -> Vec<u32> {
        self.groups.first().cloned().unwrap_or_default()
    }

    /// Steps nothing depends on.
    pub fn leaves(&self) -> Vec<u32> {
        self.dependents
            .iter()
            .filter(|(_, d)| d.is_empty())
            .map(|(&s, _)| s)
            .collect()
    }

    /// Critical path using nominal unit costs.
    pub fn critical_path(&self) -> &[u32] {
        &self.critical_path
    }

    /// Estimated speedup of level-parallel execution over sequential,
    /// with every step at nominal cost.
    pub fn estimated_speedup(&self) -> f64 {
        if self.critical_path.is_empty() {
            return 1.0;
        }
        self.len() as f64 / self.critical_path.len() as f64
    }

    /// Critical path and speedup computed from measured step durations.
    ///
    /// Steps without a measurement cost nothing (they were skipped or never ran).
    pub fn measured_critical_path(&self, durations: &HashMap<u32, Duration>) -> (Vec<u32>, f64) {
        let cost = |step: u32| {
            durations
                .get(&step)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        };
        let (path, critical) = self.longest_path(&cost);
        let total: f64 = durations.values().map(|d| d.as_secs_f64()).sum();
        let speedup = if critical > 0.0 { total / critical } else { 1.0 };
        (path, speedup)
    }
}

/// Hash of a definition's full content.
///
/// Two definitions sharing an id and version but differing anywhere else
/// get different fingerprints.
pub fn fingerprint(definition: &WorkflowDefinition) -> Option<u64> {
    let content = serde_json::to_string(definition).ok()?;
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    Some(hasher.finish())
}

struct CachedGraph {
    fingerprint: u64,
    graph: Arc<DependencyGraph>,
}

/// Built graphs keyed by workflow id and version, checked against the
/// definition's content on every lookup.
#[derive(Default)]
pub struct GraphCache {
    graphs: RwLock<HashMap<CacheKey, CachedGraph>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached graph for a definition, validating the definition
    /// and building the graph on first use or whenever its content changed.
    pub fn get_or_build(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<DependencyGraph>, Vec<DefinitionError>> {
        let key = CacheKey::new(definition.id.clone(), definition.version.clone());
        let fingerprint = fingerprint(definition);

        if let (Some(fingerprint), Ok(graphs)) = (fingerprint, self.graphs.read()) {
            match graphs.get(&key) {
                Some(cached) if cached.fingerprint == fingerprint => {
                    return Ok(Arc::clone(&cached.graph));
                }
                Some(_) => debug!(
                    "Definition {}@{} changed; rebuilding its graph",
                    definition.id, definition.version
                ),
                None => {}
            }
        }

        let graph = Arc::new(validate_definition(definition)?);
        info!(
            "Built dependency graph for {}@{}: {} steps in {} levels",
            definition.id,
            definition.version,
            graph.len(),
            graph.depth()
        );
        if let (Some(fingerprint), Ok(mut graphs)) = (fingerprint, self.graphs.write()) {
            graphs.insert(
                key,
                CachedGraph {
                    fingerprint,
                    graph: Arc::clone(&graph),
                },
            );
        }
        Ok(graph)
    }

    /// Number of cached graphs.
    pub fn len(&self) -> usize {
        self.graphs.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
