use crate::domain::instance::DefinitionName;
use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// A versioned, immutable process template: a directed graph of steps.
///
/// Definitions are never mutated after publish; a correction is a new
/// version. Running instances keep executing against the version they were
/// created with, so version skew against the current definition is normal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Name shared by all versions of this process
    pub name: DefinitionName,

    /// Monotonically increasing version, assigned at publish
    pub version: u32,

    /// Description of the process
    pub description: Option<String>,

    /// Id of the step every new instance enters first
    pub start: String,

    /// The step graph
    pub steps: Vec<StepSpec>,

    /// How instances of this definition are started
    pub trigger: TriggerSpec,

    /// Whether this version is eligible for `get_active` resolution
    pub active: bool,
}

/// A node in the definition graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Id of the step, unique within the definition
    pub id: String,

    /// What entering this step does
    pub kind: StepKind,

    /// Outgoing edges, evaluated in declaration order
    pub edges: Vec<Edge>,
}

/// Step behavior, dispatched by the execution engine on entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Creates a task ledger entry and suspends until completion or expiry
    Task {
        /// Principal or role identifier, resolved externally
        assignee: String,
        /// Optional deadline relative to task creation
        due: Option<Duration>,
    },

    /// Suspends until a relative delay elapses
    Timer {
        /// Delay before the instance resumes
        delay: Duration,
    },

    /// Routes control flow by evaluating edge guards
    Gateway(GatewayKind),

    /// A synchronous, idempotent side-effect call to a collaborator
    Automatic {
        /// Name of the registered automatic action
        action: String,
        /// Configuration passed to the action verbatim
        config: Value,
    },

    /// Suspends until an external event matching `(name, correlation key)`
    /// arrives; the correlation key names a variable resolved at entry
    Event {
        /// Event name to match
        name: String,
        /// Variable whose value is the correlation key
        correlation_key: String,
    },

    /// Terminal step
    End,
}

/// Gateway routing semantics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GatewayKind {
    /// Take the first edge whose guard is true; fall back to the default
    /// edge target, if declared
    Exclusive {
        /// Step id taken when no guard is true
        default: Option<String>,
    },

    /// Take every edge whose guard is true (or all, if unguarded),
    /// creating one active position per taken edge
    Parallel,

    /// Fires once all declared incoming branches have arrived
    Join {
        /// Number of branches that must arrive
        branches: usize,
    },
}

/// A directed edge between two steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Target step id
    pub target: String,

    /// Optional guard expression over instance variables
    pub guard: Option<String>,

    /// What traversal of this edge is triggered by
    #[serde(default)]
    pub trigger: EdgeTrigger,
}

impl Edge {
    /// Unguarded edge taken on normal completion
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            guard: None,
            trigger: EdgeTrigger::Completed,
        }
    }

    /// Guarded edge taken on normal completion
    pub fn guarded(target: impl Into<String>, guard: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            guard: Some(guard.into()),
            trigger: EdgeTrigger::Completed,
        }
    }

    /// Edge taken when a task step's deadline lapses
    pub fn on_expiry(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            guard: None,
            trigger: EdgeTrigger::Expired,
        }
    }
}

/// Input that causes an outgoing edge to be considered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTrigger {
    /// The step finished normally
    #[default]
    Completed,

    /// The step's task deadline lapsed without completion
    Expired,
}

/// How instances of a definition are started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Started by an explicit instantiate call
    Manual,

    /// Started on a schedule; firing the schedule is the host's concern
    Scheduled {
        /// Schedule expression, opaque to the engine
        schedule: String,
    },

    /// Started when a named external event arrives
    Event {
        /// Event name that instantiates this definition
        name: String,
    },
}

/// Reference to a specific definition version, fixed at instance creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    /// Definition name
    pub name: DefinitionName,
    /// Definition version
    pub version: u32,
}

impl ProcessDefinition {
    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validate the step graph for publish.
    ///
    /// Rejects unknown edge targets, steps unreachable from the start step
    /// (dead code), non-terminal steps with no path to an `End` step, edges
    /// out of `End` steps, and exclusive gateway defaults referencing
    /// unknown steps. Loops back to earlier steps are permitted as long as
    /// a terminating path exists. Guard expressions are checked by the
    /// definition service, which holds the guard evaluator.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::DefinitionInvalid(
                "definition must have at least one step".to_string(),
            ));
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if !step_ids.insert(step.id.as_str()) {
                return Err(EngineError::DefinitionInvalid(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        if !step_ids.contains(self.start.as_str()) {
            return Err(EngineError::DefinitionInvalid(format!(
                "start step does not exist: {}",
                self.start
            )));
        }

        for step in &self.steps {
            for edge in &step.edges {
                if !step_ids.contains(edge.target.as_str()) {
                    return Err(EngineError::DefinitionInvalid(format!(
                        "step {} has an edge to unknown step: {}",
                        step.id, edge.target
                    )));
                }
            }

            match &step.kind {
                StepKind::End => {
                    if !step.edges.is_empty() {
                        return Err(EngineError::DefinitionInvalid(format!(
                            "end step {} must not have outgoing edges",
                            step.id
                        )));
                    }
                }
                StepKind::Gateway(GatewayKind::Exclusive { default }) => {
                    if let Some(default) = default {
                        if !step_ids.contains(default.as_str()) {
                            return Err(EngineError::DefinitionInvalid(format!(
                                "gateway {} defaults to unknown step: {}",
                                step.id, default
                            )));
                        }
                    }
                    if step.edges.is_empty() && default.is_none() {
                        return Err(EngineError::DefinitionInvalid(format!(
                            "exclusive gateway {} has no outgoing edges",
                            step.id
                        )));
                    }
                }
                StepKind::Gateway(GatewayKind::Join { branches }) => {
                    if *branches == 0 {
                        return Err(EngineError::DefinitionInvalid(format!(
                            "join {} must declare at least one incoming branch",
                            step.id
                        )));
                    }
                }
                _ => {
                    if step.edges.is_empty() {
                        return Err(EngineError::DefinitionInvalid(format!(
                            "step {} has no outgoing edges and is not an end step",
                            step.id
                        )));
                    }
                }
            }
        }

        self.check_reachability()?;
        self.check_termination()?;

        Ok(())
    }

    /// Every step must be reachable from the start step.
    fn check_reachability(&self) -> Result<(), EngineError> {
        let forward = self.adjacency(|edge| edge.target.as_str());
        let reached = bfs(&self.start, &forward);

        for step in &self.steps {
            if !reached.contains(step.id.as_str()) {
                return Err(EngineError::DefinitionInvalid(format!(
                    "step {} is not reachable from the start step",
                    step.id
                )));
            }
        }
        Ok(())
    }

    /// Every step must have a path to an `End` step.
    fn check_termination(&self) -> Result<(), EngineError> {
        // Walk the reversed graph from every End step; anything not
        // reached has no terminating path.
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            reverse.entry(step.id.as_str()).or_default();
            for edge in &step.edges {
                reverse
                    .entry(edge.target.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
            if let StepKind::Gateway(GatewayKind::Exclusive {
                default: Some(default),
            }) = &step.kind
            {
                reverse
                    .entry(default.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut can_terminate: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::End))
            .map(|s| s.id.as_str())
            .collect();

        while let Some(id) = queue.pop_front() {
            if !can_terminate.insert(id) {
                continue;
            }
            if let Some(sources) = reverse.get(id) {
                for source in sources {
                    if !can_terminate.contains(source) {
                        queue.push_back(source);
                    }
                }
            }
        }

        for step in &self.steps {
            if !can_terminate.contains(step.id.as_str()) {
                return Err(EngineError::DefinitionInvalid(format!(
                    "step {} has no path to an end step",
                    step.id
                )));
            }
        }
        Ok(())
    }

    fn adjacency<'a>(&'a self, target: fn(&'a Edge) -> &'a str) -> HashMap<&'a str, Vec<&'a str>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            let mut targets: Vec<&str> = step.edges.iter().map(target).collect();
            if let StepKind::Gateway(GatewayKind::Exclusive {
                default: Some(default),
            }) = &step.kind
            {
                targets.push(default.as_str());
            }
            adjacency.insert(step.id.as_str(), targets);
        }
        adjacency
    }
}

fn bfs<'a>(start: &'a str, adjacency: &HashMap<&'a str, Vec<&'a str>>) -> HashSet<&'a str> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([start]);

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(targets) = adjacency.get(id) {
            for target in targets {
                if !visited.contains(target) {
                    queue.push_back(target);
                }
            }
        }
    }
    visited
}
