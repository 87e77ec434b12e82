//! Dependency-graph coordinator: admits tasks whose prerequisites are
//! satisfied, dispatches them onto bounded cell slots, propagates upstream
//! failure, and aggregates run metrics.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cell::CellDriver;
use crate::config::EngineSettings;
use crate::engine::{FailureKind, TaskResult, TaskSpec, TcrEngine};
use crate::{CoreError, Result};

/// One task as admitted to the coordinator, dependencies by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl AgentConfig {
    fn to_task_spec(&self) -> TaskSpec {
        TaskSpec {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            acceptance_criteria: self.acceptance_criteria.clone(),
            max_retries: self.max_retries,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Aggregate numbers for one coordinator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Wall-clock time of the whole run.
    pub total_time_ms: u64,
    /// Mean duration of the tasks that actually executed.
    pub avg_task_time_ms: u64,
    pub tokens_estimate: u64,
    /// Σ task durations / wall time. Reported, never tuned against.
    pub parallel_factor: f64,
}

/// Everything a finished run yields.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub results: Vec<TaskResult>,
    pub metrics: CoordinatorMetrics,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

pub type ResultCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Ready,
    Running,
    Done,
}

/// Schedules tasks over a shared [`CellDriver`], one engine worker per
/// in-flight task.
pub struct Coordinator {
    driver: Arc<dyn CellDriver>,
    settings: EngineSettings,
    branch: String,
    max_concurrent: usize,
    agents: Vec<AgentConfig>,
    on_success: Option<ResultCallback>,
    on_failure: Option<ResultCallback>,
    metrics: Arc<Mutex<CoordinatorMetrics>>,
}

impl Coordinator {
    pub fn new(
        driver: Arc<dyn CellDriver>,
        settings: EngineSettings,
        branch: String,
        max_concurrent: usize,
    ) -> Self {
        Self {
            driver,
            settings,
            branch,
            max_concurrent: max_concurrent.max(1),
            agents: Vec::new(),
            on_success: None,
            on_failure: None,
            metrics: Arc::new(Mutex::new(CoordinatorMetrics::default())),
        }
    }

    /// Enqueue a task. Admission (cycle checks) happens in [`Self::execute`].
    pub fn add_agent(&mut self, agent: AgentConfig) {
        self.agents.push(agent);
    }

    pub fn set_max_concurrent(&mut self, n: usize) {
        self.max_concurrent = n.max(1);
    }

    /// Callback for every successful terminal transition. Callbacks run on
    /// one dedicated consumer in terminal order; they cannot block the
    /// scheduler.
    pub fn on_success(&mut self, cb: ResultCallback) {
        self.on_success = Some(cb);
    }

    /// Callback for failed and skipped terminal transitions.
    pub fn on_failure(&mut self, cb: ResultCallback) {
        self.on_failure = Some(cb);
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        self.metrics.lock().expect("metrics poisoned").clone()
    }

    /// Run until every task is terminal or the context is cancelled.
    pub async fn execute(&mut self, cancel: CancellationToken) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let total = self.agents.len();
        if total == 0 {
            return Ok(RunSummary {
                run_id,
                results: vec![],
                metrics: CoordinatorMetrics::default(),
            });
        }

        let graph = Graph::build(&self.agents)?;
        let agents_by_id: HashMap<String, AgentConfig> = self
            .agents
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect();

        let mut indegree = graph.indegree.clone();
        let mut state: HashMap<String, TaskState> = graph
            .order
            .iter()
            .map(|id| (id.clone(), TaskState::Pending))
            .collect();
        let mut ready: Vec<String> = Vec::new();
        for id in &graph.order {
            if indegree[id] == 0 {
                ready.push(id.clone());
                state.insert(id.clone(), TaskState::Ready);
            }
        }

        // Tasks bounced on port exhaustion wait here until a cell completes.
        let mut deferred: Vec<String> = Vec::new();

        let (cb_tx, cb_rx) = mpsc::unbounded_channel::<TaskResult>();
        let cb_task = self.spawn_callback_consumer(cb_rx);

        let mut running: JoinSet<(String, TaskResult)> = JoinSet::new();
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let wall_start = tokio::time::Instant::now();
        let mut executed_time_ms: u64 = 0;

        info!(
            %run_id,
            total,
            max_concurrent = self.max_concurrent,
            "coordinator run started"
        );

        while results.len() < total {
            if cancel.is_cancelled() && running.is_empty() {
                break;
            }

            // Dispatch while there is capacity and ready work.
            while !cancel.is_cancelled()
                && running.len() < self.max_concurrent
                && !ready.is_empty()
            {
                let id = pop_ready(&mut ready, &graph);
                state.insert(id.clone(), TaskState::Running);
                let agent = &agents_by_id[&id];
                debug!(task_id = %id, in_flight = running.len() + 1, "dispatching task");
                self.spawn_worker(&mut running, agent, &cancel);
            }

            let Some(joined) = running.join_next().await else {
                if ready.is_empty() {
                    // No running work and nothing ready: either everything is
                    // terminal or cancellation stopped admission.
                    break;
                }
                continue;
            };

            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // The engine folds failures into results, so a join error
                    // means the worker itself died. There is no id to recover
                    // from the join error; fail the run.
                    warn!(error = %e, "engine worker panicked");
                    return Err(CoreError::Config(format!("engine worker panicked: {e}")));
                }
            };

            // Back-pressure absorption: a bootstrap lost to port exhaustion
            // is retried once some other cell has let its port go.
            if is_port_exhaustion(&result) && !running.is_empty() {
                debug!(task_id = %id, "ports exhausted; deferring task until a cell completes");
                state.insert(id.clone(), TaskState::Ready);
                deferred.push(id);
                continue;
            }

            // A completion frees a port; deferred tasks get another shot.
            if !deferred.is_empty() {
                ready.append(&mut deferred);
            }

            executed_time_ms += result.duration_ms;
            state.insert(id.clone(), TaskState::Done);
            let succeeded = result.success;
            let _ = cb_tx.send(result.clone());
            results.insert(id.clone(), result);

            if succeeded {
                for dep in graph.dependents_of(&id) {
                    let deg = indegree.get_mut(dep).expect("known dependent");
                    *deg -= 1;
                    if *deg == 0 && state[dep] == TaskState::Pending {
                        state.insert(dep.to_string(), TaskState::Ready);
                        ready.push(dep.to_string());
                    }
                }
            } else {
                // Non-recoverable upstream failure: every transitive
                // dependent is terminal without executing.
                for dep_id in graph.transitive_dependents(&id) {
                    if state[&dep_id] == TaskState::Done {
                        continue;
                    }
                    if state[&dep_id] == TaskState::Running {
                        // Cannot happen: a dependent never starts before all
                        // its dependencies succeeded.
                        continue;
                    }
                    debug!(task_id = %dep_id, upstream = %id, "skipping dependent of failed task");
                    let skipped = TaskResult::skipped(&dep_id, &format!("upstream-failed: {id}"));
                    ready.retain(|r| r != &dep_id);
                    state.insert(dep_id.clone(), TaskState::Done);
                    let _ = cb_tx.send(skipped.clone());
                    results.insert(dep_id, skipped);
                }
            }
        }

        // Cancellation: outstanding workers observe their child token and
        // come home with `cancelled` results; await them all.
        while let Some(joined) = running.join_next().await {
            if let Ok((id, result)) = joined {
                executed_time_ms += result.duration_ms;
                let _ = cb_tx.send(result.clone());
                results.insert(id, result);
            }
        }

        drop(cb_tx);
        let _ = cb_task.await;

        let wall_ms = wall_start.elapsed().as_millis() as u64;
        let summary = self.summarise(run_id, &graph.order, results, wall_ms, executed_time_ms);

        if cancel.is_cancelled() && summary.results.len() < total {
            return Err(CoreError::Cancelled);
        }

        info!(
            %run_id,
            succeeded = summary.metrics.succeeded,
            failed = summary.metrics.failed,
            skipped = summary.metrics.skipped,
            wall_ms,
            parallel_factor = summary.metrics.parallel_factor,
            "coordinator run finished"
        );

        Ok(summary)
    }

    fn spawn_worker(
        &self,
        running: &mut JoinSet<(String, TaskResult)>,
        agent: &AgentConfig,
        cancel: &CancellationToken,
    ) {
        let engine = TcrEngine::new(
            Arc::clone(&self.driver),
            self.settings.clone(),
            self.branch.clone(),
        );
        let task = agent.to_task_spec();
        let id = agent.id.clone();
        let child = cancel.child_token();

        // Watchdog: a stalled heartbeat means a dead worker. It unblocks
        // itself when the engine (and its sender) is dropped.
        let mut beats = engine.heartbeat();
        let stall = std::time::Duration::from_secs(
            self.settings.heartbeat_interval_seconds.max(1) * 2,
        );
        let watchdog_id = id.clone();
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(stall, beats.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(task_id = %watchdog_id, stall_secs = stall.as_secs(), "no heartbeat from worker");
                    }
                }
            }
        });

        running.spawn(async move {
            let result = engine.run(&task, child).await;
            (id, result)
        });
    }

    fn spawn_callback_consumer(
        &self,
        mut rx: mpsc::UnboundedReceiver<TaskResult>,
    ) -> tokio::task::JoinHandle<()> {
        let on_success = self.on_success.clone();
        let on_failure = self.on_failure.clone();
        tokio::spawn(async move {
            // One consumer: callbacks observe terminal order and are never
            // re-entered.
            while let Some(result) = rx.recv().await {
                let cb = if result.success {
                    &on_success
                } else {
                    &on_failure
                };
                if let Some(cb) = cb {
                    cb(&result);
                }
            }
        })
    }

    fn summarise(
        &self,
        run_id: Uuid,
        order: &[String],
        mut results: HashMap<String, TaskResult>,
        wall_ms: u64,
        executed_time_ms: u64,
    ) -> RunSummary {
        let ordered: Vec<TaskResult> = order
            .iter()
            .filter_map(|id| results.remove(id))
            .collect();

        let succeeded = ordered.iter().filter(|r| r.success).count();
        let skipped = ordered
            .iter()
            .filter(|r| r.failure == Some(FailureKind::UpstreamFailed))
            .count();
        let failed = ordered.len() - succeeded - skipped;
        let executed = succeeded + failed;
        let tokens_estimate = ordered.iter().map(|r| r.tokens_estimate).sum();

        let metrics = CoordinatorMetrics {
            total: ordered.len(),
            succeeded,
            failed,
            skipped,
            total_time_ms: wall_ms,
            avg_task_time_ms: if executed > 0 {
                executed_time_ms / executed as u64
            } else {
                0
            },
            tokens_estimate,
            parallel_factor: if wall_ms > 0 {
                executed_time_ms as f64 / wall_ms as f64
            } else {
                0.0
            },
        };

        *self.metrics.lock().expect("metrics poisoned") = metrics.clone();

        RunSummary {
            run_id,
            results: ordered,
            metrics,
        }
    }
}

/// Pop the ready task with the fewest dependents; insertion order breaks
/// ties.
fn pop_ready(ready: &mut Vec<String>, graph: &Graph) -> String {
    let (idx, _) = ready
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| {
            (
                graph.dependents_of(id).len(),
                graph.insertion_index(id),
            )
        })
        .expect("ready set non-empty");
    ready.remove(idx)
}

fn is_port_exhaustion(result: &TaskResult) -> bool {
    result.failure == Some(FailureKind::Infra)
        && result.error_kind.as_deref() == Some("ports.exhausted")
}

/// Admission-time dependency graph: dependents adjacency plus in-degree
/// counts. Predecessor lists are never materialised.
#[derive(Debug)]
struct Graph {
    order: Vec<String>,
    insertion: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    indegree: HashMap<String, usize>,
}

impl Graph {
    fn build(agents: &[AgentConfig]) -> Result<Self> {
        let mut order = Vec::with_capacity(agents.len());
        let mut insertion = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut indegree: HashMap<String, usize> = HashMap::new();

        for (idx, agent) in agents.iter().enumerate() {
            if insertion.insert(agent.id.clone(), idx).is_some() {
                return Err(CoreError::Config(format!(
                    "duplicate task id '{}'",
                    agent.id
                )));
            }
            order.push(agent.id.clone());
            dependents.insert(agent.id.clone(), Vec::new());
            indegree.insert(agent.id.clone(), 0);
        }

        for agent in agents {
            for dep in &agent.dependencies {
                if !insertion.contains_key(dep) {
                    return Err(CoreError::Config(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        agent.id
                    )));
                }
                if dep == &agent.id {
                    return Err(CoreError::Config(format!(
                        "task '{}' depends on itself",
                        agent.id
                    )));
                }
                *indegree.get_mut(&agent.id).expect("known id") += 1;
                dependents
                    .get_mut(dep)
                    .expect("known id")
                    .push(agent.id.clone());
            }
        }

        let graph = Self {
            order,
            insertion,
            dependents,
            indegree,
        };
        graph.reject_cycles()?;
        Ok(graph)
    }

    /// Kahn's algorithm over a scratch in-degree map; any unprocessed node
    /// sits on a cycle.
    fn reject_cycles(&self) -> Result<()> {
        let mut indegree = self.indegree.clone();
        let mut queue: Vec<&String> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| self.insertion.get_key_value(id).expect("known id").0)
            .collect();
        let mut processed = 0;

        while let Some(id) = queue.pop() {
            processed += 1;
            for dep in self.dependents_of(id) {
                let deg = indegree.get_mut(dep).expect("known id");
                *deg -= 1;
                if *deg == 0 {
                    queue.push(dep);
                }
            }
        }

        if processed != self.order.len() {
            return Err(CoreError::Config(
                "task dependencies contain a cycle".into(),
            ));
        }
        Ok(())
    }

    fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn insertion_index(&self, id: &str) -> usize {
        *self.insertion.get(id).expect("known id")
    }

    /// All transitive dependents of `id`, depth-first.
    fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependents_of(id).iter().map(String::as_str).collect();
        let mut out = Vec::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            out.push(current.to_string());
            stack.extend(self.dependents_of(current).iter().map(String::as_str));
        }
        out
    }
}
