//! Shared test doubles: a scripted in-memory `CellDriver` that fabricates
//! cells, replays configured gate outcomes, and records every activity call
//! so scenarios can assert on traces and resource discipline.

// Each scenario binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mitosis_core::cell::{Cell, CellDriver, ExecutionResult};
use mitosis_core::client::{
    AgentApi, ClientError, FileStatus, PromptOptions, PromptResult, Session,
};
use mitosis_core::gates::{LintResult, ReviewResult, ReviewVote, TestResult};
use mitosis_core::ports::PortAllocator;
use mitosis_core::server::ServerHandle;
use mitosis_core::worktree::WorktreeError;
use mitosis_core::{CoreError, Result};

/// Agent stub for the `Cell` the scripted driver fabricates. Never called:
/// the driver answers at the activity level.
pub struct NullAgent;

#[async_trait]
impl AgentApi for NullAgent {
    async fn execute_prompt(
        &self,
        _prompt: &str,
        opts: PromptOptions,
    ) -> std::result::Result<PromptResult, ClientError> {
        Ok(PromptResult {
            session_id: opts.session_id.unwrap_or_else(|| "null".into()),
            message_id: None,
            parts: vec![],
        })
    }

    async fn execute_command(
        &self,
        session_id: &str,
        _command: &str,
        _args: &[String],
    ) -> std::result::Result<PromptResult, ClientError> {
        Ok(PromptResult {
            session_id: session_id.to_string(),
            message_id: None,
            parts: vec![],
        })
    }

    async fn list_sessions(&self) -> std::result::Result<Vec<Session>, ClientError> {
        Ok(vec![])
    }

    async fn get_session(&self, id: &str) -> std::result::Result<Session, ClientError> {
        Ok(Session {
            id: id.to_string(),
            title: None,
        })
    }

    async fn delete_session(&self, _id: &str) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    async fn abort_session(&self, _id: &str) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    async fn file_status(&self) -> std::result::Result<Vec<FileStatus>, ClientError> {
        Ok(vec![])
    }

    async fn read_file(&self, _path: &str) -> std::result::Result<String, ClientError> {
        Ok(String::new())
    }
}

/// Scripted behaviour for one task.
#[derive(Debug, Clone)]
pub struct TaskScript {
    /// Bootstrap fails with a backend error.
    pub bootstrap_fails: bool,
    /// Simulated agent work per execute call.
    pub work_delay: Duration,
    /// Every execute call fails like a dropped HTTP connection.
    pub execute_fails: bool,
    /// Execute with this role never returns (deadline / cancellation
    /// scenarios).
    pub hang_on_role: Option<String>,
    /// Successive `run_tests` outcomes as (passed, failed); the last entry
    /// repeats once the script runs out.
    pub test_outcomes: Vec<(u32, u32)>,
    pub lint_ok: bool,
    /// Reviewer roles voting reject.
    pub reject_roles: Vec<String>,
}

impl Default for TaskScript {
    fn default() -> Self {
        Self {
            bootstrap_fails: false,
            work_delay: Duration::ZERO,
            execute_fails: false,
            hang_on_role: None,
            // RED first, GREEN afterwards: the enhanced happy path.
            test_outcomes: vec![(0, 3), (5, 0)],
            lint_ok: true,
            reject_roles: vec![],
        }
    }
}

impl TaskScript {
    /// Happy path for basic mode: a single passing test run.
    pub fn basic_happy() -> Self {
        Self {
            test_outcomes: vec![(5, 0)],
            ..Default::default()
        }
    }
}

/// One recorded activity call: (task id, operation).
pub type Event = (String, Op);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Bootstrap,
    BootstrapFailed,
    Execute(String),
    RunTests,
    RunLint,
    Review(String),
    Commit,
    Revert,
    AbortSession,
    DiscardSession,
    Teardown,
}

#[derive(Default)]
struct DriverState {
    events: Vec<Event>,
    test_cursor: HashMap<String, usize>,
    active: HashSet<String>,
    high_water: usize,
    cell_ports: HashMap<String, u16>,
}

/// In-memory [`CellDriver`] with per-task scripts.
pub struct ScriptedDriver {
    scripts: HashMap<String, TaskScript>,
    default_script: TaskScript,
    /// When present, bootstrap really allocates (and teardown releases) so
    /// tests can assert port discipline and exhaustion behaviour.
    ports: Option<Arc<PortAllocator>>,
    state: Mutex<DriverState>,
    session_counter: AtomicU64,
}

impl ScriptedDriver {
    pub fn new(default_script: TaskScript) -> Self {
        Self {
            scripts: HashMap::new(),
            default_script,
            ports: None,
            state: Mutex::new(DriverState::default()),
            session_counter: AtomicU64::new(0),
        }
    }

    pub fn with_script(mut self, task_id: &str, script: TaskScript) -> Self {
        self.scripts.insert(task_id.to_string(), script);
        self
    }

    pub fn with_ports(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    fn script_for(&self, task_id: &str) -> &TaskScript {
        self.scripts.get(task_id).unwrap_or(&self.default_script)
    }

    /// Strip the engine's `cell-` prefix to recover the task id.
    fn task_id(cell_id: &str) -> String {
        cell_id.strip_prefix("cell-").unwrap_or(cell_id).to_string()
    }

    fn record(&self, task_id: &str, op: Op) {
        self.state
            .lock()
            .unwrap()
            .events
            .push((task_id.to_string(), op));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn ops_for(&self, task_id: &str) -> Vec<Op> {
        self.events()
            .into_iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, op)| op)
            .collect()
    }

    pub fn count_for(&self, task_id: &str, op: &Op) -> usize {
        self.ops_for(task_id).iter().filter(|o| *o == op).count()
    }

    /// Cells currently live (bootstrapped, not torn down).
    pub fn active_cells(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Most cells ever live at once.
    pub fn high_water(&self) -> usize {
        self.state.lock().unwrap().high_water
    }

    fn next_session(&self, task_id: &str) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::Relaxed);
        format!("sess-{task_id}-{n}")
    }
}

#[async_trait]
impl CellDriver for ScriptedDriver {
    async fn bootstrap(&self, cell_id: &str, _branch: &str) -> Result<Cell> {
        let task_id = Self::task_id(cell_id);
        let script = self.script_for(&task_id).clone();

        if script.bootstrap_fails {
            self.record(&task_id, Op::BootstrapFailed);
            return Err(CoreError::Worktree(WorktreeError::Backend {
                detail: "scripted bootstrap failure".into(),
            }));
        }

        let port = match &self.ports {
            Some(ports) => match ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    self.record(&task_id, Op::BootstrapFailed);
                    return Err(e.into());
                }
            },
            None => 0,
        };

        {
            let mut state = self.state.lock().unwrap();
            state.active.insert(task_id.clone());
            state.high_water = state.high_water.max(state.active.len());
            state.cell_ports.insert(task_id.clone(), port);
        }
        self.record(&task_id, Op::Bootstrap);

        Ok(Cell {
            id: cell_id.to_string(),
            port,
            tree_id: format!("{cell_id}-tree"),
            tree_path: PathBuf::from(format!("/tmp/{cell_id}")),
            server: ServerHandle::detached(
                port,
                0,
                format!("http://localhost:{port}"),
                0,
                PathBuf::new(),
                PathBuf::new(),
            ),
            client: Arc::new(NullAgent),
        })
    }

    async fn execute(
        &self,
        cell: &Cell,
        _prompt: &str,
        role: &str,
        session_id: Option<&str>,
    ) -> Result<ExecutionResult> {
        let task_id = Self::task_id(&cell.id);
        let script = self.script_for(&task_id).clone();
        self.record(&task_id, Op::Execute(role.to_string()));

        if script.hang_on_role.as_deref() == Some(role) {
            tokio::time::sleep(Duration::from_secs(1_000_000)).await;
        }
        if script.execute_fails {
            return Err(CoreError::Client(ClientError::Request {
                url: cell.server.base_url.clone(),
                detail: "connection reset by peer".into(),
            }));
        }
        if !script.work_delay.is_zero() {
            tokio::time::sleep(script.work_delay).await;
        }

        let session = session_id
            .map(str::to_string)
            .unwrap_or_else(|| self.next_session(&task_id));

        Ok(ExecutionResult {
            success: true,
            output: format!("done: {role} for {task_id}"),
            files_modified: vec![format!("src/{task_id}.rs")],
            session_id: session,
            error: None,
        })
    }

    async fn run_tests(&self, cell: &Cell) -> Result<TestResult> {
        let task_id = Self::task_id(&cell.id);
        let script = self.script_for(&task_id).clone();
        self.record(&task_id, Op::RunTests);

        let cursor = {
            let mut state = self.state.lock().unwrap();
            let cursor = state.test_cursor.entry(task_id.clone()).or_insert(0);
            let current = *cursor;
            *cursor += 1;
            current
        };
        let idx = cursor.min(script.test_outcomes.len().saturating_sub(1));
        let (passed, failed) = script.test_outcomes[idx];

        Ok(TestResult {
            total: passed + failed,
            passed,
            failed,
            output: format!("{passed} passed, {failed} failed"),
            exit_code: None,
            passing: failed == 0 && passed > 0,
        })
    }

    async fn run_lint(&self, cell: &Cell) -> Result<LintResult> {
        let task_id = Self::task_id(&cell.id);
        let script = self.script_for(&task_id).clone();
        self.record(&task_id, Op::RunLint);

        Ok(LintResult {
            passing: script.lint_ok,
            issues: vec![],
            critical: if script.lint_ok {
                vec![]
            } else {
                vec!["error: generated test does not compile".into()]
            },
        })
    }

    async fn review(
        &self,
        cell: &Cell,
        role: &str,
        advisory: bool,
        _artifact: &str,
    ) -> Result<ReviewResult> {
        let task_id = Self::task_id(&cell.id);
        let script = self.script_for(&task_id).clone();
        self.record(&task_id, Op::Review(role.to_string()));

        let reject = script.reject_roles.iter().any(|r| r == role);
        Ok(ReviewResult {
            role: role.to_string(),
            vote: if reject {
                ReviewVote::Reject
            } else {
                ReviewVote::Approve
            },
            rationale: if reject {
                format!("{role}: the change does not satisfy the criteria")
            } else {
                format!("{role}: looks correct")
            },
            severity: None,
            advisory,
        })
    }

    async fn commit(&self, cell: &Cell, _session_id: Option<&str>, _message: &str) -> Result<()> {
        let task_id = Self::task_id(&cell.id);
        self.record(&task_id, Op::Commit);
        Ok(())
    }

    async fn revert(&self, cell: &Cell, _session_id: Option<&str>) -> Result<()> {
        let task_id = Self::task_id(&cell.id);
        self.record(&task_id, Op::Revert);
        Ok(())
    }

    async fn abort_session(&self, cell: &Cell, _session_id: &str) -> Result<()> {
        let task_id = Self::task_id(&cell.id);
        self.record(&task_id, Op::AbortSession);
        Ok(())
    }

    async fn discard_session(&self, cell: &Cell, _session_id: &str) -> Result<()> {
        let task_id = Self::task_id(&cell.id);
        self.record(&task_id, Op::DiscardSession);
        Ok(())
    }

    async fn is_healthy(&self, _cell: &Cell) -> bool {
        true
    }

    async fn teardown(&self, cell: Cell) -> Result<()> {
        let task_id = Self::task_id(&cell.id);

        let port = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(&task_id);
            state.cell_ports.remove(&task_id)
        };
        if let (Some(ports), Some(port)) = (&self.ports, port) {
            if port != 0 {
                ports.release(port)?;
            }
        }

        self.record(&task_id, Op::Teardown);
        Ok(())
    }
}

/// Engine settings tuned for scripted tests: short retries, one required
/// reviewer.
pub fn test_settings(mode: mitosis_core::config::EngineMode) -> mitosis_core::config::EngineSettings {
    mitosis_core::config::EngineSettings {
        mode,
        max_fix_attempts: 2,
        max_retries: 2,
        task_timeout_seconds: 3_600,
        heartbeat_interval_seconds: 15,
        reviewers: vec![mitosis_core::config::ReviewerConfig {
            role: "reviewer".into(),
            advisory: false,
        }],
        retry_initial_delay_ms: 10,
        retry_factor: 2,
        retry_max_attempts: 3,
    }
}

pub fn task(id: &str) -> mitosis_core::engine::TaskSpec {
    mitosis_core::engine::TaskSpec {
        id: id.to_string(),
        title: format!("task {id}"),
        description: format!("do the work for {id}"),
        acceptance_criteria: "all tests pass".into(),
        max_retries: None,
        timeout_seconds: None,
    }
}
