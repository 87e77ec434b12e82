//! The cell composite: one port, one working tree, one child server, one
//! client, owned together. Activities here are the atomic work units the
//! engine invokes.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{AgentApi, AgentClient, PromptOptions};
use crate::gates::{self, LintResult, ReviewResult, TestResult};
use crate::ports::PortAllocator;
use crate::server::{ServerError, ServerHandle, ServerSupervisor};
use crate::worktree::WorktreeService;
use crate::{CoreError, Result};

/// The quadruple owned by one task. All four members exist together or not
/// at all; `teardown` releases them in reverse acquisition order.
#[derive(Clone)]
pub struct Cell {
    pub id: String,
    pub port: u16,
    pub tree_id: String,
    pub tree_path: PathBuf,
    pub server: ServerHandle,
    pub client: Arc<dyn AgentApi>,
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("tree_id", &self.tree_id)
            .field("tree_path", &self.tree_path)
            .finish()
    }
}

/// Outcome of one `execute` activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub files_modified: Vec<String>,
    pub session_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// The activity set the engine drives a task through. Production wires
/// [`CellActivities`]; scenario tests substitute a scripted in-memory driver.
#[async_trait]
pub trait CellDriver: Send + Sync {
    /// Allocate a port, create a tree, boot a server, wire a client.
    /// Unwinds every completed step when a later one fails.
    async fn bootstrap(&self, cell_id: &str, branch: &str) -> Result<Cell>;

    /// Send a prompt with a role label and collect output plus the modified
    /// file list.
    async fn execute(
        &self,
        cell: &Cell,
        prompt: &str,
        role: &str,
        session_id: Option<&str>,
    ) -> Result<ExecutionResult>;

    /// Invoke the test suite inside the cell and parse the outcome.
    async fn run_tests(&self, cell: &Cell) -> Result<TestResult>;

    /// Static checks over the produced code.
    async fn run_lint(&self, cell: &Cell) -> Result<LintResult>;

    /// One reviewer pass over an artifact description.
    async fn review(
        &self,
        cell: &Cell,
        role: &str,
        advisory: bool,
        artifact: &str,
    ) -> Result<ReviewResult>;

    /// Stage and commit everything in the tree. Only called after a passing
    /// test run on the same state.
    async fn commit(&self, cell: &Cell, session_id: Option<&str>, message: &str) -> Result<()>;

    /// Reset the tree to HEAD, discarding uncommitted work.
    async fn revert(&self, cell: &Cell, session_id: Option<&str>) -> Result<()>;

    async fn abort_session(&self, cell: &Cell, session_id: &str) -> Result<()>;

    /// Drop a session between regenerations. Best-effort.
    async fn discard_session(&self, cell: &Cell, session_id: &str) -> Result<()>;

    async fn is_healthy(&self, cell: &Cell) -> bool;

    /// Release server, tree and port. Attempts every step even when an
    /// earlier one fails; errors are aggregated.
    async fn teardown(&self, cell: Cell) -> Result<()>;
}

/// Constructs an [`AgentApi`] for a booted server. Injectable so tests can
/// wire an in-memory agent behind a real (or fake) server handle.
pub type ClientFactory = Arc<dyn Fn(&str, u16) -> Arc<dyn AgentApi> + Send + Sync>;

/// Production [`CellDriver`] over the four leaf services.
pub struct CellActivities {
    ports: Arc<PortAllocator>,
    worktrees: Arc<WorktreeService>,
    servers: Arc<ServerSupervisor>,
    clients: ClientFactory,
}

/// Steps completed so far during a bootstrap, unwound on failure. The
/// success path hands the resources to the `Cell` and never runs this.
#[derive(Default)]
struct Unwind {
    port: Option<u16>,
    tree_id: Option<String>,
    server: Option<ServerHandle>,
}

impl CellActivities {
    pub fn new(
        ports: Arc<PortAllocator>,
        worktrees: Arc<WorktreeService>,
        servers: Arc<ServerSupervisor>,
    ) -> Self {
        Self {
            ports,
            worktrees,
            servers,
            clients: Arc::new(|base_url, port| Arc::new(AgentClient::new(base_url, port))),
        }
    }

    /// Replace the client factory (tests wire an in-memory agent here).
    pub fn with_client_factory(mut self, clients: ClientFactory) -> Self {
        self.clients = clients;
        self
    }

    async fn bootstrap_inner(
        &self,
        cell_id: &str,
        branch: &str,
        port: u16,
        unwind: &mut Unwind,
    ) -> Result<Cell> {
        let tree_id = format!("{cell_id}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"));
        let tree = self.worktrees.create(&tree_id, branch).await?;
        unwind.tree_id = Some(tree_id.clone());

        let server = self.servers.start(port as u32, &tree.path).await?;
        unwind.server = Some(server.clone());

        let client = (self.clients)(&server.base_url, port);

        Ok(Cell {
            id: cell_id.to_string(),
            port,
            tree_id,
            tree_path: tree.path,
            server,
            client,
        })
    }

    /// Undo completed bootstrap steps in reverse order. Every failure is
    /// logged; none is surfaced, the original bootstrap error is the one
    /// the caller sees.
    async fn unwind(&self, unwind: Unwind) {
        if let Some(server) = unwind.server {
            if let Err(e) = self.servers.shutdown(&server).await {
                warn!(port = server.port, error = %e, "bootstrap unwind: server shutdown failed");
            }
        }
        if let Some(tree_id) = unwind.tree_id {
            if let Err(e) = self.worktrees.remove(&tree_id).await {
                warn!(tree_id, error = %e, "bootstrap unwind: tree removal failed");
            }
        }
        if let Some(port) = unwind.port {
            if let Err(e) = self.ports.release(port) {
                warn!(port, error = %e, "bootstrap unwind: port release failed");
            }
        }
    }
}

#[async_trait]
impl CellDriver for CellActivities {
    async fn bootstrap(&self, cell_id: &str, branch: &str) -> Result<Cell> {
        let port = self.ports.allocate()?;
        let mut unwind = Unwind {
            port: Some(port),
            ..Default::default()
        };

        match self.bootstrap_inner(cell_id, branch, port, &mut unwind).await {
            Ok(cell) => {
                // Success disarms the unwind: the cell now owns everything.
                info!(
                    cell_id,
                    port,
                    tree = %cell.tree_path.display(),
                    "cell bootstrapped"
                );
                Ok(cell)
            }
            Err(e) => {
                warn!(cell_id, port, error = %e, "bootstrap failed; unwinding");
                self.unwind(unwind).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        cell: &Cell,
        prompt: &str,
        role: &str,
        session_id: Option<&str>,
    ) -> Result<ExecutionResult> {
        if !self.servers.is_healthy(&cell.server).await {
            return Err(ServerError::Unhealthy { port: cell.port }.into());
        }

        let result = cell
            .client
            .execute_prompt(
                prompt,
                PromptOptions {
                    agent_role: Some(role.to_string()),
                    session_id: session_id.map(str::to_string),
                    title: Some(cell.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let files = cell.client.file_status().await?;

        Ok(ExecutionResult {
            success: true,
            output: result.text(),
            files_modified: files.into_iter().map(|f| f.path).collect(),
            session_id: result.session_id,
            error: None,
        })
    }

    async fn run_tests(&self, cell: &Cell) -> Result<TestResult> {
        let result = cell
            .client
            .execute_prompt(
                "Run the project's test suite and report the full runner output, \
                 including the pass/fail counts, verbatim. Do not modify any files.",
                PromptOptions {
                    agent_role: Some("test".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(gates::parse_test_output(&result.text(), None))
    }

    async fn run_lint(&self, cell: &Cell) -> Result<LintResult> {
        let result = cell
            .client
            .execute_prompt(
                "Run the project's lint checks and report every warning and error \
                 line verbatim. Do not modify any files.",
                PromptOptions {
                    agent_role: Some("lint".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(gates::parse_lint_output(&result.text(), None))
    }

    async fn review(
        &self,
        cell: &Cell,
        role: &str,
        advisory: bool,
        artifact: &str,
    ) -> Result<ReviewResult> {
        let prompt = format!(
            "Review the following change for your area of responsibility.\n\
             End your answer with a single-word verdict: APPROVE or REJECT.\n\n{artifact}"
        );
        let result = cell
            .client
            .execute_prompt(
                &prompt,
                PromptOptions {
                    agent_role: Some(role.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(gates::parse_review_output(role, &result.text(), advisory))
    }

    async fn commit(&self, cell: &Cell, session_id: Option<&str>, message: &str) -> Result<()> {
        let command = format!("git add . && git commit -m {}", shell_quote(message));
        match session_id {
            Some(session) => {
                cell.client.execute_command(session, &command, &[]).await?;
            }
            None => {
                cell.client
                    .execute_prompt(
                        &format!("Run exactly this command and nothing else: {command}"),
                        PromptOptions {
                            agent_role: Some("build".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        info!(cell_id = %cell.id, "committed cell work");
        Ok(())
    }

    async fn revert(&self, cell: &Cell, session_id: Option<&str>) -> Result<()> {
        let command = "git reset --hard HEAD";
        match session_id {
            Some(session) => {
                cell.client.execute_command(session, command, &[]).await?;
            }
            None => {
                cell.client
                    .execute_prompt(
                        &format!("Run exactly this command and nothing else: {command}"),
                        PromptOptions {
                            agent_role: Some("build".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        info!(cell_id = %cell.id, "reverted cell work");
        Ok(())
    }

    async fn abort_session(&self, cell: &Cell, session_id: &str) -> Result<()> {
        cell.client.abort_session(session_id).await?;
        Ok(())
    }

    async fn discard_session(&self, cell: &Cell, session_id: &str) -> Result<()> {
        cell.client.delete_session(session_id).await?;
        Ok(())
    }

    async fn is_healthy(&self, cell: &Cell) -> bool {
        self.servers.is_healthy(&cell.server).await
    }

    async fn teardown(&self, cell: Cell) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        if let Err(e) = self.servers.shutdown(&cell.server).await {
            warn!(cell_id = %cell.id, error = %e, "teardown: server shutdown failed");
            failures.push(format!("server: {e}"));
        }

        if let Err(e) = self.worktrees.remove(&cell.tree_id).await {
            warn!(cell_id = %cell.id, error = %e, "teardown: tree removal failed");
            failures.push(format!("worktree: {e}"));
        }

        if let Err(e) = self.ports.release(cell.port) {
            warn!(cell_id = %cell.id, port = cell.port, error = %e, "teardown: port release failed");
            failures.push(format!("port: {e}"));
        }

        if failures.is_empty() {
            info!(cell_id = %cell.id, port = cell.port, "cell torn down");
            Ok(())
        } else {
            Err(CoreError::Teardown(failures.join("; ")))
        }
    }
}

/// Single-quote a string for the shell command line the agent runs.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
