//! TCR workflow engine: drives one task through bootstrap, the quality
//! gates, commit-or-revert, and teardown.
//!
//! Two modes share the skeleton. Basic is prompt → tests → commit|revert.
//! Enhanced inserts test generation, RED verification, a GREEN fix loop with
//! regeneration, and a reviewer quorum before the commit.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cell::{Cell, CellDriver};
use crate::config::{EngineMode, EngineSettings};
use crate::gates::{self, TestResult};
use crate::{CoreError, Result};

// ---------------------------------------------------------------------------
// Task and result types
// ---------------------------------------------------------------------------

/// One unit of work handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    /// Overrides the engine-wide regeneration budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the engine-wide deadline, in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Why a task ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bootstrap or other infrastructure failure.
    Infra,
    /// The generated tests were unusable (lint failure, or RED never failed).
    TestQuality,
    /// GREEN was unreachable within the fix and regeneration budgets.
    Implementation,
    /// A required reviewer rejected.
    Review,
    Timeout,
    Cancelled,
    /// A dependency failed; the task never ran.
    UpstreamFailed,
}

/// One validation step's outcome, appended in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub message: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub advisory: bool,
}

/// Terminal outcome of a task. Written exactly once per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    pub duration_ms: u64,
    /// Annotation only; nothing branches on it.
    pub tokens_estimate: u64,
    pub files_modified: Vec<String>,
    pub gate_results: Vec<GateResult>,
    #[serde(default)]
    pub test_result: Option<TestResult>,
    pub fix_attempts_used: u32,
    pub regenerations_used: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl TaskResult {
    pub fn skipped(task_id: &str, reason: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            failure: Some(FailureKind::UpstreamFailed),
            duration_ms: 0,
            tokens_estimate: 0,
            files_modified: vec![],
            gate_results: vec![],
            test_result: None,
            fix_attempts_used: 0,
            regenerations_used: 0,
            error: Some(reason.to_string()),
            error_kind: Some("upstream-failed".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal run bookkeeping
// ---------------------------------------------------------------------------

/// Mid-flight failure inside the gate phases.
#[derive(Debug)]
struct PhaseFailure {
    kind: FailureKind,
    error_kind: &'static str,
    detail: String,
}

impl PhaseFailure {
    fn new(kind: FailureKind, error_kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            error_kind,
            detail: detail.into(),
        }
    }

    fn from_core(e: &CoreError) -> Self {
        let kind = match e {
            CoreError::Timeout => FailureKind::Timeout,
            CoreError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Infra,
        };
        Self {
            kind,
            error_kind: e.kind(),
            detail: e.to_string(),
        }
    }
}

type PhaseResult = std::result::Result<(), PhaseFailure>;

/// State the gate phases accumulate. Shared behind a mutex so the trace
/// survives the phase future being dropped on timeout or cancellation.
#[derive(Default)]
struct RunState {
    gates: Vec<GateResult>,
    files_modified: Vec<String>,
    test_result: Option<TestResult>,
    live_session: Option<String>,
    tokens_estimate: u64,
    fix_attempts: u32,
    regenerations: u32,
    committed: bool,
    work_started: bool,
}

#[derive(Clone, Default)]
struct SharedState(Arc<Mutex<RunState>>);

impl SharedState {
    fn with<T>(&self, f: impl FnOnce(&mut RunState) -> T) -> T {
        f(&mut self.0.lock().expect("run state poisoned"))
    }

    fn push_gate(&self, gate: GateResult) {
        self.with(|s| s.gates.push(gate));
    }

    fn note_output(&self, output: &str) {
        // Crude chars/4 annotation; usage parts are not assumed.
        self.with(|s| s.tokens_estimate += output.len() as u64 / 4);
    }

    fn merge_files(&self, files: &[String]) {
        self.with(|s| {
            for f in files {
                if !s.files_modified.contains(f) {
                    s.files_modified.push(f.clone());
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives tasks through the TCR state machine over an injected
/// [`CellDriver`].
pub struct TcrEngine {
    driver: Arc<dyn CellDriver>,
    settings: EngineSettings,
    branch: String,
    heartbeat_tx: watch::Sender<u64>,
    heartbeat_rx: watch::Receiver<u64>,
}

impl TcrEngine {
    pub fn new(driver: Arc<dyn CellDriver>, settings: EngineSettings, branch: String) -> Self {
        let (heartbeat_tx, heartbeat_rx) = watch::channel(0);
        Self {
            driver,
            settings,
            branch,
            heartbeat_tx,
            heartbeat_rx,
        }
    }

    /// Subscribe to liveness beats. The counter increases while the engine
    /// makes progress; a stalled counter means a dead worker.
    pub fn heartbeat(&self) -> watch::Receiver<u64> {
        self.heartbeat_rx.clone()
    }

    fn beat(&self) {
        self.heartbeat_tx.send_modify(|n| *n += 1);
    }

    /// Run one task to a terminal [`TaskResult`]. Never panics the worker:
    /// every failure path folds into the result.
    pub async fn run(&self, task: &TaskSpec, cancel: CancellationToken) -> TaskResult {
        let started = tokio::time::Instant::now();
        let state = SharedState::default();

        info!(task_id = %task.id, mode = ?self.settings.mode, "task started");

        // Bootstrap is fatal on failure; there is nothing to tear down that
        // the activity has not already unwound.
        let cell_id = format!("cell-{}", task.id);
        let bootstrap_started = tokio::time::Instant::now();
        let cell = match self.driver.bootstrap(&cell_id, &self.branch).await {
            Ok(cell) => {
                state.push_gate(GateResult {
                    gate: "bootstrap".into(),
                    passed: true,
                    message: format!("cell on port {}", cell.port),
                    duration_ms: bootstrap_started.elapsed().as_millis() as u64,
                    error: None,
                    advisory: false,
                });
                cell
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "bootstrap failed");
                state.push_gate(GateResult {
                    gate: "bootstrap".into(),
                    passed: false,
                    message: "bootstrap failed".into(),
                    duration_ms: bootstrap_started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    advisory: false,
                });
                return self.finish(
                    task,
                    started,
                    state,
                    Err(PhaseFailure {
                        kind: FailureKind::Infra,
                        error_kind: e.kind(),
                        detail: e.to_string(),
                    }),
                );
            }
        };
        self.beat();

        // Liveness ticker for the whole gate phase; individual beats also
        // land at gate boundaries.
        let ticker = {
            let tx = self.heartbeat_tx.clone();
            let interval = Duration::from_secs(self.settings.heartbeat_interval_seconds.max(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    tx.send_modify(|n| *n += 1);
                }
            })
        };

        let deadline = Duration::from_secs(
            task.timeout_seconds
                .unwrap_or(self.settings.task_timeout_seconds),
        );

        let phase = async {
            match self.settings.mode {
                EngineMode::Basic => self.run_basic(&cell, task, &state).await,
                EngineMode::Enhanced => self.run_enhanced(&cell, task, &state).await,
            }
        };

        let outcome: PhaseResult = tokio::select! {
            r = phase => r,
            _ = tokio::time::sleep(deadline) => Err(PhaseFailure::new(
                FailureKind::Timeout,
                "timeout",
                format!("deadline of {deadline:?} expired"),
            )),
            _ = cancel.cancelled() => Err(PhaseFailure::new(
                FailureKind::Cancelled,
                "cancelled",
                "cancellation observed",
            )),
        };

        ticker.abort();

        // Orderly abort of the in-flight session on timeout or cancellation.
        if let Err(failure) = &outcome {
            if matches!(failure.kind, FailureKind::Timeout | FailureKind::Cancelled) {
                if let Some(session) = state.with(|s| s.live_session.clone()) {
                    if let Err(e) = self.driver.abort_session(&cell, &session).await {
                        warn!(task_id = %task.id, error = %e, "session abort failed");
                    }
                }
            }
        }

        // TCR discipline: a failed task leaves no half-done work behind.
        let needs_revert =
            outcome.is_err() && state.with(|s| s.work_started && !s.committed);
        if needs_revert {
            let session = state.with(|s| s.live_session.clone());
            if let Err(e) = self.driver.revert(&cell, session.as_deref()).await {
                warn!(task_id = %task.id, error = %e, "revert after failure did not complete");
            }
        }

        // Teardown always runs and never shadows the task's own outcome.
        if let Err(e) = self.driver.teardown(cell).await {
            error!(task_id = %task.id, error = %e, "teardown incomplete");
        }
        self.beat();

        self.finish(task, started, state, outcome)
    }

    fn finish(
        &self,
        task: &TaskSpec,
        started: tokio::time::Instant,
        state: SharedState,
        outcome: PhaseResult,
    ) -> TaskResult {
        let (gates, files, test_result, tokens, fixes, regens) = state.with(|s| {
            (
                std::mem::take(&mut s.gates),
                std::mem::take(&mut s.files_modified),
                s.test_result.clone(),
                s.tokens_estimate,
                s.fix_attempts,
                s.regenerations,
            )
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(()) => TaskResult {
                task_id: task.id.clone(),
                success: true,
                failure: None,
                duration_ms,
                tokens_estimate: tokens,
                files_modified: files,
                gate_results: gates,
                test_result,
                fix_attempts_used: fixes,
                regenerations_used: regens,
                error: None,
                error_kind: None,
            },
            Err(failure) => TaskResult {
                task_id: task.id.clone(),
                success: false,
                failure: Some(failure.kind),
                duration_ms,
                tokens_estimate: tokens,
                files_modified: files,
                gate_results: gates,
                test_result,
                fix_attempts_used: fixes,
                regenerations_used: regens,
                error: Some(failure.detail),
                error_kind: Some(failure.error_kind.to_string()),
            },
        };

        info!(
            task_id = %task.id,
            success = result.success,
            failure = ?result.failure,
            duration_ms,
            gates = result.gate_results.len(),
            "task finished"
        );
        result
    }

    // -----------------------------------------------------------------------
    // Basic mode: execute → tests → commit|revert
    // -----------------------------------------------------------------------

    async fn run_basic(&self, cell: &Cell, task: &TaskSpec, state: &SharedState) -> PhaseResult {
        let prompt = build_prompt(task);

        let exec = self
            .gate(state, "execute", || async {
                self.retried("execute", || {
                    self.driver.execute(cell, &prompt, "build", None)
                })
                .await
            })
            .await
            .map_err(|e| PhaseFailure::from_core(&e))?;

        state.with(|s| {
            s.live_session = Some(exec.session_id.clone());
            s.work_started = true;
        });
        state.note_output(&exec.output);
        state.merge_files(&exec.files_modified);

        let tests = self
            .gate_expect(state, "tests", true, || async {
                self.retried("run_tests", || self.driver.run_tests(cell)).await
            })
            .await
            .map_err(|e| PhaseFailure::from_core(&e))?;

        state.with(|s| s.test_result = Some(tests.clone()));

        if tests.passing {
            let session = exec.session_id.clone();
            // Commit is not idempotent: one attempt, no retry.
            self.gate(state, "commit", || async {
                self.driver.commit(cell, Some(&session), &task.title).await
            })
            .await
            .map_err(|e| PhaseFailure::from_core(&e))?;
            state.with(|s| s.committed = true);
            Ok(())
        } else {
            let session = exec.session_id.clone();
            let _ = self
                .gate(state, "revert", || async {
                    self.driver.revert(cell, Some(&session)).await
                })
                .await;
            state.with(|s| s.work_started = false);
            Err(PhaseFailure::new(
                FailureKind::Implementation,
                "gate.tests-failing",
                format!("{} of {} tests failed", tests.failed, tests.total),
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Enhanced mode: test-gen → test-lint → RED → impl → GREEN → review
    // -----------------------------------------------------------------------

    async fn run_enhanced(&self, cell: &Cell, task: &TaskSpec, state: &SharedState) -> PhaseResult {
        // Generate tests from the acceptance criteria.
        let testgen_prompt = build_test_gen_prompt(task);
        let testgen = self
            .gate(state, "test-gen", || async {
                self.retried("test-gen", || {
                    self.driver.execute(cell, &testgen_prompt, "test", None)
                })
                .await
            })
            .await
            .map_err(|e| PhaseFailure::from_core(&e))?;

        state.with(|s| {
            s.live_session = Some(testgen.session_id.clone());
            s.work_started = true;
        });
        state.note_output(&testgen.output);
        state.merge_files(&testgen.files_modified);

        // Static checks on the produced test code.
        let lint = self
            .gate(state, "test-lint", || async {
                self.retried("run_lint", || self.driver.run_lint(cell)).await
            })
            .await
            .map_err(|e| PhaseFailure::from_core(&e))?;

        if !lint.passing {
            return Err(PhaseFailure::new(
                FailureKind::TestQuality,
                "gate.test-lint",
                format!("lint rejected generated tests: {}", lint.critical.join("; ")),
            ));
        }

        // RED verification: the intended tests must fail before any
        // implementation.
        // Passing here means stub or no-op tests; that is fatal, never
        // retried or regenerated.
        let red = self
            .gate_expect(state, "verify-red", false, || async {
                self.retried("run_tests", || self.driver.run_tests(cell)).await
            })
            .await
            .map_err(|e| PhaseFailure::from_core(&e))?;

        state.with(|s| s.test_result = Some(red.clone()));

        if red.passing {
            return Err(PhaseFailure::new(
                FailureKind::TestQuality,
                "gate.red-not-failing",
                "generated tests pass before implementation (stub or no-op tests)",
            ));
        }

        // Implementation with the GREEN fix loop, escalating to
        // regeneration with a fresh session.
        let max_retries = task.max_retries.unwrap_or(self.settings.max_retries);
        let impl_session = self.green_loop(cell, task, state, max_retries).await?;

        // Reviewer quorum over the finished change.
        let artifact = state.with(|s| describe_artifact(task, &s.files_modified, &s.test_result));
        let decision = self.review_gate(cell, state, &artifact).await?;

        if !decision.approved {
            return Err(PhaseFailure::new(
                FailureKind::Review,
                "gate.reviewer-reject",
                decision.rejection_rationales().join(" | "),
            ));
        }

        // Commit only happens with GREEN tests and reviewer approval, in the
        // same cell the tests just passed in. One attempt, no retry.
        self.gate(state, "commit", || async {
            self.driver.commit(cell, Some(&impl_session), &task.title).await
        })
        .await
        .map_err(|e| PhaseFailure::from_core(&e))?;
        state.with(|s| s.committed = true);

        Ok(())
    }

    /// Implementation generation plus the GREEN verification fix loop.
    /// Returns the session id the accepted implementation lives in.
    async fn green_loop(
        &self,
        cell: &Cell,
        task: &TaskSpec,
        state: &SharedState,
        max_retries: u32,
    ) -> std::result::Result<String, PhaseFailure> {
        // Attempt 0 is the first generation; every further attempt is a
        // regeneration with a fresh session.
        let mut attempt = 0u32;

        loop {
            let impl_prompt = build_impl_prompt(task, attempt);
            let exec = self
                .gate(state, "implementation", || async {
                    self.retried("implementation", || {
                        self.driver.execute(cell, &impl_prompt, "build", None)
                    })
                    .await
                })
                .await
                .map_err(|e| PhaseFailure::from_core(&e))?;

            let impl_session = exec.session_id.clone();
            state.with(|s| s.live_session = Some(impl_session.clone()));
            state.note_output(&exec.output);
            state.merge_files(&exec.files_modified);

            // Run tests; on failure re-prompt within the same session so
            // the agent keeps its context.
            let mut fix_attempts = 0u32;
            let green = loop {
                let tests = self
                    .gate_expect(state, "verify-green", true, || async {
                        self.retried("run_tests", || self.driver.run_tests(cell)).await
                    })
                    .await
                    .map_err(|e| PhaseFailure::from_core(&e))?;

                state.with(|s| s.test_result = Some(tests.clone()));

                if tests.passing {
                    break true;
                }
                if fix_attempts >= self.settings.max_fix_attempts {
                    break false;
                }

                fix_attempts += 1;
                state.with(|s| s.fix_attempts += 1);
                debug!(
                    task_id = %task.id,
                    fix_attempts,
                    attempt,
                    "tests still failing; issuing fix prompt"
                );

                let fix_prompt = build_fix_prompt(&tests);
                let fix = self
                    .retried("fix", || {
                        self.driver
                            .execute(cell, &fix_prompt, "build", Some(&impl_session))
                    })
                    .await
                    .map_err(|e| PhaseFailure::from_core(&e))?;
                state.note_output(&fix.output);
                state.merge_files(&fix.files_modified);
            };

            if green {
                return Ok(impl_session);
            }

            // Escalate: discard the poisoned session before regenerating.
            if let Err(e) = self.driver.discard_session(cell, &impl_session).await {
                debug!(task_id = %task.id, error = %e, "session discard failed (ignored)");
            }

            if attempt >= max_retries {
                return Err(PhaseFailure::new(
                    FailureKind::Implementation,
                    "gate.green-unreachable",
                    format!(
                        "tests never passed after {} generation attempts \
                         ({} fix prompts each)",
                        attempt + 1,
                        self.settings.max_fix_attempts
                    ),
                ));
            }
            attempt += 1;
            state.with(|s| s.regenerations = attempt);
            warn!(
                task_id = %task.id,
                regeneration = attempt,
                max_retries,
                "fix budget exhausted; regenerating implementation"
            );
        }
    }

    /// Fan reviewers out in parallel and join before deciding.
    async fn review_gate(
        &self,
        cell: &Cell,
        state: &SharedState,
        artifact: &str,
    ) -> std::result::Result<gates::ReviewDecision, PhaseFailure> {
        let started = tokio::time::Instant::now();
        let mut set = JoinSet::new();

        for reviewer in &self.settings.reviewers {
            let driver = Arc::clone(&self.driver);
            let cell = cell.clone();
            let role = reviewer.role.clone();
            let advisory = reviewer.advisory;
            let artifact = artifact.to_string();
            set.spawn(async move {
                driver.review(&cell, &role, advisory, &artifact).await
            });
        }

        let mut votes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(vote)) => votes.push(vote),
                Ok(Err(e)) => {
                    self.record_gate(state, "review", false, started, Some(e.to_string()), false);
                    return Err(PhaseFailure::from_core(&e));
                }
                Err(e) => {
                    self.record_gate(state, "review", false, started, Some(e.to_string()), false);
                    return Err(PhaseFailure::new(
                        FailureKind::Infra,
                        "review.worker-died",
                        format!("reviewer task panicked: {e}"),
                    ));
                }
            }
        }
        self.beat();

        // Individual votes land in the trace; advisory ones are marked.
        for vote in &votes {
            state.push_gate(GateResult {
                gate: format!("review:{}", vote.role),
                passed: vote.vote == gates::ReviewVote::Approve,
                message: vote.rationale.chars().take(200).collect(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
                advisory: vote.advisory,
            });
        }

        let decision = gates::aggregate_reviews(votes);
        self.record_gate(
            state,
            "review",
            decision.approved,
            started,
            None,
            false,
        );
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Gate plumbing
    // -----------------------------------------------------------------------

    /// Run one gate body, record its result, and beat the heartbeat.
    async fn gate<T, Fut>(
        &self,
        state: &SharedState,
        name: &str,
        body: impl FnOnce() -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let started = tokio::time::Instant::now();
        match body().await {
            Ok(value) => {
                self.record_gate(state, name, true, started, None, false);
                Ok(value)
            }
            Err(e) => {
                self.record_gate(state, name, false, started, Some(e.to_string()), false);
                Err(e)
            }
        }
    }

    /// Like [`Self::gate`], but for test gates whose pass/fail is judged
    /// against an expected polarity (RED expects failing tests).
    async fn gate_expect<Fut>(
        &self,
        state: &SharedState,
        name: &str,
        expect_passing: bool,
        body: impl FnOnce() -> Fut,
    ) -> Result<TestResult>
    where
        Fut: Future<Output = Result<TestResult>>,
    {
        let started = tokio::time::Instant::now();
        match body().await {
            Ok(tests) => {
                let ok = tests.passing == expect_passing;
                let message = format!(
                    "{} passed, {} failed (expected {})",
                    tests.passed,
                    tests.failed,
                    if expect_passing { "GREEN" } else { "RED" }
                );
                let gate = GateResult {
                    gate: name.to_string(),
                    passed: ok,
                    message,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                    advisory: false,
                };
                state.push_gate(gate);
                self.beat();
                Ok(tests)
            }
            Err(e) => {
                self.record_gate(state, name, false, started, Some(e.to_string()), false);
                Err(e)
            }
        }
    }

    fn record_gate(
        &self,
        state: &SharedState,
        name: &str,
        passed: bool,
        started: tokio::time::Instant,
        error: Option<String>,
        advisory: bool,
    ) {
        state.push_gate(GateResult {
            gate: name.to_string(),
            passed,
            message: if passed { "ok".into() } else { "failed".into() },
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            advisory,
        });
        self.beat();
    }

    /// Exponential-backoff retry for transient activity failures.
    async fn retried<T, Fut>(&self, name: &str, op: impl Fn() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(self.settings.retry_initial_delay_ms);
        let mut attempt = 1u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.settings.retry_max_attempts && is_transient(&e) => {
                    warn!(
                        op = name,
                        attempt,
                        max = self.settings.retry_max_attempts,
                        error = %e,
                        "activity failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= self.settings.retry_factor;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transient failures are absorbed by the retry loop; structural ones
/// surface immediately.
fn is_transient(e: &CoreError) -> bool {
    matches!(
        e,
        CoreError::Client(_) | CoreError::Server(crate::server::ServerError::Unhealthy { .. })
    )
}

// ---------------------------------------------------------------------------
// Prompt builders
// ---------------------------------------------------------------------------

fn build_prompt(task: &TaskSpec) -> String {
    format!(
        "# Task: {}\n\n{}\n\n## Acceptance criteria\n{}\n\n\
         Implement the task. Make sure the project's tests pass when you are done.",
        task.title, task.description, task.acceptance_criteria
    )
}

fn build_test_gen_prompt(task: &TaskSpec) -> String {
    format!(
        "# Task: {}\n\n{}\n\n## Acceptance criteria\n{}\n\n\
         Write tests that express the acceptance criteria. Do NOT implement \
         the feature itself; the new tests must fail against the current code. \
         Stub or trivially-true tests are unacceptable.",
        task.title, task.description, task.acceptance_criteria
    )
}

fn build_impl_prompt(task: &TaskSpec, regeneration: u32) -> String {
    let retry_note = if regeneration > 0 {
        "\n\nA previous attempt did not make the tests pass; start over cleanly."
    } else {
        ""
    };
    format!(
        "# Task: {}\n\n{}\n\n## Acceptance criteria\n{}\n\n\
         Tests for this task already exist and currently fail. Implement the \
         feature so that the whole test suite passes. Do not weaken or delete \
         the tests.{retry_note}",
        task.title, task.description, task.acceptance_criteria
    )
}

fn build_fix_prompt(tests: &TestResult) -> String {
    format!(
        "The test suite still fails ({} of {} tests failing). Fix the \
         implementation, not the tests. Runner output:\n\n{}",
        tests.failed,
        tests.total,
        tail(&tests.output, 4_000)
    )
}

fn describe_artifact(
    task: &TaskSpec,
    files: &[String],
    tests: &Option<TestResult>,
) -> String {
    let test_line = match tests {
        Some(t) => format!("{} passed, {} failed", t.passed, t.failed),
        None => "not run".to_string(),
    };
    format!(
        "Task: {}\n{}\n\nFiles modified:\n{}\n\nTest status: {}",
        task.title,
        task.description,
        files.join("\n"),
        test_line
    )
}

/// Last `max` characters of a string, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let (idx, _) = s.char_indices().nth(skip).expect("index within bounds");
    &s[idx..]
}
