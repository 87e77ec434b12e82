use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("port {0} is outside [1, 65535]")]
    InvalidPort(u32),

    #[error("failed to spawn agent server: {0}")]
    Spawn(String),

    #[error("agent server on port {port} exited during boot (status {status})")]
    ExitedDuringBoot { port: u16, status: i32 },

    #[error("agent server on port {port} not healthy after {waited_ms} ms")]
    BootTimeout { port: u16, waited_ms: u64 },

    #[error("agent server on port {port} failed health check")]
    Unhealthy { port: u16 },

    #[error("bootstrap semaphore closed")]
    SemaphoreClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Running child agent process.
///
/// Only the plain fields survive serialization; the live process handle is
/// process-local. After a handle crosses a durable boundary, shutdown falls
/// back to the pid-only path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandle {
    pub port: u16,
    pub pid: u32,
    pub base_url: String,
    pub process_group_id: i32,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    #[serde(skip)]
    pub(crate) child: Option<Arc<Mutex<Child>>>,
}

impl ServerHandle {
    /// Whether the in-process child handle is still attached.
    pub fn has_live_handle(&self) -> bool {
        self.child.is_some()
    }

    /// Rebuild a handle from plain fields, e.g. after deserialization.
    /// Shutdown on a detached handle always takes the pid-only path.
    pub fn detached(
        port: u16,
        pid: u32,
        base_url: String,
        process_group_id: i32,
        stdout_log: PathBuf,
        stderr_log: PathBuf,
    ) -> Self {
        Self {
            port,
            pid,
            base_url,
            process_group_id,
            stdout_log,
            stderr_log,
            child: None,
        }
    }
}

/// Subdirectory inside the working tree that receives server logs.
const LOG_DIR: &str = ".mitosis-logs";

/// Starts child agent servers, confirms readiness over HTTP, and terminates
/// whole process groups on shutdown.
///
/// The bootstrap semaphore is injected, never module-global: concurrent
/// server starts across all cells share the same permit pool, and tests can
/// hand in their own.
pub struct ServerSupervisor {
    config: ServerConfig,
    boot_permits: Arc<Semaphore>,
}

impl ServerSupervisor {
    pub fn new(config: ServerConfig, boot_permits: Arc<Semaphore>) -> Self {
        Self {
            config,
            boot_permits,
        }
    }

    /// Boot an agent server on `port` with `worktree` as its working
    /// directory, returning once it answers `/health` and the settling
    /// interval has elapsed.
    pub async fn start(&self, port: u32, worktree: &Path) -> Result<ServerHandle, ServerError> {
        if port == 0 || port > u16::MAX as u32 {
            return Err(ServerError::InvalidPort(port));
        }
        let port = port as u16;

        let _permit = self
            .boot_permits
            .acquire()
            .await
            .map_err(|_| ServerError::SemaphoreClosed)?;

        let log_dir = worktree.join(LOG_DIR);
        tokio::fs::create_dir_all(&log_dir).await?;
        let stdout_log = log_dir.join(format!("server-{port}.stdout.log"));
        let stderr_log = log_dir.join(format!("server-{port}.stderr.log"));
        let stdout_file = std::fs::File::create(&stdout_log)?;
        let stderr_file = std::fs::File::create(&stderr_log)?;

        let mut cmd = Command::new(&self.config.agent_command);
        cmd.args(&self.config.agent_args)
            .arg("serve")
            .args(["--port", &port.to_string(), "--hostname", "localhost"])
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));

        // Own process group, so shutdown can signal the whole subtree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ServerError::Spawn(format!("{}: {e}", self.config.agent_command)))?;

        let pid = child
            .id()
            .ok_or_else(|| ServerError::Spawn("process exited before pid was read".into()))?;
        let process_group_id = pid as i32;
        let base_url = format!("http://localhost:{port}");

        debug!(port, pid, cwd = %worktree.display(), "spawned agent server");

        if let Err(e) = self.await_healthy(port, &base_url, &mut child).await {
            send_group_signal(process_group_id, GroupSignal::Term);
            if tokio::time::timeout(self.grace(), child.wait()).await.is_err() {
                send_group_signal(process_group_id, GroupSignal::Kill);
                let _ = child.wait().await;
            }
            return Err(e);
        }

        // The health endpoint can answer before the session routes are
        // registered; give the server a settling interval before use.
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;

        info!(port, pid, %base_url, "agent server ready");

        Ok(ServerHandle {
            port,
            pid,
            base_url,
            process_group_id,
            stdout_log,
            stderr_log,
            child: Some(Arc::new(Mutex::new(child))),
        })
    }

    /// Poll `GET {base}/health` until it answers 200 or the boot timeout
    /// elapses. Each probe uses a short-lived client with its own timeout.
    async fn await_healthy(
        &self,
        port: u16,
        base_url: &str,
        child: &mut Child,
    ) -> Result<(), ServerError> {
        let boot_timeout = Duration::from_secs(self.config.boot_timeout_seconds);
        let interval = Duration::from_millis(self.config.health_poll_interval_ms);
        let started = tokio::time::Instant::now();

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(ServerError::ExitedDuringBoot {
                    port,
                    status: status.code().unwrap_or(-1),
                });
            }

            if probe_health(base_url, Duration::from_millis(self.config.health_probe_timeout_ms))
                .await
            {
                return Ok(());
            }

            if started.elapsed() >= boot_timeout {
                return Err(ServerError::BootTimeout {
                    port,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// One health probe against a running server.
    pub async fn is_healthy(&self, handle: &ServerHandle) -> bool {
        probe_health(
            &handle.base_url,
            Duration::from_millis(self.config.health_probe_timeout_ms),
        )
        .await
    }

    /// Shut the server down, preferring the live process handle and falling
    /// back to the pid-only path when the handle was lost.
    pub async fn shutdown(&self, handle: &ServerHandle) -> Result<(), ServerError> {
        match &handle.child {
            Some(child) => {
                debug!(port = handle.port, pid = handle.pid, "shutting down agent server");
                send_group_signal(handle.process_group_id, GroupSignal::Term);

                let mut child = child.lock().await;
                match tokio::time::timeout(self.grace(), child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(port = handle.port, code = status.code(), "agent server exited");
                    }
                    Ok(Err(e)) => {
                        warn!(port = handle.port, error = %e, "wait failed after SIGTERM");
                    }
                    Err(_) => {
                        error!(
                            port = handle.port,
                            pid = handle.pid,
                            "agent server ignored SIGTERM; killing process group"
                        );
                        send_group_signal(handle.process_group_id, GroupSignal::Kill);
                        let _ = child.wait().await;
                    }
                }
                Ok(())
            }
            None => self.shutdown_by_pid(handle.pid).await,
        }
    }

    /// Pid-only shutdown, for handles reconstructed across a durability
    /// boundary. A nonexistent pid counts as already-dead.
    pub async fn shutdown_by_pid(&self, pid: u32) -> Result<(), ServerError> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::unistd::{getpgid, Pid};

            let nix_pid = Pid::from_raw(pid as i32);
            let pgid = match getpgid(Some(nix_pid)) {
                Ok(pgid) => pgid.as_raw(),
                Err(Errno::ESRCH) => {
                    debug!(pid, "pid-only shutdown: process already gone");
                    return Ok(());
                }
                Err(e) => {
                    warn!(pid, error = %e, "getpgid failed; falling back to pid as group");
                    pid as i32
                }
            };

            send_group_signal(pgid, GroupSignal::Term);

            if !await_death(pid, self.grace()).await {
                error!(pid, pgid, "process survived SIGTERM grace; sending SIGKILL");
                send_group_signal(pgid, GroupSignal::Kill);
                await_death(pid, Duration::from_secs(1)).await;
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Ok(())
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_grace_seconds)
    }
}

async fn probe_health(base_url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(format!("{base_url}/health")).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

enum GroupSignal {
    Term,
    Kill,
}

/// Signal an entire process group. Failures are logged, not surfaced: the
/// group may already be gone, which is the desired end state.
fn send_group_signal(pgid: i32, signal: GroupSignal) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            GroupSignal::Term => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        if let Err(e) = killpg(Pid::from_raw(pgid), sig) {
            debug!(pgid, signal = %sig, error = %e, "killpg failed (group may be gone)");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
    }
}

/// Poll for process death, returning true once the pid is gone.
#[cfg(unix)]
async fn await_death(pid: u32, within: Duration) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let deadline = tokio::time::Instant::now() + within;
    let nix_pid = Pid::from_raw(pid as i32);

    loop {
        match kill(nix_pid, None) {
            Err(Errno::ESRCH) => return true,
            _ => {
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
