use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// Top-level configuration loaded from `mitosis.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MitosisConfig {
    pub ports: PortsConfig,
    pub worktree: WorktreeConfig,
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub coordinator: CoordinatorConfig,
    pub reports: ReportsConfig,
}

/// TCP port range handed to the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PortsConfig {
    pub min: u16,
    pub max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: 39100,
            max: 39163,
        }
    }
}

/// Working-tree provisioning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorktreeConfig {
    /// Repository the trees are carved from.
    pub repo: String,
    /// Directory the trees are created under.
    pub base_dir: String,
    /// Branch new trees start from.
    pub source_branch: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            repo: ".".to_string(),
            base_dir: ".mitosis/cells".to_string(),
            source_branch: "main".to_string(),
        }
    }
}

/// Child agent-server boot and shutdown configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Program spawned per cell; receives `serve --port N --hostname localhost`.
    pub agent_command: String,
    /// Extra args placed before `serve`.
    pub agent_args: Vec<String>,
    pub health_poll_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub boot_timeout_seconds: u64,
    /// Pause after the first healthy probe. The health endpoint can go green
    /// before the session routes are registered; this delay covers that
    /// window and is deliberately tunable.
    pub settle_delay_ms: u64,
    pub shutdown_grace_seconds: u64,
    /// Permits on the shared bootstrap semaphore: concurrent server starts.
    pub bootstrap_permits: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_command: "opencode".to_string(),
            agent_args: vec![],
            health_poll_interval_ms: 500,
            health_probe_timeout_ms: 2_000,
            boot_timeout_seconds: 30,
            settle_delay_ms: 2_000,
            shutdown_grace_seconds: 5,
            bootstrap_permits: 4,
        }
    }
}

/// TCR engine knobs shared by every task unless the task overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSettings {
    pub mode: EngineMode,
    /// Re-prompts within one implementation session before regenerating.
    pub max_fix_attempts: u32,
    /// Full regenerations (fresh session, back to the implementation gate).
    pub max_retries: u32,
    pub task_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Reviewer roles fanned out in the review gate.
    pub reviewers: Vec<ReviewerConfig>,
    pub retry_initial_delay_ms: u64,
    pub retry_factor: u32,
    pub retry_max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: EngineMode::Enhanced,
            max_fix_attempts: 2,
            max_retries: 2,
            task_timeout_seconds: 1_800,
            heartbeat_interval_seconds: 15,
            reviewers: vec![ReviewerConfig {
                role: "reviewer".to_string(),
                advisory: false,
            }],
            retry_initial_delay_ms: 1_000,
            retry_factor: 2,
            retry_max_attempts: 3,
        }
    }
}

/// Which TCR state machine drives a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Single prompt + test + commit-or-revert.
    Basic,
    /// Test generation, RED verification, implementation, GREEN fix loop,
    /// reviewer quorum.
    Enhanced,
}

impl Default for EngineMode {
    fn default() -> Self {
        EngineMode::Enhanced
    }
}

/// One reviewer seat in the review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewerConfig {
    pub role: String,
    /// Advisory reviewers record a vote but cannot fail the task.
    #[serde(default)]
    pub advisory: bool,
}

/// Dispatch limits for the dependency coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinatorConfig {
    /// Upper bound on in-flight cells. Zero means "derive from port range".
    pub max_concurrent: usize,
    /// Cap on admitted tasks. Zero means unlimited.
    pub max_tasks: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            max_tasks: 0,
        }
    }
}

/// Where run reports land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReportsConfig {
    pub dir: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: ".mitosis/reports".to_string(),
        }
    }
}

impl MitosisConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: MitosisConfig = toml::from_str(&data)
            .map_err(|e| CoreError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.ports.min == 0 {
            return Err(CoreError::Config("ports.min must be at least 1".into()));
        }
        if self.ports.min > self.ports.max {
            return Err(CoreError::Config(format!(
                "ports.min ({}) exceeds ports.max ({})",
                self.ports.min, self.ports.max
            )));
        }
        if self.server.bootstrap_permits == 0 {
            return Err(CoreError::Config(
                "server.bootstrap_permits must be at least 1".into(),
            ));
        }
        if self.server.agent_command.trim().is_empty() {
            return Err(CoreError::Config("server.agent_command is empty".into()));
        }
        Ok(())
    }

    /// Effective concurrency cap: the configured value, or the port-range
    /// size when unset.
    pub fn effective_max_concurrent(&self) -> usize {
        if self.coordinator.max_concurrent > 0 {
            self.coordinator.max_concurrent
        } else {
            (self.ports.max - self.ports.min) as usize + 1
        }
    }

    pub fn repo_root(&self) -> PathBuf {
        PathBuf::from(&self.worktree.repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MitosisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.health_poll_interval_ms, 500);
        assert_eq!(config.server.settle_delay_ms, 2_000);
        assert_eq!(config.engine.max_fix_attempts, 2);
    }

    #[test]
    fn max_concurrent_derived_from_port_range() {
        let config = MitosisConfig {
            ports: PortsConfig {
                min: 8000,
                max: 8003,
            },
            ..Default::default()
        };
        assert_eq!(config.effective_max_concurrent(), 4);

        let pinned = MitosisConfig {
            coordinator: CoordinatorConfig {
                max_concurrent: 2,
                max_tasks: 0,
            },
            ..config
        };
        assert_eq!(pinned.effective_max_concurrent(), 2);
    }

    #[test]
    fn inverted_port_range_rejected() {
        let config = MitosisConfig {
            ports: PortsConfig {
                min: 9000,
                max: 8000,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_partial_toml() {
        let toml = r#"
[ports]
min = 8100
max = 8110

[engine]
mode = "basic"
max_fix_attempts = 3
"#;
        let config: MitosisConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.ports.min, 8100);
        assert_eq!(config.engine.mode, EngineMode::Basic);
        assert_eq!(config.engine.max_fix_attempts, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.server.boot_timeout_seconds, 30);
    }

    #[test]
    fn unknown_field_rejected() {
        let toml = r#"
[ports]
min = 8100
max = 8110
banana = true
"#;
        assert!(toml::from_str::<MitosisConfig>(toml).is_err());
    }

    #[test]
    fn reviewer_advisory_defaults_false() {
        let toml = r#"
[[engine.reviewers]]
role = "security"

[[engine.reviewers]]
role = "style"
advisory = true
"#;
        let config: MitosisConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.reviewers.len(), 2);
        assert!(!config.engine.reviewers[0].advisory);
        assert!(config.engine.reviewers[1].advisory);
    }
}
