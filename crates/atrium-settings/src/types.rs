//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file only needs the fields it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AtriumSettings {
    pub session: SessionSettings,
    pub history: HistorySettings,
    pub brain: BrainSettings,
    pub workflow: WorkflowSettings,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub collaborators: CollaboratorSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingSettings,
}

impl AtriumSettings {
    /// Reject combinations that would make the engine misbehave at runtime.
    pub fn validate(&self) -> crate::Result<()> {
        if self.brain.max_turns == 0 {
            return Err(crate::SettingsError::invalid("brain.maxTurns", "must be at least 1"));
        }
        for (field, secs) in [
            ("session.idleTtlSecs", self.session.idle_ttl_secs),
            ("session.recordTtlSecs", self.session.record_ttl_secs),
            ("history.ttlSecs", self.history.ttl_secs),
        ] {
            if secs == 0 {
                return Err(crate::SettingsError::invalid(field, "must be positive"));
            }
        }
        if self.workflow.resume_keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(crate::SettingsError::invalid(
                "workflow.resumeKeywords",
                "needs at least one keyword",
            ));
        }
        Ok(())
    }
}

/// Tenant session lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle time after which a session is evicted from memory.
    pub idle_ttl_secs: u64,
    /// TTL of the externalized presence record, refreshed on every write.
    pub record_ttl_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
    /// How long fetched business context stays fresh.
    pub context_ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 2 * 60 * 60,
            record_ttl_secs: 2 * 60 * 60,
            sweep_interval_secs: 300,
            context_ttl_secs: 600,
        }
    }
}

impl SessionSettings {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySettings {
    pub ttl_secs: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { ttl_secs: 24 * 60 * 60 }
    }
}

impl HistorySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Turn-loop limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrainSettings {
    pub max_turns: u32,
    /// Accumulated tokens after which history is compacted.
    pub token_budget: u64,
    pub stream_debounce_ms: u64,
    pub tool_timeout_secs: u64,
    pub system_prompt: String,
}

impl Default for BrainSettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            token_budget: 120_000,
            stream_debounce_ms: 75,
            tool_timeout_secs: 120,
            system_prompt: "You are a business operations agent. Use tools to make progress on \
                            assigned workflows and answer the user directly when they talk to you."
                .to_string(),
        }
    }
}

/// Workflow pause/resume behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Upper bound on waiting for a live stream to end before resuming after a callback.
    pub stream_clear_timeout_secs: u64,
    /// Messages that resume a paused run (case-insensitive, whole message).
    pub resume_keywords: Vec<String>,
    pub lock_ttl_secs: u64,
    pub callback_dedup_ttl_secs: u64,
    pub stop_signal_ttl_secs: u64,
    pub run_ttl_secs: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            stream_clear_timeout_secs: 60,
            resume_keywords: vec!["resume".into(), "continue".into(), "resume workflow".into()],
            lock_ttl_secs: 300,
            callback_dedup_ttl_secs: 24 * 60 * 60,
            stop_signal_ttl_secs: 30,
            run_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl WorkflowSettings {
    pub fn stream_clear_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_clear_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn callback_dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.callback_dedup_ttl_secs)
    }

    pub fn stop_signal_ttl(&self) -> Duration {
        Duration::from_secs(self.stop_signal_ttl_secs)
    }

    pub fn run_ttl(&self) -> Duration {
        Duration::from_secs(self.run_ttl_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub sqlite_path: String,
    /// Prepended to every namespace so several deployments can share one store.
    pub namespace_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: default_home().join(".atrium").join("state.db").display().to_string(),
            namespace_prefix: "atrium".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Identity used as lock holder. Generated at startup when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            instance_id: None,
        }
    }
}

/// Endpoints for the external collaborators.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollaboratorSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launcher_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_context_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            completion_url: None,
            launcher_url: None,
            business_context_url: None,
            request_timeout_secs: 60,
        }
    }
}

impl CollaboratorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub tick_interval_secs: u64,
    pub tasks: Vec<ScheduledTaskSettings>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_interval_secs: 60,
            tasks: Vec::new(),
        }
    }
}

/// A recurring business task bound to one thread of one tenant session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduledTaskSettings {
    pub name: String,
    pub user_id: String,
    pub tenant_id: String,
    pub thread_id: String,
    pub instructions: String,
    pub checklist: Vec<ChecklistStepSettings>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChecklistStepSettings {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}

pub(crate) fn default_home() -> std::path::PathBuf {
    std::env::var("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/tmp"))
}
