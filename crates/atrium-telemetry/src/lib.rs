//! Structured logging for Atrium processes.
//!
//! Output is JSON lines on stdout by default. `RUST_LOG` wins over the
//! configured levels when it is set.

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "atrium_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from a level string such as `"debug"` or `"info,atrium_engine=trace"`.
    ///
    /// Unknown levels fall back to INFO.
    pub fn from_directives(directives: &str, json: bool) -> Self {
        let mut config = Self {
            json,
            ..Self::default()
        };
        for part in directives.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((module, level)) => {
                    if let Ok(level) = Level::from_str(level.trim()) {
                        config.module_levels.push((module.trim().to_string(), level));
                    }
                }
                None => {
                    if let Ok(level) = Level::from_str(part) {
                        config.log_level = level;
                    }
                }
            }
        }
        config
    }

    /// Render the configured levels as an `EnvFilter` directive string.
    pub fn filter_string(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Handle returned from [`init_telemetry`].
pub struct TelemetryGuard {
    installed: bool,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    /// Whether this call installed the global subscriber. False when one was already set.
    pub fn installed(&self) -> bool {
        self.installed
    }

    /// Record a per-module level override for reporting.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let mut levels = self.level_filter.write();
        if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            levels.push((module.to_string(), level));
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));
    let filter_str = config.filter_string();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();

    TelemetryGuard {
        installed,
        level_filter,
    }
}
