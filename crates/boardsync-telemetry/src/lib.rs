use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var at startup.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "boardsync_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; pretty human output otherwise.
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

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive: {0}")]
    Filter(String),
    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Handle to the installed subscriber. Keep it alive for the life of the process.
pub struct TelemetryGuard {
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    /// Replaces any RUST_LOG directives that were active at startup.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };

        let Some(handle) = &self.reload else {
            return Ok(());
        };
        let filter = EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::Filter(e.to_string()))?;
        handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call (e.g. from several tests in one process) leaves the first
/// subscriber in place and returns a guard whose level changes are no-ops.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let pretty_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        base_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        reload: installed.then_some(handle),
    }
}

fn filter_directives(level: Level, modules: &[(String, Level)]) -> String {
    let mut out = level.to_string().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let modules = vec![
            ("boardsync_server".to_string(), Level::DEBUG),
            ("hyper".to_string(), Level::WARN),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &modules),
            "info,boardsync_server=debug,hyper=warn"
        );
    }

    #[test]
    fn default_config_is_json_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
    }

    #[test]
    fn module_levels_update_in_place() {
        let guard = init_telemetry(TelemetryConfig::default());
        guard.set_module_level("boardsync_server", Level::DEBUG).unwrap();
        guard.set_module_level("boardsync_server", Level::TRACE).unwrap();
        assert_eq!(
            guard.module_levels(),
            vec![("boardsync_server".to_string(), Level::TRACE)]
        );
    }
}
