//! Structured logging setup shared by the binary and integration tests.

use std::fmt::Write as _;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// How log output should be filtered and formatted.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Baseline level when RUST_LOG is unset.
    pub log_level: Level,
    /// Per-target overrides, e.g. ("helm_llm", DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of the human format.
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

fn directives(config: &TelemetryConfig) -> String {
    config.module_levels.iter().fold(
        config.log_level.to_string().to_lowercase(),
        |mut acc, (target, level)| {
            let _ = write!(acc, ",{target}={}", level.to_string().to_lowercase());
            acc
        },
    )
}

/// Install the global tracing subscriber. Call once at startup; RUST_LOG
/// takes precedence over the config when set.
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config)));

    let registry = tracing_subscriber::registry();
    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_filter(filter),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_filter(filter))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_join_baseline_and_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("helm_llm".into(), Level::DEBUG),
                ("helm_engine".into(), Level::TRACE),
            ],
            json: false,
        };
        assert_eq!(directives(&config), "warn,helm_llm=debug,helm_engine=trace");
    }

    #[test]
    fn defaults_to_info_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
        assert_eq!(directives(&config), "info");
    }
}
