//! Logging setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing. The default directive keeps our crates at info
/// and quiets chatty dependencies; RUST_LOG overrides everything.
pub fn init_logging(level: &str) {
    let default_directives = format!(
        "{level},orchestrator={level},proxy_core={level},flow_engine={level},\
         attack_engine={level},spider_engine={level},scan_engine={level},\
         sqlx=warn,hyper=warn,reqwest=warn",
        level = level
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();

    if result.is_ok() {
        tracing::info!(level, "logging initialized");
    }
}

/// Log level utilities
pub mod levels {
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_validation() {
        assert!(levels::is_valid_level("info"));
        assert!(levels::is_valid_level("DEBUG"));
        assert!(!levels::is_valid_level("loud"));
    }
}
