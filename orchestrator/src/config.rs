//! Orchestrator configuration.
//!
//! Environment variables with defaults; the CLI flags in `main` override
//! them.

use serde::Serialize;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_API_PORT: u16 = 8000;
pub const DEFAULT_PROXY_PORT: u16 = 8080;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub database_url: String,
    pub cors_origins: Vec<String>,
    pub body_size_cap: usize,
    pub cert_dir: PathBuf,
    pub leaf_cert_ttl_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: DEFAULT_API_PORT,
            proxy_host: "0.0.0.0".to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            database_url: "sqlite:./webmod.db".to_string(),
            cors_origins: vec!["http://localhost:3000".to_string()],
            body_size_cap: proxy_core::config::DEFAULT_BODY_CAP,
            cert_dir: PathBuf::from("./certs"),
            leaf_cert_ttl_days: proxy_core::config::DEFAULT_LEAF_TTL_DAYS,
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_host: env_or("API_HOST", defaults.api_host),
            api_port: env_parsed("API_PORT", defaults.api_port),
            proxy_host: env_or("PROXY_HOST", defaults.proxy_host),
            proxy_port: env_parsed("PROXY_PORT", defaults.proxy_port),
            database_url: env_or("DATABASE_URL", defaults.database_url),
            cors_origins: env::var("CORS_ORIGINS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            body_size_cap: env_parsed("BODY_SIZE_CAP", defaults.body_size_cap),
            cert_dir: env::var("CERT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cert_dir),
            leaf_cert_ttl_days: env_parsed("LEAF_CERT_TTL_DAYS", defaults.leaf_cert_ttl_days),
        }
    }

    pub fn proxy_config(&self) -> proxy_core::ProxyConfig {
        proxy_core::ProxyConfig {
            cert_dir: self.cert_dir.clone(),
            body_cap: self.body_size_cap,
            leaf_ttl_days: self.leaf_cert_ttl_days,
            ..Default::default()
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.proxy_port, 8080);
        assert_eq!(config.body_size_cap, 10 * 1024 * 1024);
        assert_eq!(config.leaf_cert_ttl_days, 825);
    }
}
