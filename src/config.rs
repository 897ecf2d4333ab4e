//! Process configuration.
//!
//! Consumed by the Application and Host Router; this module owns the
//! concrete struct and the layered loader (defaults -> TOML file -> env).

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Recognized options: `workers`, `timeout`, `dst_port`, `rvm_path`,
/// `domain`, `root`. Field names are snake_case throughout (TOML keys and
/// `PORTKEEPER_*` env vars match the Rust field names directly) rather than
/// camelCase, so multi-word keys stay unambiguous across both layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool size per application.
    pub workers: usize,
    /// Worker idle timeout, in seconds, before a worker is shut down.
    pub timeout_secs: u64,
    /// Port injected into the worker environment as `SERVER_PORT`.
    pub dst_port: u16,
    /// Path to the rvm loader script (e.g. `~/.rvm/scripts/rvm`).
    pub rvm_path: String,
    /// TLD stripped from Host headers to find the app-root symlink name.
    pub domain: String,
    /// Directory containing one subdirectory/symlink per hosted application.
    pub root: PathBuf,
    /// Address the proxy listens on.
    pub bind_addr: String,
    /// `tracing` log level.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout_secs: 900,
            dst_port: 80,
            rvm_path: shellexpand_home("~/.rvm/scripts/rvm"),
            domain: "dev".to_string(),
            root: PathBuf::from(shellexpand_home("~/.portkeeper/hosts")),
            bind_addr: "127.0.0.1:20559".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file, then `PORTKEEPER_*` env vars.
    pub fn load(config_file: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("PORTKEEPER_"));
        figment.extract()
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let cfg = Config::load(None).expect("defaults should always extract");
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.dst_port, 80);
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("PORTKEEPER_WORKERS", "5");
        let cfg = Config::load(None).expect("env override should extract");
        assert_eq!(cfg.workers, 5);
        std::env::remove_var("PORTKEEPER_WORKERS");
    }

    #[test]
    fn env_overrides_a_multi_word_field() {
        std::env::set_var("PORTKEEPER_DST_PORT", "3000");
        let cfg = Config::load(None).expect("env override should extract");
        assert_eq!(cfg.dst_port, 3000);
        std::env::remove_var("PORTKEEPER_DST_PORT");
    }
}
