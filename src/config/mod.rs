// Three-layer configuration: environment variable > JSONC config file >
// built-in default. `Config::load` assembles a `FileConfig` (permissive
// serde deserialize of the JSONC file, defaulting on missing/malformed
// input) and overlays an `EnvConfig` pass that re-reads every
// env-overridable key directly from the process environment.

mod env;
mod file;

pub use env::EnvConfig;
pub use file::FileConfig;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,

    pub observer_provider: Option<String>,
    pub observer_model: Option<String>,
    pub observer_api_key: Option<String>,
    pub observer_max_chars: usize,
    pub observer_max_tokens: usize,
    pub observer_max_events: usize,

    pub embeddings_base_url: Option<String>,
    pub embeddings_model: Option<String>,
    pub embeddings_api_key: Option<String>,

    pub pack_observation_limit: usize,
    pub pack_session_limit: usize,

    pub hybrid_retrieval_enabled: bool,
    pub hybrid_retrieval_shadow_log: bool,
    pub hybrid_retrieval_shadow_sample_rate: f64,

    pub sync_enabled: bool,
    pub sync_host: String,
    pub sync_port: u16,
    pub sync_interval_s: u64,
    pub sync_projects_include: Vec<String>,
    pub sync_projects_exclude: Vec<String>,
    pub sync_advertise: String,

    pub retention_raw_event_days: u64,
    pub retention_ingest_sample_days: u64,

    pub log_level: String,
    pub log_format: String,

    pub gate_success_rate: f64,
    pub gate_dropped_rate: f64,
    pub gate_boundary_accuracy: f64,
    pub gate_retry_depth_max: i64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".codemem");
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("codemem");

        Config {
            data_dir,
            config_dir,
            observer_provider: None,
            observer_model: None,
            observer_api_key: None,
            observer_max_chars: 24_000,
            observer_max_tokens: 4_096,
            observer_max_events: 40,
            embeddings_base_url: None,
            embeddings_model: None,
            embeddings_api_key: None,
            pack_observation_limit: 12,
            pack_session_limit: 1,
            hybrid_retrieval_enabled: true,
            hybrid_retrieval_shadow_log: false,
            hybrid_retrieval_shadow_sample_rate: 0.0,
            sync_enabled: false,
            sync_host: "0.0.0.0".to_string(),
            sync_port: 8787,
            sync_interval_s: 120,
            sync_projects_include: Vec::new(),
            sync_projects_exclude: Vec::new(),
            sync_advertise: "auto".to_string(),
            retention_raw_event_days: 30,
            retention_ingest_sample_days: 14,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            gate_success_rate: 0.99,
            gate_dropped_rate: 0.05,
            gate_boundary_accuracy: 0.99,
            gate_retry_depth_max: 3,
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mem.sqlite")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn sync_pid_path(&self) -> PathBuf {
        self.data_dir.join("sync-daemon.pid")
    }

    pub fn sync_log_path(&self) -> PathBuf {
        self.data_dir.join("sync-daemon.log")
    }

    fn config_file_path(&self) -> PathBuf {
        self.config_dir.join("config.jsonc")
    }

    /// Resolve configuration: defaults, overlaid by the JSONC config file
    /// (if present and parseable — a malformed file degrades to defaults
    /// with a logged warning rather than aborting), overlaid by environment
    /// variables.
    pub fn load() -> Self {
        let mut config = Config::default();

        let path = config.config_file_path();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(raw) => match FileConfig::parse(&raw) {
                    Ok(file) => file.apply(&mut config),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "malformed config file, using defaults")
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not read config file, using defaults")
                }
            }
        }

        EnvConfig::from_process_env().apply(&mut config);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_retention() {
        let config = Config::default();
        assert!(config.retention_raw_event_days > 0);
        assert!(config.gate_success_rate > 0.9);
    }

    #[test]
    fn db_path_lives_under_data_dir() {
        let config = Config::default();
        assert_eq!(config.db_path(), config.data_dir.join("mem.sqlite"));
    }
}
