// `CODEMEM_*` environment variable overlay. Every env-overridable key in
// `Config` has a mirror here; unset or unparsable variables are left as
// `None` and the existing value (file layer or default) is kept.

use super::Config;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct EnvConfig {
    pub observer_provider: Option<String>,
    pub observer_model: Option<String>,
    pub observer_api_key: Option<String>,
    pub observer_max_chars: Option<usize>,
    pub observer_max_tokens: Option<usize>,
    pub observer_max_events: Option<usize>,
    pub embeddings_base_url: Option<String>,
    pub embeddings_model: Option<String>,
    pub embeddings_api_key: Option<String>,
    pub pack_observation_limit: Option<usize>,
    pub pack_session_limit: Option<usize>,
    pub hybrid_retrieval_enabled: Option<bool>,
    pub hybrid_retrieval_shadow_log: Option<bool>,
    pub hybrid_retrieval_shadow_sample_rate: Option<f64>,
    pub sync_enabled: Option<bool>,
    pub sync_host: Option<String>,
    pub sync_port: Option<u16>,
    pub sync_interval_s: Option<u64>,
    pub sync_projects_include: Option<String>,
    pub sync_projects_exclude: Option<String>,
    pub sync_advertise: Option<String>,
    pub retention_raw_event_days: Option<u64>,
    pub retention_ingest_sample_days: Option<u64>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub gate_success_rate: Option<f64>,
    pub gate_dropped_rate: Option<f64>,
    pub gate_boundary_accuracy: Option<f64>,
    pub gate_retry_depth_max: Option<i64>,
    pub data_dir: Option<String>,
}

fn var(name: &str) -> Option<String> {
    env::var(format!("CODEMEM_{name}")).ok()
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    var(name).and_then(|v| v.parse().ok())
}

fn list(name: &str) -> Option<Vec<String>> {
    var(name).map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

impl EnvConfig {
    /// Reads `.env` from the fixed config directory only — never from the
    /// current working directory, so a cloned repository can't override
    /// credentials by shipping its own `.env`.
    pub fn load_dotenv(config_dir: &std::path::Path) {
        let path = config_dir.join(".env");
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }

    pub fn from_process_env() -> Self {
        EnvConfig {
            observer_provider: var("OBSERVER_PROVIDER"),
            observer_model: var("OBSERVER_MODEL"),
            observer_api_key: var("OBSERVER_API_KEY"),
            observer_max_chars: parsed("OBSERVER_MAX_CHARS"),
            observer_max_tokens: parsed("OBSERVER_MAX_TOKENS"),
            observer_max_events: parsed("OBSERVER_MAX_EVENTS"),
            embeddings_base_url: var("EMBEDDINGS_BASE_URL"),
            embeddings_model: var("EMBEDDINGS_MODEL"),
            embeddings_api_key: var("EMBEDDINGS_API_KEY"),
            pack_observation_limit: parsed("PACK_OBSERVATION_LIMIT"),
            pack_session_limit: parsed("PACK_SESSION_LIMIT"),
            hybrid_retrieval_enabled: parsed("HYBRID_RETRIEVAL_ENABLED"),
            hybrid_retrieval_shadow_log: parsed("HYBRID_RETRIEVAL_SHADOW_LOG"),
            hybrid_retrieval_shadow_sample_rate: parsed("HYBRID_RETRIEVAL_SHADOW_SAMPLE_RATE"),
            sync_enabled: parsed("SYNC_ENABLED"),
            sync_host: var("SYNC_HOST"),
            sync_port: parsed("SYNC_PORT"),
            sync_interval_s: parsed("SYNC_INTERVAL_S"),
            sync_projects_include: var("SYNC_PROJECTS_INCLUDE"),
            sync_projects_exclude: var("SYNC_PROJECTS_EXCLUDE"),
            sync_advertise: var("SYNC_ADVERTISE"),
            retention_raw_event_days: parsed("RETENTION_RAW_EVENT_DAYS"),
            retention_ingest_sample_days: parsed("RETENTION_INGEST_SAMPLE_DAYS"),
            log_level: var("LOG_LEVEL"),
            log_format: var("LOG_FORMAT"),
            gate_success_rate: parsed("GATE_SUCCESS_RATE"),
            gate_dropped_rate: parsed("GATE_DROPPED_RATE"),
            gate_boundary_accuracy: parsed("GATE_BOUNDARY_ACCURACY"),
            gate_retry_depth_max: parsed("GATE_RETRY_DEPTH_MAX"),
            data_dir: var("DATA_DIR"),
        }
    }

    pub fn apply(self, config: &mut Config) {
        if let Some(v) = self.observer_provider {
            config.observer_provider = Some(v);
        }
        if let Some(v) = self.observer_model {
            config.observer_model = Some(v);
        }
        if let Some(v) = self.observer_api_key {
            config.observer_api_key = Some(v);
        }
        if let Some(v) = self.observer_max_chars {
            config.observer_max_chars = v;
        }
        if let Some(v) = self.observer_max_tokens {
            config.observer_max_tokens = v;
        }
        if let Some(v) = self.observer_max_events {
            config.observer_max_events = v;
        }
        if let Some(v) = self.embeddings_base_url {
            config.embeddings_base_url = Some(v);
        }
        if let Some(v) = self.embeddings_model {
            config.embeddings_model = Some(v);
        }
        if let Some(v) = self.embeddings_api_key {
            config.embeddings_api_key = Some(v);
        }
        if let Some(v) = self.pack_observation_limit {
            config.pack_observation_limit = v;
        }
        if let Some(v) = self.pack_session_limit {
            config.pack_session_limit = v;
        }
        if let Some(v) = self.hybrid_retrieval_enabled {
            config.hybrid_retrieval_enabled = v;
        }
        if let Some(v) = self.hybrid_retrieval_shadow_log {
            config.hybrid_retrieval_shadow_log = v;
        }
        if let Some(v) = self.hybrid_retrieval_shadow_sample_rate {
            config.hybrid_retrieval_shadow_sample_rate = v;
        }
        if let Some(v) = self.sync_enabled {
            config.sync_enabled = v;
        }
        if let Some(v) = self.sync_host {
            config.sync_host = v;
        }
        if let Some(v) = self.sync_port {
            config.sync_port = v;
        }
        if let Some(v) = self.sync_interval_s {
            config.sync_interval_s = v;
        }
        if let Some(v) = list("SYNC_PROJECTS_INCLUDE") {
            config.sync_projects_include = v;
        }
        if let Some(v) = list("SYNC_PROJECTS_EXCLUDE") {
            config.sync_projects_exclude = v;
        }
        if let Some(v) = self.sync_advertise {
            config.sync_advertise = v;
        }
        if let Some(v) = self.retention_raw_event_days {
            config.retention_raw_event_days = v;
        }
        if let Some(v) = self.retention_ingest_sample_days {
            config.retention_ingest_sample_days = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.log_format {
            config.log_format = v;
        }
        if let Some(v) = self.gate_success_rate {
            config.gate_success_rate = v;
        }
        if let Some(v) = self.gate_dropped_rate {
            config.gate_dropped_rate = v;
        }
        if let Some(v) = self.gate_boundary_accuracy {
            config.gate_boundary_accuracy = v;
        }
        if let Some(v) = self.gate_retry_depth_max {
            config.gate_retry_depth_max = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = PathBuf::from(v);
        }
    }
}
