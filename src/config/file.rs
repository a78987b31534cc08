// JSONC config file layer: a permissive partial view of `Config` where
// every field is optional so a file that sets only one key still parses.

use super::Config;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
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
    pub sync_projects_include: Option<Vec<String>>,
    pub sync_projects_exclude: Option<Vec<String>>,
    pub sync_advertise: Option<String>,

    pub retention_raw_event_days: Option<u64>,
    pub retention_ingest_sample_days: Option<u64>,

    pub log_level: Option<String>,
    pub log_format: Option<String>,

    pub gate_success_rate: Option<f64>,
    pub gate_dropped_rate: Option<f64>,
    pub gate_boundary_accuracy: Option<f64>,
    pub gate_retry_depth_max: Option<i64>,

    pub data_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Parse a JSONC document permissively: unknown keys are ignored by
    /// serde's field-by-field deserialize (no `deny_unknown_fields`), and
    /// the caller treats any parse error as "use defaults".
    pub fn parse(raw: &str) -> Result<Self> {
        let value = jsonc_parser::parse_to_serde_value(raw, &Default::default())?
            .unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub fn apply(self, config: &mut Config) {
        macro_rules! overlay {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    config.$field = v;
                }
            };
        }

        overlay!(observer_provider);
        overlay!(observer_model);
        overlay!(observer_api_key);
        overlay!(observer_max_chars);
        overlay!(observer_max_tokens);
        overlay!(observer_max_events);
        overlay!(embeddings_base_url);
        overlay!(embeddings_model);
        overlay!(embeddings_api_key);
        overlay!(pack_observation_limit);
        overlay!(pack_session_limit);
        overlay!(hybrid_retrieval_enabled);
        overlay!(hybrid_retrieval_shadow_log);
        overlay!(hybrid_retrieval_shadow_sample_rate);
        overlay!(sync_enabled);
        overlay!(sync_host);
        overlay!(sync_port);
        overlay!(sync_interval_s);
        overlay!(sync_projects_include);
        overlay!(sync_projects_exclude);
        overlay!(sync_advertise);
        overlay!(retention_raw_event_days);
        overlay!(retention_ingest_sample_days);
        overlay!(log_level);
        overlay!(log_format);
        overlay!(gate_success_rate);
        overlay!(gate_dropped_rate);
        overlay!(gate_boundary_accuracy);
        overlay!(gate_retry_depth_max);
        overlay!(data_dir);
    }
}
