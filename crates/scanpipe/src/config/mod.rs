use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Host names and CIDRs scans may target. Empty means unrestricted.
    pub scope_allowlist: Vec<String>,
    pub max_concurrent_scans: usize,
    pub create_rate_per_minute: usize,
    pub worker: WorkerConfig,
    pub enrichment: EnrichmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    /// Arguments placed before the target, e.g. the worker script.
    pub args: Vec<String>,
    pub module_dir: PathBuf,
    pub module_path_var: String,
    pub default_modules: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub cache_capacity: u64,
    pub cache_ttl_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANPIPE_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SP_HOST") {
            self.host = v;
        }
        if let Some(v) = var("SP_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("SP_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("SP_SCOPE_ALLOWLIST") {
            self.scope_allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("SP_WORKER_PROGRAM") {
            self.worker.program = v;
        }
        if let Some(v) = var("SP_WORKER_MODULE_DIR") {
            self.worker.module_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SP_ENRICHMENT_API_KEY") {
            self.enrichment.enabled = !v.is_empty();
            self.enrichment.api_key = v;
        }
        if let Some(v) = var("SP_ENRICHMENT_API_BASE") {
            self.enrichment.api_base = v;
        }
        if let Some(v) = var("SP_ENRICHMENT_MODEL") {
            self.enrichment.model = v;
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://scanpipe.db".to_string(),
            scope_allowlist: vec![],
            max_concurrent_scans: 4,
            create_rate_per_minute: 30,
            worker: WorkerConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["worker/scanner.py".to_string()],
            module_dir: PathBuf::from("worker"),
            module_path_var: "PYTHONPATH".to_string(),
            default_modules: vec!["recon".to_string()],
            timeout_secs: 600,
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            timeout_secs: 120,
            cache_capacity: 256,
            cache_ttl_secs: 3600,
        }
    }
}
