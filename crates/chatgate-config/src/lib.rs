use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub admission: Admission,
    pub store: Store,
    pub llm: Llm,
    #[serde(default)]
    pub cache: Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    /// In-flight requests allowed per peer address before answering 429.
    #[serde(default = "default_max_concurrent_per_client")]
    pub max_concurrent_per_client: usize,
    /// gzip response bodies for clients that accept it.
    #[serde(default = "default_compression")]
    pub compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Inline HS256 secret. Takes precedence over `jwt_secret_env`.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_jwt_secret_env")]
    pub jwt_secret_env: String,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_secret_env: default_jwt_secret_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    /// Only the acquisition that set the processing flag may clear it.
    Token,
    /// Any completion clears the flag, even after a stale override.
    Unconditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "default_inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_release_mode")]
    pub release_mode: ReleaseMode,
}

impl Default for Admission {
    fn default() -> Self {
        Self {
            processing_timeout_ms: default_processing_timeout_ms(),
            inactivity_threshold_ms: default_inactivity_threshold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            release_mode: default_release_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Llm {
    pub mode: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: default_cache_ttl_ms(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_max_concurrent_per_client() -> usize {
    100
}

fn default_compression() -> bool {
    true
}

fn default_jwt_secret_env() -> String {
    "JWT_SECRET".to_string()
}

fn default_processing_timeout_ms() -> u64 {
    30_000
}

fn default_inactivity_threshold_ms() -> u64 {
    30 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_release_mode() -> ReleaseMode {
    ReleaseMode::Token
}

fn default_llm_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_llm_timeout_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_context_window() -> usize {
    10
}

fn default_cache_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_cache_max_entries() -> usize {
    1_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Cross-field checks the schema cannot express.
pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.max_concurrent_per_client == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "server.max_concurrent_per_client must be >= 1".to_string(),
        ));
    }
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.llm.mode != "echo" && cfg.llm.mode != "gemini" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "llm.mode={} is not implemented; supported: echo, gemini",
            cfg.llm.mode
        )));
    }
    if cfg.llm.mode == "gemini" && cfg.llm.endpoint.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "llm.endpoint is required when llm.mode=gemini".to_string(),
        ));
    }
    if cfg.llm.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "llm.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.llm.context_window == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "llm.context_window must be >= 1".to_string(),
        ));
    }
    if cfg.admission.processing_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "admission.processing_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.admission.sweep_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "admission.sweep_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.admission.inactivity_threshold_ms < cfg.admission.processing_timeout_ms {
        return Err(ConfigError::UnsupportedConfig(
            "admission.inactivity_threshold_ms must be >= admission.processing_timeout_ms"
                .to_string(),
        ));
    }
    Ok(())
}
