use serde::Deserialize;
use std::{env, path::Path, time::Duration};
use thiserror::Error;

const DEFAULT_API_VERSION: &str = "2024-10";
const DEFAULT_NAMESPACE: &str = "hermes";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {detail}")]
    Invalid { field: &'static str, detail: String },
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub shop: ShopifyConfig,
    pub transport: TransportConfig,
    pub batch: BatchConfig,
    pub resolver: ResolverConfig,
    pub provenance_namespace: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            shop: ShopifyConfig::default(),
            transport: TransportConfig::default(),
            batch: BatchConfig::default(),
            resolver: ResolverConfig::default(),
            provenance_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShopifyConfig {
    pub shop_domain: String,
    pub access_token: String,
    pub api_version: String,
    /// Overrides `https://{shop_domain}`; proxies and local fakes use this.
    pub api_base_url: Option<String>,
}

impl Default for ShopifyConfig {
    fn default() -> Self {
        Self {
            shop_domain: String::new(),
            access_token: String::new(),
            api_version: DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
        }
    }
}

impl ShopifyConfig {
    pub fn base_url(&self) -> String {
        match &self.api_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.shop_domain.trim_end_matches('/')),
        }
    }

    pub fn graphql_url(&self) -> String {
        format!(
            "{}/admin/api/{}/graphql.json",
            self.base_url(),
            self.api_version
        )
    }

    pub fn rest_url(&self, path: &str) -> String {
        format!(
            "{}/admin/api/{}/{}",
            self.base_url(),
            self.api_version,
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub requests_per_second: u32,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Zero keeps the delay sequence deterministic.
    pub jitter_ms: u64,
    pub call_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter_ms: 0,
            call_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

impl TransportConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
    pub skip_existing: bool,
    pub verify_metadata: bool,
    pub max_staged_restarts: u32,
    pub staged_target_ttl_secs: u64,
    pub abort_after_unreachable_chunks: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            inter_chunk_delay_ms: 250,
            skip_existing: true,
            verify_metadata: true,
            max_staged_restarts: 1,
            staged_target_ttl_secs: 600,
            abort_after_unreachable_chunks: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub probe: bool,
    pub requery_delay_ms: u64,
    pub probe_timeout_secs: u64,
    /// Last-resort pattern; `{id}` is replaced with the numeric file id.
    pub url_template: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            probe: true,
            requery_delay_ms: 2_000,
            probe_timeout_secs: 5,
            url_template: None,
        }
    }
}

impl UploaderConfig {
    /// Reads `HERMES_CONFIG` when set, then layers environment variables on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("HERMES_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_string("SHOPIFY_SHOP_DOMAIN") {
            self.shop.shop_domain = value;
        }
        if let Some(value) = env_string("SHOPIFY_ACCESS_TOKEN") {
            self.shop.access_token = value;
        }
        if let Some(value) = env_string("SHOPIFY_API_VERSION") {
            self.shop.api_version = value;
        }
        if let Some(value) = env_string("SHOPIFY_API_BASE_URL") {
            self.shop.api_base_url = Some(value);
        }

        let transport = &mut self.transport;
        env_parse("HERMES_RATE_LIMIT_PER_SEC", &mut transport.requests_per_second);
        env_parse("HERMES_MAX_ATTEMPTS", &mut transport.max_attempts);
        env_parse("HERMES_BACKOFF_INITIAL_MS", &mut transport.initial_backoff_ms);
        env_parse("HERMES_BACKOFF_MAX_MS", &mut transport.max_backoff_ms);
        env_parse("HERMES_BACKOFF_JITTER_MS", &mut transport.jitter_ms);
        env_parse("HTTP_TIMEOUT_SECS", &mut transport.call_timeout_secs);
        env_parse("HTTP_CONNECT_TIMEOUT_SECS", &mut transport.connect_timeout_secs);

        let batch = &mut self.batch;
        env_parse("HERMES_CHUNK_SIZE", &mut batch.chunk_size);
        env_parse("HERMES_CHUNK_DELAY_MS", &mut batch.inter_chunk_delay_ms);
        env_bool("HERMES_SKIP_EXISTING", &mut batch.skip_existing);
        env_bool("HERMES_VERIFY_METADATA", &mut batch.verify_metadata);
        env_parse("HERMES_STAGED_RESTARTS", &mut batch.max_staged_restarts);
        env_parse("HERMES_STAGED_TTL_SECS", &mut batch.staged_target_ttl_secs);

        let resolver = &mut self.resolver;
        env_bool("HERMES_CDN_PROBE", &mut resolver.probe);
        env_parse("HERMES_CDN_REQUERY_MS", &mut resolver.requery_delay_ms);
        if let Some(value) = env_string("HERMES_CDN_URL_TEMPLATE") {
            resolver.url_template = Some(value);
        }

        if let Some(value) = env_string("HERMES_METAFIELD_NAMESPACE") {
            self.provenance_namespace = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shop.shop_domain.trim().is_empty() && self.shop.api_base_url.is_none() {
            return Err(ConfigError::Missing("SHOPIFY_SHOP_DOMAIN"));
        }
        if self.shop.access_token.trim().is_empty() {
            return Err(ConfigError::Missing("SHOPIFY_ACCESS_TOKEN"));
        }
        if self.transport.requests_per_second == 0 {
            return Err(ConfigError::Invalid {
                field: "requests_per_second",
                detail: "must be at least 1".into(),
            });
        }
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                detail: "must be at least 1".into(),
            });
        }
        if self.batch.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                detail: "must be at least 1".into(),
            });
        }
        if self.provenance_namespace.trim().len() < 3 {
            return Err(ConfigError::Invalid {
                field: "provenance_namespace",
                detail: "must be at least 3 characters".into(),
            });
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Some(value) = env_string(key).and_then(|raw| raw.parse::<T>().ok()) {
        *slot = value;
    }
}

fn env_bool(key: &str, slot: &mut bool) {
    if let Some(raw) = env_string(key) {
        *slot = matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}
