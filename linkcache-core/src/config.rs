use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::LinkCacheError;

#[derive(Debug, Deserialize, Clone)]
pub struct LinkCacheConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// `{agentId}` template forwarded as `langchainUrl` on session create.
    #[serde(default = "default_execute_url_template")]
    pub execute_url_template: String,
}

fn default_timeout_seconds() -> u64 {
    15
}

pub const DEFAULT_EXECUTE_URL_TEMPLATE: &str =
    "https://new-langchain.chiefaiofficer.id/api/v1/agents/{agentId}/execute";

fn default_execute_url_template() -> String {
    DEFAULT_EXECUTE_URL_TEMPLATE.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub max_entry_age_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entry_age_seconds: 15 * 60,
            sweep_interval_seconds: 60,
        }
    }
}

impl StoreConfig {
    /// Zero disables expiry.
    pub fn max_entry_age(&self) -> chrono::Duration {
        let seconds = i64::try_from(self.max_entry_age_seconds).unwrap_or(i64::MAX);
        chrono::Duration::seconds(seconds.min(i64::MAX / 1000))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
        }
    }
}

impl LinkCacheConfig {
    /// Load from a TOML file, then apply `LINKCACHE__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, LinkCacheError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("LINKCACHE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, LinkCacheError> {
        let s = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LinkCacheError> {
        let base = self.backend.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(LinkCacheError::InvalidConfig(format!(
                "backend.base_url must be an http(s) URL, got {:?}",
                self.backend.base_url
            )));
        }
        if self.backend.timeout_seconds == 0 {
            return Err(LinkCacheError::InvalidConfig(
                "backend.timeout_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_entry_age(&self) -> chrono::Duration {
        self.store.max_entry_age()
    }
}
