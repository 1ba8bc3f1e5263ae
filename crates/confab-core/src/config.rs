//! Backend configuration (confab.toml + CONFAB_* env overrides).

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config for a backend replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfabConfig {
    /// Environment name, used as a salt for derived ids ("dev", "staging",
    /// "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Verbosity of completion logging: 0 = quiet, 2 = completions,
    /// 3 = request messages, 4 = raw request bodies.
    #[serde(default)]
    pub verbose: u8,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// When unset, the in-memory store is used instead.
    pub host: Option<String>,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_redis_port(),
            ssl: false,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let scheme = if self.ssl { "rediss" } else { "redis" };
        let auth = self
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        Some(format!("{scheme}://{auth}{host}:{}", self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    pub gemini_api_key: Option<String>,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            anthropic_api_key: None,
            anthropic_base_url: default_anthropic_base_url(),
            gemini_api_key: None,
            gemini_base_url: default_gemini_base_url(),
        }
    }
}

impl Default for ConfabConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            verbose: 0,
            redis: RedisConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl ConfabConfig {
    /// Load config from a TOML file with CONFAB_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, figment::Error> {
        let path = config_path.unwrap_or("confab.toml");
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONFAB_").split("_"))
            .extract()
    }

    /// Whether the replica runs inside a cluster (affects retry profiles).
    pub fn is_kubernetes(&self) -> bool {
        std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
    }
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_formats() {
        let mut config = RedisConfig {
            host: Some("cache.internal".to_string()),
            port: 6380,
            ssl: true,
            password: Some("hunter2".to_string()),
        };
        assert_eq!(
            config.url().unwrap(),
            "rediss://:hunter2@cache.internal:6380"
        );

        config.ssl = false;
        config.password = None;
        assert_eq!(config.url().unwrap(), "redis://cache.internal:6380");

        config.host = None;
        assert!(config.url().is_none());
    }
}
