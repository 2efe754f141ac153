use serde::Deserialize;
use std::env;

use crate::pool::PoolSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_backend() -> Backend { Backend::Postgres }
fn default_true() -> bool { true }

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 20 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Untracked developer overrides
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TRANSIT__POOL__MAX_SIZE=20`
            .add_source(config::Environment::with_prefix("TRANSIT").separator("__"))
            .build()?;

        let cfg: Config = s.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        self.pool.validate().map_err(|e| config::ConfigError::Message(e.to_string()))?;
        if self.retry.max_attempts == 0 {
            return Err(config::ConfigError::Message("retry.max_attempts must be at least 1".into()));
        }
        if self.database.backend == Backend::Postgres && self.database.url.is_empty() {
            return Err(config::ConfigError::Message("database.url is required for the postgres backend".into()));
        }
        Ok(())
    }
}
