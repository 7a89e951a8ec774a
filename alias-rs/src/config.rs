use crate::error::{AliasError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for layered configuration (`ALIAS_RS__LIMITS__...`)
const ENV_PREFIX: &str = "ALIAS_RS";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base service domains; the first entry is canonical
    pub domains: Vec<String>,
    /// Owner of aliases addressed to a bare base domain
    pub admin_username: Option<String>,
    pub unsubscribe_label: String,
    pub feedback_tag: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub new_aliases_per_window: u32,
    pub new_alias_window_secs: i64,
    pub default_bandwidth_limit: u64,
    pub near_limit_ratio: f64,
    pub near_limit_policy: NearLimitPolicy,
    pub max_message_size: u64,
}

/// When to send the near-bandwidth-limit notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NearLimitPolicy {
    /// Every charged message that leaves the user above the ratio
    EveryMessage,
    /// Only the message that moves the user from at-or-below to above the ratio
    OnCrossing,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Base64 encoded 32-byte key; queued payloads are sealed when set
    pub encryption_key: Option<String>,
    pub max_retries: i32,
    pub retry_base_delay_secs: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            domains: vec!["anonaddy.me".to_string()],
            admin_username: None,
            unsubscribe_label: "unsubscribe".to_string(),
            feedback_tag: "anonaddy".to_string(),
            from_address: "mailer@anonaddy.me".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            new_aliases_per_window: 10,
            new_alias_window_secs: 3600,
            default_bandwidth_limit: 100 * 1024 * 1024, // 100MB
            near_limit_ratio: 0.9,
            near_limit_policy: NearLimitPolicy::EveryMessage,
            max_message_size: 25 * 1024 * 1024, // 25MB
        }
    }
}

impl Default for NearLimitPolicy {
    fn default() -> Self {
        NearLimitPolicy::EveryMessage
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://alias-rs.db".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            max_retries: 5,
            retry_base_delay_secs: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Canonical base domain used for synthetic addresses
    pub fn canonical_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or("localhost")
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AliasError::Config(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| AliasError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then the optional TOML file, then `ALIAS_RS__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.service.domains.is_empty() {
            return Err(AliasError::Config(
                "service.domains must list at least one domain".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.limits.near_limit_ratio) {
            return Err(AliasError::Config(format!(
                "limits.near_limit_ratio must be within 0..=1, got {}",
                self.limits.near_limit_ratio
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.service.canonical_domain(), "anonaddy.me");
        assert_eq!(config.limits.new_aliases_per_window, 10);
        assert_eq!(config.limits.default_bandwidth_limit, 104_857_600);
        assert_eq!(config.limits.near_limit_policy, NearLimitPolicy::EveryMessage);
        assert!(config.queue.encryption_key.is_none());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
domains = ["anonaddy.me", "anonaddy.com"]
admin_username = "johndoe"

[limits]
near_limit_policy = "on-crossing"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.service.domains.len(), 2);
        assert_eq!(config.service.admin_username.as_deref(), Some("johndoe"));
        assert_eq!(config.service.unsubscribe_label, "unsubscribe");
        assert_eq!(config.limits.near_limit_policy, NearLimitPolicy::OnCrossing);
        assert_eq!(config.storage.database_url, "sqlite://alias-rs.db");
    }

    #[test]
    fn test_rejects_empty_domains() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service]\ndomains = []").unwrap();

        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
