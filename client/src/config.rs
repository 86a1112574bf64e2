//! Configuration for the client.

use serde::{Deserialize, Serialize};
use std::env;
use tether_engine::IdentityPolicy;

const DEFAULT_BATCH_SIZE: usize = 20;
const DEFAULT_MOUNT_PATH: &str = "/1/";

/// Client configuration.
///
/// Deserializes from any serde format; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of records saved in one batch request
    pub batch_size: usize,
    /// Maximum number of records deleted in one batch request
    pub destroy_batch_size: usize,
    /// How record handles map onto stored state
    pub identity_policy: IdentityPolicy,
    /// Prefix of every path inside a batch request
    pub mount_path: String,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            destroy_batch_size: DEFAULT_BATCH_SIZE,
            identity_policy: IdentityPolicy::default(),
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
        }
    }

    /// Sets the save batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the destroy batch size. Zero is treated as one.
    pub fn with_destroy_batch_size(mut self, size: usize) -> Self {
        self.destroy_batch_size = size.max(1);
        self
    }

    pub fn with_identity_policy(mut self, policy: IdentityPolicy) -> Self {
        self.identity_policy = policy;
        self
    }

    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = normalize_mount_path(&mount_path.into());
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `TETHER_BATCH_SIZE`, `TETHER_DESTROY_BATCH_SIZE`,
    /// `TETHER_IDENTITY_POLICY` and `TETHER_MOUNT_PATH`; unset variables keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(raw) = lookup("TETHER_BATCH_SIZE") {
            config.batch_size = parse_batch_size("TETHER_BATCH_SIZE", &raw)?;
        }
        config.destroy_batch_size = match lookup("TETHER_DESTROY_BATCH_SIZE") {
            Some(raw) => parse_batch_size("TETHER_DESTROY_BATCH_SIZE", &raw)?,
            None => config.batch_size,
        };
        if let Some(raw) = lookup("TETHER_IDENTITY_POLICY") {
            config.identity_policy = raw
                .parse()
                .map_err(|_| ConfigError::InvalidIdentityPolicy(raw.clone()))?;
        }
        if let Some(raw) = lookup("TETHER_MOUNT_PATH") {
            config.mount_path = normalize_mount_path(&raw);
        }

        Ok(config)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_batch_size(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ConfigError::InvalidBatchSize {
            key,
            value: raw.to_string(),
        }),
    }
}

fn normalize_mount_path(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidBatchSize { key: &'static str, value: String },

    #[error("Invalid TETHER_IDENTITY_POLICY value '{0}' (expected shared or isolated)")]
    InvalidIdentityPolicy(String),
}

/// Per-call options for [`save`](crate::ObjectController::save) and
/// [`save_all`](crate::ObjectController::save_all).
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOptions {
    /// Save unsaved records reachable from the saved record first
    pub cascade: bool,
    /// Overrides [`ClientConfig::batch_size`]
    pub batch_size: Option<usize>,
    pub session_token: Option<String>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            cascade: true,
            batch_size: None,
            session_token: None,
        }
    }
}

impl SaveOptions {
    pub fn with_cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.destroy_batch_size, 20);
        assert_eq!(config.identity_policy, IdentityPolicy::Shared);
        assert_eq!(config.mount_path, "/1/");
    }

    #[test]
    fn builder() {
        let config = ClientConfig::new()
            .with_batch_size(0)
            .with_destroy_batch_size(5)
            .with_identity_policy(IdentityPolicy::Isolated)
            .with_mount_path("parse");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.destroy_batch_size, 5);
        assert_eq!(config.identity_policy, IdentityPolicy::Isolated);
        assert_eq!(config.mount_path, "/parse/");
    }

    #[test]
    fn from_lookup_reads_every_key() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("TETHER_BATCH_SIZE", "7"),
            ("TETHER_IDENTITY_POLICY", "isolated"),
            ("TETHER_MOUNT_PATH", "/api/"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 7);
        // Falls back to the save batch size.
        assert_eq!(config.destroy_batch_size, 7);
        assert_eq!(config.identity_policy, IdentityPolicy::Isolated);
        assert_eq!(config.mount_path, "/api/");
    }

    #[test]
    fn from_lookup_rejects_bad_values() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("TETHER_BATCH_SIZE", "0")])),
            Err(ConfigError::InvalidBatchSize { .. })
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("TETHER_DESTROY_BATCH_SIZE", "many")])),
            Err(ConfigError::InvalidBatchSize { .. })
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("TETHER_IDENTITY_POLICY", "global")])),
            Err(ConfigError::InvalidIdentityPolicy(_))
        ));
    }

    #[test]
    fn save_options() {
        let options = SaveOptions::default();
        assert!(options.cascade);
        let options = options
            .with_cascade(false)
            .with_batch_size(3)
            .with_session_token("r:abc");
        assert!(!options.cascade);
        assert_eq!(options.batch_size, Some(3));
        assert_eq!(options.session_token.as_deref(), Some("r:abc"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"batch_size": 5, "identity_policy": "isolated"}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.destroy_batch_size, 20);
        assert_eq!(config.identity_policy, IdentityPolicy::Isolated);
        assert_eq!(config.mount_path, "/1/");
    }
}
