use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// What the committer does when the chosen category vanished before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingCategoryPolicy {
    /// Commit without a category.
    #[default]
    Drop,
    /// Fail the commit with `ReferenceNotFound`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RasidConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub capability: CapabilityConfig,
    pub pipeline: PipelineConfig,
    pub index: IndexConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("rasid.db"),
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            body_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// The external text-understanding service. An empty endpoint means rules only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: "gemini-2.0-flash-lite".to_string(),
            timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub auto_approve_threshold: f32,
    pub search_threshold: f32,
    pub suggestion_threshold: f32,
    pub top_k: usize,
    pub suggestion_count: usize,
    pub institution_bonus: f32,
    pub fuzzy_name_threshold: f32,
    pub country: Option<String>,
    pub missing_category_policy: MissingCategoryPolicy,
    pub commit_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 0.85,
            search_threshold: 0.7,
            suggestion_threshold: 0.5,
            top_k: 1,
            suggestion_count: 3,
            institution_bonus: 0.1,
            fuzzy_name_threshold: 0.85,
            country: None,
            missing_category_policy: MissingCategoryPolicy::Drop,
            commit_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

/// IVF layout for the payee embedding index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dimensions: usize,
    pub lists: usize,
    pub probes: usize,
    /// Training waits until the table holds `lists * train_rows_per_list` embedded rows.
    pub train_rows_per_list: usize,
    pub kmeans_iterations: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: 768,
            lists: 100,
            probes: 10,
            train_rows_per_list: 10,
            kmeans_iterations: 10,
        }
    }
}

impl RasidConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RasidConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Secrets may come from the environment instead of the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("RASID_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(key) = lookup("RASID_CAPABILITY_API_KEY") {
            self.capability.api_key = key;
        }
        if let Some(path) = lookup("RASID_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |key: &'static str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    key,
                    reason: format!("{v} is outside [0, 1]"),
                })
            }
        };
        unit("pipeline.auto_approve_threshold", self.pipeline.auto_approve_threshold)?;
        unit("pipeline.search_threshold", self.pipeline.search_threshold)?;
        unit("pipeline.suggestion_threshold", self.pipeline.suggestion_threshold)?;
        unit("pipeline.institution_bonus", self.pipeline.institution_bonus)?;
        unit("pipeline.fuzzy_name_threshold", self.pipeline.fuzzy_name_threshold)?;

        if self.index.dimensions == 0 {
            return Err(ConfigError::Invalid {
                key: "index.dimensions",
                reason: "must be positive".into(),
            });
        }
        if self.index.lists == 0 || self.index.probes == 0 || self.index.probes > self.index.lists {
            return Err(ConfigError::Invalid {
                key: "index.probes",
                reason: format!(
                    "need 0 < probes <= lists, got probes={} lists={}",
                    self.index.probes, self.index.lists
                ),
            });
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "database.max_connections",
                reason: "must be positive".into(),
            });
        }
        if self.pipeline.top_k == 0 {
            return Err(ConfigError::Invalid {
                key: "pipeline.top_k",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RasidConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.auto_approve_threshold, 0.85);
        assert_eq!(config.index.lists, 100);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = RasidConfig::from_toml(
            r#"
            [pipeline]
            auto_approve_threshold = 0.9
            missing_category_policy = "reject"

            [index]
            dimensions = 3
            lists = 4
            probes = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.auto_approve_threshold, 0.9);
        assert_eq!(config.pipeline.missing_category_policy, MissingCategoryPolicy::Reject);
        assert_eq!(config.pipeline.search_threshold, 0.7);
        assert_eq!(config.index.dimensions, 3);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = RasidConfig::from_toml("[pipeline]\nauto_approve_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_more_probes_than_lists() {
        let err = RasidConfig::from_toml("[index]\nlists = 2\nprobes = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "index.probes", .. }));
    }

    #[test]
    fn missing_file_is_default() {
        let config = RasidConfig::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.database.path, PathBuf::from("rasid.db"));
    }

    #[test]
    fn env_overrides_secrets() {
        let mut config = RasidConfig::default();
        config.apply_env(|key| match key {
            "RASID_JWT_SECRET" => Some("s3cret".into()),
            _ => None,
        });
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert!(config.capability.api_key.is_empty());
    }
}
