//! Issue Sync
//!
//! Client-side synchronization core for an issue tracker:
//! - Normalized entity cache with ordered, paginated list views
//! - Optimistic mutations with per-entity ordering and exact rollback
//! - Push invalidation feed with reconnect backoff
//! - Query coordination with stale-response suppression

pub mod api;
pub mod auth;
pub mod error;
pub mod events;
pub mod models;
pub mod mutation;
pub mod push;
pub mod query;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use error::{SyncError, SyncResult};
pub use session::{SyncHandle, SyncSession};

use anyhow::Result;
use models::{SortDirection, SortField, SortSpec};
use push::BackoffPolicy;
use query::ViewParams;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "issue-sync.yaml";

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub push: PushYamlConfig,
    pub views: ViewsYamlConfig,
    pub auth: AuthYamlConfig,
}

/// REST server section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".into(),
            request_timeout_secs: 10,
        }
    }
}

/// Push feed section; no `nats_url` means no push
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushYamlConfig {
    pub nats_url: Option<String>,
    pub subject: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: f64,
    pub degrade_after: u32,
    pub stable_after_ms: u64,
}

impl Default for PushYamlConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject: "events.crud".into(),
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter: 0.2,
            degrade_after: 5,
            stable_after_ms: 10_000,
        }
    }
}

/// Defaults for newly opened list views
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewsYamlConfig {
    pub page_size: u32,
    pub sort_by: SortField,
    pub sort_order: SortDirection,
}

impl Default for ViewsYamlConfig {
    fn default() -> Self {
        Self {
            page_size: query::DEFAULT_PAGE_SIZE,
            sort_by: SortField::CreatedAt,
            sort_order: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYamlConfig {
    /// Bearer credential; prefer the environment over committing it to a file
    pub token: Option<String>,
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub nats_url: Option<String>,
    pub push_subject: String,
    pub backoff: BackoffPolicy,
    pub page_size: u32,
    pub sort: SortSpec,
    pub token: Option<String>,
}

impl Config {
    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "issue-sync.yaml" in CWD. A missing or
    /// unparsable file falls back to env vars / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        // 1. Load YAML config (or defaults if file not found)
        let yaml = Self::load_yaml(yaml_path);

        // 2. Build Config with env var overrides
        Ok(Self {
            api_url: std::env::var("ISSUE_SYNC_API_URL").unwrap_or(yaml.server.api_url),
            request_timeout_secs: std::env::var("ISSUE_SYNC_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.server.request_timeout_secs),
            nats_url: std::env::var("ISSUE_SYNC_NATS_URL")
                .ok()
                .or(yaml.push.nats_url),
            push_subject: std::env::var("ISSUE_SYNC_PUSH_SUBJECT").unwrap_or(yaml.push.subject),
            backoff: BackoffPolicy {
                base: Duration::from_millis(yaml.push.backoff_base_ms),
                max: Duration::from_millis(yaml.push.backoff_max_ms),
                jitter: yaml.push.jitter,
                degrade_after: yaml.push.degrade_after,
                stable_after: Duration::from_millis(yaml.push.stable_after_ms),
            },
            page_size: std::env::var("ISSUE_SYNC_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(yaml.views.page_size),
            sort: SortSpec {
                field: yaml.views.sort_by,
                direction: yaml.views.sort_order,
            },
            token: std::env::var("ISSUE_SYNC_TOKEN").ok().or(yaml.auth.token),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parameters a view opens with unless the caller overrides them
    pub fn view_defaults(&self) -> ViewParams {
        ViewParams {
            sort: self.sort,
            size: self.page_size,
            ..ViewParams::default()
        }
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
