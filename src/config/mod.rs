use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::poller::DEFAULT_POLL_INTERVAL;

mod load;

pub use load::{warn_if_loose_permissions, CONFIG_FILE};

pub const BACKENDS: [&str; 4] = ["folder", "s3", "glacier", "webdav"];

/// Per-box configuration stored in `<box>/config.yml`.
///
/// Backend settings are a flat string map next to the `backend` key, e.g.
/// `folder_path` for folder boxes or `bucket` and `storage_class` for S3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxConfig {
    pub backend: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,

    #[serde(flatten)]
    pub settings: BTreeMap<String, String>,
}

impl BoxConfig {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            poll_interval_secs: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<String>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    /// Adds `key` only when a value is present.
    pub fn with_optional_setting(self, key: &str, value: Option<String>) -> Self {
        match value {
            Some(value) => self.with_setting(key, value),
            None => self,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !BACKENDS.contains(&self.backend.as_str()) {
            return Err(crate::icebox_error!(ConfigError {
                description: format!("Unsupported backend: {}", self.backend),
            }));
        }
        Ok(())
    }
}
