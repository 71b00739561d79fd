use std::{collections::BTreeMap, fmt, path::Path, str::FromStr};

use tempfile::TempPath;

use crate::Result;

mod folder;
mod glacier;
mod s3;
mod webdav;

#[cfg(test)]
pub(crate) mod mem;

pub use folder::FolderBackend;
pub use glacier::GlacierBackend;
pub use s3::S3Backend;
pub use webdav::WebDavBackend;

/// Job key returned by backends whose inventory is a synchronous listing.
pub const SYNC_INVENTORY_JOB: &str = "inventory";

/// Status of a long-running backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failure,
}

/// One entry of a backend inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendFile {
    /// Retrieval key.
    pub key: String,
    /// Name stored alongside the file, used to pair data and metadata.
    pub name: String,
    pub size: u64,
}

impl BackendFile {
    pub fn new(key: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            size,
        }
    }
}

/// Transport behind a box.
///
/// Retrieval and inventory are modelled as jobs: `*_init` returns an opaque
/// job key, `*_status` is a non-blocking poll and `*_finish` is only valid
/// after the status turned `Success`. Instant backends echo the key and
/// report success immediately. Status polls never fail; transport errors are
/// logged and reported as `JobStatus::Failure`.
pub trait Backend {
    /// Cheap reachability and permission check.
    fn box_init(&self) -> Result<()>;

    /// Stores the encrypted data archive, returning its retrieval key.
    fn store_data(&self, path: &Path, name: &str) -> Result<String>;

    /// Stores the encrypted metadata archive, returning its retrieval key.
    /// Backends should prefer instant availability for metadata.
    fn store_meta(&self, path: &Path, name: &str) -> Result<String>;

    fn retrieve_init(&self, retrieval_key: &str, options: &RetrievalOptions) -> Result<String>;

    fn retrieve_status(&self, job_key: &str) -> JobStatus;

    /// Downloads the object into a fresh temporary file. The file is removed
    /// when the returned path is dropped.
    fn retrieve_finish(&self, job_key: &str) -> Result<TempPath>;

    /// Removes the object. Deleting an absent object succeeds.
    fn delete(&self, retrieval_key: &str) -> Result<()>;

    fn inventory_init(&self) -> Result<String>;

    fn inventory_status(&self, job_key: &str) -> JobStatus;

    fn inventory_finish(&self, job_key: &str) -> Result<Vec<BackendFile>>;
}

/// Retrieval speed tier of archival storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalTier {
    Expedited,
    Standard,
    Bulk,
}

impl RetrievalTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalTier::Expedited => "Expedited",
            RetrievalTier::Standard => "Standard",
            RetrievalTier::Bulk => "Bulk",
        }
    }
}

impl fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalTier {
    type Err = crate::IceboxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "expedited" => Ok(RetrievalTier::Expedited),
            "standard" => Ok(RetrievalTier::Standard),
            "bulk" => Ok(RetrievalTier::Bulk),
            _ => Err(crate::icebox_error!(InvalidParameter {
                description: format!(
                    "Unsupported retrieval tier '{value}' (expected Expedited, Standard or Bulk)"
                ),
            })),
        }
    }
}

/// Per-call overrides for retrieval operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalOptions {
    pub tier: Option<RetrievalTier>,
}

impl RetrievalOptions {
    /// Parses `key=value` pairs. Only `tier` is recognised; unknown keys are
    /// rejected rather than forwarded to the backend.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = RetrievalOptions::default();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                crate::icebox_error!(InvalidParameter {
                    description: format!("Backend option '{pair}' is not of the form key=value"),
                })
            })?;
            match key.trim().to_ascii_lowercase().as_str() {
                "tier" => options.tier = Some(value.trim().parse()?),
                other => {
                    return Err(crate::icebox_error!(InvalidParameter {
                        description: format!("Unsupported backend option '{other}'"),
                    }))
                }
            }
        }
        Ok(options)
    }
}

/// Reads a required setting, failing with a configuration error.
pub(crate) fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            crate::icebox_error!(ConfigError {
                description: format!("Missing backend setting '{key}'"),
            })
        })
}

/// Builds the transport named by `backend` from its flat settings map.
/// Settings are only validated when the backend is first used.
pub fn build_backend(
    backend: &str,
    settings: &BTreeMap<String, String>,
) -> Result<Box<dyn Backend>> {
    match backend {
        "folder" => Ok(Box::new(FolderBackend::from_settings(settings))),
        "s3" => Ok(Box::new(S3Backend::from_settings(settings)?)),
        "glacier" => Ok(Box::new(GlacierBackend::from_settings(settings)?)),
        "webdav" => Ok(Box::new(WebDavBackend::from_settings(settings)?)),
        other => Err(crate::icebox_error!(ConfigError {
            description: format!("Unsupported backend: {other}"),
        })),
    }
}
