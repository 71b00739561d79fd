//! The box orchestrator.
//!
//! A box is a local directory holding `config.yml`, the `identity` used to seal
//! archives and the `box.db` catalog. Content lives on the configured backend
//! as `<id>.data` / `<id>.meta` pairs.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    backend::{build_backend, Backend, JobStatus, RetrievalOptions},
    catalog::{Catalog, Source},
    config::{BoxConfig, CONFIG_FILE},
    crypt::{
        source_name, Compression, Crypto, Identity, SealedArchiver, DEFAULT_COMPRESSION,
        IDENTITY_FILE,
    },
    error_context,
    poller::JobPoller,
    reconcile::backend_names,
    Result, ResultExt,
};

mod refresh;

pub use refresh::RefreshReport;

pub struct IceBox {
    path: PathBuf,
    config: BoxConfig,
    catalog: Catalog,
    backend: Box<dyn Backend>,
    crypto: Box<dyn Crypto>,
    poller: JobPoller,
}

fn create_box_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .context(format!("Creating box directory {}", path.display()))
}

impl IceBox {
    /// Creates a new box at `path`.
    ///
    /// The backend is checked before `config.yml` is written, so a box whose
    /// backend is unreachable is never left half-initialised; `init` can simply
    /// be retried.
    #[error_context("Initialising box {}", path.display())]
    pub fn init(path: &Path, config: BoxConfig) -> Result<Self> {
        let config_path = path.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(crate::icebox_error!(BoxExists {
                path: path.display().to_string(),
            }));
        }
        config.validate()?;
        create_box_dir(path)?;

        let identity_path = path.join(IDENTITY_FILE);
        let identity = if identity_path.exists() {
            Identity::load(&identity_path)?
        } else {
            let identity = Identity::generate();
            identity.save(&identity_path)?;
            identity
        };
        let catalog = Catalog::open(path)?;

        let backend = build_backend(&config.backend, &config.settings)?;
        backend.box_init()?;
        config.save(&config_path)?;
        info!("Initialised {} box at {}", config.backend, path.display());

        let poller = JobPoller::new(config.poll_interval());
        Ok(Self::with_parts(
            path,
            config,
            catalog,
            backend,
            Box::new(SealedArchiver::new(identity)),
            poller,
        ))
    }

    #[error_context("Opening box {}", path.display())]
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join(CONFIG_FILE);
        if !config_path.is_file() {
            return Err(crate::icebox_error!(BoxNotFound {
                path: path.display().to_string(),
            }));
        }
        let config = BoxConfig::load(&config_path)?;
        let catalog = Catalog::open(path)?;
        let backend = build_backend(&config.backend, &config.settings)?;
        let crypto = SealedArchiver::load(&path.join(IDENTITY_FILE))?;
        let poller = JobPoller::new(config.poll_interval());
        Ok(Self::with_parts(
            path,
            config,
            catalog,
            backend,
            Box::new(crypto),
            poller,
        ))
    }

    /// Assembles a box from already constructed collaborators.
    pub fn with_parts(
        path: &Path,
        config: BoxConfig,
        catalog: Catalog,
        backend: Box<dyn Backend>,
        crypto: Box<dyn Crypto>,
        poller: JobPoller,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            config,
            catalog,
            backend,
            crypto,
            poller,
        }
    }

    pub fn config(&self) -> &BoxConfig {
        &self.config
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.catalog.load_source(name)?.is_some())
    }

    /// All sources, ordered by name ignoring case.
    pub fn sources(&self) -> Result<Vec<Source>> {
        self.catalog.load_all_sources()
    }

    fn source(&self, name: &str) -> Result<Source> {
        self.catalog.load_source(name)?.ok_or_else(|| {
            crate::icebox_error!(SourceNotFound {
                name: name.to_string(),
            })
        })
    }

    pub fn store(&self, source: &Path, comment: Option<&str>) -> Result<Source> {
        self.store_with(source, comment, DEFAULT_COMPRESSION)
    }

    /// Compresses and seals `source`, then uploads the archive pair.
    ///
    /// If the metadata upload fails after the data upload succeeded, the data
    /// file stays on the backend without a catalog entry and shows up as
    /// orphaned in the next `refresh`.
    #[error_context("Storing {}", source.display())]
    pub fn store_with(
        &self,
        source: &Path,
        comment: Option<&str>,
        compression: Compression,
    ) -> Result<Source> {
        let name = source_name(source)?;
        if self.contains(&name)? {
            return Err(crate::icebox_error!(SourceExists { name: name }));
        }

        info!("Encrypting {name} ({} compression)", compression.as_str());
        let pair = self.crypto.encrypt(source, comment, compression)?;
        let size = fs::metadata(&pair.data)?.len();
        let (data_name, meta_name) = backend_names();

        info!("Transferring {name} to backend");
        let data_key = self.backend.store_data(&pair.data, &data_name)?;
        let meta_key = match self.backend.store_meta(&pair.meta, &meta_name) {
            Ok(key) => key,
            Err(e) => {
                warn!("Data archive {data_name} of {name} was stored without its metadata");
                return Err(e);
            }
        };

        let stored = Source {
            name,
            comment: comment.map(str::to_string),
            size,
            data_key,
            meta_key,
        };
        self.catalog.save_source(&stored)?;
        info!("Stored {} ({} bytes)", stored.name, stored.size);
        Ok(stored)
    }

    /// Fetches `name` from the backend and restores it below `destination`.
    ///
    /// The backend job is recorded in the catalog before waiting, so an
    /// interrupted retrieval resumes polling the same job.
    #[error_context("Retrieving {}", name)]
    pub fn retrieve(
        &self,
        name: &str,
        destination: &Path,
        options: &RetrievalOptions,
    ) -> Result<PathBuf> {
        let source = self.source(name)?;
        let job_key = match self.catalog.load_job(name)? {
            Some(job_key) => {
                info!("Resuming transfer of {name} from backend");
                job_key
            }
            None => {
                info!("Initiating transfer from backend");
                let job_key = self.backend.retrieve_init(&source.data_key, options)?;
                self.catalog.save_job(name, &job_key)?;
                job_key
            }
        };

        let status = self.poller.wait("Transfer from backend", || {
            self.backend.retrieve_status(&job_key)
        });
        if status != JobStatus::Success {
            self.catalog.delete_job(name)?;
            return Err(crate::icebox_error!(JobFailed {
                operation: format!("retrieval of {name}"),
            }));
        }

        info!("Downloading {name}");
        let downloaded = self.backend.retrieve_finish(&job_key)?;
        self.catalog.delete_job(name)?;

        info!("Decrypting {name}");
        let restored = self.crypto.decrypt(&downloaded, destination)?;
        info!("Restored {name} to {}", restored.display());
        Ok(restored)
    }

    /// Removes both archives from the backend, then forgets the source.
    #[error_context("Deleting {}", name)]
    pub fn delete(&self, name: &str) -> Result<()> {
        let source = self.source(name)?;
        self.backend.delete(&source.data_key)?;
        self.backend.delete(&source.meta_key)?;
        self.catalog.delete_source(name)?;
        info!("Deleted {name}");
        Ok(())
    }
}

#[cfg(test)]
#[path = "ice_box_tests.rs"]
mod tests;
