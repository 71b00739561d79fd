use std::collections::BTreeMap;

use log::{info, warn};

use super::IceBox;
use crate::{
    backend::{BackendFile, JobStatus, RetrievalOptions},
    catalog::Source,
    error_context,
    reconcile::{InventoryCheck, INVENTORY_JOB},
    Result,
};

/// Findings of a `refresh` run. Nothing listed here is repaired automatically.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Sources added to the catalog from backend pairs.
    pub imported: Vec<String>,
    /// Backend pairs whose name is already taken by another source.
    pub duplicates: Vec<String>,
    /// Cataloged sources with missing backend keys.
    pub broken_sources: BTreeMap<String, Vec<String>>,
    /// Backend files without a sibling.
    pub orphaned: Vec<BackendFile>,
    /// Metadata files that could not be fetched or opened.
    pub failed_imports: Vec<String>,
}

/// An import whose metadata retrieval job is in flight.
struct PendingImport {
    meta: BackendFile,
    data: BackendFile,
    job_key: String,
}

impl IceBox {
    /// Compares the catalog with the backend inventory and imports pairs
    /// that were stored from elsewhere.
    #[error_context("Refreshing box {}", self.path.display())]
    pub fn refresh(&self, options: &RetrievalOptions) -> Result<RefreshReport> {
        let inventory = self.fetch_inventory()?;
        info!("Backend holds {} files", inventory.len());
        let check = InventoryCheck::new(&self.catalog.load_all_sources()?, inventory);

        for (name, missing) in &check.broken_sources {
            warn!("Source {name} is missing backend files: {}", missing.join(", "));
        }
        for file in &check.orphaned {
            warn!("Orphaned backend file {} ({})", file.name, file.key);
        }

        let mut report = RefreshReport {
            broken_sources: check.broken_sources,
            orphaned: check.orphaned,
            ..Default::default()
        };
        self.import_pairs(check.importable, options, &mut report)?;
        // Kept until every import has settled so an interrupted refresh
        // reuses the same inventory.
        self.catalog.delete_job(INVENTORY_JOB)?;
        Ok(report)
    }

    fn fetch_inventory(&self) -> Result<Vec<BackendFile>> {
        let job_key = match self.catalog.load_job(INVENTORY_JOB)? {
            Some(job_key) => job_key,
            None => {
                info!("Requesting backend inventory");
                let job_key = self.backend.inventory_init()?;
                self.catalog.save_job(INVENTORY_JOB, &job_key)?;
                job_key
            }
        };

        let status = self.poller.wait("Inventory retrieval", || {
            self.backend.inventory_status(&job_key)
        });
        if status != JobStatus::Success {
            self.catalog.delete_job(INVENTORY_JOB)?;
            return Err(crate::icebox_error!(JobFailed {
                operation: "inventory retrieval".to_string(),
            }));
        }

        self.backend.inventory_finish(&job_key)
    }

    /// Starts one metadata retrieval per pair and polls them together until
    /// every job has finished.
    fn import_pairs(
        &self,
        importable: Vec<(BackendFile, BackendFile)>,
        options: &RetrievalOptions,
        report: &mut RefreshReport,
    ) -> Result<()> {
        let mut pending = Vec::new();
        for (meta, data) in importable {
            let job_key = match self.catalog.load_job(&meta.key)? {
                Some(job_key) => job_key,
                None => match self.backend.retrieve_init(&meta.key, options) {
                    Ok(job_key) => {
                        self.catalog.save_job(&meta.key, &job_key)?;
                        job_key
                    }
                    Err(e) => {
                        warn!("Cannot request metadata {}: {e}", meta.name);
                        report.failed_imports.push(meta.name);
                        continue;
                    }
                },
            };
            pending.push(PendingImport {
                meta,
                data,
                job_key,
            });
        }

        if !pending.is_empty() {
            info!("Fetching metadata of {} unknown pairs", pending.len());
        }
        while !pending.is_empty() {
            let mut running = Vec::new();
            for import in pending {
                match self.backend.retrieve_status(&import.job_key) {
                    JobStatus::Running => running.push(import),
                    JobStatus::Failure => {
                        self.catalog.delete_job(&import.meta.key)?;
                        warn!("Metadata retrieval of {} failed", import.meta.name);
                        report.failed_imports.push(import.meta.name);
                    }
                    JobStatus::Success => self.finish_import(import, report)?,
                }
            }
            pending = running;
            if !pending.is_empty() {
                self.poller.pause();
            }
        }
        Ok(())
    }

    fn finish_import(&self, import: PendingImport, report: &mut RefreshReport) -> Result<()> {
        let PendingImport {
            meta,
            data,
            job_key,
        } = import;

        // A failed download keeps its job so the next refresh resumes it.
        let downloaded = match self.backend.retrieve_finish(&job_key) {
            Ok(downloaded) => downloaded,
            Err(e) => {
                warn!("Cannot download metadata {}: {e}", meta.name);
                report.failed_imports.push(meta.name);
                return Ok(());
            }
        };
        self.catalog.delete_job(&meta.key)?;

        let metadata = match self.crypto.decrypt_meta(&downloaded) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Cannot open metadata {}: {e}", meta.name);
                report.failed_imports.push(meta.name);
                return Ok(());
            }
        };

        if self.contains(&metadata.name)? {
            warn!(
                "Backend pair {} duplicates existing source {}",
                data.name, metadata.name
            );
            report.duplicates.push(metadata.name);
            return Ok(());
        }

        self.catalog.save_source(&Source {
            name: metadata.name.clone(),
            comment: metadata.comment,
            size: data.size,
            data_key: data.key,
            meta_key: meta.key,
        })?;
        info!("Imported {}", metadata.name);
        report.imported.push(metadata.name);
        Ok(())
    }
}
