use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use aws_sdk_glacier::{
    operation::{delete_archive::DeleteArchiveError, describe_job::DescribeJobOutput},
    primitives::ByteStream,
    types::{JobParameters, StatusCode},
};
use log::{debug, error, info};
use serde::Deserialize;
use tempfile::{NamedTempFile, TempPath};

use super::{required, Backend, BackendFile, JobStatus, RetrievalOptions, RetrievalTier};
use crate::{
    upload::{plan_parts, PartPlan, MULTIPART_LIMIT, PART_SIZE},
    utils::aws::{build_glacier_client, create_runtime, AwsSettings},
    Result, ResultExt,
};

type GlacierClient = aws_sdk_glacier::Client;

/// Vaults are always addressed through the credentials' own account.
const ACCOUNT_ID: &str = "-";

/// Archival vault backend. Every retrieval, including the inventory, is an
/// asynchronous vault job that may take hours to complete.
pub struct GlacierBackend {
    runtime: Arc<tokio::runtime::Runtime>,
    client: GlacierClient,
    vault: Option<String>,
    tier: Option<String>,
    multipart_limit: u64,
    part_size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inventory {
    archive_list: Vec<InventoryArchive>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InventoryArchive {
    archive_id: String,
    #[serde(default)]
    archive_description: String,
    #[serde(default)]
    size: u64,
}

impl GlacierBackend {
    pub fn new(
        runtime: Arc<tokio::runtime::Runtime>,
        client: GlacierClient,
        vault: Option<String>,
        tier: Option<String>,
    ) -> Self {
        Self {
            runtime,
            client,
            vault,
            tier,
            multipart_limit: MULTIPART_LIMIT,
            part_size: PART_SIZE,
        }
    }

    /// Uploads files of at least `limit` bytes in parts of `part_size`,
    /// which must be a power-of-two multiple of 1 MiB.
    pub fn with_multipart(mut self, limit: u64, part_size: u64) -> Self {
        self.multipart_limit = limit;
        self.part_size = part_size;
        self
    }

    pub fn from_settings(settings: &BTreeMap<String, String>) -> Result<Self> {
        let aws = AwsSettings {
            profile: settings.get("profile").cloned(),
            region: settings.get("region").cloned(),
            endpoint: settings.get("endpoint").cloned(),
        };
        let runtime = create_runtime()?;
        let client = build_glacier_client(&runtime, &aws);
        Ok(Self::new(
            runtime,
            client,
            settings.get("vault").cloned(),
            settings.get("tier").cloned(),
        ))
    }

    fn vault(&self) -> Result<&str> {
        required(&self.vault, "vault")
    }

    fn tier(&self) -> Result<RetrievalTier> {
        match &self.tier {
            Some(tier) => tier.parse(),
            None => Ok(RetrievalTier::Bulk),
        }
    }

    fn store(&self, path: &Path, name: &str) -> Result<String> {
        let vault = self.vault()?;
        let plan = plan_parts(File::open(path)?, self.part_size)?;
        debug!(
            "Uploading {} ({} bytes) to vault {vault} as {name}",
            path.display(),
            plan.size
        );
        if plan.size < self.multipart_limit {
            let body = std::fs::read(path)?;
            self.runtime.block_on(self.upload_archive(name, body, &plan))
        } else {
            self.runtime.block_on(self.multipart_upload(name, path, &plan))
        }
    }

    async fn upload_archive(&self, name: &str, body: Vec<u8>, plan: &PartPlan) -> Result<String> {
        let output = self
            .client
            .upload_archive()
            .account_id(ACCOUNT_ID)
            .vault_name(self.vault()?)
            .archive_description(name)
            .checksum(plan.tree_hash_hex())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to upload archive {name}: {err}"),
                })
            })?;
        archive_id(output.archive_id(), name)
    }

    async fn multipart_upload(&self, name: &str, path: &Path, plan: &PartPlan) -> Result<String> {
        let vault = self.vault()?;
        let created = self
            .client
            .initiate_multipart_upload()
            .account_id(ACCOUNT_ID)
            .vault_name(vault)
            .archive_description(name)
            .part_size(self.part_size.to_string())
            .send()
            .await
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to start multipart upload of {name}: {err}"),
                })
            })?;
        let upload_id = created.upload_id().unwrap_or_default().to_string();

        let completed = match self.upload_parts(&upload_id, path, plan).await {
            Ok(()) => {
                self.client
                    .complete_multipart_upload()
                    .account_id(ACCOUNT_ID)
                    .vault_name(vault)
                    .upload_id(&upload_id)
                    .archive_size(plan.size.to_string())
                    .checksum(plan.tree_hash_hex())
                    .send()
                    .await
                    .map_err(|err| {
                        crate::icebox_error!(BackendError {
                            description: format!("Failed to complete upload of {name}: {err}"),
                        })
                    })
            }
            Err(e) => Err(e),
        };

        match completed {
            Ok(output) => archive_id(output.archive_id(), name),
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .account_id(ACCOUNT_ID)
                    .vault_name(vault)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    error!("Failed to abort multipart upload {upload_id}: {abort_err}");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, upload_id: &str, path: &Path, plan: &PartPlan) -> Result<()> {
        let vault = self.vault()?;
        let mut file = File::open(path)?;
        for part in &plan.parts {
            let mut body = Vec::with_capacity(part.len() as usize);
            part.reader(&mut file)?.read_to_end(&mut body)?;
            debug!("Uploading {}", part.content_range());
            self.client
                .upload_multipart_part()
                .account_id(ACCOUNT_ID)
                .vault_name(vault)
                .upload_id(upload_id)
                .range(part.content_range())
                .checksum(hex::encode(part.tree_hash))
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|err| {
                    crate::icebox_error!(BackendError {
                        description: format!("Failed to upload {}: {err}", part.content_range()),
                    })
                })?;
        }
        Ok(())
    }

    fn initiate_job(&self, parameters: JobParameters) -> Result<String> {
        let vault = self.vault()?;
        let output = self
            .runtime
            .block_on(
                self.client
                    .initiate_job()
                    .account_id(ACCOUNT_ID)
                    .vault_name(vault)
                    .job_parameters(parameters)
                    .send(),
            )
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to initiate vault job: {err}"),
                })
            })?;
        output.job_id().map(str::to_string).ok_or_else(|| {
            crate::icebox_error!(BackendError {
                description: "Vault job was created without an id".to_string(),
            })
        })
    }

    fn describe_job(&self, job_key: &str) -> Result<DescribeJobOutput> {
        let vault = self.vault()?;
        self.runtime
            .block_on(
                self.client
                    .describe_job()
                    .account_id(ACCOUNT_ID)
                    .vault_name(vault)
                    .job_id(job_key)
                    .send(),
            )
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to describe vault job {job_key}: {err}"),
                })
            })
    }

    fn job_status(&self, job_key: &str) -> JobStatus {
        match self.describe_job(job_key) {
            Ok(output) => match output.status_code() {
                Some(StatusCode::Succeeded) => JobStatus::Success,
                Some(StatusCode::Failed) => {
                    error!(
                        "Vault job {job_key} failed: {}",
                        output.status_message().unwrap_or("no details")
                    );
                    JobStatus::Failure
                }
                _ => JobStatus::Running,
            },
            Err(e) => {
                error!("{e}");
                JobStatus::Failure
            }
        }
    }

    /// Downloads the output of a finished job into a temporary file.
    fn job_output(&self, job_key: &str) -> Result<TempPath> {
        let described = self.describe_job(job_key)?;
        if described.status_code() != Some(&StatusCode::Succeeded) {
            return Err(crate::icebox_error!(JobFailed {
                operation: format!("vault job {job_key}"),
            }));
        }
        let vault = self.vault()?;
        self.runtime.block_on(async {
            let output = self
                .client
                .get_job_output()
                .account_id(ACCOUNT_ID)
                .vault_name(vault)
                .job_id(job_key)
                .send()
                .await
                .map_err(|err| {
                    crate::icebox_error!(BackendError {
                        description: format!("Failed to fetch output of job {job_key}: {err}"),
                    })
                })?;
            let mut tmp = NamedTempFile::new()?;
            let mut body = output.body;
            while let Some(bytes) = body.try_next().await.map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to read job output: {err}"),
                })
            })? {
                tmp.write_all(&bytes)?;
            }
            tmp.flush()?;
            Ok(tmp.into_temp_path())
        })
    }
}

fn archive_id(id: Option<&str>, name: &str) -> Result<String> {
    id.map(str::to_string).ok_or_else(|| {
        crate::icebox_error!(BackendError {
            description: format!("Vault returned no archive id for {name}"),
        })
    })
}

fn parse_inventory(content: &[u8]) -> Result<Vec<BackendFile>> {
    let inventory: Inventory = serde_json::from_slice(content)?;
    Ok(inventory
        .archive_list
        .into_iter()
        .map(|a| BackendFile::new(a.archive_id, a.archive_description, a.size))
        .collect())
}

impl Backend for GlacierBackend {
    fn box_init(&self) -> Result<()> {
        let vault = self.vault()?;
        self.tier()?;
        self.runtime
            .block_on(
                self.client
                    .describe_vault()
                    .account_id(ACCOUNT_ID)
                    .vault_name(vault)
                    .send(),
            )
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Cannot access vault {vault}: {err}"),
                })
            })?;
        Ok(())
    }

    fn store_data(&self, path: &Path, name: &str) -> Result<String> {
        self.store(path, name)
    }

    fn store_meta(&self, path: &Path, name: &str) -> Result<String> {
        self.store(path, name)
    }

    fn retrieve_init(&self, retrieval_key: &str, options: &RetrievalOptions) -> Result<String> {
        let tier = match options.tier {
            Some(tier) => tier,
            None => self.tier()?,
        };
        info!("Initiating archive retrieval ({tier})");
        self.initiate_job(
            JobParameters::builder()
                .r#type("archive-retrieval")
                .archive_id(retrieval_key)
                .tier(tier.as_str())
                .build(),
        )
    }

    fn retrieve_status(&self, job_key: &str) -> JobStatus {
        self.job_status(job_key)
    }

    fn retrieve_finish(&self, job_key: &str) -> Result<TempPath> {
        self.job_output(job_key)
    }

    fn delete(&self, retrieval_key: &str) -> Result<()> {
        let vault = self.vault()?;
        let deleted = self.runtime.block_on(
            self.client
                .delete_archive()
                .account_id(ACCOUNT_ID)
                .vault_name(vault)
                .archive_id(retrieval_key)
                .send(),
        );
        match deleted {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.as_service_error(),
                    Some(DeleteArchiveError::ResourceNotFoundException(_))
                ) =>
            {
                debug!("Archive {retrieval_key} is already gone from vault {vault}");
                Ok(())
            }
            Err(err) => Err(crate::icebox_error!(BackendError {
                description: format!("Failed to delete archive: {err}"),
            })),
        }
    }

    fn inventory_init(&self) -> Result<String> {
        let vault = self.vault()?;
        info!("Initiating inventory retrieval of vault {vault}");
        self.initiate_job(
            JobParameters::builder()
                .r#type("inventory-retrieval")
                .format("JSON")
                .build(),
        )
    }

    fn inventory_status(&self, job_key: &str) -> JobStatus {
        self.job_status(job_key)
    }

    fn inventory_finish(&self, job_key: &str) -> Result<Vec<BackendFile>> {
        let tmp = self.job_output(job_key)?;
        let content = std::fs::read(&tmp)?;
        parse_inventory(&content).context("Parsing vault inventory".to_string())
    }
}
