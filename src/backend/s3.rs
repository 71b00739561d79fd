use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use aws_sdk_s3::{
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload, CompletedPart, GlacierJobParameters, RestoreRequest,
        StorageClass, Tier,
    },
};
use log::{debug, error, info};
use tempfile::{NamedTempFile, TempPath};

use super::{
    required, Backend, BackendFile, JobStatus, RetrievalOptions, RetrievalTier,
    SYNC_INVENTORY_JOB,
};
use crate::{
    upload::{plan_parts, Part, MULTIPART_LIMIT, PART_SIZE},
    utils::aws::{build_s3_client, create_runtime, AwsSettings},
    Result, ResultExt,
};

type S3Client = aws_sdk_s3::Client;

const RESTORE_RUNNING: &str = "ongoing-request=\"true\"";
const RESTORE_COMPLETE: &str = "ongoing-request=\"false\"";
const RESTORE_DAYS: i32 = 1;

/// Object store backend. Data archives go to an archival storage class and
/// have to be restored before download; metadata is stored as `STANDARD`.
pub struct S3Backend {
    runtime: Arc<tokio::runtime::Runtime>,
    client: S3Client,
    bucket: Option<String>,
    storage_class: Option<String>,
    tier: Option<String>,
    multipart_limit: u64,
    part_size: u64,
}

impl S3Backend {
    pub fn new(
        runtime: Arc<tokio::runtime::Runtime>,
        client: S3Client,
        bucket: Option<String>,
        storage_class: Option<String>,
        tier: Option<String>,
    ) -> Self {
        Self {
            runtime,
            client,
            bucket,
            storage_class,
            tier,
            multipart_limit: MULTIPART_LIMIT,
            part_size: PART_SIZE,
        }
    }

    /// Uploads files of at least `limit` bytes in parts of `part_size`.
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
        let client = build_s3_client(&runtime, &aws);
        Ok(Self::new(
            runtime,
            client,
            settings.get("bucket").cloned(),
            settings.get("storage_class").cloned(),
            settings.get("tier").cloned(),
        ))
    }

    fn bucket(&self) -> Result<&str> {
        required(&self.bucket, "bucket")
    }

    fn storage_class(&self) -> Result<StorageClass> {
        parse_storage_class(self.storage_class.as_deref().unwrap_or("DEEP_ARCHIVE"))
    }

    fn tier(&self) -> Result<RetrievalTier> {
        match &self.tier {
            Some(tier) => tier.parse(),
            None => Ok(RetrievalTier::Bulk),
        }
    }

    fn store(&self, path: &Path, name: &str, storage_class: StorageClass) -> Result<String> {
        let bucket = self.bucket()?;
        let size = std::fs::metadata(path)?.len();
        debug!(
            "Uploading {} ({size} bytes) to s3://{bucket}/{name} as {}",
            path.display(),
            storage_class.as_str()
        );
        if size < self.multipart_limit {
            let body = std::fs::read(path)?;
            self.runtime
                .block_on(put_object(&self.client, bucket, name, body, storage_class))?;
        } else {
            let plan = plan_parts(File::open(path)?, self.part_size)?;
            self.runtime.block_on(multipart_upload(
                &self.client,
                bucket,
                name,
                path,
                &plan.parts,
                storage_class,
            ))?;
        }
        Ok(name.to_string())
    }

    fn head(&self, key: &str) -> Result<(Option<StorageClass>, Option<String>)> {
        let output = self
            .runtime
            .block_on(self.client.head_object().bucket(self.bucket()?).key(key).send())
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to query S3 object {key}: {err}"),
                })
            })?;
        Ok((
            output.storage_class().cloned(),
            output.restore().map(str::to_string),
        ))
    }
}

fn parse_storage_class(value: &str) -> Result<StorageClass> {
    match value {
        "GLACIER" => Ok(StorageClass::Glacier),
        "DEEP_ARCHIVE" => Ok(StorageClass::DeepArchive),
        other => Err(crate::icebox_error!(ConfigError {
            description: format!(
                "Unsupported storage class '{other}' (expected GLACIER or DEEP_ARCHIVE)"
            ),
        })),
    }
}

fn is_archival(storage_class: &Option<StorageClass>) -> bool {
    matches!(
        storage_class,
        Some(StorageClass::Glacier) | Some(StorageClass::DeepArchive)
    )
}

fn restore_status(
    storage_class: &Option<StorageClass>,
    restore: Option<&str>,
) -> Result<JobStatus> {
    if !is_archival(storage_class) {
        return Ok(JobStatus::Success);
    }
    match restore {
        None => Ok(JobStatus::Failure),
        Some(r) if r.contains(RESTORE_RUNNING) => Ok(JobStatus::Running),
        Some(r) if r.contains(RESTORE_COMPLETE) => Ok(JobStatus::Success),
        Some(r) => Err(crate::icebox_error!(BackendError {
            description: format!("Unsupported restore state: {r}"),
        })),
    }
}

async fn put_object(
    client: &S3Client,
    bucket: &str,
    key: &str,
    data: Vec<u8>,
    storage_class: StorageClass,
) -> Result<()> {
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .storage_class(storage_class)
        .body(ByteStream::from(data))
        .send()
        .await
        .map_err(|err| {
            crate::icebox_error!(BackendError {
                description: format!("Failed to upload object to S3: {err}"),
            })
        })?;
    Ok(())
}

async fn multipart_upload(
    client: &S3Client,
    bucket: &str,
    key: &str,
    path: &Path,
    parts: &[Part],
    storage_class: StorageClass,
) -> Result<()> {
    let created = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .storage_class(storage_class)
        .send()
        .await
        .map_err(|err| {
            crate::icebox_error!(BackendError {
                description: format!("Failed to start multipart upload: {err}"),
            })
        })?;
    let upload_id = created.upload_id().unwrap_or_default().to_string();

    let result = upload_parts(client, bucket, key, &upload_id, path, parts).await;
    match result {
        Ok(completed) => {
            client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(|err| {
                    crate::icebox_error!(BackendError {
                        description: format!("Failed to complete multipart upload: {err}"),
                    })
                })?;
            Ok(())
        }
        Err(e) => {
            if let Err(abort_err) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
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

async fn upload_parts(
    client: &S3Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    path: &Path,
    parts: &[Part],
) -> Result<Vec<CompletedPart>> {
    let mut file = File::open(path)?;
    let mut completed = Vec::with_capacity(parts.len());
    for (index, part) in parts.iter().enumerate() {
        let part_number = index as i32 + 1;
        let mut body = Vec::with_capacity(part.len() as usize);
        part.reader(&mut file)?.read_to_end(&mut body)?;
        debug!("Uploading part {part_number} ({})", part.content_range());
        let output = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to upload part {part_number}: {err}"),
                })
            })?;
        completed.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(output.e_tag().map(str::to_string))
                .build(),
        );
    }
    Ok(completed)
}

async fn download_object(client: &S3Client, bucket: &str, key: &str) -> Result<TempPath> {
    let output = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|err| {
            crate::icebox_error!(BackendError {
                description: format!("Failed to fetch object from S3: {err}"),
            })
        })?;

    let mut tmp = NamedTempFile::new()?;
    let mut body = output.body;
    while let Some(bytes) = body.try_next().await.map_err(|err| {
        crate::icebox_error!(BackendError {
            description: format!("Failed to read object body: {err}"),
        })
    })? {
        tmp.write_all(&bytes)?;
    }
    tmp.flush()?;
    Ok(tmp.into_temp_path())
}

async fn list_objects(client: &S3Client, bucket: &str) -> Result<Vec<BackendFile>> {
    let mut files = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let output = client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation.take())
            .send()
            .await
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to list S3 bucket {bucket}: {err}"),
                })
            })?;
        for object in output.contents() {
            if let Some(key) = object.key() {
                let size = object.size().unwrap_or_default().max(0) as u64;
                files.push(BackendFile::new(key, key, size));
            }
        }
        match output.next_continuation_token() {
            Some(token) if output.is_truncated().unwrap_or(false) => {
                continuation = Some(token.to_string());
            }
            _ => break,
        }
    }
    Ok(files)
}

impl Backend for S3Backend {
    fn box_init(&self) -> Result<()> {
        let bucket = self.bucket()?;
        self.storage_class()?;
        self.tier()?;
        self.runtime
            .block_on(self.client.list_objects_v2().bucket(bucket).max_keys(1).send())
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Cannot access S3 bucket {bucket}: {err}"),
                })
            })?;
        Ok(())
    }

    fn store_data(&self, path: &Path, name: &str) -> Result<String> {
        self.store(path, name, self.storage_class()?)
    }

    fn store_meta(&self, path: &Path, name: &str) -> Result<String> {
        self.store(path, name, StorageClass::Standard)
    }

    fn retrieve_init(&self, retrieval_key: &str, options: &RetrievalOptions) -> Result<String> {
        let (storage_class, restore) = self.head(retrieval_key)?;
        if is_archival(&storage_class) && restore.is_none() {
            let tier = match options.tier {
                Some(tier) => tier,
                None => self.tier()?,
            };
            info!("Requesting restore of {retrieval_key} ({tier})");
            let job_parameters = GlacierJobParameters::builder()
                .tier(Tier::from(tier.as_str()))
                .build()
                .map_err(|err| {
                    crate::icebox_error!(BackendError {
                        description: format!("Invalid restore parameters: {err}"),
                    })
                })?;
            let request = RestoreRequest::builder()
                .days(RESTORE_DAYS)
                .glacier_job_parameters(job_parameters)
                .build();
            self.runtime
                .block_on(
                    self.client
                        .restore_object()
                        .bucket(self.bucket()?)
                        .key(retrieval_key)
                        .restore_request(request)
                        .send(),
                )
                .map_err(|err| {
                    crate::icebox_error!(BackendError {
                        description: format!("Failed to restore {retrieval_key}: {err}"),
                    })
                })?;
        }
        Ok(retrieval_key.to_string())
    }

    fn retrieve_status(&self, job_key: &str) -> JobStatus {
        let status = self.head(job_key).and_then(|(storage_class, restore)| {
            restore_status(&storage_class, restore.as_deref())
        });
        match status {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to check restore of {job_key}: {e}");
                JobStatus::Failure
            }
        }
    }

    fn retrieve_finish(&self, job_key: &str) -> Result<TempPath> {
        let (storage_class, restore) = self.head(job_key)?;
        if restore_status(&storage_class, restore.as_deref())? != JobStatus::Success {
            return Err(crate::icebox_error!(JobFailed {
                operation: format!("restore of {job_key}"),
            }));
        }
        self.runtime
            .block_on(download_object(&self.client, self.bucket()?, job_key))
            .context(format!("Downloading {job_key}"))
    }

    fn delete(&self, retrieval_key: &str) -> Result<()> {
        let bucket = self.bucket()?;
        debug!("Deleting s3://{bucket}/{retrieval_key}");
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(bucket)
                    .key(retrieval_key)
                    .send(),
            )
            .map_err(|err| {
                crate::icebox_error!(BackendError {
                    description: format!("Failed to delete {retrieval_key}: {err}"),
                })
            })?;
        Ok(())
    }

    fn inventory_init(&self) -> Result<String> {
        Ok(SYNC_INVENTORY_JOB.to_string())
    }

    fn inventory_status(&self, _job_key: &str) -> JobStatus {
        JobStatus::Success
    }

    fn inventory_finish(&self, _job_key: &str) -> Result<Vec<BackendFile>> {
        self.runtime.block_on(list_objects(&self.client, self.bucket()?))
    }
}
