use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, error};
use tempfile::{NamedTempFile, TempPath};

use super::{
    required, Backend, BackendFile, JobStatus, RetrievalOptions, SYNC_INVENTORY_JOB,
};
use crate::{Result, ResultExt};

/// Stores archives as plain files in a local (or mounted) folder. Retrieval
/// keys are the file names.
pub struct FolderBackend {
    folder_path: Option<String>,
}

impl FolderBackend {
    pub fn new(folder_path: PathBuf) -> Self {
        Self {
            folder_path: Some(folder_path.to_string_lossy().into_owned()),
        }
    }

    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        Self {
            folder_path: settings.get("folder_path").cloned(),
        }
    }

    fn folder(&self) -> Result<PathBuf> {
        required(&self.folder_path, "folder_path").map(PathBuf::from)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
            return Err(crate::icebox_error!(InvalidParameter {
                description: format!("Invalid retrieval key '{key}'"),
            }));
        }
        Ok(self.folder()?.join(key))
    }

    fn store(&self, src: &Path, name: &str) -> Result<String> {
        let dst = self.object_path(name)?;
        debug!("Copying {} to {}", src.display(), dst.display());
        fs::copy(src, &dst).context(format!("Failed to store {name} in folder"))?;
        Ok(name.to_string())
    }
}

impl Backend for FolderBackend {
    fn box_init(&self) -> Result<()> {
        let folder = self.folder()?;
        let metadata = fs::metadata(&folder).map_err(|e| {
            crate::icebox_error!(BackendError {
                description: format!("Folder {} is not accessible: {e}", folder.display()),
            })
        })?;
        if !metadata.is_dir() {
            return Err(crate::icebox_error!(BackendError {
                description: format!("{} is not a directory", folder.display()),
            }));
        }
        if metadata.permissions().readonly() {
            return Err(crate::icebox_error!(BackendError {
                description: format!("Folder {} is not writable", folder.display()),
            }));
        }
        Ok(())
    }

    fn store_data(&self, path: &Path, name: &str) -> Result<String> {
        self.store(path, name)
    }

    fn store_meta(&self, path: &Path, name: &str) -> Result<String> {
        self.store(path, name)
    }

    fn retrieve_init(&self, retrieval_key: &str, _options: &RetrievalOptions) -> Result<String> {
        Ok(retrieval_key.to_string())
    }

    fn retrieve_status(&self, job_key: &str) -> JobStatus {
        match self.object_path(job_key) {
            Ok(path) if path.is_file() => JobStatus::Success,
            Ok(path) => {
                error!("Folder object {} does not exist", path.display());
                JobStatus::Failure
            }
            Err(e) => {
                error!("Failed to check folder object {job_key}: {e}");
                JobStatus::Failure
            }
        }
    }

    fn retrieve_finish(&self, job_key: &str) -> Result<TempPath> {
        let src = self.object_path(job_key)?;
        let tmp = NamedTempFile::new()?.into_temp_path();
        fs::copy(&src, &tmp).context(format!("Failed to retrieve {job_key} from folder"))?;
        Ok(tmp)
    }

    fn delete(&self, retrieval_key: &str) -> Result<()> {
        let path = self.object_path(retrieval_key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} already absent", path.display());
                Ok(())
            }
            Err(e) => Err(e).context(format!("Failed to delete {retrieval_key} from folder")),
        }
    }

    fn inventory_init(&self) -> Result<String> {
        Ok(SYNC_INVENTORY_JOB.to_string())
    }

    fn inventory_status(&self, _job_key: &str) -> JobStatus {
        JobStatus::Success
    }

    fn inventory_finish(&self, _job_key: &str) -> Result<Vec<BackendFile>> {
        let folder = self.folder()?;
        let mut files = Vec::new();
        if !folder.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&folder)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.push(BackendFile::new(name, name, entry.metadata()?.len()));
            }
        }
        Ok(files)
    }
}
