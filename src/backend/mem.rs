use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io::Write,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use tempfile::{NamedTempFile, TempPath};

use super::{Backend, BackendFile, JobStatus, RetrievalOptions};
use crate::Result;

struct StoredObject {
    name: String,
    content: Vec<u8>,
}

enum JobTarget {
    Retrieve(String),
    Inventory,
}

struct MemJob {
    target: JobTarget,
    polls_left: u32,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<String, StoredObject>,
    jobs: HashMap<String, MemJob>,
    calls: Vec<String>,
    failing: BTreeSet<String>,
    next_id: u64,
}

/// In-memory backend for tests.
///
/// Clones share the same remote state, so a box can be dropped mid-job and
/// reopened against an identical backend. Jobs need `polls` status calls
/// before they succeed. Operations listed through `fail` return errors (or a
/// failed job status) until `heal` is called.
#[derive(Clone, Default)]
pub struct MemBackend {
    state: Arc<Mutex<MemState>>,
    polls: u32,
    opaque_keys: bool,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `Running` polls before a job completes.
    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls = polls;
        self
    }

    /// Hands out generated keys instead of echoing the stored name.
    pub fn with_opaque_keys(mut self) -> Self {
        self.opaque_keys = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) -> MutexGuard<'_, MemState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn fail(&self, operation: &str) {
        self.state().failing.insert(operation.to_string());
    }

    pub fn heal(&self) {
        self.state().failing.clear();
    }

    /// Stored names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .objects
            .values()
            .map(|o| o.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn key_of(&self, name: &str) -> Option<String> {
        self.state()
            .objects
            .iter()
            .find(|(_, o)| o.name == name)
            .map(|(k, _)| k.clone())
    }

    /// Stores raw bytes as if uploaded by another client.
    pub fn insert(&self, name: &str, content: &[u8]) -> String {
        let mut state = self.state();
        let key = self.next_key(&mut state, name);
        state.objects.insert(
            key.clone(),
            StoredObject {
                name: name.to_string(),
                content: content.to_vec(),
            },
        );
        key
    }

    /// Removes an object behind the box's back.
    pub fn remove(&self, name: &str) {
        self.state().objects.retain(|_, o| o.name != name);
    }

    fn next_key(&self, state: &mut MemState, name: &str) -> String {
        state.next_id += 1;
        if self.opaque_keys {
            format!("archive-{}", state.next_id)
        } else {
            name.to_string()
        }
    }

    fn check(state: &MemState, operation: &str) -> Result<()> {
        if state.failing.contains(operation) {
            return Err(crate::icebox_error!(BackendError {
                description: format!("injected {operation} failure"),
            }));
        }
        Ok(())
    }

    fn store(&self, operation: &str, path: &Path, name: &str) -> Result<String> {
        let content = std::fs::read(path)?;
        let mut state = self.record(format!("{operation}:{name}"));
        Self::check(&state, operation)?;
        let key = self.next_key(&mut state, name);
        state.objects.insert(
            key.clone(),
            StoredObject {
                name: name.to_string(),
                content,
            },
        );
        Ok(key)
    }

    fn start_job(&self, state: &mut MemState, target: JobTarget) -> String {
        state.next_id += 1;
        let job_key = format!("job-{}", state.next_id);
        state.jobs.insert(
            job_key.clone(),
            MemJob {
                target,
                polls_left: self.polls,
            },
        );
        job_key
    }

    fn poll(&self, operation: &str, job_key: &str) -> JobStatus {
        let mut guard = self.record(format!("{operation}:{job_key}"));
        let state = &mut *guard;
        let failing = state.failing.contains(operation);
        let Some(job) = state.jobs.get_mut(job_key) else {
            return JobStatus::Failure;
        };
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return JobStatus::Running;
        }
        if failing {
            return JobStatus::Failure;
        }
        match &job.target {
            JobTarget::Retrieve(key) if !state.objects.contains_key(key) => JobStatus::Failure,
            _ => JobStatus::Success,
        }
    }

    fn finished_job<'a>(state: &'a MemState, job_key: &str) -> Result<&'a MemJob> {
        match state.jobs.get(job_key) {
            Some(job) if job.polls_left == 0 => Ok(job),
            _ => Err(crate::icebox_error!(JobFailed {
                operation: job_key.to_string(),
            })),
        }
    }
}

impl Backend for MemBackend {
    fn box_init(&self) -> Result<()> {
        let state = self.record("box_init".to_string());
        Self::check(&state, "box_init")
    }

    fn store_data(&self, path: &Path, name: &str) -> Result<String> {
        self.store("store_data", path, name)
    }

    fn store_meta(&self, path: &Path, name: &str) -> Result<String> {
        self.store("store_meta", path, name)
    }

    fn retrieve_init(&self, retrieval_key: &str, options: &RetrievalOptions) -> Result<String> {
        let call = match options.tier {
            Some(tier) => format!("retrieve_init:{retrieval_key}:{tier}"),
            None => format!("retrieve_init:{retrieval_key}"),
        };
        let mut state = self.record(call);
        Self::check(&state, "retrieve_init")?;
        Ok(self.start_job(&mut state, JobTarget::Retrieve(retrieval_key.to_string())))
    }

    fn retrieve_status(&self, job_key: &str) -> JobStatus {
        self.poll("retrieve_status", job_key)
    }

    fn retrieve_finish(&self, job_key: &str) -> Result<TempPath> {
        let state = self.record(format!("retrieve_finish:{job_key}"));
        Self::check(&state, "retrieve_finish")?;
        let job = Self::finished_job(&state, job_key)?;
        let JobTarget::Retrieve(key) = &job.target else {
            return Err(crate::icebox_error!(JobFailed {
                operation: job_key.to_string(),
            }));
        };
        let object = state.objects.get(key).ok_or_else(|| {
            crate::icebox_error!(BackendError {
                description: format!("no object {key}"),
            })
        })?;
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(&object.content)?;
        Ok(tmp.into_temp_path())
    }

    fn delete(&self, retrieval_key: &str) -> Result<()> {
        let mut state = self.record(format!("delete:{retrieval_key}"));
        Self::check(&state, "delete")?;
        state.objects.remove(retrieval_key);
        Ok(())
    }

    fn inventory_init(&self) -> Result<String> {
        let mut state = self.record("inventory_init".to_string());
        Self::check(&state, "inventory_init")?;
        Ok(self.start_job(&mut state, JobTarget::Inventory))
    }

    fn inventory_status(&self, job_key: &str) -> JobStatus {
        self.poll("inventory_status", job_key)
    }

    fn inventory_finish(&self, job_key: &str) -> Result<Vec<BackendFile>> {
        let state = self.record(format!("inventory_finish:{job_key}"));
        Self::finished_job(&state, job_key)?;
        Ok(state
            .objects
            .iter()
            .map(|(key, o)| BackendFile::new(key, &o.name, o.content.len() as u64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_need_configured_polls() {
        let backend = MemBackend::new().with_polls(2);
        let key = backend.insert("a.data", b"abc");
        let job = backend
            .retrieve_init(&key, &RetrievalOptions::default())
            .unwrap();
        assert!(backend.retrieve_finish(&job).is_err());
        assert_eq!(backend.retrieve_status(&job), JobStatus::Running);
        assert_eq!(backend.retrieve_status(&job), JobStatus::Running);
        assert_eq!(backend.retrieve_status(&job), JobStatus::Success);
        let tmp = backend.retrieve_finish(&job).unwrap();
        assert_eq!(std::fs::read(&tmp).unwrap(), b"abc");
    }

    #[test]
    fn test_clones_share_state() {
        let backend = MemBackend::new().with_opaque_keys();
        let other = backend.clone();
        let key = backend.insert("a.meta", b"x");
        assert_eq!(key, "archive-1");
        assert_eq!(other.key_of("a.meta"), Some(key));
        other.remove("a.meta");
        assert!(backend.names().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let backend = MemBackend::new();
        backend.fail("inventory_init");
        assert!(backend.inventory_init().is_err());
        backend.heal();
        let job = backend.inventory_init().unwrap();
        backend.fail("inventory_status");
        assert_eq!(backend.inventory_status(&job), JobStatus::Failure);
        assert_eq!(
            backend.calls(),
            vec![
                "inventory_init".to_string(),
                "inventory_init".to_string(),
                format!("inventory_status:{job}"),
            ]
        );
    }
}
