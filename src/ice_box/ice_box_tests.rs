use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use tempfile::{tempdir, TempDir};

use super::*;
use crate::{
    backend::{mem::MemBackend, FolderBackend, RetrievalTier},
    poller::{
        testing::{instant_poller, RecordingSleeper},
        Sleeper,
    },
    reconcile::INVENTORY_JOB,
    ErrorKind,
};

/// A box directory with a saved identity whose backend state outlives any
/// single `IceBox` handle.
struct Fixture {
    work: TempDir,
    backend: MemBackend,
}

impl Fixture {
    fn new(backend: MemBackend) -> Self {
        let work = tempdir().unwrap();
        let fixture = Self { work, backend };
        fs::create_dir_all(fixture.box_dir()).unwrap();
        Identity::generate()
            .save(&fixture.box_dir().join(IDENTITY_FILE))
            .unwrap();
        fixture
    }

    fn box_dir(&self) -> PathBuf {
        self.work.path().join("box")
    }

    /// Opens a fresh handle, as a new process would.
    fn open(&self) -> (IceBox, RecordingSleeper) {
        self.open_at(&self.box_dir())
    }

    /// Opens a second box sharing identity and backend but not the catalog.
    fn open_at(&self, dir: &Path) -> (IceBox, RecordingSleeper) {
        fs::create_dir_all(dir).unwrap();
        let crypto = SealedArchiver::load(&self.box_dir().join(IDENTITY_FILE)).unwrap();
        let (poller, sleeper) = instant_poller();
        let ice_box = IceBox::with_parts(
            dir,
            BoxConfig::new("folder"),
            Catalog::open(dir).unwrap(),
            Box::new(self.backend.clone()),
            Box::new(crypto),
            poller,
        );
        (ice_box, sleeper)
    }

    fn write(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.work.path().join("sources").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn out_dir(&self) -> PathBuf {
        self.work.path().join("out")
    }
}

fn names(ice_box: &IceBox) -> Vec<String> {
    ice_box
        .sources()
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect()
}

#[test]
fn test_store_and_retrieve_round_trip() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new().with_polls(2));
    let (ice_box, sleeper) = fixture.open();
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let source = fixture.write("report.bin", &content);

    let stored = ice_box.store(&source, Some("quarterly"))?;
    assert_eq!(stored.name, "report.bin");
    assert_eq!(stored.comment.as_deref(), Some("quarterly"));
    assert!(stored.data_key.ends_with(".data"));
    assert!(stored.meta_key.ends_with(".meta"));
    assert!(stored.size > content.len() as u64);
    assert!(ice_box.contains("report.bin")?);

    let restored =
        ice_box.retrieve("report.bin", &fixture.out_dir(), &RetrievalOptions::default())?;
    assert_eq!(fs::read(restored)?, content);
    assert_eq!(sleeper.sleeps().len(), 2);
    assert!(ice_box.catalog.load_job("report.bin")?.is_none());
    Ok(())
}

#[test]
fn test_retrieve_passes_options_to_backend() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    let stored = ice_box.store(&fixture.write("a.txt", b"alpha"), None)?;
    fixture.backend.clear_calls();

    let options = RetrievalOptions {
        tier: Some(RetrievalTier::Expedited),
    };
    ice_box.retrieve("a.txt", &fixture.out_dir(), &options)?;
    assert_eq!(
        fixture.backend.calls()[0],
        format!("retrieve_init:{}:Expedited", stored.data_key)
    );
    Ok(())
}

#[test]
fn test_store_compression_choice() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    let content = b"0123456789".repeat(50_000);

    let packed = ice_box.store(&fixture.write("packed/log", &content), None)?;
    let plain =
        ice_box.store_with(&fixture.write("plain/other", &content), None, Compression::None)?;
    assert!(packed.size < plain.size / 10);

    for name in ["log", "other"] {
        let restored = ice_box.retrieve(name, &fixture.out_dir(), &RetrievalOptions::default())?;
        assert_eq!(fs::read(restored)?, content);
    }
    Ok(())
}

#[test]
fn test_duplicate_store_makes_no_backend_calls() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    let source = fixture.write("notes", b"hello");
    ice_box.store(&source, None)?;
    fixture.backend.clear_calls();

    let err = ice_box.store(&source, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("notes"));
    assert!(fixture.backend.calls().is_empty());
    Ok(())
}

#[test]
fn test_delete_removes_both_archives() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    let stored = ice_box.store(&fixture.write("notes", b"hello"), None)?;
    assert_eq!(fixture.backend.names().len(), 2);

    ice_box.delete("notes")?;
    assert!(!ice_box.contains("notes")?);
    assert!(fixture.backend.names().is_empty());

    for key in [&stored.data_key, &stored.meta_key] {
        let job = fixture
            .backend
            .retrieve_init(key, &RetrievalOptions::default())?;
        assert_eq!(fixture.backend.retrieve_status(&job), JobStatus::Failure);
    }

    let err = ice_box.delete("notes").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    Ok(())
}

#[test]
fn test_failed_backend_delete_keeps_source() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    ice_box.store(&fixture.write("notes", b"hello"), None)?;

    fixture.backend.fail("delete");
    assert!(ice_box.delete("notes").is_err());
    assert!(ice_box.contains("notes")?);

    fixture.backend.heal();
    ice_box.delete("notes")?;
    assert!(!ice_box.contains("notes")?);
    Ok(())
}

#[test]
fn test_retrieve_unknown_source() {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    let err = ice_box
        .retrieve("missing", &fixture.out_dir(), &RetrievalOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(fixture.backend.calls().is_empty());
}

#[test]
fn test_retrieval_resumes_persisted_job() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new().with_polls(1));
    let (ice_box, _) = fixture.open();
    let stored = ice_box.store(&fixture.write("notes", b"hello"), None)?;

    // Crash after the job was requested but before it finished.
    let job = fixture
        .backend
        .retrieve_init(&stored.data_key, &RetrievalOptions::default())?;
    ice_box.catalog.save_job("notes", &job)?;
    drop(ice_box);
    fixture.backend.clear_calls();

    let (reopened, _) = fixture.open();
    let restored = reopened.retrieve("notes", &fixture.out_dir(), &RetrievalOptions::default())?;
    assert_eq!(fs::read(restored)?, b"hello");
    let calls = fixture.backend.calls();
    assert!(!calls.iter().any(|c| c.starts_with("retrieve_init")));
    assert!(calls.contains(&format!("retrieve_status:{job}")));
    assert!(calls.contains(&format!("retrieve_finish:{job}")));
    Ok(())
}

#[test]
fn test_failed_retrieval_clears_job() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    ice_box.store(&fixture.write("notes", b"hello"), None)?;
    fixture.backend.fail("retrieve_status");

    let err = ice_box
        .retrieve("notes", &fixture.out_dir(), &RetrievalOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(ice_box.catalog.load_job("notes")?.is_none());
    assert!(!fixture.out_dir().join("notes").exists());
    Ok(())
}

#[test]
fn test_transport_error_keeps_job_for_retry() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    ice_box.store(&fixture.write("notes", b"hello"), None)?;
    fixture.backend.fail("retrieve_finish");

    assert!(ice_box
        .retrieve("notes", &fixture.out_dir(), &RetrievalOptions::default())
        .is_err());
    let job = ice_box.catalog.load_job("notes")?;
    assert!(job.is_some());

    fixture.backend.heal();
    fixture.backend.clear_calls();
    ice_box.retrieve("notes", &fixture.out_dir(), &RetrievalOptions::default())?;
    assert!(!fixture
        .backend
        .calls()
        .iter()
        .any(|c| c.starts_with("retrieve_init")));
    Ok(())
}

#[test]
fn test_retrieve_refuses_existing_destination() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    ice_box.store(&fixture.write("notes", b"hello"), None)?;
    fs::create_dir_all(fixture.out_dir())?;
    fs::write(fixture.out_dir().join("notes"), b"keep me")?;

    let err = ice_box
        .retrieve("notes", &fixture.out_dir(), &RetrievalOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(fs::read(fixture.out_dir().join("notes"))?, b"keep me");
    Ok(())
}

#[test]
fn test_sources_are_listed_by_name() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    for name in ["beta", "Alpha", "gamma"] {
        ice_box.store(&fixture.write(name, name.as_bytes()), None)?;
    }
    assert_eq!(names(&ice_box), vec!["Alpha", "beta", "gamma"]);
    Ok(())
}

#[test]
fn test_partial_store_leaves_orphan_for_refresh() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    fixture.backend.fail("store_meta");

    assert!(ice_box
        .store(&fixture.write("notes", b"hello"), None)
        .is_err());
    assert!(!ice_box.contains("notes")?);

    fixture.backend.heal();
    let report = ice_box.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.orphaned.len(), 1);
    assert!(report.orphaned[0].name.ends_with(".data"));
    assert!(report.imported.is_empty());

    // The name is still free, so the source can be stored again.
    ice_box.store(&fixture.write("notes", b"hello"), None)?;
    Ok(())
}

#[test]
fn test_refresh_imports_pairs_from_another_catalog() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new().with_polls(1).with_opaque_keys());
    let (original, _) = fixture.open();
    let first = original.store(&fixture.write("first", b"one"), Some("c1"))?;
    original.store(&fixture.write("second", b"two"), None)?;

    let (replica, sleeper) = fixture.open_at(&fixture.work.path().join("replica"));
    let mut report = replica.refresh(&RetrievalOptions::default())?;
    report.imported.sort();
    assert_eq!(report.imported, vec!["first", "second"]);
    assert!(report.duplicates.is_empty());
    assert!(report.orphaned.is_empty());
    assert!(report.broken_sources.is_empty());
    assert!(report.failed_imports.is_empty());

    let imported = replica.catalog.load_source("first")?.unwrap();
    assert_eq!(imported.comment.as_deref(), Some("c1"));
    assert_eq!(imported.data_key, first.data_key);
    assert_eq!(imported.meta_key, first.meta_key);
    assert_eq!(imported.size, first.size);
    // One pause for the inventory job and one for the batched metadata jobs.
    assert_eq!(sleeper.sleeps().len(), 2);

    let restored = replica.retrieve("first", &fixture.out_dir(), &RetrievalOptions::default())?;
    assert_eq!(fs::read(restored)?, b"one");
    Ok(())
}

#[test]
fn test_refresh_is_idempotent() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (original, _) = fixture.open();
    original.store(&fixture.write("notes", b"hello"), None)?;

    let (replica, _) = fixture.open_at(&fixture.work.path().join("replica"));
    assert_eq!(replica.refresh(&RetrievalOptions::default())?.imported, vec!["notes"]);

    let second = replica.refresh(&RetrievalOptions::default())?;
    assert!(second.imported.is_empty());
    assert!(second.duplicates.is_empty());
    assert!(second.orphaned.is_empty());
    Ok(())
}

#[test]
fn test_refresh_reports_duplicate_names() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (original, _) = fixture.open();
    original.store(&fixture.write("notes", b"hello"), None)?;

    let (replica, _) = fixture.open_at(&fixture.work.path().join("replica"));
    let local = replica.store(&fixture.write("notes", b"other"), None)?;

    let report = replica.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.duplicates, vec!["notes"]);
    assert!(report.imported.is_empty());
    assert_eq!(replica.catalog.load_source("notes")?.unwrap(), local);
    Ok(())
}

#[test]
fn test_refresh_reports_broken_sources() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    let stored = ice_box.store(&fixture.write("notes", b"hello"), None)?;
    fixture.backend.remove(&stored.meta_key);

    let report = ice_box.refresh(&RetrievalOptions::default())?;
    assert_eq!(
        report.broken_sources.get("notes"),
        Some(&vec![stored.meta_key.clone()])
    );
    // Reported, not repaired.
    assert!(ice_box.contains("notes")?);
    Ok(())
}

#[test]
fn test_refresh_with_one_cataloged_pair_and_one_orphan() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    ice_box.store(&fixture.write("kept", b"hello"), None)?;
    fixture.backend.insert("0000-stray.data", b"dangling");

    let report = ice_box.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].name, "0000-stray.data");
    assert!(report.imported.is_empty());
    assert!(report.duplicates.is_empty());
    assert!(report.broken_sources.is_empty());
    Ok(())
}

#[test]
fn test_refresh_records_untrusted_metadata() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    fixture.backend.insert("forged.data", b"not sealed");
    fixture.backend.insert("forged.meta", b"ICEBOXM1 but not signed");
    let (ice_box, _) = fixture.open();

    let report = ice_box.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.failed_imports, vec!["forged.meta"]);
    assert!(report.imported.is_empty());
    assert!(ice_box.catalog.load_job("forged.meta")?.is_none());
    Ok(())
}

#[test]
fn test_refresh_records_failed_metadata_jobs() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (original, _) = fixture.open();
    original.store(&fixture.write("notes", b"hello"), None)?;

    let (replica, _) = fixture.open_at(&fixture.work.path().join("replica"));
    fixture.backend.fail("retrieve_status");
    let report = replica.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.failed_imports.len(), 1);
    assert!(report.imported.is_empty());

    fixture.backend.heal();
    let report = replica.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.imported, vec!["notes"]);
    Ok(())
}

#[test]
fn test_refresh_resumes_inventory_job() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new().with_polls(1));
    let (ice_box, _) = fixture.open();
    let job = fixture.backend.inventory_init()?;
    ice_box.catalog.save_job(INVENTORY_JOB, &job)?;
    fixture.backend.clear_calls();

    ice_box.refresh(&RetrievalOptions::default())?;
    let calls = fixture.backend.calls();
    assert!(!calls.contains(&"inventory_init".to_string()));
    assert!(calls.contains(&format!("inventory_finish:{job}")));
    assert!(ice_box.catalog.load_job(INVENTORY_JOB)?.is_none());
    Ok(())
}

/// Lets the first `survive` pauses through, then panics like a killed process.
struct CrashingSleeper {
    survive: usize,
    pauses: Arc<Mutex<usize>>,
}

impl Sleeper for CrashingSleeper {
    fn sleep(&self, _duration: Duration) {
        let mut pauses = self.pauses.lock().unwrap();
        *pauses += 1;
        if *pauses > self.survive {
            panic!("interrupted after {} pauses", self.survive);
        }
    }
}

#[test]
fn test_refresh_interrupted_during_import_keeps_inventory_job() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new().with_polls(1));
    let (original, _) = fixture.open();
    original.store(&fixture.write("notes", b"hello"), None)?;

    let replica_dir = fixture.work.path().join("replica");
    let (mut replica, _) = fixture.open_at(&replica_dir);
    // The inventory wait pauses once, then the metadata batch pauses.
    replica.poller = JobPoller::with_sleeper(
        Duration::from_secs(60),
        Box::new(CrashingSleeper {
            survive: 1,
            pauses: Arc::default(),
        }),
    );
    let interrupted = panic::catch_unwind(AssertUnwindSafe(|| {
        replica.refresh(&RetrievalOptions::default())
    }));
    assert!(interrupted.is_err());
    drop(replica);

    let (replica, _) = fixture.open_at(&replica_dir);
    assert!(replica.catalog.load_job(INVENTORY_JOB)?.is_some());
    fixture.backend.clear_calls();

    let report = replica.refresh(&RetrievalOptions::default())?;
    assert_eq!(report.imported, vec!["notes"]);
    let calls = fixture.backend.calls();
    assert!(!calls.iter().any(|call| call == "inventory_init"));
    assert!(replica.catalog.load_job(INVENTORY_JOB)?.is_none());
    Ok(())
}

#[test]
fn test_failed_inventory_is_an_error() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let (ice_box, _) = fixture.open();
    fixture.backend.fail("inventory_status");

    let err = ice_box.refresh(&RetrievalOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(ice_box.catalog.load_job(INVENTORY_JOB)?.is_none());
    Ok(())
}

#[test]
fn test_misconfigured_s3_box_still_opens_and_lists() -> Result<()> {
    let fixture = Fixture::new(MemBackend::new());
    let config = BoxConfig::new("s3")
        .with_setting("region", "us-east-1")
        .with_setting("storage_class", "STANDARD_IA");
    config.save(&fixture.box_dir().join(CONFIG_FILE))?;

    let ice_box = IceBox::open(&fixture.box_dir())?;
    assert!(ice_box.sources()?.is_empty());
    let err = ice_box
        .store(&fixture.write("notes", b"hello"), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[test]
fn test_folder_box_scenario() -> Result<()> {
    let work = tempdir()?;
    let remote = work.path().join("remote");
    fs::create_dir(&remote)?;
    let box_dir = work.path().join("box");
    let config =
        BoxConfig::new("folder").with_setting("folder_path", remote.display().to_string());
    IceBox::init(&box_dir, config)?;

    let source = work.path().join("test");
    fs::write(&source, b"hello")?;
    let ice_box = IceBox::open(&box_dir)?;
    ice_box.store(&source, None)?;
    assert_eq!(names(&ice_box), vec!["test"]);
    assert_eq!(fs::read_dir(&remote)?.count(), 2);

    let out = work.path().join("out");
    let restored = ice_box.retrieve("test", &out, &RetrievalOptions::default())?;
    assert_eq!(fs::read(restored)?, b"hello");

    ice_box.delete("test")?;
    assert!(names(&ice_box).is_empty());
    assert_eq!(fs::read_dir(&remote)?.count(), 0);
    Ok(())
}

#[test]
fn test_init_and_open_preconditions() -> Result<()> {
    let work = tempdir()?;
    let box_dir = work.path().join("box");
    let err = IceBox::open(&box_dir).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let config = BoxConfig::new("folder")
        .with_setting("folder_path", work.path().display().to_string());
    IceBox::init(&box_dir, config.clone())?;
    let err = IceBox::init(&box_dir, config).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("box"));
    Ok(())
}

#[test]
fn test_init_without_reachable_backend_writes_no_config() -> Result<()> {
    let work = tempdir()?;
    let box_dir = work.path().join("box");
    let missing = work.path().join("missing");
    let config =
        BoxConfig::new("folder").with_setting("folder_path", missing.display().to_string());

    assert!(IceBox::init(&box_dir, config.clone()).is_err());
    assert!(!box_dir.join(CONFIG_FILE).exists());

    fs::create_dir(&missing)?;
    let ice_box = IceBox::init(&box_dir, config)?;
    assert_eq!(ice_box.config().backend, "folder");
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_box_directory_is_private() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let work = tempdir()?;
    let box_dir = work.path().join("box");
    let config = BoxConfig::new("folder")
        .with_setting("folder_path", work.path().display().to_string());
    IceBox::init(&box_dir, config)?;
    let mode = fs::metadata(&box_dir)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
    Ok(())
}

#[test]
fn test_folder_backend_parts_compose() -> Result<()> {
    let work = tempdir()?;
    let remote = work.path().join("remote");
    fs::create_dir(&remote)?;
    let box_dir = work.path().join("box");
    fs::create_dir(&box_dir)?;
    let (poller, _) = instant_poller();
    let ice_box = IceBox::with_parts(
        &box_dir,
        BoxConfig::new("folder"),
        Catalog::open(&box_dir)?,
        Box::new(FolderBackend::new(remote.clone())),
        Box::new(SealedArchiver::new(Identity::generate())),
        poller,
    );
    let source = work.path().join("dir-source");
    fs::create_dir_all(source.join("inner"))?;
    fs::write(source.join("inner/file"), b"x")?;

    ice_box.store(&source, Some("a directory"))?;
    let restored = ice_box.retrieve(
        "dir-source",
        &work.path().join("out"),
        &RetrievalOptions::default(),
    )?;
    assert_eq!(fs::read(restored.join("inner/file"))?, b"x");
    Ok(())
}
