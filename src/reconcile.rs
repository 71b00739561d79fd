//! Cross-checks the catalog against a backend inventory.
//!
//! Every stored pair shares a random base name: `<id>.data` holds the sealed
//! payload and `<id>.meta` the detached metadata. The suffix is the only link
//! between the two files on the backend.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::{backend::BackendFile, catalog::Source, Result};

pub const DATA_SUFFIX: &str = ".data";
pub const META_SUFFIX: &str = ".meta";

/// Job name under which a pending inventory retrieval is persisted.
pub const INVENTORY_JOB: &str = "::inventory::";

/// Maps a data name to its metadata name and vice versa.
pub fn sibling_name(name: &str) -> Result<String> {
    if let Some(base) = name.strip_suffix(DATA_SUFFIX) {
        Ok(format!("{base}{META_SUFFIX}"))
    } else if let Some(base) = name.strip_suffix(META_SUFFIX) {
        Ok(format!("{base}{DATA_SUFFIX}"))
    } else {
        Err(crate::icebox_error!(InvalidParameter {
            description: format!("Unsupported backend name: {name}"),
        }))
    }
}

/// Fresh `(data, meta)` names for a new archive pair.
pub fn backend_names() -> (String, String) {
    let base = Uuid::new_v4().to_string();
    (format!("{base}{DATA_SUFFIX}"), format!("{base}{META_SUFFIX}"))
}

/// Result of comparing catalog sources with a backend inventory.
#[derive(Debug, Default)]
pub struct InventoryCheck {
    /// Sources whose data or metadata file is missing, with the missing keys.
    pub broken_sources: BTreeMap<String, Vec<String>>,
    /// Unknown pairs: metadata file to its data sibling.
    pub importable: Vec<(BackendFile, BackendFile)>,
    /// Backend files without a sibling.
    pub orphaned: Vec<BackendFile>,
}

impl InventoryCheck {
    pub fn new(sources: &[Source], inventory: Vec<BackendFile>) -> Self {
        let mut by_key: HashMap<String, BackendFile> = inventory
            .into_iter()
            .map(|f| (f.key.clone(), f))
            .collect();

        let mut broken_sources = BTreeMap::new();
        for source in sources {
            let data = by_key.remove(&source.data_key);
            let meta = by_key.remove(&source.meta_key);
            let mut missing = Vec::new();
            if data.is_none() {
                missing.push(source.data_key.clone());
            }
            if meta.is_none() {
                missing.push(source.meta_key.clone());
            }
            if !missing.is_empty() {
                broken_sources.insert(source.name.clone(), missing);
            }
        }

        // Remaining files are unknown to the catalog; files with neither suffix
        // do not belong to any box and are ignored.
        let mut data_files: BTreeMap<String, BackendFile> = BTreeMap::new();
        let mut meta_files: BTreeMap<String, BackendFile> = BTreeMap::new();
        for file in by_key.into_values() {
            if file.name.ends_with(DATA_SUFFIX) {
                data_files.insert(file.name.clone(), file);
            } else if file.name.ends_with(META_SUFFIX) {
                meta_files.insert(file.name.clone(), file);
            }
        }

        let mut importable = Vec::new();
        let mut orphaned = Vec::new();
        for (name, data) in data_files {
            let meta = sibling_name(&name)
                .ok()
                .and_then(|sibling| meta_files.remove(&sibling));
            match meta {
                Some(meta) => importable.push((meta, data)),
                None => orphaned.push(data),
            }
        }
        orphaned.extend(meta_files.into_values());

        Self {
            broken_sources,
            importable,
            orphaned,
        }
    }
}
