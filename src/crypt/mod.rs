use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::Result;

mod compression;
mod envelope;
mod identity;
mod sealed;

pub use compression::{Compression, DEFAULT_COMPRESSION};
pub use envelope::{SourceKind, SourceMetadata};
pub use identity::{Identity, IDENTITY_FILE};
pub use sealed::{source_name, SealedArchiver};

/// Encrypted data and metadata archives of one source. Both files live in a
/// private temporary directory that is removed when the pair is dropped.
pub struct ArchivePair {
    _dir: TempDir,
    pub data: PathBuf,
    pub meta: PathBuf,
}

/// Produces and consumes archive pairs for a box.
pub trait Crypto {
    /// Seals `source` (a file or a directory) together with `comment`,
    /// compressing the payload first.
    fn encrypt(
        &self,
        source: &Path,
        comment: Option<&str>,
        compression: Compression,
    ) -> Result<ArchivePair>;

    /// Verifies and decrypts a metadata archive.
    fn decrypt_meta(&self, meta: &Path) -> Result<SourceMetadata>;

    /// Verifies a data archive and restores its content below `destination`,
    /// returning the restored path. Nothing is written unless every check
    /// passes.
    fn decrypt(&self, data: &Path, destination: &Path) -> Result<PathBuf>;
}
