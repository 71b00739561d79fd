use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use log::debug;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use super::{
    envelope::{open_metadata, seal_metadata},
    ArchivePair, Compression, Crypto, Identity, SourceKind, SourceMetadata,
};
use crate::{upload::OffsetRangeReader, Result, ResultExt};

const DATA_MAGIC: &[u8; 8] = b"ICEBOXD1";
const META_MAGIC: &[u8; 8] = b"ICEBOXM1";
const CHUNK_SIZE: usize = 64 * 1024;
const GCM_TAG_LEN: usize = 16;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + GCM_TAG_LEN;

const AAD_MIDDLE: &[u8] = &[0];
const AAD_LAST: &[u8] = &[1];

/// Seals sources with the box identity.
///
/// Data archive: `ICEBOXD1 || chunks || envelope || u64 LE envelope length`.
/// Metadata archive: `ICEBOXM1 || envelope`. Each chunk is 64 KiB of the
/// (optionally compressed) payload under AES-256-GCM; the final chunk is
/// marked through its associated data so truncation at a chunk boundary is
/// detected.
pub struct SealedArchiver {
    identity: Identity,
}

fn chunk_nonce(prefix: &[u8; 8], counter: u64) -> Result<[u8; 12]> {
    let counter = u32::try_from(counter).map_err(|_| {
        crate::icebox_error!(CryptoError {
            description: "Payload exceeds the maximum number of chunks".to_string(),
        })
    })?;
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    Ok(nonce)
}

/// Reads until `buf` is full or the stream ends.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Catalog name of a source: its final path component.
pub fn source_name(source: &Path) -> Result<String> {
    source
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            crate::icebox_error!(InvalidParameter {
                description: format!("Cannot derive a source name from {}", source.display()),
            })
        })
}

/// A restored name must be a single plain path component.
fn check_restored_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(crate::icebox_error!(IntegrityError {
            description: format!("Refusing to restore unsafe name '{name}'"),
        })),
    }
}

fn integrity_error(description: &str) -> crate::IceboxError {
    crate::icebox_error!(IntegrityError {
        description: description.to_string(),
    })
}

impl SealedArchiver {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(Identity::load(path)?))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.identity.cipher_key).map_err(|e| {
            crate::icebox_error!(CryptoError {
                description: format!("Failed to initialize cipher: {e}"),
            })
        })
    }

    /// Encrypts `input` chunk by chunk into `output`, returning the SHA-256
    /// hex of everything written.
    fn seal_payload<R: Read, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
        nonce_prefix: &[u8; 8],
    ) -> Result<String> {
        let cipher = self.cipher()?;
        let mut hasher = Sha256::new();
        let mut current = vec![0u8; CHUNK_SIZE];
        let mut next = vec![0u8; CHUNK_SIZE];
        let mut current_len = read_full(input, &mut current)?;
        let mut counter = 0u64;
        loop {
            let next_len = if current_len == CHUNK_SIZE {
                read_full(input, &mut next)?
            } else {
                0
            };
            let last = next_len == 0;
            let nonce = chunk_nonce(nonce_prefix, counter)?;
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &current[..current_len],
                        aad: if last { AAD_LAST } else { AAD_MIDDLE },
                    },
                )
                .map_err(|e| {
                    crate::icebox_error!(CryptoError {
                        description: format!("Failed to encrypt chunk {counter}: {e}"),
                    })
                })?;
            hasher.update(&sealed);
            output.write_all(&sealed)?;
            if last {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            counter += 1;
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Decrypts the payload range of a data archive into `output`.
    fn open_payload<R: Read, W: Write>(
        &self,
        payload: &mut R,
        payload_len: u64,
        output: &mut W,
        nonce_prefix: &[u8; 8],
    ) -> Result<()> {
        let cipher = self.cipher()?;
        let mut buf = vec![0u8; SEALED_CHUNK_SIZE];
        let mut remaining = payload_len;
        let mut counter = 0u64;
        while remaining > 0 {
            let want = remaining.min(SEALED_CHUNK_SIZE as u64) as usize;
            let got = read_full(payload, &mut buf[..want])?;
            if got != want || got < GCM_TAG_LEN {
                return Err(integrity_error("Data archive payload is truncated"));
            }
            remaining -= got as u64;
            let last = remaining == 0;
            let nonce = chunk_nonce(nonce_prefix, counter)?;
            let plain = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buf[..got],
                        aad: if last { AAD_LAST } else { AAD_MIDDLE },
                    },
                )
                .map_err(|_| {
                    crate::icebox_error!(IntegrityError {
                        description: format!("Chunk {counter} failed authentication"),
                    })
                })?;
            output.write_all(&plain)?;
            counter += 1;
        }
        Ok(())
    }

    /// Locates the payload and envelope inside a data archive.
    fn read_data_layout(&self, file: &mut File) -> Result<(SourceMetadata, u64)> {
        let total = file.metadata()?.len();
        let mut magic = [0u8; 8];
        if total < (DATA_MAGIC.len() + 8) as u64 {
            return Err(integrity_error("Data archive is truncated"));
        }
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if &magic != DATA_MAGIC {
            return Err(integrity_error("Not an icebox data archive"));
        }

        let mut len_bytes = [0u8; 8];
        file.seek(SeekFrom::End(-8))?;
        file.read_exact(&mut len_bytes)?;
        let envelope_len = u64::from_le_bytes(len_bytes);
        let payload_end = (total - 8)
            .checked_sub(envelope_len)
            .filter(|end| *end >= DATA_MAGIC.len() as u64)
            .ok_or_else(|| integrity_error("Data archive envelope length is invalid"))?;

        let mut envelope = vec![0u8; envelope_len as usize];
        file.seek(SeekFrom::Start(payload_end))?;
        file.read_exact(&mut envelope)?;
        let metadata = open_metadata(&self.identity, &envelope)?;
        Ok((metadata, payload_end))
    }

    fn payload_hash(file: &mut File, payload_end: u64) -> Result<String> {
        let mut payload = OffsetRangeReader::new(&mut *file, DATA_MAGIC.len() as u64, payload_end)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = payload.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

impl Crypto for SealedArchiver {
    fn encrypt(
        &self,
        source: &Path,
        comment: Option<&str>,
        compression: Compression,
    ) -> Result<ArchivePair> {
        let name = source_name(source)?;
        let metadata = fs::metadata(source).context(format!("Reading {}", source.display()))?;
        let dir = TempDir::new()?;

        let (kind, plain_path) = if metadata.is_dir() {
            let tar_path = dir.path().join("source.tar");
            let mut builder = tar::Builder::new(BufWriter::new(File::create(&tar_path)?));
            builder.follow_symlinks(false);
            builder
                .append_dir_all(&name, source)
                .context(format!("Packing {}", source.display()))?;
            builder.into_inner()?.flush()?;
            (SourceKind::Directory, tar_path)
        } else {
            (SourceKind::File, source.to_path_buf())
        };

        let payload_path = if compression == Compression::None {
            plain_path.clone()
        } else {
            let packed = dir.path().join("source.packed");
            let mut input = BufReader::new(File::open(&plain_path)?);
            let mut output = BufWriter::new(File::create(&packed)?);
            compression
                .compress(&mut input, &mut output)
                .context(format!("Compressing {} ({})", name, compression.as_str()))?;
            output.flush()?;
            packed
        };

        let mut nonce_prefix = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_prefix);

        let data = dir.path().join("archive.data");
        let mut output = BufWriter::new(File::create(&data)?);
        output.write_all(DATA_MAGIC)?;
        let mut input = BufReader::new(File::open(&payload_path)?);
        let content_hash = self.seal_payload(&mut input, &mut output, &nonce_prefix)?;
        drop(input);
        if kind == SourceKind::Directory {
            fs::remove_file(&plain_path)?;
        }
        if payload_path != plain_path {
            fs::remove_file(&payload_path)?;
        }

        let envelope = seal_metadata(
            &self.identity,
            &SourceMetadata {
                name,
                comment: comment.map(str::to_string),
                kind,
                compression,
                content_hash,
                nonce_prefix,
            },
        )?;
        output.write_all(&envelope)?;
        output.write_all(&(envelope.len() as u64).to_le_bytes())?;
        output.flush()?;

        let meta = dir.path().join("archive.meta");
        let mut meta_file = File::create(&meta)?;
        meta_file.write_all(META_MAGIC)?;
        meta_file.write_all(&envelope)?;
        meta_file.flush()?;

        debug!("Sealed {} into {}", source.display(), dir.path().display());
        Ok(ArchivePair {
            _dir: dir,
            data,
            meta,
        })
    }

    fn decrypt_meta(&self, meta: &Path) -> Result<SourceMetadata> {
        let content = fs::read(meta)?;
        let envelope = content
            .strip_prefix(META_MAGIC.as_slice())
            .ok_or_else(|| integrity_error("Not an icebox metadata archive"))?;
        open_metadata(&self.identity, envelope)
    }

    fn decrypt(&self, data: &Path, destination: &Path) -> Result<PathBuf> {
        let mut file = File::open(data)?;
        let (metadata, payload_end) = self.read_data_layout(&mut file)?;
        check_restored_name(&metadata.name)?;

        let target = destination.join(&metadata.name);
        if target.symlink_metadata().is_ok() {
            return Err(crate::icebox_error!(DestinationExists {
                path: target.display().to_string(),
            }));
        }

        if Self::payload_hash(&mut file, payload_end)? != metadata.content_hash {
            return Err(integrity_error("Content hash mismatch"));
        }

        fs::create_dir_all(destination)?;
        let staging = tempfile::Builder::new()
            .prefix(".icebox-")
            .tempdir_in(destination)?;
        let opened_path = staging.path().join("payload");
        {
            let payload_len = payload_end - DATA_MAGIC.len() as u64;
            let mut payload =
                OffsetRangeReader::new(&mut file, DATA_MAGIC.len() as u64, payload_end)?;
            let mut output = BufWriter::new(File::create(&opened_path)?);
            self.open_payload(&mut payload, payload_len, &mut output, &metadata.nonce_prefix)?;
            output.flush()?;
        }

        let plain_path = if metadata.compression == Compression::None {
            opened_path
        } else {
            let plain_path = staging.path().join("plain");
            let mut input = BufReader::new(File::open(&opened_path)?);
            let mut output = BufWriter::new(File::create(&plain_path)?);
            metadata.compression.decompress(&mut input, &mut output)?;
            output.flush()?;
            drop(input);
            fs::remove_file(&opened_path)?;
            plain_path
        };

        let restored = match metadata.kind {
            SourceKind::File => plain_path,
            SourceKind::Directory => {
                let unpacked = staging.path().join("unpacked");
                fs::create_dir(&unpacked)?;
                tar::Archive::new(BufReader::new(File::open(&plain_path)?))
                    .unpack(&unpacked)
                    .context("Unpacking restored directory")?;
                unpacked.join(&metadata.name)
            }
        };
        if target.symlink_metadata().is_ok() {
            return Err(crate::icebox_error!(DestinationExists {
                path: target.display().to_string(),
            }));
        }
        fs::rename(&restored, &target)?;
        Ok(target)
    }
}
