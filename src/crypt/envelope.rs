use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use sha2::Sha256;

use super::{Compression, Identity};
use crate::Result;

const ENVELOPE_HMAC_DOMAIN: &[u8] = b"ICEBOX_METADATA_HMAC_V1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Directory,
}

/// Metadata sealed into both archives of a pair.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub comment: Option<String>,
    pub kind: SourceKind,
    #[serde(default)]
    pub compression: Compression,
    /// SHA-256 hex over the sealed payload.
    pub content_hash: String,
    #[serde_as(as = "Base64")]
    pub nonce_prefix: [u8; 8],
}

fn compute_hmac_tag(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|e| {
        crate::icebox_error!(CryptoError {
            description: format!("Failed to initialize HMAC: {e}"),
        })
    })?;
    mac.update(ENVELOPE_HMAC_DOMAIN);
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

fn cipher(identity: &Identity) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(&identity.cipher_key).map_err(|e| {
        crate::icebox_error!(CryptoError {
            description: format!("Failed to initialize cipher: {e}"),
        })
    })
}

/// Encrypts and signs `metadata`: `nonce || ciphertext || hmac`.
pub fn seal_metadata(identity: &Identity, metadata: &SourceMetadata) -> Result<Vec<u8>> {
    let plain = serde_yaml::to_string(metadata)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher(identity)?
        .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
        .map_err(|e| {
            crate::icebox_error!(CryptoError {
                description: format!("Failed to encrypt metadata: {e}"),
            })
        })?;
    let tag = compute_hmac_tag(&identity.signing_key, &nonce, &ciphertext)?
        .finalize()
        .into_bytes();

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    envelope.extend_from_slice(&tag);
    Ok(envelope)
}

/// Verifies the signature of an envelope, then decrypts it.
pub fn open_metadata(identity: &Identity, envelope: &[u8]) -> Result<SourceMetadata> {
    if envelope.len() < NONCE_LEN + TAG_LEN {
        return Err(crate::icebox_error!(IntegrityError {
            description: "Metadata envelope is truncated".to_string(),
        }));
    }
    let (nonce, rest) = envelope.split_at(NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
    compute_hmac_tag(&identity.signing_key, nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| {
            crate::icebox_error!(IntegrityError {
                description: "Untrusted metadata: signature mismatch".to_string(),
            })
        })?;

    let plain = cipher(identity)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| {
            crate::icebox_error!(IntegrityError {
                description: format!("Failed to decrypt metadata: {e}"),
            })
        })?;
    serde_yaml::from_slice(&plain).map_err(|e| {
        crate::icebox_error!(IntegrityError {
            description: format!("Malformed sealed metadata: {e}"),
        })
    })
}
