use std::{fs::OpenOptions, io::Write, path::Path};

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use zeroize::Zeroize;

use crate::{config::warn_if_loose_permissions, Result, ResultExt};

pub const IDENTITY_FILE: &str = "identity";

/// Secret key material of a box. Both keys are wiped when dropped.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde_as(as = "Base64")]
    pub(super) cipher_key: [u8; 32],

    #[serde_as(as = "Base64")]
    pub(super) signing_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let mut identity = Self {
            cipher_key: [0u8; 32],
            signing_key: [0u8; 32],
        };
        OsRng.fill_bytes(&mut identity.cipher_key);
        OsRng.fill_bytes(&mut identity.signing_key);
        identity
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Reading identity {}", path.display()))?;
        warn_if_loose_permissions(path);
        serde_yaml::from_str(&content).map_err(|e| {
            crate::icebox_error!(ConfigError {
                description: format!("Error parsing identity {}: {e}", path.display()),
            })
        })
    }

    /// Writes the identity to a new file readable only by the owner.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = serde_yaml::to_string(self)?;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .context(format!("Creating identity {}", path.display()))?;
        let written = file.write_all(content.as_bytes());
        content.zeroize();
        written?;
        file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Identity { .. }")
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.signing_key.zeroize();
    }
}
