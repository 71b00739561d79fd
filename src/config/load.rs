use std::{fs::OpenOptions, io::Write, path::Path};

use super::BoxConfig;
use crate::{Result, ResultExt};

pub const CONFIG_FILE: &str = "config.yml";

impl BoxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Loading config {}", path.display()))?;
        warn_if_loose_permissions(path);
        let config: BoxConfig = serde_yaml::from_str(&content).map_err(|e| {
            crate::icebox_error!(ConfigError {
                description: format!("Failed to parse {}: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config readable only by the owner, since backend settings
    /// may carry credentials.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .context(format!("Writing config {}", path.display()))?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }
}

#[cfg(unix)]
pub fn warn_if_loose_permissions(path: &Path) {
    if let Some(mode) = get_file_mode(path) {
        if mode & 0o077 != 0 {
            log::warn!(
                "file '{}' is accessible to other users (mode {:04o}); consider restricting to 0600",
                path.display(),
                mode & 0o7777
            );
        }
    }
}

#[cfg(unix)]
fn get_file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
pub fn warn_if_loose_permissions(_path: &Path) {}
