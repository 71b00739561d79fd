use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::{
    backend::RetrievalOptions,
    catalog::Source,
    config::BoxConfig,
    crypt::{Compression, DEFAULT_COMPRESSION},
    ice_box::{IceBox, RefreshReport},
    utils::human_readable_size,
    Result, ResultExt,
};

#[derive(Parser, Debug)]
#[command(
    name = "icebox",
    version,
    about = "Encrypting cold storage client.",
    long_about = r#"Seal files and directories into encrypted archive pairs and keep them in cold storage.

Examples:
  # Create a box backed by a local folder
  icebox init photos folder /mnt/backup/photos

  # Create a box in S3 Glacier Deep Archive using an AWS profile
  icebox init photos s3 my-bucket --profile archive

  # Store a directory, then fetch it back with an expedited restore
  icebox put photos ~/Pictures/2019 --comment "trip"
  icebox get photos 2019 -d /tmp/restore -o tier=Expedited"#
)]
pub struct Cli {
    /// Directory holding one sub-directory per box.
    #[arg(short = 'c', long = "config-dir", global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new box.
    Init {
        #[arg(value_name = "BOX")]
        box_name: String,

        #[command(subcommand)]
        backend: InitBackend,
    },
    /// Encrypt and upload a file or directory.
    Put {
        #[arg(value_name = "BOX")]
        box_name: String,

        source: PathBuf,

        #[arg(short = 'm', long = "comment")]
        comment: Option<String>,

        /// Compression applied before encryption.
        #[arg(long, value_enum, default_value_t = DEFAULT_COMPRESSION)]
        compression: Compression,
    },
    /// Download and decrypt a stored source.
    Get {
        #[arg(value_name = "BOX")]
        box_name: String,

        source: String,

        /// Directory to restore into.
        #[arg(short = 'd', long = "destination", default_value = ".")]
        destination: PathBuf,

        /// Backend option such as `tier=Expedited`. May be repeated.
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Remove a source from the box and the backend.
    Delete {
        #[arg(value_name = "BOX")]
        box_name: String,

        source: String,
    },
    /// List stored sources.
    List {
        #[arg(value_name = "BOX")]
        box_name: String,
    },
    /// Reconcile the catalog with the backend inventory.
    Refresh {
        #[arg(value_name = "BOX")]
        box_name: String,

        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum InitBackend {
    /// Local or mounted folder.
    Folder { path: PathBuf },
    /// S3 bucket with an archival storage class.
    S3 {
        bucket: String,

        /// GLACIER or DEEP_ARCHIVE.
        #[arg(long = "storage-class")]
        storage_class: Option<String>,

        /// Default restore tier: Expedited, Standard or Bulk.
        #[arg(long = "tier")]
        tier: Option<String>,

        #[arg(long = "profile")]
        profile: Option<String>,

        #[arg(long = "region")]
        region: Option<String>,

        /// Custom endpoint for S3-compatible services.
        #[arg(long = "endpoint")]
        endpoint: Option<String>,
    },
    /// Amazon Glacier vault.
    Glacier {
        vault: String,

        #[arg(long = "tier")]
        tier: Option<String>,

        #[arg(long = "profile")]
        profile: Option<String>,

        #[arg(long = "region")]
        region: Option<String>,
    },
    /// WebDAV collection.
    Webdav {
        url: String,

        #[arg(long = "username")]
        username: String,

        #[arg(long = "password")]
        password: String,
    },
}

impl InitBackend {
    pub fn into_config(self) -> Result<BoxConfig> {
        let config = match self {
            InitBackend::Folder { path } => {
                let path = std::fs::canonicalize(&path)
                    .context(format!("Resolving backend folder {}", path.display()))?;
                BoxConfig::new("folder").with_setting("folder_path", path.display().to_string())
            }
            InitBackend::S3 {
                bucket,
                storage_class,
                tier,
                profile,
                region,
                endpoint,
            } => BoxConfig::new("s3")
                .with_setting("bucket", bucket)
                .with_optional_setting("storage_class", storage_class)
                .with_optional_setting("tier", tier)
                .with_optional_setting("profile", profile)
                .with_optional_setting("region", region)
                .with_optional_setting("endpoint", endpoint),
            InitBackend::Glacier {
                vault,
                tier,
                profile,
                region,
            } => BoxConfig::new("glacier")
                .with_setting("vault", vault)
                .with_optional_setting("tier", tier)
                .with_optional_setting("profile", profile)
                .with_optional_setting("region", region),
            InitBackend::Webdav {
                url,
                username,
                password,
            } => BoxConfig::new("webdav")
                .with_setting("url", url)
                .with_setting("username", username)
                .with_setting("password", password),
        };
        Ok(config)
    }
}

pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("icebox"))
        .ok_or_else(|| {
            crate::icebox_error!(ConfigError {
                description: "Cannot determine the user configuration directory".to_string(),
            })
        })
}

fn box_path(config_dir: &Path, box_name: &str) -> Result<PathBuf> {
    if box_name.is_empty() || box_name.contains(['/', '\\']) || box_name.starts_with('.') {
        return Err(crate::icebox_error!(InvalidParameter {
            description: format!("Invalid box name '{box_name}'"),
        }));
    }
    Ok(config_dir.join(box_name))
}

/// One line per source plus a total line.
pub fn format_listing(sources: &[Source]) -> Vec<String> {
    let width = sources.iter().map(|s| s.name.len()).max().unwrap_or(0);
    let mut lines: Vec<String> = sources
        .iter()
        .map(|s| {
            let line = format!(
                "{:<width$}  {:>10}  {}",
                s.name,
                human_readable_size(s.size),
                s.comment.as_deref().unwrap_or("")
            );
            line.trim_end().to_string()
        })
        .collect();
    let total: u64 = sources.iter().map(|s| s.size).sum();
    lines.push(format!(
        "{} sources, {} total",
        sources.len(),
        human_readable_size(total)
    ));
    lines
}

pub fn format_report(report: &RefreshReport) -> Vec<String> {
    let mut lines = Vec::new();
    for name in &report.imported {
        lines.push(format!("imported: {name}"));
    }
    for name in &report.duplicates {
        lines.push(format!("duplicate: {name} (existing entry kept)"));
    }
    for (name, missing) in &report.broken_sources {
        lines.push(format!("broken: {name} (missing {})", missing.join(", ")));
    }
    for file in &report.orphaned {
        lines.push(format!("orphaned: {} ({})", file.name, file.key));
    }
    for name in &report.failed_imports {
        lines.push(format!("failed: {name}"));
    }
    if lines.is_empty() {
        lines.push("Box is in sync with the backend".to_string());
    }
    lines
}

pub fn run(cli: Cli) -> Result<()> {
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir()?,
    };

    match cli.command {
        Command::Init { box_name, backend } => {
            let path = box_path(&config_dir, &box_name)?;
            IceBox::init(&path, backend.into_config()?)?;
            println!("Created box {box_name}");
        }
        Command::Put {
            box_name,
            source,
            comment,
            compression,
        } => {
            let ice_box = IceBox::open(&box_path(&config_dir, &box_name)?)?;
            let stored = ice_box.store_with(&source, comment.as_deref(), compression)?;
            println!(
                "Stored {} ({})",
                stored.name,
                human_readable_size(stored.size)
            );
        }
        Command::Get {
            box_name,
            source,
            destination,
            options,
        } => {
            let options = RetrievalOptions::from_pairs(&options)?;
            let ice_box = IceBox::open(&box_path(&config_dir, &box_name)?)?;
            let restored = ice_box.retrieve(&source, &destination, &options)?;
            println!("Restored {}", restored.display());
        }
        Command::Delete { box_name, source } => {
            let ice_box = IceBox::open(&box_path(&config_dir, &box_name)?)?;
            ice_box.delete(&source)?;
            println!("Deleted {source}");
        }
        Command::List { box_name } => {
            let ice_box = IceBox::open(&box_path(&config_dir, &box_name)?)?;
            for line in format_listing(&ice_box.sources()?) {
                println!("{line}");
            }
        }
        Command::Refresh { box_name, options } => {
            let options = RetrievalOptions::from_pairs(&options)?;
            let ice_box = IceBox::open(&box_path(&config_dir, &box_name)?)?;
            for line in format_report(&ice_box.refresh(&options)?) {
                println!("{line}");
            }
        }
        Command::Version => println!("icebox {}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}
