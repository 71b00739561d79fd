use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::Result;

const ZSTD_LEVEL: i32 = 3;

/// Compression used by `put` unless another one is requested.
pub const DEFAULT_COMPRESSION: Compression = Compression::Zstd;

/// Compression applied to the plain payload before it is sealed.
///
/// Envelopes written without the field decode as `None`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }

    pub fn compress<R: Read, W: Write>(&self, input: &mut R, output: &mut W) -> Result<()> {
        match self {
            Compression::None => {
                io::copy(input, output)?;
            }
            Compression::Zstd => zstd::stream::copy_encode(input, output, ZSTD_LEVEL)?,
        }
        Ok(())
    }

    pub fn decompress<R: Read, W: Write>(&self, input: &mut R, output: &mut W) -> Result<()> {
        match self {
            Compression::None => {
                io::copy(input, output)?;
            }
            Compression::Zstd => zstd::stream::copy_decode(input, output).map_err(|source| {
                crate::icebox_error!(IntegrityError {
                    description: format!("Failed to decompress zstd payload: {source}"),
                })
            })?,
        }
        Ok(())
    }
}
