pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod crypt;
pub mod error;
pub mod ice_box;
pub mod poller;
pub mod reconcile;
pub mod upload;
pub mod utils;

pub use error::{Error, ErrorKind, ErrorLocation, ErrorMeta, IceboxError, Result, ResultExt};
pub use ice_box::IceBox;
pub use icebox_macros::error_context;
