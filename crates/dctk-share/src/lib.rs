//! # dctk-share
//!
//! The local share: a recursive index of mounted directories with per-file
//! Tiger-tree digests, plus the browsable file-list document peers download
//! under the fixed name `files.xml.bz2`.

mod filelist;
mod share;

pub use filelist::{
    generate_file_list, magnet_link, parse_file_list, FileList, FileListDirectory, FileListFile,
    FILE_LIST_NAME,
};
pub use share::{ShareDirectory, ShareFile, ShareTree};

use std::path::PathBuf;
use thiserror::Error;

/// Share layer errors.
#[derive(Error, Debug)]
pub enum ShareError {
    /// A mount points at something that is not a readable directory.
    #[error("share path is not a directory: {0}")]
    BadPath(PathBuf),

    /// I/O error while scanning or hashing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hashing failed.
    #[error(transparent)]
    Hash(#[from] dctk_hash::HashError),

    /// The file-list document could not be built or parsed.
    #[error("file list error: {0}")]
    FileList(String),
}

/// Result type for share operations.
pub type ShareResult<T> = Result<T, ShareError>;
