//! Local filesystem capability used by the sandboxed runtime.
//!
//! Every filesystem the runtime can be pointed at implements [`LocalFs`]. The
//! overlay layer wraps one of these and implements the same trait, so callers
//! never learn whether a path was materialized on demand.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use std::sync::Arc;

mod memfs;
pub use memfs::MemFs;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Numeric open flags as the runtime passes them through its syscall layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(0);
    pub const WRITE_ONLY: OpenFlags = OpenFlags(0o1);
    pub const READ_WRITE: OpenFlags = OpenFlags(0o2);
    pub const CREATE: OpenFlags = OpenFlags(0o100);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0o200);
    pub const TRUNCATE: OpenFlags = OpenFlags(0o1000);
    pub const APPEND: OpenFlags = OpenFlags(0o2000);
    pub const LARGEFILE: OpenFlags = OpenFlags(0o100000);
    pub const CLOEXEC: OpenFlags = OpenFlags(0o2000000);

    /// The exact word the runtime uses for a plain read-open (557056).
    pub const READ: OpenFlags = OpenFlags(0o2100000);

    const ACCESS_MODE_MASK: u32 = 0o3;

    pub const fn from_bits(bits: u32) -> Self {
        OpenFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn writes(self) -> bool {
        self.0 & Self::ACCESS_MODE_MASK != 0
    }

    pub fn is_plain_read(self) -> bool {
        self == Self::READ
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub path: String,
    pub flags: OpenFlags,
    pub kind: FileKind,
    pub size: u64,
}

pub trait LocalFs: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<FileHandle>;
    fn stat(&self, path: &str) -> FsResult<Metadata>;
    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()>;
    fn exists(&self, path: &str) -> bool;
    fn write_file(&self, path: &str, bytes: &[u8]) -> FsResult<()>;
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;
    fn chdir(&self, path: &str) -> FsResult<()>;
    fn cwd(&self) -> String;
    fn remove_tree(&self, path: &str) -> FsResult<()>;
}

impl<T: LocalFs + ?Sized> LocalFs for Arc<T> {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<FileHandle> {
        (**self).open(path, flags, mode)
    }

    fn stat(&self, path: &str) -> FsResult<Metadata> {
        (**self).stat(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        (**self).mkdir(path, mode)
    }

    fn exists(&self, path: &str) -> bool {
        (**self).exists(path)
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> FsResult<()> {
        (**self).write_file(path, bytes)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        (**self).read_file(path)
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        (**self).chdir(path)
    }

    fn cwd(&self) -> String {
        (**self).cwd()
    }

    fn remove_tree(&self, path: &str) -> FsResult<()> {
        (**self).remove_tree(path)
    }
}

pub const DEFAULT_DIR_MODE: u32 = 0o777;
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Creates `path` and every missing ancestor. Existing directories are left
/// alone; an existing non-directory along the way is an error.
pub fn create_dir_all(fs: &dyn LocalFs, path: &str) -> FsResult<()> {
    let abs = stage_core::normalize_path(path, &fs.cwd());
    let mut chain = stage_core::ancestors(&abs);
    if abs != "/" {
        chain.push(abs);
    }
    for dir in chain {
        match fs.mkdir(&dir, DEFAULT_DIR_MODE) {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => {
                if !fs.stat(&dir)?.is_dir() {
                    return Err(FsError::NotADirectory(dir));
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
