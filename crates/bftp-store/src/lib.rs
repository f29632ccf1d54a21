//! # bftp-store
//!
//! Thin abstraction over one server-side directory. Files are addressed by
//! bare name only; anything that looks like a path escapes the store and is
//! rejected up front.
//!
//! The store does no locking. Callers serialize access through the
//! registry's namespace gate; policy (existence checks before transfers,
//! chunking) lives in the session layer.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("access violation: {name:?} is not a bare filename")]
    AccessViolation { name: String },

    #[error("file not found: {name}")]
    NotFound { name: String },

    #[error("file already exists: {name}")]
    Exists { name: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Directory-backed file store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` inside the root, rejecting anything that is not a
    /// plain filename.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let bare = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !bare {
            return Err(StoreError::AccessViolation {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(name))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.resolve(name)?.exists())
    }

    /// Snapshot of the current file names. Enumeration order is whatever the
    /// filesystem returns; callers must not rely on it being stable.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Create `name` and return a write sink. Fails if the file exists.
    pub fn open_for_write(&self, name: &str) -> Result<File> {
        let path = self.resolve(name)?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                debug!(name, "created file");
                Ok(file)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::Exists {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Open `name` for reading. Fails if the file is absent.
    pub fn open_for_read(&self, name: &str) -> Result<File> {
        let path = self.resolve(name)?;
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(name, "deleted file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
