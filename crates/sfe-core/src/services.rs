//! Collaborator traits consumed by the encryption core
//!
//! The core never touches disks, user databases or share tables directly.
//! Everything goes through these blocking interfaces so deployments (and
//! tests) can plug in their own storage and identity layers.

use crate::types::{AccessList, FileInfo};
use crate::SfeResult;

/// Blocking view over the hierarchical file store.
///
/// Paths are absolute within the store (`/<uid>/files/...`). Reads go through
/// the encryption-aware path, so `copy` of an encrypted source produces
/// whatever the read path yields (plaintext while encryption is disabled).
pub trait FilesystemView: Send + Sync {
    fn is_dir(&self, path: &str) -> bool;
    fn file_exists(&self, path: &str) -> bool;
    /// Immediate children of a directory.
    fn get_directory_content(&self, path: &str) -> SfeResult<Vec<FileInfo>>;
    /// Fresh metadata, or `None` when nothing exists at `path`.
    fn get_file_info(&self, path: &str) -> SfeResult<Option<FileInfo>>;
    fn copy(&self, source: &str, target: &str) -> SfeResult<()>;
    fn rename(&self, source: &str, target: &str) -> SfeResult<()>;
    fn unlink(&self, path: &str) -> SfeResult<()>;
    /// Set the modification time (Unix epoch seconds).
    fn touch(&self, path: &str, mtime: u64) -> SfeResult<()>;
    /// Owner uid and the path relative to the owner's `files` folder.
    fn owner_path(&self, path: &str) -> SfeResult<(String, String)>;
}

/// One source of user accounts.
pub trait UserBackend: Send + Sync {
    fn name(&self) -> &str;
    /// A page of uids matching `search` (empty matches all).
    fn get_users(&self, search: &str, limit: usize, offset: usize) -> Vec<String>;
}

pub trait UserManager: Send + Sync {
    fn user_exists(&self, uid: &str) -> bool;
    fn backends(&self) -> Vec<&dyn UserBackend>;
}

/// Computes who may currently read a file.
pub trait AccessListResolver: Send + Sync {
    fn get_access_list(&self, path: &str) -> SfeResult<AccessList>;
}
