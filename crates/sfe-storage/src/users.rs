//! Directory-backed user accounts
//!
//! A user exists when `<root>/<uid>/files` is a directory. The key store
//! directory at the root is never a user.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sfe_core::services::{UserBackend, UserManager};
use sfe_encryption::paths::KEYSTORE_DIR;
use tracing::warn;

pub const BACKEND_NAME: &str = "local";

pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// All uids, sorted.
    fn list(&self) -> anyhow::Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("listing users under {}", self.root.display()))?;
        let mut uids = Vec::new();
        for entry in entries {
            let entry = entry.context("reading user directory entry")?;
            let Ok(uid) = entry.file_name().into_string() else {
                continue;
            };
            if is_user_dir(&self.root, &uid) {
                uids.push(uid);
            }
        }
        uids.sort();
        Ok(uids)
    }
}

impl UserBackend for DirectoryBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn get_users(&self, search: &str, limit: usize, offset: usize) -> Vec<String> {
        let uids = match self.list() {
            Ok(uids) => uids,
            Err(e) => {
                warn!(root = %self.root.display(), "cannot list users: {e:#}");
                return Vec::new();
            }
        };
        let needle = search.to_lowercase();
        uids.into_iter()
            .filter(|uid| needle.is_empty() || uid.to_lowercase().contains(&needle))
            .skip(offset)
            .take(limit)
            .collect()
    }
}

pub struct LocalUserManager {
    backend: DirectoryBackend,
}

impl LocalUserManager {
    pub fn new(root: &Path) -> Self {
        Self {
            backend: DirectoryBackend::new(root),
        }
    }

    /// Create `<root>/<uid>/files`.
    pub fn create_user(&self, uid: &str) -> anyhow::Result<()> {
        if !is_valid_uid(uid) {
            anyhow::bail!("invalid user id: {uid:?}");
        }
        let files = self.backend.root.join(uid).join("files");
        fs::create_dir_all(&files).with_context(|| format!("creating {}", files.display()))?;
        Ok(())
    }
}

impl UserManager for LocalUserManager {
    fn user_exists(&self, uid: &str) -> bool {
        is_valid_uid(uid) && is_user_dir(&self.backend.root, uid)
    }

    fn backends(&self) -> Vec<&dyn UserBackend> {
        vec![&self.backend]
    }
}

fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid != KEYSTORE_DIR
        && !uid.starts_with('.')
        && !uid.contains(['/', '\\'])
}

fn is_user_dir(root: &Path, uid: &str) -> bool {
    is_valid_uid(uid) && root.join(uid).join("files").is_dir()
}
