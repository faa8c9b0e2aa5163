//! Path classification and key-directory layout.
//!
//! Store paths look like `/<uid>/files/<relative>`. Key material lives under
//! `[<root>/][<uid>/]files_encryption/keys/<relative>/<module id>/`, where the
//! uid segment is dropped for system-wide mounts.

use std::sync::Arc;

use sfe_core::config::{EncryptionConfig, StorageConfig, SystemMount};
use sfe_core::services::UserManager;
use sfe_core::{SfeError, SfeResult};

/// Keystore directory name, per user or at the root
pub const KEYSTORE_DIR: &str = "files_encryption";

/// Per-file keys, relative to a keystore base
pub const KEYS_BASE_DIR: &str = "files_encryption/keys";

const PART_EXTENSION: &str = ".part";
const TRANSFER_ID_MARKER: &str = ".ocTransferId";

pub struct PathClassifier {
    users: Arc<dyn UserManager>,
    key_storage_root: String,
    system_mounts: Vec<SystemMount>,
}

impl PathClassifier {
    pub fn new(
        users: Arc<dyn UserManager>,
        key_storage_root: &str,
        system_mounts: Vec<SystemMount>,
    ) -> Self {
        let trimmed = key_storage_root.trim_matches('/');
        let key_storage_root = if trimmed.is_empty() {
            String::new()
        } else {
            normalize_path(trimmed)
        };
        Self {
            users,
            key_storage_root,
            system_mounts,
        }
    }

    pub fn from_config(
        users: Arc<dyn UserManager>,
        storage: &StorageConfig,
        encryption: &EncryptionConfig,
    ) -> Self {
        Self::new(
            users,
            &storage.key_storage_root,
            encryption.system_mounts.clone(),
        )
    }

    /// Normalized key-storage root, `""` when keys live inside user trees.
    pub fn key_storage_root(&self) -> &str {
        &self.key_storage_root
    }

    /// True for paths that must never be encrypted: anything under the key
    /// storage root, any keystore subtree, and anything outside a user tree.
    pub fn is_excluded(&self, path: &str) -> bool {
        let normalized = normalize_path(path);

        let relative = if self.key_storage_root.is_empty() {
            normalized.as_str()
        } else if normalized == self.key_storage_root {
            return true;
        } else {
            match normalized.strip_prefix(&self.key_storage_root) {
                Some(rest) if rest.starts_with('/') => return true,
                _ => normalized.as_str(),
            }
        };

        let mut segments = relative.split('/').filter(|s| !s.is_empty());
        let Some(first) = segments.next() else {
            return false;
        };

        if first == KEYSTORE_DIR {
            return true;
        }
        if !self.users.user_exists(first) {
            return true;
        }
        segments.next() == Some(KEYSTORE_DIR)
    }

    /// True only for `/<uid>/files/<rest>` with a non-empty rest.
    pub fn is_file(&self, path: &str) -> bool {
        is_user_file(path)
    }

    /// Split `/<uid>/files/...` into the owner and `/files/...`.
    pub fn get_uid_and_filename(&self, path: &str) -> SfeResult<(String, String)> {
        let normalized = normalize_path(path);
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 3 {
            return Err(SfeError::InvalidPath(format!(
                "{path}: expected /<uid>/files/<path>"
            )));
        }
        let uid = segments[0];
        if !self.users.user_exists(uid) {
            return Err(SfeError::InvalidPath(format!(
                "{path}: \"{uid}\" is not an existing user"
            )));
        }
        Ok((uid.to_string(), format!("/{}", segments[1..].join("/"))))
    }

    /// Whether `relative_path` (as `/files/...`) lies on a system-wide mount
    /// applicable to `uid`.
    pub fn is_system_wide_mount_point(&self, relative_path: &str, uid: &str) -> bool {
        let relative = normalize_path(relative_path);
        self.system_mounts.iter().any(|mount| {
            let mount_path = normalize_path(&format!("/files/{}", mount.mount_point));
            let inside = relative == mount_path
                || relative
                    .strip_prefix(&mount_path)
                    .is_some_and(|rest| rest.starts_with('/'));
            inside && mount.applies_to(uid)
        })
    }

    /// Directory holding the key material of `path` for `module_id`, always
    /// with a trailing `/`.
    pub fn get_file_key_dir(&self, module_id: &str, path: &str) -> SfeResult<String> {
        let tree = self.get_key_tree(path)?;
        Ok(format!("{}/", normalize_path(&format!("{tree}/{module_id}"))))
    }

    /// Key material of `path` for every module. For a directory this is the
    /// parent of all key directories below it.
    pub fn get_key_tree(&self, path: &str) -> SfeResult<String> {
        let (owner, filename) = self.get_uid_and_filename(path)?;
        let filename = strip_partial_file_extension(&filename);

        let base = if self.is_system_wide_mount_point(&filename, &owner) {
            format!("{}/{KEYS_BASE_DIR}", self.key_storage_root)
        } else {
            format!("{}/{owner}/{KEYS_BASE_DIR}", self.key_storage_root)
        };
        Ok(normalize_path(&format!("{base}/{filename}")))
    }
}

// ── Free helpers ──────────────────────────────────────────────────────────────

/// Collapse repeated slashes, drop `.` segments, force a leading `/` and no
/// trailing `/`. `..` is kept verbatim.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Parent directory of a normalized path (`/` for top-level entries).
pub fn dirname(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

pub fn is_user_file(path: &str) -> bool {
    let normalized = normalize_path(path);
    let mut segments = normalized.split('/').filter(|s| !s.is_empty());
    segments.next().is_some() && segments.next() == Some("files") && segments.next().is_some()
}

/// Strip an upload suffix: `.part` or `.ocTransferId<digits>.part`.
pub fn strip_partial_file_extension(path: &str) -> String {
    let Some(stem) = path.strip_suffix(PART_EXTENSION) else {
        return path.to_string();
    };
    if let Some(idx) = stem.rfind(TRANSFER_ID_MARKER) {
        let transfer_id = &stem[idx + TRANSFER_ID_MARKER.len()..];
        if !transfer_id.is_empty() && transfer_id.bytes().all(|b| b.is_ascii_digit()) {
            return stem[..idx].to_string();
        }
    }
    stem.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticUsers;

    fn classifier(root: &str, mounts: Vec<SystemMount>) -> PathClassifier {
        PathClassifier::new(Arc::new(StaticUsers::new(&["alice", "bob"])), root, mounts)
    }

    fn mount(point: &str, users: &[&str]) -> SystemMount {
        SystemMount {
            mount_point: point.to_string(),
            applicable_users: users.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_path("alice//files/./a/"), "/alice/files/a");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("///"), "/");
    }

    #[test]
    fn dirname_of_paths() {
        assert_eq!(dirname("/alice/files/a/b.txt"), "/alice/files/a");
        assert_eq!(dirname("/top"), "/");
        assert_eq!(dirname("/"), "/");
    }

    #[test]
    fn user_files() {
        let c = classifier("", vec![]);
        assert!(c.is_file("/alice/files/doc.txt"));
        assert!(c.is_file("/alice/files/sub/doc.txt"));
        assert!(!c.is_file("/alice/files"));
        assert!(!c.is_file("/alice/files/"));
        assert!(!c.is_file("/alice/files_versions/doc.txt"));
        assert!(!c.is_file("/alice"));
    }

    #[test]
    fn exclusions() {
        let c = classifier("", vec![]);
        assert!(c.is_excluded("/files_encryption/keys/x"));
        assert!(c.is_excluded("/alice/files_encryption/keys/files/doc.txt/A/fileKey"));
        assert!(c.is_excluded("/mallory/files/doc.txt"));
        assert!(c.is_excluded("/appconfig.toml"));
        assert!(!c.is_excluded("/alice/files/doc.txt"));
        assert!(!c.is_excluded("/"));
    }

    #[test]
    fn key_storage_root_is_excluded() {
        let c = classifier("/keys/", vec![]);
        assert_eq!(c.key_storage_root(), "/keys");
        assert!(c.is_excluded("/keys"));
        assert!(c.is_excluded("/keys/alice/files_encryption/keys/x"));
        assert!(!c.is_excluded("/alice/files/keys"));
        assert!(c.is_excluded("/alice/files_encryption/x"));
    }

    #[test]
    fn partial_extensions() {
        assert_eq!(strip_partial_file_extension("/a/b.txt.part"), "/a/b.txt");
        assert_eq!(
            strip_partial_file_extension("/a/b.txt.ocTransferId1234.part"),
            "/a/b.txt"
        );
        assert_eq!(
            strip_partial_file_extension("/a/b.ocTransferIdabc.part"),
            "/a/b.ocTransferIdabc"
        );
        assert_eq!(strip_partial_file_extension("/a/b.txt"), "/a/b.txt");
        let once = strip_partial_file_extension("/a/b.txt.ocTransferId9.part");
        assert_eq!(strip_partial_file_extension(&once), once);
    }

    #[test]
    fn uid_and_filename() {
        let c = classifier("", vec![]);
        assert_eq!(
            c.get_uid_and_filename("/alice/files/a/b.txt").unwrap(),
            ("alice".to_string(), "/files/a/b.txt".to_string())
        );
        assert!(c.get_uid_and_filename("/alice/files").is_err());
        assert!(c.get_uid_and_filename("/mallory/files/x").is_err());
    }

    #[test]
    fn key_dir_per_user() {
        let c = classifier("", vec![]);
        assert_eq!(
            c.get_file_key_dir("MOD", "/alice/files/a/b.txt").unwrap(),
            "/alice/files_encryption/keys/files/a/b.txt/MOD/"
        );
        assert_eq!(
            c.get_file_key_dir("MOD", "/alice/files/b.txt.ocTransferId5.part").unwrap(),
            "/alice/files_encryption/keys/files/b.txt/MOD/"
        );
    }

    #[test]
    fn key_dir_with_root() {
        let c = classifier("keys", vec![]);
        assert_eq!(
            c.get_file_key_dir("MOD", "/bob/files/x").unwrap(),
            "/keys/bob/files_encryption/keys/files/x/MOD/"
        );
    }

    #[test]
    fn key_dir_system_wide_mount_omits_uid() {
        let c = classifier("", vec![mount("shared", &[])]);
        assert_eq!(
            c.get_file_key_dir("MOD", "/alice/files/shared/x").unwrap(),
            "/files_encryption/keys/files/shared/x/MOD/"
        );
        // only a prefix of the mount name
        assert_eq!(
            c.get_file_key_dir("MOD", "/alice/files/shared2/x").unwrap(),
            "/alice/files_encryption/keys/files/shared2/x/MOD/"
        );
    }

    #[test]
    fn mount_applicability() {
        let c = classifier("", vec![mount("team", &["bob"])]);
        assert!(c.is_system_wide_mount_point("/files/team/x", "bob"));
        assert!(!c.is_system_wide_mount_point("/files/team/x", "alice"));
        assert!(!c.is_system_wide_mount_point("/files/other", "bob"));
    }

    #[test]
    fn key_tree_is_key_dir_parent() {
        let c = classifier("", vec![]);
        assert_eq!(
            c.get_key_tree("/alice/files/project").unwrap(),
            "/alice/files_encryption/keys/files/project"
        );
        assert!(c
            .get_file_key_dir("MOD", "/alice/files/project/x")
            .unwrap()
            .starts_with(&c.get_key_tree("/alice/files/project").unwrap()));
    }

    #[test]
    fn key_dirs_are_distinct() {
        let c = classifier("", vec![]);
        let a = c.get_file_key_dir("MOD", "/alice/files/x").unwrap();
        let b = c.get_file_key_dir("MOD", "/bob/files/x").unwrap();
        let other_module = c.get_file_key_dir("OTHER", "/alice/files/x").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, other_module);
    }
}
