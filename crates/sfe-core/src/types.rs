use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which storage backs an entry in a user's tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// The user's own home storage
    Home,
    /// Shared-storage wrapper: the entry belongs to another user's tree
    Shared { owner: String },
}

/// Fresh metadata for one entry, as reported by the filesystem view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Absolute path, e.g. `/alice/files/doc.txt`
    pub path: String,
    /// Last path segment
    pub name: String,
    pub is_dir: bool,
    /// True when the content starts with an encryption header
    pub encrypted: bool,
    /// Size on disk in bytes (header and ciphertext included)
    pub size: u64,
    /// Modification time (Unix epoch seconds)
    pub mtime: u64,
    pub storage: StorageKind,
}

impl FileInfo {
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_shared_storage(&self) -> bool {
        matches!(self.storage, StorageKind::Shared { .. })
    }
}

/// The principals currently able to read a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessList {
    /// uid → path of the file as seen by that user
    pub users: BTreeMap<String, String>,
    /// Whether the file is reachable through a public link
    pub public: bool,
}

impl AccessList {
    /// Access list containing only the owner.
    pub fn owner_only(uid: &str, path: &str) -> Self {
        let mut users = BTreeMap::new();
        users.insert(uid.to_string(), path.to_string());
        Self {
            users,
            public: false,
        }
    }

    pub fn uids(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }
}

/// Share item types that carry file content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareItemType {
    File,
    Folder,
    Calendar,
    Contact,
}

/// A filesystem mutation the re-encryption trigger reacts to. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Rename { old_path: String, new_path: String },
    Restore { file_path: String },
    Share { item_type: ShareItemType, path: String },
    Unshare { item_type: ShareItemType, path: String },
}
