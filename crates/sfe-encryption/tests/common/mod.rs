//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use sfe_core::config::MemoryConfigStore;
use sfe_core::services::{AccessListResolver, FilesystemView, UserBackend, UserManager};
use sfe_core::types::{AccessList, FileInfo, StorageKind};
use sfe_core::{SfeError, SfeResult};
use sfe_encryption::{Console, EncryptionModule, Header, ModuleRegistry};

// ── Filesystem ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Node {
    pub is_dir: bool,
    pub encrypted: bool,
    pub content: Vec<u8>,
    pub mtime: u64,
    pub storage: StorageKind,
}

/// Flat path → node map. Copy of an encrypted node yields plaintext, the
/// way the decrypting read path does.
#[derive(Default)]
pub struct MemoryView {
    nodes: Mutex<BTreeMap<String, Node>>,
    pub fail_copy: Mutex<BTreeSet<String>>,
    pub fail_rename_onto: Mutex<BTreeSet<String>>,
    pub fail_listing: Mutex<BTreeSet<String>>,
    pub listings: AtomicUsize,
    pub copies: AtomicUsize,
    pub renames: AtomicUsize,
    pub owner_lookups: AtomicUsize,
}

impl MemoryView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mkdir(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            nodes.entry(current.clone()).or_insert(Node {
                is_dir: true,
                encrypted: false,
                content: Vec::new(),
                mtime: 0,
                storage: StorageKind::Home,
            });
        }
    }

    fn add_file(&self, path: &str, content: &[u8], encrypted: bool, storage: StorageKind) {
        let parent = &path[..path.rfind('/').unwrap()];
        self.mkdir(parent);
        self.nodes.lock().unwrap().insert(
            path.to_string(),
            Node {
                is_dir: false,
                encrypted,
                content: content.to_vec(),
                mtime: 1_000,
                storage,
            },
        );
    }

    pub fn add_encrypted(&self, path: &str, content: &[u8]) {
        self.add_file(path, content, true, StorageKind::Home);
    }

    pub fn add_plain(&self, path: &str, content: &[u8]) {
        self.add_file(path, content, false, StorageKind::Home);
    }

    pub fn add_shared(&self, path: &str, owner: &str) {
        self.add_file(
            path,
            b"shared",
            true,
            StorageKind::Shared {
                owner: owner.to_string(),
            },
        );
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_mtime(&self, path: &str, mtime: u64) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(path) {
            node.mtime = mtime;
        }
    }

    fn info(path: &str, node: &Node) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            is_dir: node.is_dir,
            encrypted: node.encrypted,
            size: node.content.len() as u64,
            mtime: node.mtime,
            storage: node.storage.clone(),
        }
    }
}

impl FilesystemView for MemoryView {
    fn is_dir(&self, path: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(path)
            .is_some_and(|n| n.is_dir)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    fn get_directory_content(&self, path: &str) -> SfeResult<Vec<FileInfo>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.lock().unwrap().contains(path) {
            return Err(SfeError::Storage(format!("cannot list {path}")));
        }
        let prefix = format!("{path}/");
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .map(|(p, n)| Self::info(p, n))
            .collect())
    }

    fn get_file_info(&self, path: &str) -> SfeResult<Option<FileInfo>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .get(path)
            .map(|n| Self::info(path, n)))
    }

    fn copy(&self, source: &str, target: &str) -> SfeResult<()> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().unwrap();
        let mut node = nodes
            .get(source)
            .cloned()
            .ok_or_else(|| SfeError::Storage(format!("{source} not found")))?;
        if self.fail_copy.lock().unwrap().contains(source) {
            // a partial target is left behind
            node.content.truncate(1);
            nodes.insert(target.to_string(), node);
            return Err(SfeError::DecryptionFailed(format!("bad key for {source}")));
        }
        node.encrypted = false;
        node.mtime = 9_999;
        nodes.insert(target.to_string(), node);
        Ok(())
    }

    fn rename(&self, source: &str, target: &str) -> SfeResult<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        if self.fail_rename_onto.lock().unwrap().contains(target) {
            return Err(SfeError::Storage(format!("rename onto {target} refused")));
        }
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .remove(source)
            .ok_or_else(|| SfeError::Storage(format!("{source} not found")))?;
        nodes.insert(target.to_string(), node);
        Ok(())
    }

    fn unlink(&self, path: &str) -> SfeResult<()> {
        self.nodes.lock().unwrap().remove(path);
        Ok(())
    }

    fn touch(&self, path: &str, mtime: u64) -> SfeResult<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| SfeError::Storage(format!("{path} not found")))?;
        node.mtime = mtime;
        Ok(())
    }

    fn owner_path(&self, path: &str) -> SfeResult<(String, String)> {
        self.owner_lookups.fetch_add(1, Ordering::SeqCst);
        let mut segments = path.trim_start_matches('/').splitn(3, '/');
        let uid = segments.next().unwrap_or_default();
        let _files = segments.next();
        let rest = segments.next().unwrap_or_default();
        Ok((uid.to_string(), rest.to_string()))
    }
}

// ── Users ─────────────────────────────────────────────────────────────────────

pub struct PagedBackend {
    name: String,
    users: Vec<String>,
    pub calls: AtomicUsize,
}

impl PagedBackend {
    pub fn new(name: &str, users: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            users,
            calls: AtomicUsize::new(0),
        }
    }
}

impl UserBackend for PagedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_users(&self, _search: &str, limit: usize, offset: usize) -> Vec<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.users.iter().skip(offset).take(limit).cloned().collect()
    }
}

pub struct FakeUsers {
    pub backends: Vec<PagedBackend>,
}

impl FakeUsers {
    pub fn new(users: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            backends: vec![PagedBackend::new(
                "database",
                users.iter().map(|u| u.to_string()).collect(),
            )],
        })
    }

    pub fn with_backends(backends: Vec<PagedBackend>) -> Arc<Self> {
        Arc::new(Self { backends })
    }
}

impl UserManager for FakeUsers {
    fn user_exists(&self, uid: &str) -> bool {
        self.backends
            .iter()
            .any(|b| b.users.iter().any(|u| u == uid))
    }

    fn backends(&self) -> Vec<&dyn UserBackend> {
        self.backends
            .iter()
            .map(|b| b as &dyn UserBackend)
            .collect()
    }
}

// ── Encryption module ─────────────────────────────────────────────────────────

pub struct FakeModule {
    id: String,
    pub ready: bool,
    pub detailed_access_list: bool,
    pub refuse_update: Mutex<BTreeSet<String>>,
    pub prepare_calls: AtomicUsize,
    pub updates: Mutex<Vec<(String, String, AccessList)>>,
}

impl FakeModule {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ready: true,
            detailed_access_list: true,
            refuse_update: Mutex::new(BTreeSet::new()),
            prepare_calls: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn without_access_lists(mut self) -> Self {
        self.detailed_access_list = false;
        self
    }

    pub fn updated_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .updates
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }
}

impl EncryptionModule for FakeModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        "Fake module"
    }

    fn encrypt(
        &self,
        _path: &str,
        _access_list: &AccessList,
        plain: &mut dyn Read,
        cipher: &mut dyn Write,
    ) -> SfeResult<Header> {
        std::io::copy(plain, cipher)?;
        Ok(Header::new())
    }

    fn decrypt(
        &self,
        _path: &str,
        _header: &Header,
        cipher: &mut dyn Read,
        plain: &mut dyn Write,
    ) -> SfeResult<u64> {
        Ok(std::io::copy(cipher, plain)?)
    }

    fn update(&self, path: &str, uid: &str, access_list: &AccessList) -> bool {
        self.updates
            .lock()
            .unwrap()
            .push((path.to_string(), uid.to_string(), access_list.clone()));
        !self.refuse_update.lock().unwrap().contains(path)
    }

    fn prepare_decrypt_all(&self, _console: &mut dyn Console, _user: &str) -> bool {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        self.ready
    }

    fn should_encrypt(&self, _path: &str) -> bool {
        true
    }

    fn needs_detailed_access_list(&self) -> bool {
        self.detailed_access_list
    }
}

/// Registry with `modules` registered and encryption switched on.
pub fn registry_with(modules: &[Arc<FakeModule>]) -> Arc<ModuleRegistry> {
    let registry = Arc::new(ModuleRegistry::new(Arc::new(MemoryConfigStore::new())));
    for module in modules {
        let instance = Arc::clone(module);
        registry
            .register_encryption_module(module.id(), "Fake module", move || {
                Arc::clone(&instance) as Arc<dyn EncryptionModule>
            })
            .unwrap();
    }
    registry.set_enabled(true).unwrap();
    registry
}

// ── Access lists ──────────────────────────────────────────────────────────────

/// Owner plus configured extra readers; fails for selected paths.
#[derive(Default)]
pub struct FakeAccess {
    pub readers: Mutex<BTreeMap<String, Vec<String>>>,
    pub fail: Mutex<BTreeSet<String>>,
}

impl AccessListResolver for FakeAccess {
    fn get_access_list(&self, path: &str) -> SfeResult<AccessList> {
        if self.fail.lock().unwrap().contains(path) {
            return Err(SfeError::Storage(format!("share table unavailable for {path}")));
        }
        let owner = path.trim_start_matches('/').split('/').next().unwrap_or_default();
        let mut list = AccessList::owner_only(owner, path);
        if let Some(extra) = self.readers.lock().unwrap().get(path) {
            for uid in extra {
                list.users.insert(uid.clone(), path.to_string());
            }
        }
        Ok(list)
    }
}

// ── Console ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingConsole {
    pub lines: Vec<String>,
}

impl RecordingConsole {
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

impl Console for RecordingConsole {
    fn writeln(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn confirm(&mut self, _question: &str) -> bool {
        true
    }

    fn read_secret(&mut self, _prompt: &str) -> Option<SecretString> {
        None
    }
}
