//! On-disk fixture: a temp data directory wired to the reference module.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use sfe_core::config::MemoryConfigStore;
use sfe_core::services::{FilesystemView, UserManager};
use sfe_crypto::module::{DISPLAY_NAME, MODULE_ID};
use sfe_crypto::{KdfParams, XChaChaModule};
use sfe_encryption::{Console, EncryptionModule, ModuleRegistry, PathClassifier};
use sfe_storage::{LocalUserManager, LocalView, OwnerAccessResolver};
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";

pub struct Store {
    dir: Option<TempDir>,
    root: PathBuf,
    pub users: Arc<LocalUserManager>,
    pub classifier: Arc<PathClassifier>,
    pub registry: Arc<ModuleRegistry>,
    pub module: Arc<XChaChaModule>,
    pub view: Arc<LocalView>,
}

impl Store {
    /// Users `alice` and `bob`, encryption on, master key unlocked.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Self::open(dir.path());
        store.users.create_user("alice").unwrap();
        store.users.create_user("bob").unwrap();
        store
            .module
            .initialize(&SecretString::from(PASSPHRASE))
            .unwrap();
        store.registry.set_enabled(true).unwrap();
        store.dir = Some(dir);
        store
    }

    /// Second set of collaborators over the same directory, master key locked.
    pub fn reopen(other: &Store) -> Self {
        Self::open(other.root())
    }

    fn open(root: &Path) -> Self {
        let users = Arc::new(LocalUserManager::new(root));
        let classifier = Arc::new(PathClassifier::new(
            users.clone() as Arc<dyn UserManager>,
            "",
            vec![],
        ));
        let kdf = KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        let module = Arc::new(XChaChaModule::new(root, classifier.clone(), kdf));

        let registry = Arc::new(ModuleRegistry::new(Arc::new(MemoryConfigStore::new())));
        let instance = module.clone();
        registry
            .register_encryption_module(MODULE_ID, DISPLAY_NAME, move || {
                instance.clone() as Arc<dyn EncryptionModule>
            })
            .unwrap();

        let view = Arc::new(LocalView::new(
            root,
            registry.clone(),
            classifier.clone(),
            Arc::new(OwnerAccessResolver),
        ));

        Self {
            dir: None,
            root: root.to_path_buf(),
            users,
            classifier,
            registry,
            module,
            view,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn view_dyn(&self) -> Arc<dyn FilesystemView> {
        self.view.clone()
    }

    pub fn raw(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.root().join(path.trim_start_matches('/'))).unwrap()
    }

    pub fn key_dir(&self, path: &str) -> std::path::PathBuf {
        self.module.key_dir(path).unwrap()
    }

    /// Mount `/<owner>/files/<target>` into `/<user>/files/<link>`.
    #[cfg(unix)]
    pub fn share(&self, owner: &str, target: &str, user: &str, link: &str) {
        let target = self.root().join(owner).join("files").join(target);
        let link = self.root().join(user).join("files").join(link);
        std::os::unix::fs::symlink(target, link).unwrap();
    }
}

/// Answers every question with yes and every secret with the passphrase.
#[derive(Default)]
pub struct YesConsole {
    pub lines: Vec<String>,
}

impl Console for YesConsole {
    fn writeln(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn confirm(&mut self, _question: &str) -> bool {
        true
    }

    fn read_secret(&mut self, _prompt: &str) -> Option<SecretString> {
        Some(SecretString::from(PASSPHRASE))
    }
}
