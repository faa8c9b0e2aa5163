//! Permanent bulk decryption of one user's tree or of every tree.
//!
//! Each file is decrypted by copying it through the decrypting read path to
//! `<path>.decrypted.<ts>`, restoring its mtime and renaming the copy over the
//! original. The ciphertext stays intact until the rename, so an interrupted
//! run can simply be started again: already-plain files are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sfe_core::services::{FilesystemView, UserManager};
use sfe_core::{SfeError, SfeResult};
use tracing::{debug, error, info, warn};

use crate::module::Console;
use crate::registry::ModuleRegistry;

/// Users fetched per backend call when enumerating everyone
pub const USER_PAGE_SIZE: usize = 500;

/// Progress callback: (user number, user count, current file)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// State of one decrypt-all invocation. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptAllSession {
    /// `None` when every user is processed
    pub target: Option<String>,
    /// Prepare result per module id, in registration order
    pub prepared: Vec<(String, bool)>,
    pub users_processed: u64,
    pub decrypted: u64,
    pub already_plain: u64,
    /// Entries skipped because they live on another user's storage
    pub skipped_shared: u64,
    /// uid → paths that could not be decrypted
    pub failed: BTreeMap<String, Vec<String>>,
}

impl DecryptAllSession {
    pub fn failure_count(&self) -> usize {
        self.failed.values().map(Vec::len).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    AlreadyPlain,
    Decrypted,
    Failed,
}

pub struct DecryptAll {
    registry: Arc<ModuleRegistry>,
    view: Arc<dyn FilesystemView>,
    users: Arc<dyn UserManager>,
    include_versions: bool,
    session: DecryptAllSession,
}

impl DecryptAll {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        view: Arc<dyn FilesystemView>,
        users: Arc<dyn UserManager>,
    ) -> Self {
        Self {
            registry,
            view,
            users,
            include_versions: false,
            session: DecryptAllSession::default(),
        }
    }

    /// Also walk `/<uid>/files_versions`.
    pub fn with_versions(mut self, include_versions: bool) -> Self {
        self.include_versions = include_versions;
        self
    }

    pub fn session(&self) -> &DecryptAllSession {
        &self.session
    }

    /// Decrypt every file of `user`, or of all users when `user` is empty.
    ///
    /// Returns false if the user does not exist or a module refused to
    /// prepare; in both cases no file is touched. Per-file failures do not
    /// change the return value and are listed in [`Self::session`].
    pub fn decrypt_all(
        &mut self,
        console: &mut dyn Console,
        user: &str,
        progress: Option<&ProgressFn>,
    ) -> bool {
        self.session = DecryptAllSession {
            target: (!user.is_empty()).then(|| user.to_string()),
            ..DecryptAllSession::default()
        };

        if !user.is_empty() && !self.users.user_exists(user) {
            console.writeln(&format!(
                "User \"{user}\" does not exist. Please check the username and try again"
            ));
            return false;
        }

        console.writeln("prepare encryption modules...");
        if !self.prepare_encryption_modules(console, user) {
            return false;
        }
        console.writeln(" done.");

        self.decrypt_all_users_files(console, user, progress);

        if self.session.is_clean() {
            console.writeln("all files could be decrypted successfully!");
        } else {
            console.writeln("Files for following users couldn't be decrypted, ");
            console.writeln("maybe the user is not set up in a way that supports this operation: ");
            for (uid, paths) in &self.session.failed {
                console.writeln(&format!("    {uid}"));
                for path in paths {
                    console.writeln(&format!("        {path}"));
                }
            }
        }
        info!(
            users = self.session.users_processed,
            decrypted = self.session.decrypted,
            already_plain = self.session.already_plain,
            failed = self.session.failure_count(),
            "decrypt-all finished"
        );
        true
    }

    /// Ask every registered module to get ready. All must agree.
    pub fn prepare_encryption_modules(&mut self, console: &mut dyn Console, user: &str) -> bool {
        for descriptor in self.registry.get_encryption_modules() {
            let ready = match self.registry.get_encryption_module(Some(&descriptor.id)) {
                Ok(module) => {
                    console.writeln(&format!("prepare \"{}\"", descriptor.display_name));
                    module.prepare_decrypt_all(console, user)
                }
                Err(e) => {
                    error!(module = %descriptor.id, "cannot instantiate module: {e}");
                    false
                }
            };
            self.session.prepared.push((descriptor.id.clone(), ready));
            if !ready {
                console.writeln(&format!(
                    "Module \"{}\" does not support the decryption of all files, or is not ready",
                    descriptor.display_name
                ));
                warn!(module = %descriptor.id, "module not ready for decrypt-all");
                return false;
            }
        }
        true
    }

    /// Process `user`, or every user from every backend when `user` is empty.
    pub fn decrypt_all_users_files(
        &mut self,
        console: &mut dyn Console,
        user: &str,
        progress: Option<&ProgressFn>,
    ) {
        let users = if user.is_empty() {
            console.writeln("Fetch list of users...");
            self.all_users()
        } else {
            vec![user.to_string()]
        };

        let total = users.len() as u64;
        for (idx, uid) in users.iter().enumerate() {
            let user_no = idx as u64 + 1;
            if let Some(cb) = progress {
                cb(user_no, total, &format!("start decrypting files of {uid}"));
            }
            debug!(uid = %uid, user_no, total, "decrypting user tree");
            self.decrypt_users_files(uid, user_no, total, progress);
            self.session.users_processed += 1;
        }
    }

    fn all_users(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut users = Vec::new();
        for backend in self.users.backends() {
            let mut offset = 0;
            loop {
                let page = backend.get_users("", USER_PAGE_SIZE, offset);
                let page_len = page.len();
                for uid in page {
                    if seen.insert(uid.clone()) {
                        users.push(uid);
                    }
                }
                if page_len < USER_PAGE_SIZE {
                    break;
                }
                offset += USER_PAGE_SIZE;
            }
            debug!(backend = backend.name(), count = users.len(), "users fetched");
        }
        users
    }

    /// Depth-first walk of one user's tree. An empty or missing tree is
    /// simply nothing to do.
    pub fn decrypt_users_files(
        &mut self,
        uid: &str,
        user_no: u64,
        user_total: u64,
        progress: Option<&ProgressFn>,
    ) {
        let mut roots = vec![format!("/{uid}/files")];
        if self.include_versions {
            roots.push(format!("/{uid}/files_versions"));
        }
        let mut pending: Vec<String> = roots
            .into_iter()
            .rev()
            .filter(|root| self.view.is_dir(root))
            .collect();

        while let Some(dir) = pending.pop() {
            let entries = match self.view.get_directory_content(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(uid = %uid, path = %dir, "cannot list directory: {e}");
                    self.record_failure(uid, &dir);
                    continue;
                }
            };

            for entry in entries {
                if entry.is_shared_storage() {
                    self.session.skipped_shared += 1;
                    continue;
                }
                let path = format!("{dir}/{}", entry.name);
                if entry.is_dir {
                    pending.push(path);
                    continue;
                }

                if let Some(cb) = progress {
                    cb(user_no, user_total, &path);
                }
                match self.decrypt_file_outcome(&path) {
                    FileOutcome::Decrypted => self.session.decrypted += 1,
                    FileOutcome::AlreadyPlain => self.session.already_plain += 1,
                    FileOutcome::Failed => self.record_failure(uid, &path),
                }
            }
        }
    }

    /// Replace `path` with its plaintext. Already-plain files succeed
    /// untouched. Never fails loudly: any error cleans up and yields false.
    pub fn decrypt_file(&self, path: &str) -> bool {
        self.decrypt_file_outcome(path) != FileOutcome::Failed
    }

    fn decrypt_file_outcome(&self, path: &str) -> FileOutcome {
        let info = match self.view.get_file_info(path) {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(path = %path, "file vanished before decryption");
                return FileOutcome::Failed;
            }
            Err(e) => {
                warn!(path = %path, "cannot stat file: {e}");
                return FileOutcome::Failed;
            }
        };
        if !info.is_encrypted() {
            return FileOutcome::AlreadyPlain;
        }

        let target = format!("{path}.decrypted.{}", now_epoch());
        match self.swap_in_plaintext(path, &target, info.mtime) {
            Ok(()) => {
                debug!(path = %path, "decrypted");
                FileOutcome::Decrypted
            }
            Err(e) => {
                if e.is_decryption_failure() {
                    warn!(path = %path, "cannot decrypt: {e}");
                } else {
                    error!(path = %path, "decryption aborted: {e}");
                }
                if self.view.file_exists(&target) {
                    if let Err(e) = self.view.unlink(&target) {
                        warn!(path = %target, "cannot remove temporary copy: {e}");
                    }
                }
                FileOutcome::Failed
            }
        }
    }

    fn swap_in_plaintext(&self, source: &str, target: &str, mtime: u64) -> SfeResult<()> {
        self.view.copy(source, target)?;
        // with encryption still switched on the copy comes back encrypted
        if self
            .view
            .get_file_info(target)?
            .map_or(true, |info| info.is_encrypted())
        {
            return Err(SfeError::DecryptionFailed(format!(
                "{source}: copy is not plaintext, is encryption still enabled?"
            )));
        }
        self.view.touch(target, mtime)?;
        self.view.rename(target, source)?;
        Ok(())
    }

    fn record_failure(&mut self, uid: &str, path: &str) {
        self.session
            .failed
            .entry(uid.to_string())
            .or_default()
            .push(path.to_string());
    }
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
