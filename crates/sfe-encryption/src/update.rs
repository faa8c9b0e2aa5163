//! Re-encryption trigger for rename, restore and share events.
//!
//! Whenever the set of readers of a file may have changed, the active module
//! gets the fresh access list so it can rewrap the file key. Directories are
//! expanded into their descendant files. Per-file failures are collected in
//! an [`UpdateReport`] and never stop the walk.

use std::sync::Arc;

use sfe_core::services::{AccessListResolver, FilesystemView};
use sfe_core::types::{ShareItemType, UpdateEvent};
use sfe_core::SfeResult;
use tracing::{debug, info, warn};

use crate::module::EncryptionModule;
use crate::paths::{dirname, normalize_path, strip_partial_file_extension, PathClassifier};
use crate::registry::ModuleRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailure {
    pub path: String,
    pub reason: String,
}

/// Outcome of one update pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Files whose key material was rewrapped
    pub updated: usize,
    pub failures: Vec<UpdateFailure>,
}

impl UpdateReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, path: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(path = %path, "key update failed: {reason}");
        self.failures.push(UpdateFailure {
            path: path.to_string(),
            reason,
        });
    }
}

pub struct Update {
    uid: String,
    view: Arc<dyn FilesystemView>,
    classifier: Arc<PathClassifier>,
    registry: Arc<ModuleRegistry>,
    access: Arc<dyn AccessListResolver>,
}

impl Update {
    /// `uid` is the acting user; restore events are resolved in their tree.
    pub fn new(
        uid: &str,
        view: Arc<dyn FilesystemView>,
        classifier: Arc<PathClassifier>,
        registry: Arc<ModuleRegistry>,
        access: Arc<dyn AccessListResolver>,
    ) -> Self {
        Self {
            uid: uid.to_string(),
            view,
            classifier,
            registry,
            access,
        }
    }

    pub fn handle(&self, event: &UpdateEvent) -> SfeResult<UpdateReport> {
        match event {
            UpdateEvent::Rename { old_path, new_path } => self.post_rename(old_path, new_path),
            UpdateEvent::Restore { file_path } => self.post_restore(file_path),
            UpdateEvent::Share { item_type, path } => self.post_shared(*item_type, path),
            UpdateEvent::Unshare { item_type, path } => self.post_unshared(*item_type, path),
        }
    }

    /// Moving within one directory keeps the readers; anything else may not.
    pub fn post_rename(&self, old_path: &str, new_path: &str) -> SfeResult<UpdateReport> {
        if !self.registry.is_enabled() || dirname(old_path) == dirname(new_path) {
            return Ok(UpdateReport::default());
        }
        let (owner, owner_path) = self.view.owner_path(new_path)?;
        self.update(&format!("/{owner}/files/{owner_path}"))
    }

    pub fn post_restore(&self, file_path: &str) -> SfeResult<UpdateReport> {
        if !self.registry.is_enabled() {
            return Ok(UpdateReport::default());
        }
        self.update(&format!("/{}/files/{file_path}", self.uid))
    }

    pub fn post_shared(&self, item_type: ShareItemType, path: &str) -> SfeResult<UpdateReport> {
        self.share_changed(item_type, path)
    }

    pub fn post_unshared(&self, item_type: ShareItemType, path: &str) -> SfeResult<UpdateReport> {
        self.share_changed(item_type, path)
    }

    fn share_changed(&self, item_type: ShareItemType, path: &str) -> SfeResult<UpdateReport> {
        let carries_content = matches!(item_type, ShareItemType::File | ShareItemType::Folder);
        if !self.registry.is_enabled() || !carries_content {
            return Ok(UpdateReport::default());
        }
        self.update(path)
    }

    /// Rewrap key material of `path`, or of every file below it.
    ///
    /// Registry failures (no resolvable module) propagate; everything that
    /// goes wrong for a single file lands in the report.
    pub fn update(&self, path: &str) -> SfeResult<UpdateReport> {
        let module = self.registry.get_encryption_module(None)?;
        let mut report = UpdateReport::default();
        if !module.needs_detailed_access_list() {
            debug!(module = %module.id(), "module ignores access lists, skipping update");
            return Ok(report);
        }

        let path = strip_partial_file_extension(&normalize_path(path));
        let files = if self.view.is_dir(&path) {
            self.collect_files(&path, &mut report)
        } else {
            vec![path]
        };

        for file in &files {
            self.update_file(module.as_ref(), file, &mut report);
        }
        info!(
            module = %module.id(),
            updated = report.updated,
            failed = report.failures.len(),
            "key update finished"
        );
        Ok(report)
    }

    fn update_file(&self, module: &dyn EncryptionModule, path: &str, report: &mut UpdateReport) {
        let access_list = match self.access.get_access_list(path) {
            Ok(list) => list,
            Err(e) => {
                report.fail(path, format!("access list: {e}"));
                return;
            }
        };
        if module.update(path, &self.uid, &access_list) {
            debug!(path = %path, readers = access_list.users.len(), "keys updated");
            report.updated += 1;
        } else {
            report.fail(path, format!("module {} declined the update", module.id()));
        }
    }

    /// Depth-first listing of every file below `dir`, keystore subtrees excluded.
    fn collect_files(&self, dir: &str, report: &mut UpdateReport) -> Vec<String> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_string()];

        while let Some(current) = pending.pop() {
            let entries = match self.view.get_directory_content(&current) {
                Ok(entries) => entries,
                Err(e) => {
                    report.fail(&current, format!("listing: {e}"));
                    continue;
                }
            };
            for entry in entries {
                let child = format!("{current}/{}", entry.name);
                if self.classifier.is_excluded(&child) {
                    continue;
                }
                if entry.is_dir {
                    pending.push(child);
                } else {
                    files.push(child);
                }
            }
        }
        files
    }
}
