//! Re-encryption trigger: which events reach the module, and how per-file
//! failures are reported.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{registry_with, FakeAccess, FakeModule, FakeUsers, MemoryView};
use sfe_core::types::{ShareItemType, UpdateEvent};
use sfe_core::SfeError;
use sfe_encryption::{PathClassifier, Update, UpdateReport};

struct Fixture {
    view: Arc<MemoryView>,
    module: Arc<FakeModule>,
    access: Arc<FakeAccess>,
    update: Update,
}

fn fixture_with(module: FakeModule) -> Fixture {
    let view = MemoryView::new();
    let users = FakeUsers::new(&["alice", "bob"]);
    let module = Arc::new(module);
    let registry = registry_with(&[Arc::clone(&module)]);
    let classifier = Arc::new(PathClassifier::new(users, "", vec![]));
    let access = Arc::new(FakeAccess::default());
    let update = Update::new(
        "alice",
        view.clone(),
        classifier,
        registry,
        access.clone(),
    );
    Fixture {
        view,
        module,
        access,
        update,
    }
}

fn fixture() -> Fixture {
    fixture_with(FakeModule::new("A"))
}

#[test]
fn rename_within_directory_is_noop() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/docs/new.txt", b"x");

    let report = f
        .update
        .post_rename("/alice/files/docs/old.txt", "/alice/files/docs/new.txt")
        .unwrap();

    assert_eq!(report.updated, 0);
    assert!(f.module.updated_paths().is_empty());
    assert_eq!(f.view.owner_lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn rename_across_directories_updates_owner_path() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/archive/a.txt", b"x");

    let report = f
        .update
        .post_rename("/alice/files/a.txt", "/alice/files/archive/a.txt")
        .unwrap();

    assert_eq!(report.updated, 1);
    assert!(report.is_clean());
    assert_eq!(f.module.updated_paths(), ["/alice/files/archive/a.txt"]);

    let updates = f.module.updates.lock().unwrap();
    let (_, uid, access) = &updates[0];
    assert_eq!(uid, "alice");
    assert!(access.users.contains_key("alice"));
}

#[test]
fn rename_while_disabled_is_noop() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/archive/a.txt", b"x");
    let registry = registry_with(&[Arc::clone(&f.module)]);
    registry.set_enabled(false).unwrap();
    let update = Update::new(
        "alice",
        f.view.clone(),
        Arc::new(PathClassifier::new(FakeUsers::new(&["alice"]), "", vec![])),
        registry,
        f.access.clone(),
    );

    let report = update
        .post_rename("/alice/files/a.txt", "/alice/files/archive/a.txt")
        .unwrap();
    assert_eq!(report.updated, 0);
    assert!(f.module.updated_paths().is_empty());
}

#[test]
fn restore_updates_in_acting_users_tree() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/restored.txt", b"x");

    let report = f.update.post_restore("restored.txt").unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(f.module.updated_paths(), ["/alice/files/restored.txt"]);
}

#[test]
fn directory_update_continues_past_failures() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/project/a.txt", b"a");
    f.view.add_encrypted("/alice/files/project/b.txt", b"b");
    f.view.add_encrypted("/alice/files/project/deep/c.txt", b"c");
    f.view.add_encrypted("/alice/files/project/deep/d.txt", b"d");
    f.module
        .refuse_update
        .lock()
        .unwrap()
        .insert("/alice/files/project/b.txt".into());
    f.access
        .fail
        .lock()
        .unwrap()
        .insert("/alice/files/project/deep/c.txt".into());

    let report = f.update.update("/alice/files/project").unwrap();

    assert_eq!(report.updated, 2);
    let mut failed: Vec<_> = report.failures.iter().map(|x| x.path.as_str()).collect();
    failed.sort();
    assert_eq!(
        failed,
        ["/alice/files/project/b.txt", "/alice/files/project/deep/c.txt"]
    );
    // the resolver failure never reaches the module
    assert_eq!(
        f.module.updated_paths(),
        [
            "/alice/files/project/a.txt",
            "/alice/files/project/b.txt",
            "/alice/files/project/deep/d.txt",
        ]
    );
}

#[test]
fn unlistable_subdirectory_is_reported() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/project/a.txt", b"a");
    f.view.add_encrypted("/alice/files/project/locked/b.txt", b"b");
    f.view
        .fail_listing
        .lock()
        .unwrap()
        .insert("/alice/files/project/locked".into());

    let report = f.update.update("/alice/files/project").unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "/alice/files/project/locked");
}

#[test]
fn partial_upload_suffix_targets_committed_file() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/big.iso", b"x");

    f.update.update("/alice/files/big.iso.ocTransferId42.part").unwrap();

    assert_eq!(f.module.updated_paths(), ["/alice/files/big.iso"]);
}

#[test]
fn extra_readers_reach_the_module() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/shared.txt", b"x");
    f.access
        .readers
        .lock()
        .unwrap()
        .insert("/alice/files/shared.txt".into(), vec!["bob".into()]);

    f.update
        .post_shared(ShareItemType::File, "/alice/files/shared.txt")
        .unwrap();

    let updates = f.module.updates.lock().unwrap();
    let readers: Vec<_> = updates[0].2.uids().collect();
    assert_eq!(readers, ["alice", "bob"]);
}

#[test]
fn share_events_only_for_files_and_folders() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/x.txt", b"x");

    for item_type in [ShareItemType::Calendar, ShareItemType::Contact] {
        let report = f.update.post_shared(item_type, "/alice/files/x.txt").unwrap();
        assert_eq!(report.updated, 0);
    }
    assert!(f.module.updated_paths().is_empty());

    let report = f
        .update
        .handle(&UpdateEvent::Unshare {
            item_type: ShareItemType::Folder,
            path: "/alice/files/x.txt".into(),
        })
        .unwrap();
    assert_eq!(report.updated, 1);
}

#[test]
fn handle_dispatches_rename() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/b/x.txt", b"x");

    let report = f
        .update
        .handle(&UpdateEvent::Rename {
            old_path: "/alice/files/a/x.txt".into(),
            new_path: "/alice/files/b/x.txt".into(),
        })
        .unwrap();

    assert_eq!(report.updated, 1);
}

#[test]
fn module_without_access_lists_is_skipped() {
    let f = fixture_with(FakeModule::new("A").without_access_lists());
    f.view.add_encrypted("/alice/files/x.txt", b"x");

    let report = f.update.update("/alice/files/x.txt").unwrap();

    assert_eq!(report, UpdateReport::default());
    assert!(f.module.updated_paths().is_empty());
}

#[test]
fn keystore_subtree_is_not_walked() {
    let f = fixture();
    f.view.add_encrypted("/alice/files/a.txt", b"a");
    f.view.add_plain("/alice/files_encryption/keys/files/a.txt/A/fileKey", b"k");

    let report = f.update.update("/alice").unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(f.module.updated_paths(), ["/alice/files/a.txt"]);
}

#[test]
fn ambiguous_default_module_is_an_error() {
    let view = MemoryView::new();
    let users = FakeUsers::new(&["alice"]);
    let registry = registry_with(&[Arc::new(FakeModule::new("A")), Arc::new(FakeModule::new("B"))]);
    let update = Update::new(
        "alice",
        view,
        Arc::new(PathClassifier::new(users, "", vec![])),
        registry,
        Arc::new(FakeAccess::default()),
    );

    let err = update.update("/alice/files/x").unwrap_err();
    assert!(matches!(err, SfeError::ModuleDoesNotExist(_)));
}
