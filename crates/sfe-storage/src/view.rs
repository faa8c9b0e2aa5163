//! Encryption-aware filesystem view over a local data directory
//!
//! Store paths (`/<uid>/files/...`) map onto `<root>/<uid>/files/...`.
//! - Reads detect the header and decrypt through the module that wrote the file
//! - Writes encrypt with the default module when encryption is enabled, the
//!   path is not excluded and the module wants it; otherwise they store plaintext
//! - Every write lands in a sibling temp file and is renamed into place
//! - A symlink is another user's storage mounted into this tree; its owner is
//!   the user whose tree the link resolves into

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sfe_core::services::{AccessListResolver, FilesystemView};
use sfe_core::types::{FileInfo, StorageKind};
use sfe_core::{SfeError, SfeResult};
use sfe_encryption::header::{create_header, parse_raw_header, HEADER_SIZE};
use sfe_encryption::{normalize_path, Header, ModuleRegistry, PathClassifier};
use tracing::{debug, warn};

pub struct LocalView {
    root: PathBuf,
    registry: Arc<ModuleRegistry>,
    classifier: Arc<PathClassifier>,
    access: Arc<dyn AccessListResolver>,
}

impl LocalView {
    pub fn new(
        root: &Path,
        registry: Arc<ModuleRegistry>,
        classifier: Arc<PathClassifier>,
        access: Arc<dyn AccessListResolver>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            registry,
            classifier,
            access,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a store path onto disk. `..` segments are refused.
    pub fn resolve(&self, path: &str) -> SfeResult<PathBuf> {
        let normalized = normalize_path(path);
        if normalized.split('/').any(|s| s == "..") {
            return Err(SfeError::InvalidPath(format!("{path}: parent segments are not allowed")));
        }
        Ok(self.root.join(normalized.trim_start_matches('/')))
    }

    /// Store path of the real file behind `path`, following symlinks.
    /// A missing leaf resolves through its parent directory.
    pub fn canonical_store_path(&self, path: &str) -> SfeResult<String> {
        let on_disk = self.resolve(path)?;
        let real = match on_disk.canonicalize() {
            Ok(real) => real,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (on_disk.parent().map(Path::canonicalize), on_disk.file_name()) {
                    (Some(Ok(parent)), Some(name)) => parent.join(name),
                    _ => return Ok(normalize_path(path)),
                }
            }
            Err(e) => return Err(e.into()),
        };
        let root = self.root.canonicalize()?;
        let relative = real.strip_prefix(&root).map_err(|_| {
            SfeError::InvalidPath(format!("{path} resolves outside of the data directory"))
        })?;
        Ok(normalize_path(&relative.to_string_lossy()))
    }

    pub fn mkdir(&self, path: &str) -> SfeResult<()> {
        fs::create_dir_all(self.resolve(path)?)?;
        Ok(())
    }

    /// Parsed header of `path`, empty for plaintext.
    pub fn read_header(&self, path: &str) -> SfeResult<Header> {
        let mut file = File::open(self.resolve(path)?)?;
        Ok(header_of(&read_prefix(&mut file)?))
    }

    /// Decrypting read path. Returns the number of plaintext bytes.
    pub fn read(&self, path: &str, out: &mut dyn Write) -> SfeResult<u64> {
        let mut file = File::open(self.resolve(path)?)?;
        let prefix = read_prefix(&mut file)?;
        let header = header_of(&prefix);

        if header.is_empty() {
            out.write_all(&prefix)?;
            let rest = io::copy(&mut file, out)?;
            return Ok(prefix.len() as u64 + rest);
        }

        let module = self.registry.get_module_for_header(&header)?;
        let key_path = self.canonical_store_path(path)?;
        debug!(path = %path, module = %module.id(), "decrypting read");
        module.decrypt(&key_path, &header, &mut file, out)
    }

    pub fn read_to_vec(&self, path: &str) -> SfeResult<Vec<u8>> {
        let mut out = Vec::new();
        self.read(path, &mut out)?;
        Ok(out)
    }

    /// Encrypting write path: replaces `path` with the content of `plain`.
    pub fn write(&self, path: &str, plain: &mut dyn Read) -> SfeResult<()> {
        let encrypt = self.should_encrypt(path)?;
        self.write_atomic(path, |file| {
            if encrypt {
                self.encrypt_into(path, plain, file)
            } else {
                io::copy(plain, file)?;
                Ok(())
            }
        })
    }

    pub fn put_bytes(&self, path: &str, data: &[u8]) -> SfeResult<()> {
        self.write(path, &mut &data[..])
    }

    fn should_encrypt(&self, path: &str) -> SfeResult<bool> {
        if !self.registry.is_enabled() || self.classifier.is_excluded(path) {
            return Ok(false);
        }
        Ok(self.registry.get_encryption_module(None)?.should_encrypt(path))
    }

    /// Header placeholder, streamed body, then the real header over the placeholder.
    fn encrypt_into(&self, path: &str, plain: &mut dyn Read, file: &mut File) -> SfeResult<()> {
        let module = self.registry.get_encryption_module(None)?;
        let key_path = self.canonical_store_path(path)?;
        let access_list = self.access.get_access_list(&key_path)?;

        file.write_all(&[0u8; HEADER_SIZE])?;
        let fields = module.encrypt(&key_path, &access_list, plain, file)?;
        let header = create_header(&fields, module.as_ref())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        debug!(path = %path, module = %module.id(), "encrypted write");
        Ok(())
    }

    fn write_atomic<F>(&self, path: &str, fill: F) -> SfeResult<()>
    where
        F: FnOnce(&mut File) -> SfeResult<()>,
    {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| SfeError::InvalidPath(format!("{path} has no parent directory")))?;
        fs::create_dir_all(parent)?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SfeError::InvalidPath(format!("{path} has no file name")))?;
        let tmp = parent.join(format!(".{name}.sfe-tmp"));

        let result = File::create(&tmp)
            .map_err(SfeError::from)
            .and_then(|mut file| {
                fill(&mut file)?;
                file.sync_all()?;
                Ok(())
            })
            .and_then(|()| fs::rename(&tmp, &target).map_err(SfeError::from));

        if result.is_err() {
            if let Err(e) = fs::remove_file(&tmp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %tmp.display(), "cannot remove temp file: {e}");
                }
            }
        }
        result
    }

    // ── Key housekeeping ──────────────────────────────────────────────────────

    /// Key material follows its file. A file replaced by the move loses its
    /// old keys. Failures are logged: the content itself has already moved.
    fn move_key_tree(&self, source: &str, target: &str) {
        let Some(target_keys) = self.key_tree_on_disk(target) else {
            return;
        };
        let source_keys = self.key_tree_on_disk(source).filter(|p| p.exists());
        if source_keys.as_ref() == Some(&target_keys) {
            return;
        }
        if target_keys.exists() {
            if let Err(e) = fs::remove_dir_all(&target_keys) {
                warn!(path = %target_keys.display(), "cannot remove replaced keys: {e}");
            }
        }
        let Some(source_keys) = source_keys else {
            return;
        };
        let moved = target_keys
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::rename(&source_keys, &target_keys));
        match moved {
            Ok(()) => debug!(from = %source, to = %target, "key material moved"),
            Err(e) => warn!(from = %source, to = %target, "cannot move key material: {e}"),
        }
    }

    fn drop_key_tree(&self, path: &str) {
        let Some(keys) = self.key_tree_on_disk(path).filter(|p| p.exists()) else {
            return;
        };
        if let Err(e) = fs::remove_dir_all(&keys) {
            warn!(path = %keys.display(), "cannot remove key material: {e}");
        }
    }

    fn key_tree_on_disk(&self, path: &str) -> Option<PathBuf> {
        let tree = self.classifier.get_key_tree(path).ok()?;
        self.resolve(&tree).ok()
    }

    fn storage_kind(&self, on_disk: &Path, path: &str) -> SfeResult<StorageKind> {
        let is_link = fs::symlink_metadata(on_disk)?.file_type().is_symlink();
        if !is_link {
            return Ok(StorageKind::Home);
        }
        let real = self.canonical_store_path(path)?;
        let owner = real
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(StorageKind::Shared { owner })
    }

    fn info(&self, path: &str, on_disk: &Path) -> SfeResult<FileInfo> {
        let meta = fs::metadata(on_disk)?;
        let is_dir = meta.is_dir();
        let encrypted = !is_dir && is_encrypted(on_disk)?;
        let normalized = normalize_path(path);
        Ok(FileInfo {
            name: normalized.rsplit('/').next().unwrap_or_default().to_string(),
            path: normalized,
            is_dir,
            encrypted,
            size: meta.len(),
            mtime: epoch_secs(meta.modified()?),
            storage: self.storage_kind(on_disk, path)?,
        })
    }
}

impl FilesystemView for LocalView {
    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|p| p.is_dir())
    }

    fn file_exists(&self, path: &str) -> bool {
        self.resolve(path)
            .is_ok_and(|p| fs::symlink_metadata(p).is_ok())
    }

    fn get_directory_content(&self, path: &str) -> SfeResult<Vec<FileInfo>> {
        let dir = self.resolve(path)?;
        let base = normalize_path(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = format!("{}/{name}", base.trim_end_matches('/'));
            match self.info(&child, &entry.path()) {
                Ok(info) => entries.push(info),
                // dangling share link
                Err(SfeError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %child, "skipping dangling entry");
                }
                Err(e) => return Err(e),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn get_file_info(&self, path: &str) -> SfeResult<Option<FileInfo>> {
        let on_disk = self.resolve(path)?;
        match self.info(path, &on_disk) {
            Ok(info) => Ok(Some(info)),
            Err(SfeError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn copy(&self, source: &str, target: &str) -> SfeResult<()> {
        if self.is_dir(source) {
            return Err(SfeError::InvalidPath(format!("{source}: directories are not copied")));
        }
        if self.should_encrypt(target)? {
            let plain = self.read_to_vec(source)?;
            return self.write(target, &mut plain.as_slice());
        }
        // plaintext target: stream straight from the decrypting reader
        self.write_atomic(target, |file| {
            self.read(source, file)?;
            Ok(())
        })
    }

    fn rename(&self, source: &str, target: &str) -> SfeResult<()> {
        let from = self.resolve(source)?;
        let to = self.resolve(target)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        let key_source = self.canonical_store_path(source)?;
        fs::rename(&from, &to)?;
        let key_target = self.canonical_store_path(target)?;
        self.move_key_tree(&key_source, &key_target);
        Ok(())
    }

    fn unlink(&self, path: &str) -> SfeResult<()> {
        let on_disk = self.resolve(path)?;
        let meta = fs::symlink_metadata(&on_disk)?;
        let key_path = self.canonical_store_path(path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&on_disk)?;
        } else {
            fs::remove_file(&on_disk)?;
        }
        if !meta.file_type().is_symlink() {
            self.drop_key_tree(&key_path);
        }
        Ok(())
    }

    fn touch(&self, path: &str, mtime: u64) -> SfeResult<()> {
        let file = File::options().write(true).open(self.resolve(path)?)?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))?;
        Ok(())
    }

    fn owner_path(&self, path: &str) -> SfeResult<(String, String)> {
        let real = self.canonical_store_path(path)?;
        let mut segments = real.trim_start_matches('/').splitn(3, '/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(uid), Some("files"), rest) if !uid.is_empty() => {
                Ok((uid.to_string(), rest.unwrap_or_default().to_string()))
            }
            _ => Err(SfeError::InvalidPath(format!(
                "{path} is not inside a user's files folder"
            ))),
        }
    }
}

/// First `HEADER_SIZE` bytes, or the whole file if shorter.
fn read_prefix(file: &mut File) -> io::Result<Vec<u8>> {
    let mut prefix = Vec::with_capacity(HEADER_SIZE);
    Read::by_ref(file).take(HEADER_SIZE as u64).read_to_end(&mut prefix)?;
    Ok(prefix)
}

fn header_of(prefix: &[u8]) -> Header {
    if prefix.len() < HEADER_SIZE {
        return Header::new();
    }
    parse_raw_header(prefix)
}

fn is_encrypted(on_disk: &Path) -> SfeResult<bool> {
    let mut file = File::open(on_disk)?;
    Ok(!header_of(&read_prefix(&mut file)?).is_empty())
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
