//! `XChaChaModule`: the default encryption module.
//!
//! Key files live below the data directory at the location given by
//! [`PathClassifier::get_file_key_dir`]:
//! ```text
//! <data_dir>/<uid>/files_encryption/keys/files/doc.txt/SFE_DEFAULT_MODULE/
//!     fileKey          file key wrapped by the master key
//!     alice.shareKey   file key wrapped by alice's derived share key
//!     bob.shareKey
//! ```
//! The master key itself is described by `<data_dir>/files_encryption/master.json`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64, Engine};
use secrecy::SecretString;
use sfe_core::types::AccessList;
use sfe_core::{SfeError, SfeResult};
use sfe_encryption::paths::KEYSTORE_DIR;
use sfe_encryption::{Console, EncryptionModule, Header, PathClassifier};
use tracing::{debug, info, warn};

use crate::block::{decrypt_stream, encrypt_stream, generate_file_id, FileId};
use crate::kdf::{KdfParams, MasterKey, MasterKeyFile};
use crate::keys::{derive_share_key, generate_file_key, unwrap_key, wrap_key, FileKey};
use crate::{CIPHER_NAME, FILE_ID_SIZE, PLAIN_BLOCK_SIZE};

pub const MODULE_ID: &str = "SFE_DEFAULT_MODULE";
pub const DISPLAY_NAME: &str = "Default encryption module";

pub const FILE_KEY_NAME: &str = "fileKey";
pub const SHARE_KEY_SUFFIX: &str = ".shareKey";
pub const MASTER_KEY_FILE: &str = "master.json";

/// Header field names written by this module
pub const HEADER_CIPHER: &str = "cipher";
pub const HEADER_BLOCK_SIZE: &str = "blocksize";
pub const HEADER_FILE_ID: &str = "fileid";

const FILE_KEY_CONTEXT: &[u8] = b"fileKey";

/// Top-level segments whose files this module encrypts
const ENCRYPTED_TREES: [&str; 3] = ["files", "files_versions", "files_trashbin"];

pub struct XChaChaModule {
    data_dir: PathBuf,
    classifier: Arc<PathClassifier>,
    kdf: KdfParams,
    master: RwLock<Option<MasterKey>>,
}

impl XChaChaModule {
    pub fn new(data_dir: &Path, classifier: Arc<PathClassifier>, kdf: KdfParams) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            classifier,
            kdf,
            master: RwLock::new(None),
        }
    }

    // ── Master key ────────────────────────────────────────────────────────────

    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join(KEYSTORE_DIR).join(MASTER_KEY_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.master_key_path().exists()
    }

    pub fn is_unlocked(&self) -> bool {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Create `master.json` for a new passphrase and keep the module unlocked.
    pub fn initialize(&self, passphrase: &SecretString) -> SfeResult<()> {
        let path = self.master_key_path();
        if path.exists() {
            return Err(SfeError::Config(format!(
                "master key already initialized at {}",
                path.display()
            )));
        }
        let (file, master) = MasterKeyFile::create(passphrase, self.kdf)?;
        file.save(&path)?;
        info!(path = %path.display(), "master key initialized");
        self.set_master(master);
        Ok(())
    }

    pub fn unlock(&self, passphrase: &SecretString) -> SfeResult<()> {
        let path = self.master_key_path();
        let master = MasterKeyFile::load(&path)
            .and_then(|file| file.unlock(passphrase))
            .map_err(|e| SfeError::DecryptionFailed(format!("{e:#}")))?;
        debug!(path = %path.display(), "master key unlocked");
        self.set_master(master);
        Ok(())
    }

    /// Unlock an existing master key, or create one on first use.
    pub fn unlock_or_initialize(&self, passphrase: &SecretString) -> SfeResult<()> {
        if self.is_initialized() {
            self.unlock(passphrase)
        } else {
            self.initialize(passphrase)
        }
    }

    fn set_master(&self, master: MasterKey) {
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(master);
    }

    fn master(&self) -> SfeResult<MasterKey> {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SfeError::DecryptionFailed("master key is locked".into()))
    }

    // ── Key files ─────────────────────────────────────────────────────────────

    /// On-disk directory holding the key files of `path`.
    pub fn key_dir(&self, path: &str) -> SfeResult<PathBuf> {
        let dir = self.classifier.get_file_key_dir(MODULE_ID, path)?;
        Ok(self.data_dir.join(dir.trim_start_matches('/')))
    }

    /// uids holding a share key for `path`, sorted.
    pub fn readers(&self, path: &str) -> SfeResult<Vec<String>> {
        let dir = self.key_dir(path)?;
        let mut uids = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(uids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            if let Some(uid) = name.to_string_lossy().strip_suffix(SHARE_KEY_SUFFIX) {
                uids.push(uid.to_string());
            }
        }
        uids.sort();
        Ok(uids)
    }

    /// The file key as `uid` would obtain it through their share key.
    pub fn unwrap_share_key(&self, path: &str, uid: &str) -> SfeResult<FileKey> {
        let master = self.master()?;
        let dir = self.key_dir(path)?;
        let wrapped = std::fs::read(dir.join(format!("{uid}{SHARE_KEY_SUFFIX}")))
            .map_err(|e| SfeError::DecryptionFailed(format!("no share key for {uid}: {e}")))?;
        let share_key = derive_share_key(&master, uid)?;
        unwrap_key(&share_key, &wrapped, uid.as_bytes())
            .map_err(|e| SfeError::DecryptionFailed(format!("{e:#}")))
    }

    fn load_file_key(&self, master: &MasterKey, dir: &Path) -> anyhow::Result<FileKey> {
        let path = dir.join(FILE_KEY_NAME);
        let wrapped = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        unwrap_key(master.as_bytes(), &wrapped, FILE_KEY_CONTEXT)
    }

    /// Write the master-wrapped file key and exactly one share key per reader.
    fn store_keys(
        &self,
        master: &MasterKey,
        dir: &Path,
        file_key: &FileKey,
        access_list: &AccessList,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        write_atomic(
            &dir.join(FILE_KEY_NAME),
            &wrap_key(master.as_bytes(), file_key, FILE_KEY_CONTEXT)?,
        )?;

        for uid in access_list.uids() {
            let share_key = derive_share_key(master, uid)?;
            let wrapped = wrap_key(&share_key, file_key, uid.as_bytes())?;
            write_atomic(&dir.join(format!("{uid}{SHARE_KEY_SUFFIX}")), &wrapped)?;
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(uid) = name.strip_suffix(SHARE_KEY_SUFFIX) else {
                continue;
            };
            if !access_list.users.contains_key(uid) {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("removing stale share key of {uid}"))?;
                debug!(uid, dir = %dir.display(), "stale share key removed");
            }
        }
        Ok(())
    }

    fn encrypt_inner(
        &self,
        path: &str,
        access_list: &AccessList,
        plain: &mut dyn Read,
        cipher: &mut dyn Write,
    ) -> anyhow::Result<Header> {
        let master = self.master()?;
        let dir = self.key_dir(path)?;
        let file_key = generate_file_key();
        let file_id = generate_file_id();

        let written = encrypt_stream(&file_key, &file_id, plain, cipher)?;
        self.store_keys(&master, &dir, &file_key, access_list)?;
        debug!(path = %path, bytes = written, readers = access_list.users.len(), "encrypted");

        Ok([
            (HEADER_CIPHER, CIPHER_NAME.to_string()),
            (HEADER_BLOCK_SIZE, PLAIN_BLOCK_SIZE.to_string()),
            (HEADER_FILE_ID, B64.encode(file_id)),
        ]
        .into_iter()
        .collect())
    }

    fn decrypt_inner(
        &self,
        path: &str,
        header: &Header,
        cipher: &mut dyn Read,
        plain: &mut dyn Write,
    ) -> anyhow::Result<u64> {
        match header.get(HEADER_CIPHER) {
            Some(CIPHER_NAME) => {}
            other => anyhow::bail!("unsupported cipher {other:?}"),
        }
        let file_id = parse_file_id(header)?;
        let master = self.master()?;
        let file_key = self.load_file_key(&master, &self.key_dir(path)?)?;
        decrypt_stream(&file_key, &file_id, cipher, plain)
    }

    fn update_inner(&self, path: &str, access_list: &AccessList) -> anyhow::Result<()> {
        let master = self.master()?;
        let dir = self.key_dir(path)?;
        let file_key = self.load_file_key(&master, &dir)?;
        self.store_keys(&master, &dir, &file_key, access_list)
    }
}

impl EncryptionModule for XChaChaModule {
    fn id(&self) -> &str {
        MODULE_ID
    }

    fn display_name(&self) -> &str {
        DISPLAY_NAME
    }

    fn encrypt(
        &self,
        path: &str,
        access_list: &AccessList,
        plain: &mut dyn Read,
        cipher: &mut dyn Write,
    ) -> SfeResult<Header> {
        Ok(self.encrypt_inner(path, access_list, plain, cipher)?)
    }

    fn decrypt(
        &self,
        path: &str,
        header: &Header,
        cipher: &mut dyn Read,
        plain: &mut dyn Write,
    ) -> SfeResult<u64> {
        self.decrypt_inner(path, header, cipher, plain)
            .map_err(|e| SfeError::DecryptionFailed(format!("{path}: {e:#}")))
    }

    fn update(&self, path: &str, uid: &str, access_list: &AccessList) -> bool {
        match self.update_inner(path, access_list) {
            Ok(()) => {
                debug!(path = %path, uid, readers = access_list.users.len(), "share keys rewritten");
                true
            }
            Err(e) => {
                warn!(path = %path, uid, "share key update failed: {e:#}");
                false
            }
        }
    }

    fn prepare_decrypt_all(&self, console: &mut dyn Console, user: &str) -> bool {
        if !self.is_initialized() {
            console.writeln("no master key found, no file was encrypted by this module");
            return true;
        }
        if self.is_unlocked() {
            return true;
        }

        let scope = if user.is_empty() { "all users" } else { user };
        console.writeln(&format!("To decrypt the files of {scope} the master key passphrase is required"));
        let Some(passphrase) = console.read_secret("Master key passphrase: ") else {
            console.writeln("no passphrase given");
            return false;
        };
        match self.unlock(&passphrase) {
            Ok(()) => true,
            Err(e) => {
                console.writeln(&format!("could not unlock the master key: {e}"));
                false
            }
        }
    }

    fn should_encrypt(&self, path: &str) -> bool {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let (Some(_uid), Some(tree), Some(_)) = (segments.next(), segments.next(), segments.next())
        else {
            return false;
        };
        ENCRYPTED_TREES.contains(&tree) && !self.classifier.is_excluded(path)
    }
}

fn parse_file_id(header: &Header) -> anyhow::Result<FileId> {
    let encoded = header
        .get(HEADER_FILE_ID)
        .context("header has no file id")?;
    let bytes = B64.decode(encoded).context("decoding file id")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("file id has {} bytes (expected {FILE_ID_SIZE})", b.len()))
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming onto {}", path.display()))?;
    Ok(())
}
