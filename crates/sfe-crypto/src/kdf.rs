//! Master key: Argon2id from the admin passphrase, persisted as `master.json`
//!
//! The file stores the salt and Argon2id costs plus a verifier (a random key
//! wrapped by the master key). A passphrase is correct iff the verifier
//! unwraps.

use std::path::Path;

use anyhow::Context;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sfe_core::config::CryptoConfig;
use zeroize::Zeroize;

use crate::keys::{generate_file_key, unwrap_key, wrap_key};
use crate::KEY_SIZE;

const SALT_SIZE: usize = 16;
const VERIFIER_CONTEXT: &[u8] = b"sfe-master-verifier";

/// 256-bit master key. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Argon2id costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&CryptoConfig::default())
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }
}

pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> anyhow::Result<MasterKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let mut key = [0u8; KEY_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;
    Ok(MasterKey::from_bytes(key))
}

/// Contents of `master.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyFile {
    pub version: u32,
    /// Argon2id salt (base64)
    pub salt: String,
    pub kdf: KdfParams,
    /// Random key wrapped by the master key (base64)
    pub verifier: String,
}

impl MasterKeyFile {
    /// Derive a fresh master key under a new random salt.
    pub fn create(passphrase: &SecretString, params: KdfParams) -> anyhow::Result<(Self, MasterKey)> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let master = derive_master_key(passphrase, &salt, &params)?;
        let verifier = wrap_key(master.as_bytes(), &generate_file_key(), VERIFIER_CONTEXT)?;

        let file = Self {
            version: 1,
            salt: B64.encode(salt),
            kdf: params,
            verifier: B64.encode(verifier),
        };
        Ok((file, master))
    }

    /// Derive the master key and check it against the verifier.
    pub fn unlock(&self, passphrase: &SecretString) -> anyhow::Result<MasterKey> {
        let salt = B64.decode(&self.salt).context("decoding master key salt")?;
        let verifier = B64
            .decode(&self.verifier)
            .context("decoding master key verifier")?;
        let master = derive_master_key(passphrase, &salt, &self.kdf)?;
        unwrap_key(master.as_bytes(), &verifier, VERIFIER_CONTEXT)
            .map_err(|_| anyhow::anyhow!("wrong passphrase"))?;
        Ok(master)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write atomically (tmp then rename).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self).context("serializing master key file")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming onto {}", path.display()))?;
        Ok(())
    }
}
