//! File keys, share-key derivation and context-bound key wrapping

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::kdf::MasterKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Wrapped key length: nonce + key + tag
pub const WRAPPED_KEY_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

const SHARE_KEY_DOMAIN: &[u8] = b"sfe-share-key:";

/// Per-file 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey([REDACTED])")
    }
}

pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// Wrapping key for one user's share key: HKDF-SHA256(master, domain || uid).
pub fn derive_share_key(master: &MasterKey, uid: &str) -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut info = Vec::with_capacity(SHARE_KEY_DOMAIN.len() + uid.len());
    info.extend_from_slice(SHARE_KEY_DOMAIN);
    info.extend_from_slice(uid.as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    Hkdf::<Sha256>::new(None, master.as_bytes())
        .expand(&info, &mut okm[..])
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

/// Wrap `key` under `wrapping`. `context` is authenticated, so a wrapped key
/// only unwraps in the slot it was written for.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_key(wrapping: &[u8; KEY_SIZE], key: &FileKey, context: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = XChaCha20Poly1305::new(wrapping.into())
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: key.as_bytes(),
                aad: context,
            },
        )
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn unwrap_key(wrapping: &[u8; KEY_SIZE], wrapped: &[u8], context: &[u8]) -> anyhow::Result<FileKey> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        anyhow::bail!(
            "wrapped key has {} bytes (expected {WRAPPED_KEY_SIZE})",
            wrapped.len()
        );
    }
    let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);
    let plain = Zeroizing::new(
        XChaCha20Poly1305::new(wrapping.into())
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: context,
                },
            )
            .map_err(|_| anyhow::anyhow!("key unwrapping failed: wrong key or corrupted data"))?,
    );

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plain);
    Ok(FileKey::from_bytes(bytes))
}
