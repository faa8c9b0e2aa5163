//! sfe-crypto: default server-side encryption module
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from the admin passphrase, checked against master.json)
//!   ├── fileKey      per file, 256-bit random, wrapped by the master key
//!   └── <uid>.shareKey  the file key wrapped by HKDF(master, "sfe-share-key" || uid)
//! ```
//!
//! Body format: a sequence of XChaCha20-Poly1305 blocks of exactly
//! `ENCRYPTED_BLOCK_SIZE` bytes (the last one may be shorter), each bound to
//! its index, its finality and the file id through the AAD.

pub mod block;
pub mod kdf;
pub mod keys;
pub mod module;

pub use kdf::{derive_master_key, KdfParams, MasterKey, MasterKeyFile};
pub use keys::{derive_share_key, generate_file_key, unwrap_key, wrap_key, FileKey};
pub use module::XChaChaModule;

/// Size of a key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Random per-file identifier mixed into every block's AAD
pub const FILE_ID_SIZE: usize = 32;

/// On-disk size of a full ciphertext block
pub const ENCRYPTED_BLOCK_SIZE: usize = 8192;

/// Plaintext carried by a full block
pub const PLAIN_BLOCK_SIZE: usize = ENCRYPTED_BLOCK_SIZE - NONCE_SIZE - TAG_SIZE;

/// Value of the `cipher` header field
pub const CIPHER_NAME: &str = "XCHACHA20-POLY1305";
