//! sfe-encryption: server-side encryption core
//!
//! Files are encrypted at rest by pluggable modules. Every encrypted file
//! starts with a fixed-size header naming the module that wrote it:
//! ```text
//! ┌──────────────────── 8192 bytes ─────────────────────┐
//! │ HBEGIN:oc_encryption_module:<id>:key:value:…:HEND---│ module ciphertext …
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! - [`registry::ModuleRegistry`]: named module factories, enablement, default module
//! - [`header`] / [`paths`]: header codec, path classification, key directory layout
//! - [`update::Update`]: rewraps keys after rename, restore and share changes
//! - [`decrypt_all::DecryptAll`]: permanently decrypts one or all user trees

pub mod decrypt_all;
pub mod header;
pub mod module;
pub mod paths;
pub mod registry;
pub mod update;

pub use decrypt_all::{DecryptAll, DecryptAllSession, ProgressFn};
pub use header::{create_header, get_encryption_module_id, parse_raw_header, split_header, Header};
pub use module::{Console, EncryptionModule, EncryptionModuleDescriptor, ModuleFactory};
pub use paths::{normalize_path, strip_partial_file_extension, PathClassifier};
pub use registry::ModuleRegistry;
pub use update::{Update, UpdateFailure, UpdateReport};
