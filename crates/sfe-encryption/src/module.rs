//! The pluggable encryption module contract.
//!
//! A module owns the cryptography and the per-file key material. The core
//! hands it plaintext and an access list on write, the parsed header and the
//! ciphertext body on read, and asks it to rewrap keys whenever the set of
//! readers changes.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use secrecy::SecretString;
use sfe_core::types::AccessList;
use sfe_core::SfeResult;

use crate::header::Header;

/// Interactive channel used while preparing a decrypt-all run.
pub trait Console {
    fn writeln(&mut self, line: &str);

    /// Ask a yes/no question. Anything but an explicit yes is a no.
    fn confirm(&mut self, question: &str) -> bool;

    /// Prompt for a secret without echo. `None` if no secret was supplied.
    fn read_secret(&mut self, prompt: &str) -> Option<SecretString>;
}

pub trait EncryptionModule: Send + Sync {
    /// Stable identifier written into every header this module produces.
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Encrypt `plain` into `cipher` (the body after the header block).
    ///
    /// Returns the module's header fields. The module id is added by the
    /// header writer and must not be part of the result.
    fn encrypt(
        &self,
        path: &str,
        access_list: &AccessList,
        plain: &mut dyn Read,
        cipher: &mut dyn Write,
    ) -> SfeResult<Header>;

    /// Decrypt a body previously produced by `encrypt`. Returns the number of
    /// plaintext bytes written.
    fn decrypt(
        &self,
        path: &str,
        header: &Header,
        cipher: &mut dyn Read,
        plain: &mut dyn Write,
    ) -> SfeResult<u64>;

    /// Rewrap the key material of `path` so exactly `access_list` can read it.
    fn update(&self, path: &str, uid: &str, access_list: &AccessList) -> bool;

    /// Unlock or otherwise prepare for bulk decryption. `user` is empty for
    /// a run over all users. Returning false aborts the run.
    fn prepare_decrypt_all(&self, console: &mut dyn Console, user: &str) -> bool;

    fn should_encrypt(&self, path: &str) -> bool;

    /// Whether `update` needs per-user paths in the access list, or only uids.
    fn needs_detailed_access_list(&self) -> bool {
        true
    }
}

/// Builds a module instance on first use.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn EncryptionModule> + Send + Sync>;

/// A registered module: identity plus its lazy constructor.
#[derive(Clone)]
pub struct EncryptionModuleDescriptor {
    pub id: String,
    pub display_name: String,
    pub factory: ModuleFactory,
}

impl fmt::Debug for EncryptionModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionModuleDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}
