//! Owner-only access lists
//!
//! Without a sharing backend the only reader of a file is the user whose
//! tree holds it.

use sfe_core::services::AccessListResolver;
use sfe_core::types::AccessList;
use sfe_core::{SfeError, SfeResult};
use sfe_encryption::normalize_path;

#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerAccessResolver;

impl AccessListResolver for OwnerAccessResolver {
    fn get_access_list(&self, path: &str) -> SfeResult<AccessList> {
        let normalized = normalize_path(path);
        let owner = normalized.trim_start_matches('/').split('/').next().unwrap_or_default();
        if owner.is_empty() {
            return Err(SfeError::InvalidPath(format!("{path} has no owner")));
        }
        Ok(AccessList::owner_only(owner, &normalized))
    }
}
