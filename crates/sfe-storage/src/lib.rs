//! sfe-storage: local-disk reference collaborators
//!
//! - [`LocalView`]: encryption-aware filesystem view over a data directory
//! - [`LocalUserManager`]: users are directories with a `files` folder
//! - [`OwnerAccessResolver`]: every file is readable by its owner only
//! - [`health`]: data directory checks for `sfe status`

pub mod access;
pub mod health;
pub mod users;
pub mod view;

pub use access::OwnerAccessResolver;
pub use health::{check_health, is_healthy};
pub use users::{DirectoryBackend, LocalUserManager};
pub use view::LocalView;
