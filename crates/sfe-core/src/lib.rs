//! sfe-core: shared vocabulary for the sfe server-side encryption workspace
//!
//! Holds the error taxonomy, the `sfe.toml` schema, the app-value config
//! stores, and the traits through which the encryption core talks to its
//! collaborators (filesystem view, user enumeration, access lists).

pub mod config;
pub mod error;
pub mod services;
pub mod types;

pub use error::{SfeError, SfeResult};
