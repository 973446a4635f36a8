//! Core data model for the file-drop service.
//!
//! A stored file is content bytes plus one [`metadata::Metadata`] record,
//! both addressed by the same key.

pub mod metadata;

pub use metadata::{Expiry, Metadata, NEVER_EXPIRES_EPOCH};
