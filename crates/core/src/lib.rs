//! Core domain types and shared logic for the Capstan cluster state store.
//!
//! This crate defines the canonical data model used by the metadata crate:
//! - Content hashes for source, params, and version identity
//! - Resource versions and check metadata
//! - Span-context carrier for distributed tracing
//! - The encryption strategy seam for config blobs at rest
//! - Store configuration

pub mod config;
pub mod encryption;
pub mod error;
pub mod hash;
pub mod span;
pub mod version;

pub use config::MetadataConfig;
pub use encryption::{EncryptionStrategy, NoEncryption};
pub use error::{Error, Result};
pub use hash::{json_hash, ContentHash};
pub use span::SpanContext;
pub use version::{MetadataField, Version};
