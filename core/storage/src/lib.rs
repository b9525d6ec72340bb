//! Remote store abstraction for Worldback.
//!
//! This crate defines the capability the backup pipeline needs from a
//! remote (resumable sessions, version listing, deletion) and provides
//! the backends (Google Drive, local filesystem, in-memory) plus a store
//! registry for resolving them by name.
//!
//! # Design Principles
//! - Stores hold no credentials: every call takes the bearer token
//! - Acknowledgements reflect durable remote state only
//! - Unified error semantics across backends

pub mod gdrive;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use gdrive::{GDriveConfig, GDriveStore, GoogleAuth, OAuthConfig};
pub use local::LocalStore;
pub use memory::{MemoryStats, MemoryStore};
pub use provider::{ChunkAck, ObjectSpec, RemoteSession, RemoteStore, RetentionEntry, TokenRefresher};
pub use registry::{create_default_registry, normalize_name, StoreFactory, StoreRegistry};
