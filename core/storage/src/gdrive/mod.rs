//! Google Drive remote store.
//!
//! - OAuth2 installed-app authorization and token refresh
//! - Resumable uploads in 256 KiB-aligned chunks
//! - Versions tagged with app properties in one backup folder

pub mod auth;
pub mod client;
pub mod provider;

pub use auth::{GoogleAuth, LoopbackReceiver, OAuthConfig};
pub use client::DriveClient;
pub use provider::{create_gdrive_store, GDriveConfig, GDriveStore, DRIVE_CHUNK_ALIGNMENT};
