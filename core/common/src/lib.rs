//! Common utilities and types shared across the Worldback crates.
//!
//! This module provides the error taxonomy used by every stage of the
//! backup pipeline, along with the small value types that cross crate
//! boundaries (job identifiers and credentials).

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Credential, JobId, SecretString};
