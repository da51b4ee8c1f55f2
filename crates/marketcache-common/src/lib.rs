//! Marketcache Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the marketcache workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and its result alias
//! - **Checksums**: content checksums for raw downloads and request fingerprints
//! - **Logging**: `tracing` subscriber bootstrap driven by environment variables
//! - **Types**: request parameter values shared by every engine component
//!
//! # Example
//!
//! ```no_run
//! use marketcache_common::checksum::compute_checksum;
//! use marketcache_common::Result;
//!
//! fn describe(path: &str) -> Result<()> {
//!     let bytes = std::fs::read(path)?;
//!     let checksum = compute_checksum(&bytes);
//!     tracing::info!(%checksum, "raw payload checksum");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{ParamValue, Params};
