//! Marketcache Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Fetches externally published data artifacts, stores them once per
//! content checksum, converts them into Parquet datasets and tracks every
//! step in a SQLite metadata store so repeated requests never download or
//! parse twice.
//!
//! # Overview
//!
//! - **Fingerprints**: stable cache keys for (artifact type, parameters, volatility key)
//! - **Metadata store**: one record per fingerprint plus a fetch trial log
//! - **Raw store**: content-addressed, normalized, gzip-retained downloads
//! - **Fetch orchestrator**: transport call, dedup, normalization, rollback
//! - **Materializer**: parser call and partitioned Parquet output
//! - **Batch coordinator**: parameter grids with per-item failure isolation
//!
//! # Example
//!
//! ```no_run
//! use marketcache_engine::registry::{ComponentRegistry, TemplateRegistry};
//! use marketcache_engine::{Engine, EngineConfig, Reprocess};
//! use marketcache_common::Params;
//!
//! # async fn run() -> marketcache_engine::Result<()> {
//! let config = EngineConfig::from_env()?;
//! let components = ComponentRegistry::with_defaults(&config)?;
//! let mut templates = TemplateRegistry::new();
//! templates.register_json(
//!     r#"{
//!         "id": "b3-indexes-composition",
//!         "transport": {"component": "http", "url": "https://example.com/indexes.csv"},
//!         "parser": {"component": "csv"},
//!         "volatility": "current_date"
//!     }"#,
//!     &components,
//! )?;
//!
//! let engine = Engine::new(config, templates).await?;
//! let datasets = engine
//!     .get("b3-indexes-composition", &Params::new(), Reprocess::None)
//!     .await?;
//! tracing::info!(outputs = datasets.len(), "loaded");
//! # Ok(())
//! # }
//! ```

pub mod artifact_type;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod layout;
pub mod locks;
pub mod materialize;
pub mod metadata;
pub mod params;
pub mod parser;
pub mod progress;
pub mod raw;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use artifact_type::{ArtifactType, ArtifactTypeConfig, ParserSpec, TransportSpec};
pub use batch::{BatchItemStatus, BatchMode, BatchReport};
pub use config::EngineConfig;
pub use engine::{Datasets, Engine, Reprocess};
pub use error::{EngineError, Result};
pub use fetch::{AlreadySatisfied, ArtifactRequest, FetchOutcome};
pub use fingerprint::{fingerprint, Fingerprint, VolatilityPolicy};
pub use metadata::ArtifactMetadata;
pub use params::{DateRange, ParamGrid};
