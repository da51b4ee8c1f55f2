//! Engine facade
//!
//! Wires configuration, storage layout, stores, registries, clock and
//! per-fingerprint locks into one explicitly constructed service. Cheap to
//! clone; clones share the same stores and locks.

use crate::batch::{BatchCoordinator, BatchMode, BatchReport};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fetch::{ArtifactRequest, FetchOrchestrator, FetchOutcome};
use crate::fingerprint::{Clock, Fingerprint, SystemClock};
use crate::layout::StorageLayout;
use crate::locks::KeyedLocks;
use crate::materialize::{read_parquet, MaterializeReport, Materializer};
use crate::metadata::{ArtifactMetadata, MetadataStore};
use crate::params::ParamGrid;
use crate::raw::RawArtifactStore;
use crate::registry::TemplateRegistry;
use arrow_array::RecordBatch;
use marketcache_common::Params;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Output name -> batches of its dataset partition
pub type Datasets = BTreeMap<String, Vec<RecordBatch>>;

/// What [`Engine::get`] redoes for an already cached artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reprocess {
    /// Reuse whatever is cached
    #[default]
    None,
    /// Run the parser again on the cached raw files
    Parse,
    /// Purge, download again, then parse
    Refetch,
}

struct EngineInner {
    config: EngineConfig,
    layout: StorageLayout,
    templates: Arc<TemplateRegistry>,
    metadata: MetadataStore,
    raw: RawArtifactStore,
    fetcher: FetchOrchestrator,
    materializer: Materializer,
    batch: BatchCoordinator,
    fingerprint_locks: Arc<KeyedLocks>,
    /// Raw folder locks shared by fetches and purges
    raw_locks: Arc<KeyedLocks>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the storage root and build the engine on the system clock
    pub async fn new(config: EngineConfig, templates: TemplateRegistry) -> Result<Self> {
        Self::with_clock(config, templates, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        config: EngineConfig,
        templates: TemplateRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let layout = StorageLayout::new(&config.root);
        let metadata = MetadataStore::open(layout.clone(), clock.clone()).await?;
        let raw = RawArtifactStore::new(layout.clone());
        let fingerprint_locks = Arc::new(KeyedLocks::new());
        let raw_locks = Arc::new(KeyedLocks::new());
        let templates = Arc::new(templates);

        let fetcher = FetchOrchestrator::new(
            metadata.clone(),
            raw.clone(),
            clock,
            fingerprint_locks.clone(),
            raw_locks.clone(),
        );
        let materializer = Materializer::new(metadata.clone(), raw.clone(), fingerprint_locks.clone())?;
        let batch = BatchCoordinator::new(
            templates.clone(),
            metadata.clone(),
            fetcher.clone(),
            materializer.clone(),
            config.concurrency,
            config.show_progress,
        );

        info!(root = %layout.root().display(), types = templates.ids().len(), "Engine ready");

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                layout,
                templates,
                metadata,
                raw,
                fetcher,
                materializer,
                batch,
                fingerprint_locks,
                raw_locks,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.inner.layout
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.inner.templates
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.inner.metadata
    }

    pub fn raw(&self) -> &RawArtifactStore {
        &self.inner.raw
    }

    /// Resolve effective parameters and fingerprint without any I/O
    pub fn request(&self, artifact_type_id: &str, params: &Params) -> Result<ArtifactRequest> {
        let artifact_type = self.inner.templates.get(artifact_type_id)?;
        self.inner.fetcher.request(&artifact_type, params)
    }

    /// Fetch a single artifact
    pub async fn fetch(&self, artifact_type_id: &str, params: &Params) -> Result<FetchOutcome> {
        let artifact_type = self.inner.templates.get(artifact_type_id)?;
        let request = self.inner.fetcher.request(&artifact_type, params)?;
        self.inner.fetcher.fetch(&artifact_type, &request).await
    }

    /// Materialize an already fetched artifact
    pub async fn materialize(&self, fingerprint: &Fingerprint) -> Result<MaterializeReport> {
        let mut meta = self.load(fingerprint).await?;
        let artifact_type = self.inner.templates.get(&meta.artifact_type)?;
        self.inner.materializer.materialize(&artifact_type, &mut meta).await
    }

    /// Fetch and materialize as needed, then read the request's partitions
    #[instrument(skip(self, params))]
    pub async fn get(
        &self,
        artifact_type_id: &str,
        params: &Params,
        reprocess: Reprocess,
    ) -> Result<Datasets> {
        let artifact_type = self.inner.templates.get(artifact_type_id)?;
        let request = self.inner.fetcher.request(&artifact_type, params)?;

        if reprocess == Reprocess::Refetch {
            self.purge(&request.fingerprint).await?;
        }

        let mut meta = self
            .inner
            .fetcher
            .fetch(&artifact_type, &request)
            .await?
            .into_result()?;

        let cached = meta.is_materialized() && self.inner.materializer.outputs_exist(&meta);
        if reprocess != Reprocess::None || !cached {
            self.inner
                .materializer
                .materialize(&artifact_type, &mut meta)
                .await?;
        }

        self.read_outputs(&meta).await
    }

    /// Read every dataset partition recorded on `meta`
    pub async fn read_outputs(&self, meta: &ArtifactMetadata) -> Result<Datasets> {
        let layout = self.inner.layout.clone();
        let outputs = meta.outputs.clone();
        tokio::task::spawn_blocking(move || {
            outputs
                .into_iter()
                .map(|(name, relative)| Ok((name, read_parquet(&layout.resolve(&relative))?)))
                .collect::<Result<Datasets>>()
        })
        .await?
    }

    /// Delete a record with the files only it references.
    ///
    /// Returns `false` when there was nothing to purge.
    pub async fn purge(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let _guard = self.inner.fingerprint_locks.lock(fingerprint.as_str()).await;
        match self.inner.metadata.load(fingerprint).await? {
            Some(meta) => {
                // Same order as fetch: fingerprint first, then the raw folder.
                let _raw_guard = match &meta.content_checksum {
                    Some(checksum) => Some(
                        self.inner
                            .raw_locks
                            .lock(&self.inner.layout.raw_folder(&meta.artifact_type, checksum))
                            .await,
                    ),
                    None => None,
                };
                self.inner.metadata.delete(&meta).await?;
                info!(fingerprint = %fingerprint, "Purged");
                Ok(true)
            },
            None => Ok(false),
        }
    }

    pub async fn run_batch(
        &self,
        artifact_type_id: &str,
        grid: &ParamGrid,
        mode: BatchMode,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.inner.batch.run(artifact_type_id, grid, mode, cancel).await
    }

    pub async fn reprocess_pending(
        &self,
        artifact_type_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.inner.batch.reprocess_pending(artifact_type_id, cancel).await
    }

    async fn load(&self, fingerprint: &Fingerprint) -> Result<ArtifactMetadata> {
        self.inner
            .metadata
            .load(fingerprint)
            .await?
            .ok_or_else(|| EngineError::MetadataNotFound(fingerprint.to_string()))
    }
}
