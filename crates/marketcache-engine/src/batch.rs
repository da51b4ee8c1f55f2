//! Batch coordinator
//!
//! Expands a parameter grid into individual requests and drives each one
//! through fetch (and materialization in [`BatchMode::Full`]). A failing
//! item is recorded in the report and the remaining items continue; only
//! configuration errors, found before any work starts, fail the batch.

use crate::artifact_type::ArtifactType;
use crate::error::Result;
use crate::fetch::{AlreadySatisfied, ArtifactRequest, FetchOrchestrator, FetchOutcome};
use crate::fingerprint::Fingerprint;
use crate::materialize::Materializer;
use crate::metadata::{ArtifactMetadata, MetadataStore};
use crate::params::ParamGrid;
use crate::progress::create_batch_progress;
use crate::registry::TemplateRegistry;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use marketcache_common::Params;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Fetch only
    Download,
    /// Fetch, then materialize
    Full,
}

/// Per-item result of a batch run
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItemStatus {
    Fetched,
    AlreadySatisfied(AlreadySatisfied),
    /// Output name -> rows written
    Materialized(BTreeMap<String, usize>),
    Failed { error: String, fatal: bool },
    /// Not started because the batch was cancelled
    Cancelled,
    /// Same fingerprint as an earlier item of this batch
    Skipped,
}

impl BatchItemStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Fetched | Self::AlreadySatisfied(_) | Self::Materialized(_) | Self::Skipped
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::AlreadySatisfied(_) => "already_satisfied",
            Self::Materialized(_) => "materialized",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    fn failed(error: impl ToString, fatal: bool) -> Self {
        Self::Failed {
            error: error.to_string(),
            fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Position in the expanded grid
    pub index: usize,
    pub params: Params,
    pub fingerprint: Fingerprint,
    pub status: BatchItemStatus,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub artifact_type: String,
    /// Items in grid order
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|item| item.status.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|item| item.status.is_failure())
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &BatchItem> {
        self.items
            .iter()
            .filter(|item| item.status == BatchItemStatus::Cancelled)
    }

    pub fn is_clean(&self) -> bool {
        self.items.iter().all(|item| item.status.is_success())
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    templates: Arc<TemplateRegistry>,
    metadata: MetadataStore,
    fetcher: FetchOrchestrator,
    materializer: Materializer,
    concurrency: usize,
    show_progress: bool,
}

impl BatchCoordinator {
    pub fn new(
        templates: Arc<TemplateRegistry>,
        metadata: MetadataStore,
        fetcher: FetchOrchestrator,
        materializer: Materializer,
        concurrency: usize,
        show_progress: bool,
    ) -> Self {
        Self {
            templates,
            metadata,
            fetcher,
            materializer,
            concurrency: concurrency.max(1),
            show_progress,
        }
    }

    /// Run every parameter set of `grid`.
    ///
    /// Cancellation is honoured between items: items not yet started are
    /// reported as [`BatchItemStatus::Cancelled`], started items finish.
    #[instrument(skip(self, grid, cancel), fields(items = grid.len()))]
    pub async fn run(
        &self,
        artifact_type_id: &str,
        grid: &ParamGrid,
        mode: BatchMode,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let artifact_type = self.templates.get(artifact_type_id)?;

        let requests = grid
            .expand()
            .iter()
            .map(|params| self.fetcher.request(&artifact_type, params))
            .collect::<Result<Vec<_>>>()?;

        let progress = create_batch_progress(requests.len() as u64, artifact_type_id, self.show_progress);
        let mut seen = HashSet::new();

        let mut items: Vec<BatchItem> = stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| {
                let duplicate = !seen.insert(request.fingerprint.clone());
                let artifact_type = artifact_type.clone();
                let progress = progress.clone();
                async move {
                    let status = if cancel.is_cancelled() {
                        BatchItemStatus::Cancelled
                    } else if duplicate {
                        BatchItemStatus::Skipped
                    } else {
                        self.process(&artifact_type, &request, mode).await
                    };
                    progress.inc(1);
                    BatchItem {
                        index,
                        params: request.params,
                        fingerprint: request.fingerprint,
                        status,
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        items.sort_by_key(|item| item.index);
        finish(&progress);

        let report = BatchReport {
            artifact_type: artifact_type_id.to_string(),
            items,
        };
        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            cancelled = report.cancelled().count(),
            "Batch finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        artifact_type: &ArtifactType,
        request: &ArtifactRequest,
        mode: BatchMode,
    ) -> BatchItemStatus {
        let outcome = match self.fetcher.fetch(artifact_type, request).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(fingerprint = %request.fingerprint, error = %error, "Item failed");
                return BatchItemStatus::failed(error, false);
            },
        };

        let (mut meta, fetched_status) = match outcome {
            FetchOutcome::Fetched(meta) => (meta, BatchItemStatus::Fetched),
            FetchOutcome::AlreadySatisfied { reason, metadata } => {
                (metadata, BatchItemStatus::AlreadySatisfied(reason))
            },
            FetchOutcome::TransientFailure { error, .. } => {
                return BatchItemStatus::failed(error, false);
            },
            FetchOutcome::FatalFailure { error, .. } => {
                return BatchItemStatus::failed(error, true);
            },
        };

        if mode == BatchMode::Download || self.outputs_present(&meta) {
            return fetched_status;
        }

        match self.materializer.materialize(artifact_type, &mut meta).await {
            Ok(report) => BatchItemStatus::Materialized(report.rows),
            Err(error) => BatchItemStatus::failed(error, false),
        }
    }

    fn outputs_present(&self, meta: &ArtifactMetadata) -> bool {
        meta.is_materialized() && self.materializer.outputs_exist(meta)
    }

    /// Materialize every fetched record of a type that has no outputs yet.
    ///
    /// Failures are isolated per record.
    #[instrument(skip(self, cancel))]
    pub async fn reprocess_pending(
        &self,
        artifact_type_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let artifact_type = self.templates.get(artifact_type_id)?;
        let pending = self.metadata.list_unmaterialized(artifact_type_id).await?;
        info!(pending = pending.len(), "Reprocessing");

        let progress = create_batch_progress(pending.len() as u64, artifact_type_id, self.show_progress);

        let mut items: Vec<BatchItem> = stream::iter(pending.into_iter().enumerate())
            .map(|(index, mut meta)| {
                let artifact_type = artifact_type.clone();
                let progress = progress.clone();
                async move {
                    let status = if cancel.is_cancelled() {
                        BatchItemStatus::Cancelled
                    } else {
                        match self.materializer.materialize(&artifact_type, &mut meta).await {
                            Ok(report) => BatchItemStatus::Materialized(report.rows),
                            Err(error) => BatchItemStatus::failed(error, false),
                        }
                    };
                    progress.inc(1);
                    BatchItem {
                        index,
                        params: meta.params,
                        fingerprint: meta.fingerprint,
                        status,
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        items.sort_by_key(|item| item.index);
        finish(&progress);

        Ok(BatchReport {
            artifact_type: artifact_type_id.to_string(),
            items,
        })
    }
}

fn finish(progress: &ProgressBar) {
    progress.finish_with_message("done");
}
