//! Fetch orchestration
//!
//! Drives one fingerprint from request to a sealed raw folder plus a
//! persisted metadata record:
//!
//! ```text
//! Requested -> Fetching -> Validating -> Normalizing -> Persisted
//!                 |                          |
//!            FetchFailed                FatalFailed (rolled back)
//! ```
//!
//! Outcomes are values, not errors. Only infrastructure faults around the
//! state machine (metadata store unavailable) surface as `Err`.

use crate::artifact_type::ArtifactType;
use crate::error::{EngineError, Result};
use crate::fingerprint::{fingerprint, Clock, Fingerprint};
use crate::locks::KeyedLocks;
use crate::metadata::{ArtifactMetadata, MetadataStore};
use crate::raw::RawArtifactStore;
use crate::transport::TransportRequest;
use marketcache_common::checksum::compute_checksum;
use marketcache_common::Params;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A fully resolved request for one logical artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRequest {
    pub artifact_type: String,
    /// Effective parameters (declared arguments with defaults)
    pub params: Params,
    pub volatility_key: String,
    pub fingerprint: Fingerprint,
}

/// Why no download happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlreadySatisfied {
    /// Metadata and raw files for this fingerprint already exist
    Cached,
    /// Another fingerprint already stored identical bytes
    DuplicateContent,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(ArtifactMetadata),
    AlreadySatisfied {
        reason: AlreadySatisfied,
        metadata: ArtifactMetadata,
    },
    /// Nothing was written; safe to retry
    TransientFailure {
        fingerprint: Fingerprint,
        error: EngineError,
    },
    /// Raw data was written and rolled back
    FatalFailure {
        fingerprint: Fingerprint,
        error: EngineError,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Fetched(_) | Self::AlreadySatisfied { .. })
    }

    pub fn metadata(&self) -> Option<&ArtifactMetadata> {
        match self {
            Self::Fetched(meta) | Self::AlreadySatisfied { metadata: meta, .. } => Some(meta),
            _ => None,
        }
    }

    /// Error semantics for single-item callers
    pub fn into_result(self) -> Result<ArtifactMetadata> {
        match self {
            Self::Fetched(meta) | Self::AlreadySatisfied { metadata: meta, .. } => Ok(meta),
            Self::TransientFailure { error, .. } | Self::FatalFailure { error, .. } => Err(error),
        }
    }
}

/// Fetch orchestrator
#[derive(Clone)]
pub struct FetchOrchestrator {
    metadata: MetadataStore,
    raw: RawArtifactStore,
    clock: Arc<dyn Clock>,
    fingerprint_locks: Arc<KeyedLocks>,
    raw_locks: Arc<KeyedLocks>,
}

impl FetchOrchestrator {
    pub fn new(
        metadata: MetadataStore,
        raw: RawArtifactStore,
        clock: Arc<dyn Clock>,
        fingerprint_locks: Arc<KeyedLocks>,
        raw_locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            metadata,
            raw,
            clock,
            fingerprint_locks,
            raw_locks,
        }
    }

    /// Resolve effective parameters and the fingerprint.
    ///
    /// Fails with a configuration error for missing or undeclared arguments.
    pub fn request(&self, artifact_type: &ArtifactType, params: &Params) -> Result<ArtifactRequest> {
        let params = artifact_type.effective_params(params)?;
        let volatility_key = artifact_type.volatility().evaluate(self.clock.now());
        let fingerprint = fingerprint(artifact_type.id(), &params, &volatility_key);

        Ok(ArtifactRequest {
            artifact_type: artifact_type.id().to_string(),
            params,
            volatility_key,
            fingerprint,
        })
    }

    /// Persisted metadata whose raw files are all still on disk
    async fn satisfied(&self, request: &ArtifactRequest) -> Result<Option<ArtifactMetadata>> {
        let tried = self.metadata.has_successful_trial(&request.fingerprint).await?;
        if !tried && !self.metadata.exists(&request.fingerprint).await? {
            return Ok(None);
        }

        match self.metadata.load(&request.fingerprint).await? {
            Some(meta) if self.raw.files_exist(&meta.raw_files) => Ok(Some(meta)),
            Some(_) => {
                warn!("Raw files missing, downloading again");
                Ok(None)
            },
            None => {
                debug!("Successful trial without metadata, downloading again");
                Ok(None)
            },
        }
    }

    #[instrument(
        skip(self, artifact_type, request),
        fields(artifact_type = %request.artifact_type, fingerprint = %request.fingerprint)
    )]
    pub async fn fetch(
        &self,
        artifact_type: &ArtifactType,
        request: &ArtifactRequest,
    ) -> Result<FetchOutcome> {
        let _guard = self.fingerprint_locks.lock(request.fingerprint.as_str()).await;

        if let Some(metadata) = self.satisfied(request).await? {
            debug!("Already downloaded");
            return Ok(FetchOutcome::AlreadySatisfied {
                reason: AlreadySatisfied::Cached,
                metadata,
            });
        }

        let transport_request = TransportRequest {
            artifact_type_id: request.artifact_type.clone(),
            url: artifact_type.transport_spec().url.clone(),
            params: request.params.clone(),
        };

        let response = match artifact_type.transport().fetch(&transport_request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Download failed");
                return self.transient(request, e.into()).await;
            },
        };

        if response.body.is_empty() {
            warn!("Downloaded file is empty");
            return self
                .transient(request, EngineError::invalid_payload("Downloaded file is empty"))
                .await;
        }

        let checksum = compute_checksum(&response.body);
        let location = self.raw.path(&request.artifact_type, &checksum);
        let _raw_guard = self.raw_locks.lock(&location).await;

        let mut meta = ArtifactMetadata::new(
            request.fingerprint.clone(),
            request.artifact_type.clone(),
            request.params.clone(),
            request.volatility_key.clone(),
            self.clock.now(),
        );
        meta.response = response.descriptor;
        meta.content_checksum = Some(checksum.clone());

        if let Some(manifest) = self.raw.read_manifest(&location)? {
            info!(location = %location, "Identical content already stored");
            meta.raw_files = manifest.files;
            self.metadata.save(&meta).await?;
            self.metadata.record_trial(&request.fingerprint, true).await?;
            return Ok(FetchOutcome::AlreadySatisfied {
                reason: AlreadySatisfied::DuplicateContent,
                metadata: meta,
            });
        }

        let raw = self.raw.clone();
        let spec = artifact_type.transport_spec().clone();
        let type_id = request.artifact_type.clone();
        let body = response.body;
        let stored = tokio::task::spawn_blocking(move || {
            raw.store_payload(&type_id, &checksum, &body, &spec)
        })
        .await
        .map_err(EngineError::from)
        .and_then(|stored| stored);

        let manifest = match stored {
            Ok(manifest) => manifest,
            Err(error) if error.is_transient() => {
                warn!(error = %error, "Payload rejected");
                return self.transient(request, error).await;
            },
            Err(error) => return self.fatal(request, &location, error).await,
        };

        meta.raw_files = manifest.files;
        if let Err(error) = self.metadata.save(&meta).await {
            return self.fatal(request, &location, error).await;
        }
        self.metadata.record_trial(&request.fingerprint, true).await?;

        info!(files = meta.raw_files.len(), "Downloaded");
        Ok(FetchOutcome::Fetched(meta))
    }

    async fn transient(&self, request: &ArtifactRequest, error: EngineError) -> Result<FetchOutcome> {
        self.metadata.record_trial(&request.fingerprint, false).await?;
        Ok(FetchOutcome::TransientFailure {
            fingerprint: request.fingerprint.clone(),
            error,
        })
    }

    async fn fatal(
        &self,
        request: &ArtifactRequest,
        location: &str,
        error: EngineError,
    ) -> Result<FetchOutcome> {
        warn!(error = %error, location = %location, "Fetch failed after writing, rolling back");
        self.raw.discard(location)?;
        self.metadata.record_trial(&request.fingerprint, false).await?;
        Ok(FetchOutcome::FatalFailure {
            fingerprint: request.fingerprint.clone(),
            error,
        })
    }
}
