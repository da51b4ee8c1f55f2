//! Transport collaborator
//!
//! The engine only needs "given parameters, produce bytes and a response
//! descriptor, or fail". Every failure is treated as a retryable fetch
//! failure; the engine never inspects transport-specific status semantics.

pub mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use marketcache_common::Params;
use thiserror::Error;

/// What the engine asks a transport to fetch
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub artifact_type_id: String,
    /// URL template from the artifact type, if it has one
    pub url: Option<String>,
    /// Effective parameters (declared arguments with defaults applied)
    pub params: Params,
}

/// Bytes plus an opaque response descriptor (status, headers, ...)
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub body: Vec<u8>,
    pub descriptor: serde_json::Value,
}

impl TransportResponse {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            descriptor: serde_json::Value::Null,
        }
    }

    pub fn with_descriptor(mut self, descriptor: serde_json::Value) -> Self {
        self.descriptor = descriptor;
        self
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("status_code = {status} url = {url}")]
    Status { status: u16, url: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Produces raw bytes for an artifact request
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}
