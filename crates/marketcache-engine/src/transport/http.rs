//! Reference HTTP transport
//!
//! Builds the request URL from the artifact type's URL template and the
//! effective parameters, then issues a GET. Non-success statuses are
//! reported as [`TransportError::Status`].

use super::{Transport, TransportError, TransportRequest, TransportResponse};
use async_trait::async_trait;
use base64::Engine as _;
use marketcache_common::{ParamValue, Params};
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

/// `{name}` or `{name:<chrono format>}`
const PLACEHOLDER_PATTERN: &str = r"\{(\w+)(?::([^}]+))?\}";

/// How parameters are placed into the request URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlEncoding {
    /// `{name}` and `{name:<chrono format>}` placeholders are substituted
    #[default]
    Template,
    /// Parameters are JSON encoded, base64'd and appended as a path segment
    Base64Json,
}

/// GET-based transport over `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    encoding: UrlEncoding,
    placeholder: Regex,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let placeholder = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            encoding: UrlEncoding::Template,
            placeholder,
        })
    }

    pub fn with_encoding(mut self, encoding: UrlEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Final URL for a request
    pub fn build_url(&self, template: &str, params: &Params) -> Result<String, TransportError> {
        match self.encoding {
            UrlEncoding::Template => render_template(&self.placeholder, template, params),
            UrlEncoding::Base64Json => {
                let json: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(name, value)| (name.clone(), plain_json(value)))
                    .collect();
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(serde_json::Value::Object(json).to_string());
                Ok(format!("{}/{}", template.trim_end_matches('/'), encoded))
            },
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let template = request.url.as_deref().ok_or_else(|| {
            TransportError::InvalidRequest(format!(
                "artifact type '{}' has no url",
                request.artifact_type_id
            ))
        })?;
        let url = self.build_url(template, &request.params)?;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status_code = status.as_u16(), url = %url, "Download failed");
            return Err(TransportError::Status {
                status: status.as_u16(),
                url,
            });
        }
        info!(status_code = status.as_u16(), url = %url, "Downloaded");

        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), serde_json::Value::from(v)))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
            .to_vec();

        Ok(TransportResponse::new(body).with_descriptor(serde_json::json!({
            "status_code": status.as_u16(),
            "url": url,
            "headers": headers,
        })))
    }
}

fn render_template(
    placeholder: &Regex,
    template: &str,
    params: &Params,
) -> Result<String, TransportError> {
    let mut failure = None;
    let rendered = placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match params.get(name) {
            Some(value) => match caps.get(2) {
                Some(format) => value.format_with(format.as_str()).unwrap_or_else(|e| {
                    failure.get_or_insert_with(|| {
                        format!("url placeholder '{}': {}", name, e)
                    });
                    String::new()
                }),
                None => value.to_string(),
            },
            None => {
                failure.get_or_insert_with(|| format!("url placeholder '{}' has no parameter", name));
                String::new()
            },
        }
    });

    match failure {
        Some(message) => Err(TransportError::InvalidRequest(message)),
        None => Ok(rendered.into_owned()),
    }
}

fn plain_json(value: &ParamValue) -> serde_json::Value {
    match value {
        ParamValue::Integer(i) => serde_json::Value::from(*i),
        ParamValue::Float(x) => serde_json::Value::from(*x),
        ParamValue::Bool(b) => serde_json::Value::from(*b),
        other => serde_json::Value::from(other.to_string()),
    }
}
