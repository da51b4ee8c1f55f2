//! Artifact type definitions
//!
//! [`ArtifactTypeConfig`] is the declarative, deserializable form naming its
//! transport and parser components by string. Registration turns it into an
//! immutable [`ArtifactType`] holding the resolved components.

use crate::error::{EngineError, Result};
use crate::fingerprint::VolatilityPolicy;
use crate::parser::Parser;
use crate::transport::Transport;
use marketcache_common::{ParamValue, Params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Output key used when a parser produces a single table
pub const SINGLE_OUTPUT: &str = "data";

fn default_format() -> String {
    "bin".to_string()
}

fn default_partition_column() -> String {
    "refdate".to_string()
}

fn default_filename_format() -> String {
    "%Y-%m-%d".to_string()
}

/// How the downloaded payload is packaged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Plain,
    /// Zip archive, possibly nested
    Archive,
    /// Base64 text decoding to a file with the given extension
    Base64 { decoded_format: String },
}

/// Non-emptiness check applied to every stored raw file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadValidation {
    /// File size > 0
    #[default]
    NonEmpty,
    /// Non-empty and decodes to a non-empty JSON object or array
    JsonNonEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSpec {
    /// Registered transport component name
    pub component: String,

    #[serde(default)]
    pub url: Option<String>,

    /// Declared arguments; `None` marks a required argument
    #[serde(default)]
    pub args: BTreeMap<String, Option<ParamValue>>,

    #[serde(default)]
    pub payload: PayloadEncoding,

    /// Extension of the downloaded payload
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub validation: PayloadValidation,
}

impl TransportSpec {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            url: None,
            args: BTreeMap::new(),
            payload: PayloadEncoding::Plain,
            format: default_format(),
            validation: PayloadValidation::NonEmpty,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.args.insert(name.into(), None);
        self
    }

    pub fn optional(mut self, name: impl Into<String>, default: impl Into<ParamValue>) -> Self {
        self.args.insert(name.into(), Some(default.into()));
        self
    }

    pub fn with_payload(mut self, payload: PayloadEncoding, format: impl Into<String>) -> Self {
        self.payload = payload;
        self.format = format.into();
        self
    }

    pub fn with_validation(mut self, validation: PayloadValidation) -> Self {
        self.validation = validation;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserSpec {
    /// Registered parser component name
    pub component: String,

    /// Parser table name -> dataset folder suffix. Empty for single-table types.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Request parameter holding the explicit partition date
    #[serde(default = "default_partition_column")]
    pub partition_param: String,

    /// Row column holding the natural partition date
    #[serde(default = "default_partition_column")]
    pub date_column: String,

    /// Request parameters appended to the natural key
    #[serde(default)]
    pub key_params: Vec<String>,

    #[serde(default = "default_filename_format")]
    pub output_filename_format: String,
}

impl ParserSpec {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            outputs: BTreeMap::new(),
            partition_param: default_partition_column(),
            date_column: default_partition_column(),
            key_params: Vec::new(),
            output_filename_format: default_filename_format(),
        }
    }

    pub fn with_output(mut self, table: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.outputs.insert(table.into(), suffix.into());
        self
    }

    pub fn with_key_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_params = names.into_iter().map(Into::into).collect();
        self
    }

    /// Dataset folder suffix for a parser table, `None` for the single table
    pub fn suffix_for<'a>(&'a self, table: &'a str) -> Option<&'a str> {
        if table == SINGLE_OUTPUT && self.outputs.is_empty() {
            return None;
        }
        Some(self.outputs.get(table).map(String::as_str).unwrap_or(table))
    }
}

/// Declarative artifact type, as read from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactTypeConfig {
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub transport: TransportSpec,

    pub parser: ParserSpec,

    #[serde(default)]
    pub volatility: VolatilityPolicy,
}

/// Registered artifact type with resolved components
pub struct ArtifactType {
    config: ArtifactTypeConfig,
    transport: Arc<dyn Transport>,
    parser: Arc<dyn Parser>,
}

impl ArtifactType {
    pub(crate) fn new(
        config: ArtifactTypeConfig,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn Parser>,
    ) -> Self {
        Self {
            config,
            transport,
            parser,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ArtifactTypeConfig {
        &self.config
    }

    pub fn transport_spec(&self) -> &TransportSpec {
        &self.config.transport
    }

    pub fn parser_spec(&self) -> &ParserSpec {
        &self.config.parser
    }

    pub fn volatility(&self) -> VolatilityPolicy {
        self.config.volatility
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn parser(&self) -> &Arc<dyn Parser> {
        &self.parser
    }

    /// Declared arguments with supplied values or defaults.
    ///
    /// Undeclared arguments are rejected; they would be dropped from the
    /// fingerprint and make distinct requests collide.
    pub fn effective_params(&self, supplied: &Params) -> Result<Params> {
        if let Some(name) = supplied
            .keys()
            .find(|name| !self.config.transport.args.contains_key(*name))
        {
            return Err(EngineError::UnknownParameter {
                artifact_type: self.id().to_string(),
                name: name.clone(),
            });
        }

        self.config
            .transport
            .args
            .iter()
            .map(|(name, default)| {
                supplied
                    .get(name)
                    .or(default.as_ref())
                    .map(|value| (name.clone(), value.clone()))
                    .ok_or_else(|| EngineError::MissingParameter {
                        artifact_type: self.id().to_string(),
                        name: name.clone(),
                    })
            })
            .collect()
    }
}

impl fmt::Debug for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactType")
            .field("id", &self.config.id)
            .field("transport", &self.config.transport.component)
            .field("parser", &self.config.parser.component)
            .field("volatility", &self.config.volatility)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let config: ArtifactTypeConfig = serde_json::from_str(
            r#"{
                "id": "b3-cotahist-daily",
                "transport": {
                    "component": "http",
                    "url": "https://example.com/COTAHIST_D{refdate:%d%m%Y}.ZIP",
                    "args": {"refdate": null},
                    "payload": {"kind": "archive"},
                    "format": "zip"
                },
                "parser": {"component": "csv"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.transport.payload, PayloadEncoding::Archive);
        assert_eq!(config.transport.validation, PayloadValidation::NonEmpty);
        assert_eq!(config.transport.args.get("refdate"), Some(&None));
        assert_eq!(config.parser.partition_param, "refdate");
        assert_eq!(config.parser.output_filename_format, "%Y-%m-%d");
        assert_eq!(config.volatility, VolatilityPolicy::None);
    }

    #[test]
    fn test_base64_payload_from_json() {
        let payload: PayloadEncoding =
            serde_json::from_str(r#"{"kind": "base64", "decoded_format": "zip"}"#).unwrap();
        assert_eq!(
            payload,
            PayloadEncoding::Base64 {
                decoded_format: "zip".to_string()
            }
        );
    }

    #[test]
    fn test_suffix_for() {
        let single = ParserSpec::new("csv");
        assert_eq!(single.suffix_for(SINGLE_OUTPUT), None);

        let multi = ParserSpec::new("xml").with_output("Indexes", "indexes");
        assert_eq!(multi.suffix_for("Indexes"), Some("indexes"));
        assert_eq!(multi.suffix_for("Other"), Some("Other"));
    }
}
