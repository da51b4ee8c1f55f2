//! Component and template registries
//!
//! Transports and parsers are registered under string names. Artifact type
//! configurations reference those names and are resolved once, when the
//! type is registered.

use crate::artifact_type::{ArtifactType, ArtifactTypeConfig};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::parser::{DelimitedTextParser, Parser};
use crate::transport::http::UrlEncoding;
use crate::transport::{HttpTransport, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Named transport and parser implementations
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
    parsers: HashMap<String, Arc<dyn Parser>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the reference components:
    /// `http`, `http-base64-json`, `csv` and `csv-semicolon`
    pub fn with_defaults(config: &EngineConfig) -> Result<Self> {
        let http = HttpTransport::new(config.http_timeout_secs)?;
        let mut registry = Self::new();
        registry
            .register_transport("http", Arc::new(http.clone()))
            .register_transport(
                "http-base64-json",
                Arc::new(http.with_encoding(UrlEncoding::Base64Json)),
            )
            .register_parser("csv", Arc::new(DelimitedTextParser::new(b',')))
            .register_parser("csv-semicolon", Arc::new(DelimitedTextParser::new(b';')));
        Ok(registry)
    }

    pub fn register_transport(
        &mut self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> &mut Self {
        self.transports.insert(name.into(), transport);
        self
    }

    pub fn register_parser(&mut self, name: impl Into<String>, parser: Arc<dyn Parser>) -> &mut Self {
        self.parsers.insert(name.into(), parser);
        self
    }

    fn transport(&self, name: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownComponent {
                kind: "transport",
                name: name.to_string(),
            })
    }

    fn parser(&self, name: &str) -> Result<Arc<dyn Parser>> {
        self.parsers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownComponent {
                kind: "parser",
                name: name.to_string(),
            })
    }
}

/// Registered artifact types, read-only once the engine is built
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    types: HashMap<String, Arc<ArtifactType>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a configuration's components and register the type
    pub fn register(
        &mut self,
        config: ArtifactTypeConfig,
        components: &ComponentRegistry,
    ) -> Result<Arc<ArtifactType>> {
        if config.id.trim().is_empty() {
            return Err(EngineError::config("Artifact type id cannot be empty"));
        }
        if self.types.contains_key(&config.id) {
            return Err(EngineError::config(format!(
                "Artifact type '{}' is already registered",
                config.id
            )));
        }

        let transport = components.transport(&config.transport.component)?;
        let parser = components.parser(&config.parser.component)?;
        let id = config.id.clone();
        let artifact_type = Arc::new(ArtifactType::new(config, transport, parser));

        debug!(artifact_type = %id, "Registered artifact type");
        self.types.insert(id, artifact_type.clone());
        Ok(artifact_type)
    }

    /// Register a type from its JSON configuration document
    pub fn register_json(
        &mut self,
        json: &str,
        components: &ComponentRegistry,
    ) -> Result<Arc<ArtifactType>> {
        let config: ArtifactTypeConfig = serde_json::from_str(json)?;
        self.register(config, components)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ArtifactType>> {
        self.types
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownArtifactType(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.types.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
