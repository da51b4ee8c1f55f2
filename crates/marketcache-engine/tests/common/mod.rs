//! Shared helpers for engine integration tests
//!
//! - Stub transports that count calls, fail or answer slowly on demand
//! - Stub parsers (empty tables, failures, multi-output)
//! - `TestEngine`: an engine on a temporary storage root with a fixed clock

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use marketcache_common::Params;
use marketcache_engine::artifact_type::{ArtifactTypeConfig, ParserSpec, TransportSpec};
use marketcache_engine::fingerprint::FixedClock;
use marketcache_engine::metadata::ArtifactMetadata;
use marketcache_engine::parser::{DelimitedTextParser, ParsedOutput, Parser};
use marketcache_engine::raw::RawArtifactStore;
use marketcache_engine::registry::{ComponentRegistry, TemplateRegistry};
use marketcache_engine::transport::{Transport, TransportError, TransportRequest, TransportResponse};
use marketcache_engine::{Engine, EngineConfig, EngineError, VolatilityPolicy};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,marketcache_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

type Respond = dyn Fn(&TransportRequest) -> std::result::Result<Vec<u8>, TransportError> + Send + Sync;

/// Transport answering from a closure and counting calls
pub struct StubTransport {
    calls: AtomicUsize,
    delay: Duration,
    respond: Box<Respond>,
}

impl StubTransport {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&TransportRequest) -> std::result::Result<Vec<u8>, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            respond: Box::new(respond),
        })
    }

    /// Same bytes every time, answered after `delay`
    pub fn slow(body: impl Into<Vec<u8>>, delay: Duration) -> Arc<Self> {
        let body = body.into();
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            respond: Box::new(move |_| Ok(body.clone())),
        })
    }

    /// Always returns the same bytes
    pub fn fixed(body: impl Into<Vec<u8>>) -> Arc<Self> {
        let body = body.into();
        Self::new(move |_| Ok(body.clone()))
    }

    /// A one-row CSV per request, keyed by its `refdate`
    pub fn daily_csv() -> Arc<Self> {
        Self::new(|request| Ok(daily_csv_body(request).into_bytes()))
    }

    /// Like [`daily_csv`](Self::daily_csv), failing for one date
    pub fn failing_on(date: NaiveDate) -> Arc<Self> {
        Self::new(move |request| {
            let requested = request.params.get("refdate").and_then(|v| v.as_date());
            if requested == Some(date) {
                return Err(TransportError::Status {
                    status: 503,
                    url: format!("stub://{}", date),
                });
            }
            Ok(daily_csv_body(request).into_bytes())
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn fetch(&self, request: &TransportRequest) -> std::result::Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let body = (self.respond)(request)?;
        Ok(TransportResponse::new(body).with_descriptor(serde_json::json!({"status_code": 200})))
    }
}

fn daily_csv_body(request: &TransportRequest) -> String {
    let refdate = request
        .params
        .get("refdate")
        .map(|v| v.to_string())
        .unwrap_or_default();
    format!("refdate,symbol,close\n{},PETR4,27.10\n", refdate)
}

/// Parser returning a table with no rows
pub struct EmptyParser;

impl Parser for EmptyParser {
    fn parse(&self, _meta: &ArtifactMetadata, _raw: &RawArtifactStore) -> marketcache_engine::Result<ParsedOutput> {
        let schema = Arc::new(Schema::new(vec![Field::new("symbol", DataType::Utf8, true)]));
        Ok(ParsedOutput::Single(RecordBatch::new_empty(schema)))
    }
}

/// Parser failing for artifacts whose raw bytes contain `marker`
pub struct FailingParser {
    pub marker: &'static str,
    inner: DelimitedTextParser,
}

impl FailingParser {
    pub fn new(marker: &'static str) -> Self {
        Self {
            marker,
            inner: DelimitedTextParser::new(b','),
        }
    }
}

impl Parser for FailingParser {
    fn parse(&self, meta: &ArtifactMetadata, raw: &RawArtifactStore) -> marketcache_engine::Result<ParsedOutput> {
        let bytes = raw.read_to_end(&meta.raw_files[0])?;
        if String::from_utf8_lossy(&bytes).contains(self.marker) {
            return Err(EngineError::materialization("malformed record"));
        }
        self.inner.parse(meta, raw)
    }
}

/// Parser producing one populated and one empty named table
pub struct MultiParser;

impl Parser for MultiParser {
    fn parse(&self, _meta: &ArtifactMetadata, _raw: &RawArtifactStore) -> marketcache_engine::Result<ParsedOutput> {
        let schema = Arc::new(Schema::new(vec![Field::new("symbol", DataType::Utf8, true)]));
        let indexes = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(StringArray::from(vec!["IBOV", "IBXX"]))],
        )?;
        let mut tables = BTreeMap::new();
        tables.insert("Indexes".to_string(), indexes);
        tables.insert("Stocks".to_string(), RecordBatch::new_empty(schema));
        Ok(ParsedOutput::Multi(tables))
    }
}

/// Components with the reference parsers plus the test stubs
pub fn components(transport: Arc<StubTransport>) -> ComponentRegistry {
    let mut components = ComponentRegistry::new();
    components
        .register_transport("stub", transport)
        .register_parser(
            "csv",
            Arc::new(DelimitedTextParser::new(b',').with_date_columns(["refdate"], "%Y-%m-%d")),
        )
        .register_parser("empty", Arc::new(EmptyParser))
        .register_parser("failing", Arc::new(FailingParser::new("2023-05-11")))
        .register_parser("multi", Arc::new(MultiParser));
    components
}

/// Daily CSV artifact type keyed by a required `refdate`
pub fn daily_type(id: &str, parser: &str) -> ArtifactTypeConfig {
    ArtifactTypeConfig {
        id: id.to_string(),
        description: String::new(),
        transport: TransportSpec::new("stub")
            .required("refdate")
            .with_payload(Default::default(), "csv"),
        parser: ParserSpec::new(parser),
        volatility: VolatilityPolicy::None,
    }
}

pub fn refdate(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn refdate_params(date: NaiveDate) -> Params {
    let mut params = Params::new();
    params.insert("refdate".to_string(), date.into());
    params
}

/// Zip archive bytes with the given members
pub fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        for (name, data) in members {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

/// Engine on a temporary root with a fixed clock
pub struct TestEngine {
    pub dir: TempDir,
    pub clock: Arc<FixedClock>,
    pub engine: Engine,
}

impl TestEngine {
    pub async fn start(types: Vec<ArtifactTypeConfig>, components: ComponentRegistry) -> Result<Self> {
        init_tracing();
        let dir = TempDir::new()?;
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));

        let mut templates = TemplateRegistry::new();
        for config in types {
            templates.register(config, &components)?;
        }

        let config = EngineConfig::new(dir.path()).with_concurrency(2);
        let engine = Engine::with_clock(config, templates, clock.clone()).await?;

        Ok(Self { dir, clock, engine })
    }

    /// Absolute `raw/<type>` folder
    pub fn raw_root(&self, artifact_type: &str) -> PathBuf {
        self.dir.path().join("raw").join(artifact_type)
    }

    /// Content folders under `raw/<type>`
    pub fn raw_folders(&self, artifact_type: &str) -> Vec<PathBuf> {
        match std::fs::read_dir(self.raw_root(artifact_type)) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn dataset_file(&self, relative: &str) -> PathBuf {
        self.engine.layout().resolve(relative)
    }
}
