//! Materializer
//!
//! Parses the raw files of a fetched artifact and writes every non-empty
//! table as a Parquet partition under `datasets/<type>[-<suffix>]/`.
//! Parser failures do not touch the download: the error is recorded on the
//! metadata record so the row can be reprocessed later.

use crate::artifact_type::{ArtifactType, ParserSpec};
use crate::error::{EngineError, Result};
use crate::locks::KeyedLocks;
use crate::metadata::{ArtifactMetadata, MetadataStore};
use crate::parser::Parser;
use crate::raw::RawArtifactStore;
use arrow_array::cast::AsArray;
use arrow_array::types::Date32Type;
use arrow_array::{Array, RecordBatch};
use arrow_schema::DataType;
use chrono::NaiveDate;
use marketcache_common::ParamValue;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Keys that are exactly `YYYY`, `YYYY-MM` or `YYYY-MM-DD` keep a plain stem
const DATE_STEM_PATTERN: &str = r"^\d{4}(-\d{2}(-\d{2})?)?$";

/// Extension of dataset partition files
pub const DATASET_EXTENSION: &str = "parquet";

/// Rows written per output, plus the outputs skipped for having no rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub rows: BTreeMap<String, usize>,
    pub skipped_empty: Vec<String>,
}

impl MaterializeReport {
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

#[derive(Clone)]
pub struct Materializer {
    metadata: MetadataStore,
    raw: RawArtifactStore,
    fingerprint_locks: Arc<KeyedLocks>,
    date_stem: Regex,
}

impl Materializer {
    pub fn new(
        metadata: MetadataStore,
        raw: RawArtifactStore,
        fingerprint_locks: Arc<KeyedLocks>,
    ) -> Result<Self> {
        let date_stem = Regex::new(DATE_STEM_PATTERN)
            .map_err(|e| EngineError::config(format!("invalid partition pattern: {}", e)))?;

        Ok(Self {
            metadata,
            raw,
            fingerprint_locks,
            date_stem,
        })
    }

    /// Parse and write outputs for `meta`, then persist it.
    ///
    /// On success `meta.outputs` holds the written partitions and the
    /// processing error is cleared. On failure the error text is stored on
    /// the record and returned.
    #[instrument(
        skip(self, artifact_type, meta),
        fields(artifact_type = %meta.artifact_type, fingerprint = %meta.fingerprint)
    )]
    pub async fn materialize(
        &self,
        artifact_type: &ArtifactType,
        meta: &mut ArtifactMetadata,
    ) -> Result<MaterializeReport> {
        let _guard = self.fingerprint_locks.lock(meta.fingerprint.as_str()).await;

        let job = OutputJob {
            parser: artifact_type.parser().clone(),
            spec: artifact_type.parser_spec().clone(),
            artifact_type: artifact_type.id().to_string(),
            meta: meta.clone(),
            raw: self.raw.clone(),
            date_stem: self.date_stem.clone(),
        };
        let written = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(EngineError::from)
            .and_then(|written| written);

        match written {
            Ok((outputs, report)) => {
                meta.outputs = outputs;
                meta.processing_error = None;
                self.metadata.save(meta).await?;
                info!(
                    rows = report.total_rows(),
                    skipped = report.skipped_empty.len(),
                    "Materialized"
                );
                Ok(report)
            },
            Err(error) => {
                warn!(error = %error, "Materialization failed");
                meta.processing_error = Some(error.to_string());
                self.metadata.save(meta).await?;
                Err(error)
            },
        }
    }

    /// File name of a partition key
    pub fn partition_file_name(&self, key: &str) -> String {
        partition_file_name(&self.date_stem, key)
    }

    /// True when every recorded dataset file is on disk
    pub fn outputs_exist(&self, meta: &ArtifactMetadata) -> bool {
        let layout = self.raw.layout();
        meta.outputs
            .values()
            .all(|output| layout.resolve(output).is_file())
    }
}

/// Everything the blocking half of materialization needs
struct OutputJob {
    parser: Arc<dyn Parser>,
    spec: ParserSpec,
    artifact_type: String,
    meta: ArtifactMetadata,
    raw: RawArtifactStore,
    date_stem: Regex,
}

impl OutputJob {
    fn run(self) -> Result<(BTreeMap<String, String>, MaterializeReport)> {
        let parsed = self.parser.parse(&self.meta, &self.raw)?;
        let layout = self.raw.layout();

        let mut outputs = BTreeMap::new();
        let mut report = MaterializeReport::default();
        for (name, batch) in parsed.into_tables() {
            if batch.num_rows() == 0 {
                debug!(output = %name, "Empty table, skipping");
                report.skipped_empty.push(name);
                continue;
            }

            let key = partition_key(&self.spec, &self.meta, &batch);
            let folder = layout.dataset_folder(&self.artifact_type, self.spec.suffix_for(&name));
            let relative = format!("{}/{}", folder, partition_file_name(&self.date_stem, &key));
            write_parquet(&layout.resolve(&relative), &batch)?;

            debug!(output = %name, path = %relative, rows = batch.num_rows(), "Wrote partition");
            report.rows.insert(name.clone(), batch.num_rows());
            outputs.insert(name, relative);
        }

        Ok((outputs, report))
    }
}

/// Partition key of a table, in priority order: the explicit date
/// parameter, the first row's date column (plus any key parameters),
/// the content checksum.
pub fn partition_key(spec: &ParserSpec, meta: &ArtifactMetadata, batch: &RecordBatch) -> String {
    let format = &spec.output_filename_format;

    let explicit = meta
        .params
        .get(&spec.partition_param)
        .and_then(ParamValue::as_date)
        .and_then(|date| format_date(date, format));
    if let Some(key) = explicit {
        return key;
    }

    let natural = first_row_date(batch, &spec.date_column).and_then(|date| format_date(date, format));
    if let Some(mut key) = natural {
        for name in &spec.key_params {
            if let Some(value) = meta.params.get(name) {
                key.push('-');
                key.push_str(&value.to_string());
            }
        }
        return key;
    }

    meta.content_checksum
        .clone()
        .unwrap_or_else(|| meta.fingerprint.to_string())
}

fn partition_file_name(date_stem: &Regex, key: &str) -> String {
    if date_stem.is_match(key) {
        format!("{}.{}", key, DATASET_EXTENSION)
    } else {
        format!("part-{}.{}", key, DATASET_EXTENSION)
    }
}

fn format_date(date: NaiveDate, format: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", date.format(format)).ok()?;
    Some(out)
}

fn first_row_date(batch: &RecordBatch, column: &str) -> Option<NaiveDate> {
    let array = batch.column_by_name(column)?;
    if array.is_empty() || array.is_null(0) {
        return None;
    }

    match array.data_type() {
        DataType::Date32 => {
            let days = array.as_primitive::<Date32Type>().value(0);
            NaiveDate::from_num_days_from_ce_opt(days + crate::parser::delimited::UNIX_EPOCH_DAYS_FROM_CE)
        },
        DataType::Utf8 => ParamValue::from(array.as_string::<i32>().value(0)).as_date(),
        _ => None,
    }
}

/// Write a table to `path` through a temporary file
pub fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension(format!("{}.tmp", DATASET_EXTENSION));
    let written = (|| -> Result<()> {
        let mut writer = ArrowWriter::try_new(File::create(&tmp)?, batch.schema(), None)?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    })();

    if let Err(error) = written {
        let _ = fs::remove_file(&tmp);
        return Err(error);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read every batch of a Parquet partition
pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    Ok(reader.collect::<std::result::Result<Vec<_>, _>>()?)
}
