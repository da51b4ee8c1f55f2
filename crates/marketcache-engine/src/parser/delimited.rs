//! Delimited text parser
//!
//! Reads the first raw file of an artifact as delimited text with a header
//! row. Every column is UTF-8 except the configured date columns, which are
//! parsed to `Date32`. Empty cells become nulls.

use super::{ParsedOutput, Parser};
use crate::error::{EngineError, Result};
use crate::metadata::ArtifactMetadata;
use crate::raw::RawArtifactStore;
use arrow_array::{ArrayRef, Date32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;
use tracing::debug;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01
pub(crate) const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone)]
pub struct DelimitedTextParser {
    delimiter: u8,
    date_columns: Vec<String>,
    date_format: String,
}

impl DelimitedTextParser {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            date_columns: Vec::new(),
            date_format: "%Y-%m-%d".to_string(),
        }
    }

    /// Parse `columns` as dates with the given `chrono` format
    pub fn with_date_columns<I, S>(mut self, columns: I, format: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.date_columns = columns.into_iter().map(Into::into).collect();
        self.date_format = format.into();
        self
    }

    fn parse_bytes(&self, bytes: &[u8]) -> Result<RecordBatch> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();

        let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
        for record in reader.byte_records() {
            let record = record?;
            for (i, column) in columns.iter_mut().enumerate() {
                let cell = record
                    .get(i)
                    .map(|c| String::from_utf8_lossy(c).trim().to_string())
                    .filter(|c| !c.is_empty());
                column.push(cell);
            }
        }

        let mut fields = Vec::with_capacity(headers.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(headers.len());
        for (name, values) in headers.iter().zip(columns) {
            if self.date_columns.contains(name) {
                let days = values
                    .into_iter()
                    .map(|v| v.and_then(|s| self.parse_date(&s)))
                    .collect::<Vec<_>>();
                fields.push(Field::new(name, DataType::Date32, true));
                arrays.push(Arc::new(Date32Array::from(days)));
            } else {
                fields.push(Field::new(name, DataType::Utf8, true));
                arrays.push(Arc::new(StringArray::from(values)));
            }
        }

        let schema = Arc::new(Schema::new(fields));
        if arrays.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }
        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn parse_date(&self, value: &str) -> Option<i32> {
        NaiveDate::parse_from_str(value, &self.date_format)
            .ok()
            .map(|d| d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
    }
}

impl Parser for DelimitedTextParser {
    fn parse(&self, meta: &ArtifactMetadata, raw: &RawArtifactStore) -> Result<ParsedOutput> {
        let file = meta.raw_files.first().ok_or_else(|| {
            EngineError::materialization(format!("no raw files for {}", meta.fingerprint))
        })?;

        let bytes = raw.read_to_end(file)?;
        let batch = self.parse_bytes(&bytes)?;
        debug!(file = %file, rows = batch.num_rows(), "Parsed delimited text");

        Ok(ParsedOutput::Single(batch))
    }
}
