//! Parser collaborator
//!
//! A parser turns the raw files of one artifact into a single table or a
//! set of named tables. Zero-row tables are a valid result.

pub mod delimited;

pub use delimited::DelimitedTextParser;

use crate::error::Result;
use crate::metadata::ArtifactMetadata;
use crate::raw::RawArtifactStore;
use arrow_array::RecordBatch;
use std::collections::BTreeMap;

/// Tables produced by a parser
#[derive(Debug, Clone)]
pub enum ParsedOutput {
    Single(RecordBatch),
    /// Table name -> table, for multi-output artifact types
    Multi(BTreeMap<String, RecordBatch>),
}

impl ParsedOutput {
    /// Flatten to `(output name, table)` pairs
    pub fn into_tables(self) -> Vec<(String, RecordBatch)> {
        match self {
            ParsedOutput::Single(batch) => {
                vec![(crate::artifact_type::SINGLE_OUTPUT.to_string(), batch)]
            },
            ParsedOutput::Multi(tables) => tables.into_iter().collect(),
        }
    }
}

/// Converts stored raw files into tables.
///
/// Parsing is synchronous; the materializer runs it on the blocking pool.
pub trait Parser: Send + Sync {
    /// Parse the raw files referenced by `meta`.
    ///
    /// `meta` carries the request parameters and the root-relative raw file
    /// list; `raw` opens those files.
    fn parse(&self, meta: &ArtifactMetadata, raw: &RawArtifactStore) -> Result<ParsedOutput>;
}
