//! Content-addressed raw artifact store
//!
//! Downloaded bytes live under `raw/<artifact_type>/<content_checksum>/`.
//! The folder is normalized in place (archive expansion, base64 decoding),
//! validated, gzip-compressed for retention and sealed with a manifest
//! written last. A folder without a manifest is an interrupted write.
//!
//! All operations here are blocking; async callers run them on the
//! blocking pool.

use crate::artifact_type::{PayloadEncoding, PayloadValidation, TransportSpec};
use crate::error::{EngineError, Result};
use crate::layout::StorageLayout;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;
use tracing::{debug, warn};

/// Completion marker of a raw folder
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Maximum archive nesting followed during expansion
const MAX_ARCHIVE_DEPTH: usize = 8;

/// Contents of a sealed raw folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawManifest {
    pub content_checksum: String,
    /// Root-relative retained files
    pub files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RawArtifactStore {
    layout: StorageLayout,
}

impl RawArtifactStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Root-relative folder for a payload
    pub fn path(&self, artifact_type_id: &str, checksum: &str) -> String {
        self.layout.raw_folder(artifact_type_id, checksum)
    }

    /// True when the folder holds a complete, sealed entry
    pub fn exists(&self, location: &str) -> bool {
        matches!(self.read_manifest(location), Ok(Some(_)))
    }

    /// Manifest of a sealed folder.
    ///
    /// A manifest whose listed files are no longer all on disk describes a
    /// damaged folder and reads as absent.
    pub fn read_manifest(&self, location: &str) -> Result<Option<RawManifest>> {
        let path = self.layout.resolve(location).join(MANIFEST_FILENAME);
        let manifest: RawManifest = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !self.files_exist(&manifest.files) {
            warn!(location = %location, "Raw folder is missing files listed in its manifest");
            return Ok(None);
        }
        Ok(Some(manifest))
    }

    /// True when every root-relative file exists
    pub fn files_exist(&self, files: &[String]) -> bool {
        !files.is_empty() && files.iter().all(|f| self.layout.resolve(f).is_file())
    }

    /// Write `bytes` as `<location>/<file_name>`, returning the relative path
    pub fn write(&self, location: &str, file_name: &str, bytes: &[u8]) -> Result<String> {
        let folder = self.layout.resolve(location);
        fs::create_dir_all(&folder)?;
        fs::write(folder.join(file_name), bytes)?;
        Ok(format!("{}/{}", location, file_name))
    }

    /// Unpack a zip archive into its own folder, recursing into nested
    /// archives. Members are flattened to their base names.
    pub fn expand_archive(&self, file: &str) -> Result<Vec<String>> {
        let (location, _) = split_location(file);
        let mut members = Vec::new();
        self.expand_into(file, location, 0, &mut members)?;
        if members.is_empty() {
            return Err(EngineError::EmptyArchive(file.to_string()));
        }
        Ok(members)
    }

    fn expand_into(
        &self,
        file: &str,
        location: &str,
        depth: usize,
        members: &mut Vec<String>,
    ) -> Result<()> {
        if depth >= MAX_ARCHIVE_DEPTH {
            return Err(EngineError::Decode(format!(
                "archive nesting deeper than {} levels in '{}'",
                MAX_ARCHIVE_DEPTH, file
            )));
        }

        let archive_path = self.layout.resolve(file);
        let mut archive = zip::ZipArchive::new(BufReader::new(File::open(&archive_path)?))?;
        let mut nested = Vec::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }

            let Some(name) = entry
                .enclosed_name()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            else {
                warn!(entry = entry.name(), "Skipping archive member with unsafe path");
                continue;
            };

            let relative = format!("{}/{}", location, name);
            let mut out = BufWriter::new(File::create(self.layout.resolve(&relative))?);
            io::copy(&mut entry, &mut out)?;
            debug!(member = %name, size = entry.size(), "Extracted");

            if name.to_lowercase().ends_with(".zip") {
                nested.push(relative);
            } else {
                members.push(relative);
            }
        }

        drop(archive);
        fs::remove_file(&archive_path)?;

        for inner in nested {
            self.expand_into(&inner, location, depth + 1, members)?;
        }
        Ok(())
    }

    /// Decode a base64 payload into `decoded.<target_format>`
    pub fn decode_encoded_payload(&self, file: &str, target_format: &str) -> Result<String> {
        let (location, _) = split_location(file);
        let source = self.layout.resolve(file);
        let text = fs::read(&source)?;
        let compact: Vec<u8> = text
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&compact)
            .map_err(|e| EngineError::Decode(format!("base64 payload '{}': {}", file, e)))?;

        let target = self.write(location, &format!("decoded.{}", target_format), &decoded)?;
        fs::remove_file(&source)?;
        Ok(target)
    }

    /// Gzip a file in place, returning the relative `.gz` path
    pub fn compress(&self, file: &str) -> Result<String> {
        let source = self.layout.resolve(file);
        let target = format!("{}.gz", file);

        let mut input = BufReader::new(File::open(&source)?);
        let mut encoder = GzEncoder::new(
            BufWriter::new(File::create(self.layout.resolve(&target))?),
            Compression::default(),
        );
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;

        fs::remove_file(&source)?;
        Ok(target)
    }

    /// Reject zero-byte files, and for JSON payloads, empty documents
    pub fn validate_non_empty(&self, file: &str, policy: PayloadValidation) -> Result<()> {
        let path = self.layout.resolve(file);
        if fs::metadata(&path)?.len() == 0 {
            return Err(EngineError::invalid_payload(format!("'{}' is empty", file)));
        }

        if policy == PayloadValidation::JsonNonEmpty {
            let value: serde_json::Value = serde_json::from_reader(BufReader::new(File::open(&path)?))
                .map_err(|e| EngineError::invalid_payload(format!("'{}' is not JSON: {}", file, e)))?;
            let empty = match &value {
                serde_json::Value::Null => true,
                serde_json::Value::Array(items) => items.is_empty(),
                serde_json::Value::Object(fields) => fields.is_empty(),
                _ => false,
            };
            if empty {
                return Err(EngineError::invalid_payload(format!(
                    "'{}' decodes to an empty document",
                    file
                )));
            }
        }
        Ok(())
    }

    /// Open a retained file, transparently gunzipping `.gz` files
    pub fn open(&self, file: &str) -> Result<Box<dyn Read + Send>> {
        let reader = BufReader::new(File::open(self.layout.resolve(file))?);
        if file.ends_with(".gz") {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }

    pub fn read_to_end(&self, file: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.open(file)?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Remove a raw folder and everything in it
    pub fn discard(&self, location: &str) -> Result<()> {
        match fs::remove_dir_all(self.layout.resolve(location)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write, normalize, validate, compress and seal a payload.
    ///
    /// On any error the folder is removed before the error is returned.
    pub fn store_payload(
        &self,
        artifact_type_id: &str,
        checksum: &str,
        bytes: &[u8],
        spec: &TransportSpec,
    ) -> Result<RawManifest> {
        let location = self.path(artifact_type_id, checksum);

        // Left over from an interrupted write, or damaged after sealing.
        if self.layout.resolve(&location).exists() {
            warn!(location = %location, "Discarding incomplete raw folder");
            self.discard(&location)?;
        }

        match self.normalize(&location, checksum, bytes, spec) {
            Ok(manifest) => Ok(manifest),
            Err(err) => {
                if let Err(cleanup) = self.discard(&location) {
                    warn!(location = %location, error = %cleanup, "Failed to roll back raw folder");
                }
                Err(err)
            },
        }
    }

    fn normalize(
        &self,
        location: &str,
        checksum: &str,
        bytes: &[u8],
        spec: &TransportSpec,
    ) -> Result<RawManifest> {
        let downloaded = self.write(location, &format!("downloaded.{}", spec.format), bytes)?;

        let files = match &spec.payload {
            PayloadEncoding::Plain => vec![downloaded],
            PayloadEncoding::Archive => self.expand_archive(&downloaded)?,
            PayloadEncoding::Base64 { decoded_format } => {
                let decoded = self.decode_encoded_payload(&downloaded, decoded_format)?;
                if decoded_format.eq_ignore_ascii_case("zip") {
                    self.expand_archive(&decoded)?
                } else {
                    vec![decoded]
                }
            },
        };

        for file in &files {
            self.validate_non_empty(file, spec.validation)?;
        }

        let files = files
            .iter()
            .map(|file| self.compress(file))
            .collect::<Result<Vec<_>>>()?;

        let manifest = RawManifest {
            content_checksum: checksum.to_string(),
            files,
        };
        self.write(location, MANIFEST_FILENAME, &serde_json::to_vec_pretty(&manifest)?)?;
        debug!(location = %location, files = manifest.files.len(), "Sealed raw folder");

        Ok(manifest)
    }
}

fn split_location(file: &str) -> (&str, &str) {
    file.rsplit_once('/').unwrap_or(("", file))
}

/// Base name of a root-relative path
pub fn file_name(file: &str) -> &str {
    split_location(file).1
}
