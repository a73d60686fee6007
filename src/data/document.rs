use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::data::archive::{self, CURRENT_FORMAT_VERSION};
use crate::data::migrations::decode_metadata;
use crate::error::AppError;
use crate::models::document::DocumentMetadata;

/// Separator between metadata and payload in the pre-container layout.
pub const LEGACY_SENTINEL: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEncoding {
    LegacyMetadataOnly,
    LegacySentinel,
    Container { format_version: u32 },
}

impl DocumentEncoding {
    pub fn is_legacy(&self) -> bool {
        !matches!(self, Self::Container { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub metadata: DocumentMetadata,
    pub payload: Option<Vec<u8>>,
    pub encoding: DocumentEncoding,
}

impl Document {
    pub fn new(title: &str, page_count: u32, payload: Option<Vec<u8>>) -> Self {
        Self {
            metadata: DocumentMetadata::new(title, page_count),
            payload,
            encoding: DocumentEncoding::Container {
                format_version: CURRENT_FORMAT_VERSION,
            },
        }
    }

    /// Decodes any supported layout: bare metadata first, then the container,
    /// then the sentinel-delimited legacy layout.
    pub fn parse(bytes: &[u8]) -> Result<Self, AppError> {
        if let Ok(metadata) = decode_metadata(bytes) {
            return Ok(Self {
                metadata,
                payload: None,
                encoding: DocumentEncoding::LegacyMetadataOnly,
            });
        }

        match archive::read_archive_bytes(bytes) {
            Ok(contents) => {
                let metadata =
                    decode_metadata(&contents.metadata).map_err(AppError::MetadataDecodingFailed)?;
                return Ok(Self {
                    metadata,
                    payload: contents.payload.filter(|p| !p.is_empty()),
                    encoding: DocumentEncoding::Container {
                        format_version: contents.format_version,
                    },
                });
            }
            Err(e) => debug!(error = %e, "not a readable container"),
        }

        if let Some((metadata, payload)) = split_legacy(bytes) {
            if let Ok(metadata) = decode_metadata(metadata) {
                return Ok(Self {
                    metadata,
                    payload: (!payload.is_empty()).then(|| payload.to_vec()),
                    encoding: DocumentEncoding::LegacySentinel,
                });
            }
        }

        Err(AppError::InvalidFormat)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let bytes = fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Reads only the metadata, skipping the payload member of containers.
    pub fn load_metadata(path: &Path) -> Result<DocumentMetadata, AppError> {
        let mut head = [0u8; 4];
        let read = File::open(path)?.read(&mut head)?;
        if archive::is_container(&head[..read]) {
            if let Ok(bytes) = archive::read_metadata_only(path) {
                return decode_metadata(&bytes).map_err(AppError::MetadataDecodingFailed);
            }
        }
        Ok(Self::load(path)?.metadata)
    }

    pub fn save(&self, destination: &Path) -> Result<(), AppError> {
        let metadata = serde_json::to_vec(&self.metadata)?;
        let payload = self.payload.as_deref().filter(|p| !p.is_empty());
        archive::write_archive(&metadata, payload, destination, CURRENT_FORMAT_VERSION)
    }

    pub fn export_bytes(&self) -> Result<Vec<u8>, AppError> {
        let scratch = tempfile::tempdir()?;
        let path = scratch.path().join("export.yianazip");
        self.save(&path)?;
        let bytes = fs::read(&path)?;
        Ok(bytes)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref().filter(|p| !p.is_empty())
    }
}

/// Writes the payload of the document at `source` to `destination`.
/// Containers are streamed; legacy files are decoded in full.
pub fn extract_payload(source: &Path, destination: &Path) -> Result<bool, AppError> {
    let mut head = [0u8; 4];
    let read = File::open(source)?.read(&mut head)?;
    if archive::is_container(&head[..read]) {
        return archive::extract_payload(source, destination);
    }

    match Document::load(source)?.payload() {
        Some(payload) => {
            archive::write_file_atomically(destination, payload)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn split_legacy(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes
        .windows(LEGACY_SENTINEL.len())
        .position(|w| w == LEGACY_SENTINEL)?;
    Some((&bytes[..pos], &bytes[pos + LEGACY_SENTINEL.len()..]))
}
