//! Two-entry snapshot archive
//!
//! A zip container (DEFLATE) holding the memory payload under the store key
//! and `metadata.json` with the producing engine's version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Name of the metadata entry
pub const METADATA_ENTRY: &str = "metadata.json";

/// Contents of `metadata.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: String,
}

/// A decoded archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub payload: Vec<u8>,
    /// `None` if the archive carries no metadata entry
    pub metadata: Option<SnapshotMetadata>,
}

/// Archive codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// Not a readable zip container
    Malformed { reason: String },
    /// The payload entry is absent
    MissingEntry { name: String },
    /// `metadata.json` is not valid metadata
    InvalidMetadata { reason: String },
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed archive: {}", reason),
            Self::MissingEntry { name } => write!(f, "archive has no {} entry", name),
            Self::InvalidMetadata { reason } => write!(f, "invalid snapshot metadata: {}", reason),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Malformed {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        Self::Malformed {
            reason: e.to_string(),
        }
    }
}

/// Pack `payload` under `entry` together with `metadata`
pub fn encode(
    entry: &str,
    payload: &[u8],
    metadata: &SnapshotMetadata,
) -> Result<Vec<u8>, ArchiveError> {
    let metadata = serde_json::to_vec(metadata).map_err(|e| ArchiveError::InvalidMetadata {
        reason: e.to_string(),
    })?;
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(entry, options)?;
    writer.write_all(payload)?;
    writer.start_file(METADATA_ENTRY, options)?;
    writer.write_all(&metadata)?;

    Ok(writer.finish()?.into_inner())
}

/// Unpack an archive whose payload lives under `entry`
pub fn decode(bytes: &[u8], entry: &str) -> Result<Archive, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let payload = match archive.by_name(entry) {
        Ok(mut file) => {
            let mut payload = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut payload)?;
            payload
        }
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ArchiveError::MissingEntry {
                name: entry.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = match archive.by_name(METADATA_ENTRY) {
        Ok(mut file) => {
            let mut raw = Vec::new();
            file.read_to_end(&mut raw)?;
            let metadata = serde_json::from_slice(&raw).map_err(|e| {
                ArchiveError::InvalidMetadata {
                    reason: e.to_string(),
                }
            })?;
            Some(metadata)
        }
        Err(zip::result::ZipError::FileNotFound) => None,
        Err(e) => return Err(e.into()),
    };

    Ok(Archive { payload, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(version: &str) -> SnapshotMetadata {
        SnapshotMetadata {
            version: version.to_string(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let payload = vec![0xAB; 4096];
        let bytes = encode("memory", &payload, &metadata("0.1.0")).unwrap();
        // Repetitive payloads shrink under DEFLATE
        assert!(bytes.len() < payload.len());

        let archive = decode(&bytes, "memory").unwrap();
        assert_eq!(archive.payload, payload);
        assert_eq!(archive.metadata, Some(metadata("0.1.0")));
    }

    #[test]
    fn test_metadata_is_json() {
        let bytes = encode("memory", b"", &metadata("9.9.9")).unwrap();
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut raw = String::new();
        zip.by_name(METADATA_ENTRY)
            .unwrap()
            .read_to_string(&mut raw)
            .unwrap();
        assert_eq!(raw, r#"{"version":"9.9.9"}"#);
        assert_eq!(zip.len(), 2);
    }

    #[test]
    fn test_missing_metadata_is_not_an_error() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("memory", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"raw").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let archive = decode(&bytes, "memory").unwrap();
        assert_eq!(archive.payload, b"raw");
        assert_eq!(archive.metadata, None);
    }

    #[test]
    fn test_missing_payload_entry() {
        let bytes = encode("memory", b"x", &metadata("1")).unwrap();
        assert_eq!(
            decode(&bytes, "other"),
            Err(ArchiveError::MissingEntry {
                name: "other".to_string()
            })
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode(b"definitely not a zip", "memory").unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed { .. }));
    }

    #[test]
    fn test_invalid_metadata_json() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("memory", options).unwrap();
        writer.write_all(b"raw").unwrap();
        writer.start_file(METADATA_ENTRY, options).unwrap();
        writer.write_all(b"{\"version\": 3}").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        assert!(matches!(
            decode(&bytes, "memory"),
            Err(ArchiveError::InvalidMetadata { .. })
        ));
    }
}
