//! Input validation and size limits for peer messages

use thiserror::Error;
use syncmd_index::{FileRecord, Manifest};

/// Size limits for protocol messages and data
pub mod limits {
    /// Maximum length for a file path (4096 bytes)
    pub const MAX_PATH_LENGTH: usize = 4096;

    /// Maximum length for a device id
    pub const MAX_DEVICE_ID_LENGTH: usize = 256;

    /// Maximum number of records in a manifest (1 million)
    pub const MAX_MANIFEST_RECORDS: usize = 1_000_000;

    /// Maximum number of ancestor hashes on a record
    pub const MAX_ANCESTORS: usize = 64;
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid device id: {reason}")]
    InvalidDeviceId { reason: String },

    #[error("Chunk size {size} is invalid (min: {min}, max: {max})")]
    InvalidChunkSize { size: usize, min: usize, max: usize },

    #[error("Manifest has {count} records, exceeds maximum {max}")]
    ManifestTooLarge { count: usize, max: usize },

    #[error("Manifest is not sorted or has duplicate path {path:?}")]
    ManifestOrder { path: String },

    #[error("Manifest device {got} does not match handshake device {expected}")]
    DeviceMismatch { expected: String, got: String },

    #[error("Manifest hash does not verify")]
    ManifestHash,

    #[error("Invalid record {path:?}: {reason}")]
    InvalidRecord { path: String, reason: String },

    #[error("Invalid protocol version: {version}")]
    InvalidVersion { version: String },
}

pub struct Validator;

impl Validator {
    /// Relative, `/`-separated, no traversal, no empty segments
    pub fn validate_path(path: &str) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        if path.is_empty() {
            return Err(invalid("empty"));
        }
        if path.len() > limits::MAX_PATH_LENGTH {
            return Err(invalid("too long"));
        }
        if path.contains('\0') {
            return Err(invalid("contains null bytes"));
        }
        if path.starts_with('/') || path.contains('\\') || path.contains(':') {
            return Err(invalid("absolute or non-portable path"));
        }
        for segment in path.split('/') {
            match segment {
                "" => return Err(invalid("empty segment")),
                "." | ".." => return Err(invalid("contains directory traversal")),
                _ => {}
            }
        }
        if path.split('/').next() == Some(syncmd_index::STATE_DIR) {
            return Err(invalid("targets the state directory"));
        }
        Ok(())
    }

    pub fn validate_device_id(id: &str) -> Result<(), ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::InvalidDeviceId {
                reason: "empty".to_string(),
            });
        }
        if id.len() > limits::MAX_DEVICE_ID_LENGTH {
            return Err(ValidationError::InvalidDeviceId {
                reason: format!("length {} exceeds {}", id.len(), limits::MAX_DEVICE_ID_LENGTH),
            });
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidDeviceId {
                reason: "contains control characters".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_chunk_size(size: usize) -> Result<(), ValidationError> {
        if !(syncmd_chunker::MIN_CHUNK_SIZE..=syncmd_chunker::MAX_CHUNK_SIZE).contains(&size) {
            return Err(ValidationError::InvalidChunkSize {
                size,
                min: syncmd_chunker::MIN_CHUNK_SIZE,
                max: syncmd_chunker::MAX_CHUNK_SIZE,
            });
        }
        Ok(())
    }

    pub fn validate_record(record: &FileRecord) -> Result<(), ValidationError> {
        Self::validate_path(&record.path)?;
        Self::validate_device_id(&record.device_id)?;

        let invalid = |reason: &str| ValidationError::InvalidRecord {
            path: record.path.clone(),
            reason: reason.to_string(),
        };
        if record.deleted != record.content_hash.is_tombstone() {
            return Err(invalid("tombstone flag and hash disagree"));
        }
        if record.deleted && record.size != 0 {
            return Err(invalid("tombstone with non-zero size"));
        }
        if record.logical_version == 0 {
            return Err(invalid("logical version must start at 1"));
        }
        if record.ancestors.len() > limits::MAX_ANCESTORS {
            return Err(invalid("ancestor trail too long"));
        }
        Ok(())
    }

    /// Checks a manifest received from the peer identified as `expected_device`
    pub fn validate_manifest(manifest: &Manifest, expected_device: &str) -> Result<(), ValidationError> {
        if manifest.device_id != expected_device {
            return Err(ValidationError::DeviceMismatch {
                expected: expected_device.to_string(),
                got: manifest.device_id.clone(),
            });
        }
        if manifest.records.len() > limits::MAX_MANIFEST_RECORDS {
            return Err(ValidationError::ManifestTooLarge {
                count: manifest.records.len(),
                max: limits::MAX_MANIFEST_RECORDS,
            });
        }
        for pair in manifest.records.windows(2) {
            if pair[0].path >= pair[1].path {
                return Err(ValidationError::ManifestOrder {
                    path: pair[1].path.clone(),
                });
            }
        }
        for record in &manifest.records {
            Self::validate_record(record)?;
        }
        if !manifest.verify() {
            return Err(ValidationError::ManifestHash);
        }
        Ok(())
    }
}
