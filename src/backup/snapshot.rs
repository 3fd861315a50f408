// catalogtool/src/backup/snapshot.rs
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use thiserror::Error;

use crate::store::TableSnapshot;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot is not valid gzip data: {0}")]
    Compression(#[from] std::io::Error),

    #[error("snapshot is not a valid document: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0}")]
    Version(u32),
}

/// Point-in-time contents of the protected tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub record_count: u64,
    pub tables: Vec<TableSnapshot>,
}

impl SnapshotDocument {
    pub fn new(tables: Vec<TableSnapshot>) -> Self {
        let record_count = tables.iter().map(|t| t.rows.len() as u64).sum();
        Self {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            record_count,
            tables,
        }
    }

    /// Rows actually present, independent of the stored `record_count`.
    pub fn counted_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows.len() as u64).sum()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.table.clone()).collect()
    }
}

/// Compressed blob plus the metadata stored alongside it.
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub bytes: Vec<u8>,
    /// SHA-256 of the uncompressed JSON, hex encoded.
    pub checksum: String,
}

pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn encode(document: &SnapshotDocument) -> Result<EncodedSnapshot, SnapshotError> {
    let json = serde_json::to_vec(document)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let bytes = encoder.finish()?;
    Ok(EncodedSnapshot {
        bytes,
        checksum: checksum(&json),
    })
}

/// Decompresses and parses a blob. Returns the document and the checksum of its
/// uncompressed JSON.
pub fn decode(bytes: &[u8]) -> Result<(SnapshotDocument, String), SnapshotError> {
    let mut json = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut json)?;
    let document: SnapshotDocument = serde_json::from_slice(&json)?;
    if document.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version(document.version));
    }
    Ok((document, checksum(&json)))
}
