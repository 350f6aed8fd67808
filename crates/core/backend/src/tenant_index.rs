use std::io::{Read as _, Write as _};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::block::{BlockMeta, CompactedBlockMeta};

/// Version tag carried by every persisted tenant index.
pub const TENANT_INDEX_VERSION: u32 = 1;

/// A point-in-time snapshot of one tenant's block metas, persisted at a well-known
/// key and readable by any instance.
///
/// The on-disk framing is gzip-compressed JSON. The payload is self-describing: it
/// carries an explicit version tag so it can be deserialised without reference to
/// the producing process's schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantIndex {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metas: Vec<BlockMeta>,
    #[serde(default)]
    pub compacted_metas: Vec<CompactedBlockMeta>,
}

impl TenantIndex {
    pub fn new(metas: Vec<BlockMeta>, compacted_metas: Vec<CompactedBlockMeta>) -> Self {
        Self {
            version: TENANT_INDEX_VERSION,
            created_at: Utc::now(),
            metas,
            compacted_metas,
        }
    }

    /// Time elapsed since this index was created.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Serialises the index into its gzip-compressed JSON framing.
    pub fn encode(&self) -> Result<Bytes, TenantIndexError> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Deserialises an index from its gzip-compressed JSON framing.
    pub fn decode(bytes: &[u8]) -> Result<Self, TenantIndexError> {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        let index: TenantIndex = serde_json::from_slice(&json)?;
        if index.version > TENANT_INDEX_VERSION {
            return Err(TenantIndexError::UnsupportedVersion(index.version));
        }
        Ok(index)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TenantIndexError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unsupported tenant index version {0}")]
    UnsupportedVersion(u32),
}
