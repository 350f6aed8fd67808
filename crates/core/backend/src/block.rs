use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an immutable block of trace data. Equality is the only operation
/// the blocklist relies on.
pub type BlockId = Uuid;

/// An opaque, non-empty tenant identifier.
pub type TenantId = String;

/// Object name of a live block's metadata.
pub const META_NAME: &str = "meta.json";
/// Object name of the marker that retires a block after compaction.
pub const COMPACTED_META_NAME: &str = "meta.compacted.json";
/// Object name of the zero-byte marker that excludes a block from compaction.
pub const NO_COMPACT_FLAG_NAME: &str = "nocompact";
/// Object name of the per-tenant index snapshot.
pub const TENANT_INDEX_NAME: &str = "index.json.gz";

pub fn tenant_path(tenant: &str) -> Path {
    Path::from(tenant)
}

pub fn tenant_index_path(tenant: &str) -> Path {
    Path::from(tenant).child(TENANT_INDEX_NAME)
}

pub fn block_meta_path(tenant: &str, block: BlockId) -> Path {
    Path::from(tenant).child(block.to_string()).child(META_NAME)
}

pub fn compacted_block_meta_path(tenant: &str, block: BlockId) -> Path {
    Path::from(tenant)
        .child(block.to_string())
        .child(COMPACTED_META_NAME)
}

pub fn no_compact_flag_path(tenant: &str, block: BlockId) -> Path {
    Path::from(tenant)
        .child(block.to_string())
        .child(NO_COMPACT_FLAG_NAME)
}

/// Compression applied to a block's data pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    None,
    Gzip,
    Lz4,
    Snappy,
    Zstd,
}

/// A column promoted to dedicated storage within a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedColumn {
    pub scope: String,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Metadata describing a live block.
///
/// Produced by the block writer when the block is flushed and immutable thereafter.
/// The poller never writes these objects, it only discovers them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub tenant_id: TenantId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub total_objects: u64,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub data_encoding: String,
    #[serde(default)]
    pub bloom_shard_count: u16,
    #[serde(default)]
    pub index_page_size: u32,
    #[serde(default)]
    pub total_records: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dedicated_columns: Vec<DedicatedColumn>,
}

/// A block meta plus the time at which compaction retired the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedBlockMeta {
    #[serde(flatten)]
    pub block: BlockMeta,
    pub compacted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(tenant: &str) -> BlockMeta {
        BlockMeta {
            block_id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            total_objects: 10,
            size_bytes: 1024,
            encoding: Encoding::Zstd,
            data_encoding: "v2".to_string(),
            bloom_shard_count: 2,
            index_page_size: 250_000,
            total_records: 4,
            dedicated_columns: vec![],
        }
    }

    #[test]
    fn block_meta_json_round_trip() {
        let meta = meta("t1");
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(serde_json::from_str::<BlockMeta>(&json).unwrap(), meta);
    }

    #[test]
    fn compacted_meta_flattens_the_block_fields() {
        let compacted = CompactedBlockMeta {
            block: meta("t1"),
            compacted_at: Utc::now(),
        };
        let value = serde_json::to_value(&compacted).unwrap();
        assert!(value.get("block_id").is_some());
        assert!(value.get("compacted_at").is_some());
        assert!(value.get("block").is_none());
    }

    #[test]
    fn key_layout() {
        let block = Uuid::nil();
        assert_eq!(tenant_index_path("t1").to_string(), "t1/index.json.gz");
        assert_eq!(
            block_meta_path("t1", block).to_string(),
            format!("t1/{block}/meta.json"),
        );
        assert_eq!(
            compacted_block_meta_path("t1", block).to_string(),
            format!("t1/{block}/meta.compacted.json"),
        );
        assert_eq!(
            no_compact_flag_path("t1", block).to_string(),
            format!("t1/{block}/nocompact"),
        );
    }
}
