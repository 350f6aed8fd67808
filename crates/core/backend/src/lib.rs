//! Object store facade for the tracedb blocklist.
//!
//! This crate provides the narrow interface the blocklist poller needs from the
//! object store: tenant and block listings, block meta reads, and the persisted
//! per-tenant index snapshot. The underlying storage is anything the
//! [`object_store`] crate can talk to (S3, GCS, Azure, local filesystem, memory).

pub mod block;
pub mod store;
pub mod tenant_index;

pub use object_store::{self, ObjectMeta, path::Path};

pub use self::block::{
    BlockId, BlockMeta, CompactedBlockMeta, DedicatedColumn, Encoding, TenantId,
};
pub use self::store::{Store, StoreError};
pub use self::tenant_index::{TENANT_INDEX_VERSION, TenantIndex, TenantIndexError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt as _;
use uuid::Uuid;

/// Errors surfaced by the store facade.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The requested object does not exist, or is not complete enough to use.
    #[error("object does not exist: {path}")]
    DoesNotExist { path: String },

    /// The object exists but its contents could not be parsed.
    #[error("malformed object at {path}: {err}")]
    MalformedObject {
        path: String,
        #[source]
        err: serde_json::Error,
    },

    /// The tenant index exists but its framing or payload could not be decoded.
    #[error("malformed tenant index at {path}: {err}")]
    MalformedIndex {
        path: String,
        #[source]
        err: TenantIndexError,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl BackendError {
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, BackendError::DoesNotExist { .. })
    }
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectStore(object_store::Error::NotFound { path, .. }) => {
                BackendError::DoesNotExist { path }
            }
            err => BackendError::Store(err),
        }
    }
}

/// The operations the blocklist poller requires of the object store.
///
/// Implementations must map a missing object onto [`BackendError::DoesNotExist`]
/// and surface every other error verbatim.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Lists all tenants known to the store.
    async fn tenants(&self) -> Result<Vec<TenantId>, BackendError>;

    /// Lists a tenant's block ids, classified as `(live, compacted)`.
    ///
    /// A block id is classified as compacted by the presence of its compaction
    /// marker. An id carrying both metas appears in both lists.
    async fn blocks(&self, tenant: &str) -> Result<(Vec<BlockId>, Vec<BlockId>), BackendError>;

    /// Reads a live block's metadata.
    async fn block_meta(&self, tenant: &str, block: BlockId) -> Result<BlockMeta, BackendError>;

    /// Reads a retired block's metadata.
    async fn compacted_block_meta(
        &self,
        tenant: &str,
        block: BlockId,
    ) -> Result<CompactedBlockMeta, BackendError>;

    /// Reads the tenant's persisted index snapshot.
    async fn tenant_index(&self, tenant: &str) -> Result<TenantIndex, BackendError>;

    /// Atomically replaces the tenant's persisted index snapshot.
    ///
    /// Writing an index with no metas at all removes the index object instead, so
    /// that readers of an empty tenant observe `DoesNotExist` rather than an empty
    /// snapshot.
    async fn write_tenant_index(
        &self,
        tenant: &str,
        metas: &[BlockMeta],
        compacted_metas: &[CompactedBlockMeta],
    ) -> Result<(), BackendError>;

    /// Returns whether the block carries the marker excluding it from compaction.
    async fn has_no_compact_flag(
        &self,
        tenant: &str,
        block: BlockId,
    ) -> Result<bool, BackendError>;

    /// Walks the tenant's key subtree, returning every object with its
    /// modification time.
    async fn find(&self, tenant: &str) -> Result<Vec<ObjectMeta>, BackendError>;

    /// Deletes a single object by its store path.
    async fn delete(&self, location: &Path) -> Result<(), BackendError>;
}

/// [`BlockBackend`] implementation over an [`object_store`]-backed [`Store`].
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Store,
}

impl ObjectStoreBackend {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Persists a live block's metadata. Called by block producers, not the poller.
    pub async fn write_block_meta(&self, meta: &BlockMeta) -> Result<(), BackendError> {
        let location = block::block_meta_path(&meta.tenant_id, meta.block_id);
        let json = serde_json::to_vec(meta).map_err(|err| BackendError::MalformedObject {
            path: location.to_string(),
            err,
        })?;
        self.store.put_bytes(&location, Bytes::from(json)).await?;
        Ok(())
    }

    /// Persists the marker that retires a block after compaction.
    pub async fn write_compacted_block_meta(
        &self,
        meta: &CompactedBlockMeta,
    ) -> Result<(), BackendError> {
        let location = block::compacted_block_meta_path(&meta.block.tenant_id, meta.block.block_id);
        let json = serde_json::to_vec(meta).map_err(|err| BackendError::MalformedObject {
            path: location.to_string(),
            err,
        })?;
        self.store.put_bytes(&location, Bytes::from(json)).await?;
        Ok(())
    }

    /// Persists the zero-byte marker that excludes a block from compaction.
    pub async fn write_no_compact_flag(
        &self,
        tenant: &str,
        block: BlockId,
    ) -> Result<(), BackendError> {
        let location = block::no_compact_flag_path(tenant, block);
        self.store.put_bytes(&location, Bytes::new()).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockBackend for ObjectStoreBackend {
    async fn tenants(&self) -> Result<Vec<TenantId>, BackendError> {
        let listing = self.store.list_root().await?;
        let tenants = listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| prefix.parts().last())
            .map(|part| part.as_ref().to_string())
            .filter(|tenant| !tenant.is_empty())
            .collect();
        Ok(tenants)
    }

    async fn blocks(&self, tenant: &str) -> Result<(Vec<BlockId>, Vec<BlockId>), BackendError> {
        let mut live = Vec::new();
        let mut compacted = Vec::new();

        let mut listing = self.store.list(&block::tenant_path(tenant));
        while let Some(object) = listing.try_next().await.map_err(BackendError::from)? {
            let parts: Vec<_> = object.location.parts().collect();
            // Block objects live at `<tenant>/<block id>/<name>`; everything else
            // under the tenant (the index, stray objects) is not a block.
            let [_, block_dir, name] = parts.as_slice() else {
                continue;
            };
            let Ok(block_id) = Uuid::parse_str(block_dir.as_ref()) else {
                continue;
            };
            match name.as_ref() {
                block::META_NAME => live.push(block_id),
                block::COMPACTED_META_NAME => compacted.push(block_id),
                _ => {}
            }
        }

        Ok((live, compacted))
    }

    async fn block_meta(&self, tenant: &str, block: BlockId) -> Result<BlockMeta, BackendError> {
        let location = block::block_meta_path(tenant, block);
        let bytes = self.store.get_bytes(&location).await?;
        serde_json::from_slice(&bytes).map_err(|err| BackendError::MalformedObject {
            path: location.to_string(),
            err,
        })
    }

    async fn compacted_block_meta(
        &self,
        tenant: &str,
        block: BlockId,
    ) -> Result<CompactedBlockMeta, BackendError> {
        let location = block::compacted_block_meta_path(tenant, block);
        let bytes = self.store.get_bytes(&location).await?;
        serde_json::from_slice(&bytes).map_err(|err| BackendError::MalformedObject {
            path: location.to_string(),
            err,
        })
    }

    async fn tenant_index(&self, tenant: &str) -> Result<TenantIndex, BackendError> {
        let location = block::tenant_index_path(tenant);
        let bytes = self.store.get_bytes(&location).await?;
        TenantIndex::decode(&bytes).map_err(|err| BackendError::MalformedIndex {
            path: location.to_string(),
            err,
        })
    }

    async fn write_tenant_index(
        &self,
        tenant: &str,
        metas: &[BlockMeta],
        compacted_metas: &[CompactedBlockMeta],
    ) -> Result<(), BackendError> {
        let location = block::tenant_index_path(tenant);

        // An empty tenant has no index. Removing the object (rather than writing an
        // empty snapshot) is what lets the empty-tenant cleanup observe DoesNotExist.
        if metas.is_empty() && compacted_metas.is_empty() {
            match self.store.delete(&location).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(());
        }

        let index = TenantIndex::new(metas.to_vec(), compacted_metas.to_vec());
        let bytes = index.encode().map_err(|err| BackendError::MalformedIndex {
            path: location.to_string(),
            err,
        })?;
        self.store.put_bytes(&location, bytes).await?;
        Ok(())
    }

    async fn has_no_compact_flag(
        &self,
        tenant: &str,
        block: BlockId,
    ) -> Result<bool, BackendError> {
        match self.store.head(&block::no_compact_flag_path(tenant, block)).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn find(&self, tenant: &str) -> Result<Vec<ObjectMeta>, BackendError> {
        let objects = self
            .store
            .list(&block::tenant_path(tenant))
            .try_collect()
            .await
            .map_err(BackendError::from)?;
        Ok(objects)
    }

    async fn delete(&self, location: &Path) -> Result<(), BackendError> {
        self.store.delete(location).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn backend() -> ObjectStoreBackend {
        ObjectStoreBackend::new(Store::in_memory())
    }

    fn meta(tenant: &str, block_id: Uuid) -> BlockMeta {
        BlockMeta {
            block_id,
            tenant_id: tenant.to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            total_objects: 7,
            size_bytes: 2048,
            encoding: Encoding::Zstd,
            data_encoding: "v2".to_string(),
            bloom_shard_count: 1,
            index_page_size: 250_000,
            total_records: 2,
            dedicated_columns: vec![],
        }
    }

    fn compacted_meta(tenant: &str, block_id: Uuid) -> CompactedBlockMeta {
        CompactedBlockMeta {
            block: meta(tenant, block_id),
            compacted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tenants_are_the_first_level_prefixes() {
        let backend = backend();
        backend
            .write_block_meta(&meta("t1", Uuid::new_v4()))
            .await
            .unwrap();
        backend
            .write_block_meta(&meta("t2", Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(backend.tenants().await.unwrap(), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn blocks_classifies_by_marker_presence() {
        let backend = backend();
        let live = Uuid::new_v4();
        let retired = Uuid::new_v4();
        let flagged = Uuid::new_v4();

        backend.write_block_meta(&meta("t1", live)).await.unwrap();
        backend
            .write_compacted_block_meta(&compacted_meta("t1", retired))
            .await
            .unwrap();
        backend.write_block_meta(&meta("t1", flagged)).await.unwrap();
        backend.write_no_compact_flag("t1", flagged).await.unwrap();
        // A stray object under the tenant must not be classified as a block.
        backend
            .store()
            .put_bytes(&Path::from("t1/garbage"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let (mut live_ids, compacted_ids) = backend.blocks("t1").await.unwrap();
        live_ids.sort();
        let mut expected = vec![live, flagged];
        expected.sort();
        assert_eq!(live_ids, expected);
        assert_eq!(compacted_ids, vec![retired]);
    }

    #[tokio::test]
    async fn missing_meta_reads_surface_does_not_exist() {
        let backend = backend();
        let err = backend.block_meta("t1", Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_does_not_exist());

        let err = backend
            .compacted_block_meta("t1", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.is_does_not_exist());

        let err = backend.tenant_index("t1").await.unwrap_err();
        assert!(err.is_does_not_exist());
    }

    #[tokio::test]
    async fn block_meta_round_trips() {
        let backend = backend();
        let block = Uuid::new_v4();
        let written = meta("t1", block);
        backend.write_block_meta(&written).await.unwrap();
        assert_eq!(backend.block_meta("t1", block).await.unwrap(), written);
    }

    #[tokio::test]
    async fn tenant_index_round_trips_and_ages_forward() {
        let backend = backend();
        let metas = vec![meta("t1", Uuid::new_v4())];
        let compacted = vec![compacted_meta("t1", Uuid::new_v4())];

        backend
            .write_tenant_index("t1", &metas, &compacted)
            .await
            .unwrap();
        let first = backend.tenant_index("t1").await.unwrap();
        assert_eq!(first.metas, metas);
        assert_eq!(first.compacted_metas, compacted);
        assert_eq!(first.version, TENANT_INDEX_VERSION);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        backend
            .write_tenant_index("t1", &metas, &compacted)
            .await
            .unwrap();
        let second = backend.tenant_index("t1").await.unwrap();
        assert!(second.created_at > first.created_at);
    }

    #[tokio::test]
    async fn writing_an_empty_index_removes_it() {
        let backend = backend();
        let metas = vec![meta("t1", Uuid::new_v4())];
        backend.write_tenant_index("t1", &metas, &[]).await.unwrap();
        assert!(backend.tenant_index("t1").await.is_ok());

        backend.write_tenant_index("t1", &[], &[]).await.unwrap();
        let err = backend.tenant_index("t1").await.unwrap_err();
        assert!(err.is_does_not_exist());

        // Deleting an index that never existed is not an error either.
        backend.write_tenant_index("t2", &[], &[]).await.unwrap();
    }

    #[tokio::test]
    async fn no_compact_flag_presence() {
        let backend = backend();
        let block = Uuid::new_v4();
        assert!(!backend.has_no_compact_flag("t1", block).await.unwrap());
        backend.write_no_compact_flag("t1", block).await.unwrap();
        assert!(backend.has_no_compact_flag("t1", block).await.unwrap());
    }

    #[tokio::test]
    async fn find_walks_the_tenant_subtree() {
        let backend = backend();
        let block = Uuid::new_v4();
        backend.write_block_meta(&meta("t1", block)).await.unwrap();
        backend.write_no_compact_flag("t1", block).await.unwrap();
        backend
            .write_block_meta(&meta("t2", Uuid::new_v4()))
            .await
            .unwrap();

        let objects = backend.find("t1").await.unwrap();
        assert_eq!(objects.len(), 2);
        assert!(objects.iter().all(|o| o.location.as_ref().starts_with("t1/")));
    }
}
