//! The per-tenant block catalogue and the poller that keeps it current.
//!
//! Many processes share a consistent view of which blocks exist per tenant by
//! combining distributed work-sharing (a few instances per tenant build a durable
//! index snapshot) with incremental refresh (everyone else cheaply pulls that
//! snapshot, falling back to full polling when it is missing or stale).

pub mod config;
pub mod metrics;
pub mod poller;
pub mod sharder;

mod delta;
mod tasks;

pub use self::config::{ConfigDuration, PollerConfig};
pub use self::poller::{PollError, Poller};
pub use self::sharder::{JobSharder, OwnsEverythingSharder, OwnsNothingSharder};

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use backend::{BlockMeta, CompactedBlockMeta, TenantId};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Live block metas per tenant, as assembled by one polling cycle.
pub type PerTenant = HashMap<TenantId, Vec<BlockMeta>>;
/// Compacted block metas per tenant, as assembled by one polling cycle.
pub type PerTenantCompacted = HashMap<TenantId, Vec<CompactedBlockMeta>>;

/// One published point-in-time view of every tenant's blocklist.
#[derive(Debug, Default)]
pub struct BlocklistSnapshot {
    pub metas: PerTenant,
    pub compacted_metas: PerTenantCompacted,
}

/// Process-wide, atomically replaceable view of the per-tenant blocklists.
///
/// Readers obtain a stable snapshot handle; writers never mutate a published
/// snapshot, they replace it wholesale once per polling cycle.
#[derive(Debug, Default)]
pub struct Blocklist {
    snapshot: ArcSwap<BlocklistSnapshot>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tenants present in the current snapshot.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.snapshot.load().metas.keys().cloned().collect()
    }

    /// The tenant's live block metas, empty if the tenant is unknown.
    pub fn metas(&self, tenant: &str) -> Vec<BlockMeta> {
        self.snapshot
            .load()
            .metas
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    /// The tenant's compacted block metas, empty if the tenant is unknown.
    pub fn compacted_metas(&self, tenant: &str) -> Vec<CompactedBlockMeta> {
        self.snapshot
            .load()
            .compacted_metas
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a stable handle to the current snapshot.
    pub fn snapshot(&self) -> Arc<BlocklistSnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replaces the published snapshot with the given cycle results.
    pub fn apply(&self, metas: PerTenant, compacted_metas: PerTenantCompacted) {
        self.snapshot.store(Arc::new(BlocklistSnapshot {
            metas,
            compacted_metas,
        }));
    }
}
