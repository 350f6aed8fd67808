//! The polling cycle that discovers every tenant's blocks and keeps the shared
//! tenant indexes current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backend::{
    BackendError, BlockBackend, BlockId, BlockMeta, CompactedBlockMeta, TenantIndex,
};
use chrono::Utc;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::config::PollerConfig;
use crate::metrics::PollerMetrics;
use crate::sharder::JobSharder;
use crate::tasks::BoundedJoinSet;
use crate::{BlocklistSnapshot, BoxError, Blocklist, PerTenant, PerTenantCompacted};

const JOB_PREFIX: &str = "build-tenant-index-";

/// Errors that fail a whole polling cycle. Tenant-level errors are absorbed into
/// the previous snapshot instead and only count against the failure budget.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("failed listing tenants: {0}")]
    ListTenants(#[source] BackendError),

    #[error("polling cycle cancelled")]
    Cancelled,

    #[error("too many tenant failures; abandoning polling cycle")]
    TooManyTenantFailures,
}

/// Retrieves the blocklist of every tenant in the store, once per cycle.
///
/// Each cycle decides per tenant whether this instance is an index builder
/// (rebuild the list from the store and persist the tenant index) or a follower
/// (pull the index another instance wrote). Metas already present in `previous`
/// are carried forward without re-reading the store.
#[derive(Clone)]
pub struct Poller {
    backend: Arc<dyn BlockBackend>,
    sharder: Arc<dyn JobSharder>,
    cfg: Arc<PollerConfig>,
    metrics: Option<Arc<PollerMetrics>>,
}

impl Poller {
    pub fn new(
        cfg: PollerConfig,
        backend: Arc<dyn BlockBackend>,
        sharder: Arc<dyn JobSharder>,
        metrics: Option<Arc<PollerMetrics>>,
    ) -> Self {
        Self {
            backend,
            sharder,
            cfg: Arc::new(cfg),
            metrics,
        }
    }

    /// Runs one polling cycle over every tenant and returns the assembled
    /// per-tenant lists.
    ///
    /// When `cancel` fires, no further tenants are admitted; tenants already in
    /// flight run to completion so a cancelled cycle never leaves a half-written
    /// tenant index behind, and the cycle returns [`PollError::Cancelled`].
    #[tracing::instrument(skip_all)]
    pub async fn do_poll(
        &self,
        cancel: &CancellationToken,
        previous: &Blocklist,
    ) -> Result<(PerTenant, PerTenantCompacted), PollError> {
        let start = Instant::now();

        let tenants = match self.backend.tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_poll_error("");
                }
                return Err(PollError::ListTenants(err));
            }
        };

        let previous = previous.snapshot();
        let results: Arc<Mutex<(PerTenant, PerTenantCompacted)>> = Arc::default();
        let failures_remaining = Arc::new(AtomicI64::new(
            i64::from(self.cfg.tolerate_tenant_failures),
        ));

        let mut tenant_tasks = BoundedJoinSet::new(self.cfg.tenant_poll_concurrency);
        let mut cancelled = false;

        for tenant in tenants {
            // Do not admit new tenants once the cycle is cancelled. Tenants already
            // admitted keep running detached so in-flight index writes complete.
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Exit early once the budget of failing tenants is exhausted.
            if failures_remaining.load(Ordering::SeqCst) < 0 {
                tracing::error!("exiting polling loop early because too many errors");
                break;
            }

            let poller = self.clone();
            let previous = Arc::clone(&previous);
            let results = Arc::clone(&results);
            let failures_remaining = Arc::clone(&failures_remaining);

            tenant_tasks
                .spawn(async move {
                    poller
                        .poll_tenant_with_retries(tenant, &previous, &results, &failures_remaining)
                        .await
                })
                .await;
        }

        tenant_tasks.wait().await;

        if cancelled {
            return Err(PollError::Cancelled);
        }

        if failures_remaining.load(Ordering::SeqCst) < 0 {
            return Err(PollError::TooManyTenantFailures);
        }

        let (blocklist, compacted_blocklist) = Arc::try_unwrap(results)
            .expect("tenant tasks have all been joined")
            .into_inner()
            .expect("result mutex poisoned");

        let elapsed = start.elapsed().as_secs_f64();
        if let Some(metrics) = &self.metrics {
            metrics.record_poll_duration(elapsed);
        }
        tracing::info!(seconds = elapsed, "blocklist poll complete");

        Ok((blocklist, compacted_blocklist))
    }

    /// Polls one tenant, retrying transient failures, and contributes the outcome
    /// to the cycle's shared result maps.
    async fn poll_tenant_with_retries(
        &self,
        tenant: String,
        previous: &BlocklistSnapshot,
        results: &Mutex<(PerTenant, PerTenantCompacted)>,
        failures_remaining: &AtomicI64,
    ) {
        let mut attempts_remaining = self.cfg.tolerate_consecutive_errors + 1;
        let outcome = loop {
            match self.poll_tenant_and_create_index(&tenant, previous).await {
                Ok(lists) => break Ok(lists),
                Err(err) => {
                    attempts_remaining -= 1;
                    if attempts_remaining == 0 {
                        break Err(err);
                    }
                }
            }
        };

        match outcome {
            Ok((new_blocklist, new_compacted_blocklist)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_tenant_blocklist(
                        &tenant,
                        &new_blocklist,
                        &new_compacted_blocklist,
                    );
                }

                // An entirely empty tenant has no entry in the cycle results.
                if new_blocklist.is_empty() && new_compacted_blocklist.is_empty() {
                    return;
                }

                let mut results = results.lock().expect("result mutex poisoned");
                results.0.insert(tenant.clone(), new_blocklist);
                results.1.insert(tenant, new_compacted_blocklist);
            }
            Err(err) => {
                tracing::error!(
                    tenant,
                    error = %err,
                    "failed to poll or create index for tenant",
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_poll_error(&tenant);
                }

                // The tenant keeps its entry from the previous cycle.
                let metas = previous.metas.get(&tenant).cloned().unwrap_or_default();
                let compacted = previous
                    .compacted_metas
                    .get(&tenant)
                    .cloned()
                    .unwrap_or_default();

                let mut results = results.lock().expect("result mutex poisoned");
                results.0.insert(tenant.clone(), metas);
                results.1.insert(tenant, compacted);

                failures_remaining.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[tracing::instrument(skip(self, previous))]
    async fn poll_tenant_and_create_index(
        &self,
        tenant: &str,
        previous: &BlocklistSnapshot,
    ) -> Result<(Vec<BlockMeta>, Vec<CompactedBlockMeta>), BoxError> {
        let builder = self.tenant_index_builder(tenant);
        if !builder {
            if let Some(metrics) = &self.metrics {
                metrics.record_builder(tenant, false);
            }

            match self.pull_tenant_index(tenant).await {
                Ok(index) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_index_age(tenant, index.age());
                    }
                    tracing::info!(
                        tenant,
                        created_at = %index.created_at,
                        metas = index.metas.len(),
                        compacted_metas = index.compacted_metas.len(),
                        "successfully pulled tenant index",
                    );
                    return Ok((index.metas, index.compacted_metas));
                }
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_tenant_index_error(tenant);
                    }

                    if !self.cfg.poll_fallback {
                        return Err(format!(
                            "failed to pull tenant index and no fallback configured: {err}"
                        )
                        .into());
                    }

                    tracing::error!(
                        tenant,
                        error = %err,
                        "failed to pull tenant index, falling back to polling",
                    );
                }
            }
        }

        // Either this instance owns a builder slot for the tenant, or the index
        // pull failed and fallback polling is configured.
        if let Some(metrics) = &self.metrics {
            metrics.record_builder(tenant, true);
        }

        let (blocklist, compacted_blocklist) = self.poll_tenant_blocks(tenant, previous).await?;

        tracing::info!(
            tenant,
            metas = blocklist.len(),
            compacted_metas = compacted_blocklist.len(),
            "writing tenant index",
        );
        // A failed index write is not fatal: the in-memory lists are still good for
        // this instance and the next builder attempt retries the write.
        if let Err(err) = self
            .backend
            .write_tenant_index(tenant, &blocklist, &compacted_blocklist)
            .await
        {
            if let Some(metrics) = &self.metrics {
                metrics.record_tenant_index_error(tenant);
            }
            tracing::error!(tenant, error = %err, "failed to write tenant index");
        }

        if blocklist.is_empty() && compacted_blocklist.is_empty() {
            self.delete_tenant(tenant)
                .await
                .map_err(|err| -> BoxError { format!("failed to delete tenant: {err}").into() })?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_index_age(tenant, Duration::ZERO);
        }

        Ok((blocklist, compacted_blocklist))
    }

    /// Pulls the tenant's persisted index, treating one older than the configured
    /// threshold as an error.
    async fn pull_tenant_index(&self, tenant: &str) -> Result<TenantIndex, BoxError> {
        let index = self.backend.tenant_index(tenant).await?;

        let stale_after: Duration = self.cfg.stale_tenant_index.into();
        if !stale_after.is_zero() && index.age() > stale_after {
            return Err(format!("tenant index created at {} is stale", index.created_at).into());
        }

        Ok(index)
    }

    async fn poll_tenant_blocks(
        &self,
        tenant: &str,
        previous: &BlocklistSnapshot,
    ) -> Result<(Vec<BlockMeta>, Vec<CompactedBlockMeta>), BoxError> {
        let (live_ids, compacted_ids) = self
            .backend
            .blocks(tenant)
            .await
            .map_err(|err| -> BoxError { format!("failed listing tenant blocks: {err}").into() })?;

        let previous_metas = previous.metas.get(tenant).cloned().unwrap_or_default();
        let previous_compacted = previous
            .compacted_metas
            .get(tenant)
            .cloned()
            .unwrap_or_default();

        let delta = crate::delta::compute(
            previous_metas,
            previous_compacted,
            &live_ids,
            &compacted_ids,
        );

        let mut new_blocklist = delta.known;
        let mut new_compacted_blocklist = delta.known_compacted;

        let (resolved, resolved_compacted) = self
            .poll_unknown(tenant, delta.unknown)
            .await
            .map_err(|err| -> BoxError { format!("failed reading unknown blocks: {err}").into() })?;

        new_blocklist.extend(resolved);
        new_compacted_blocklist.extend(resolved_compacted);

        Ok((new_blocklist, new_compacted_blocklist))
    }

    /// Resolves the metas of blocks the previous cycle has not seen, with bounded
    /// parallelism and jittered store reads.
    async fn poll_unknown(
        &self,
        tenant: &str,
        unknown_blocks: HashMap<BlockId, bool>,
    ) -> Result<(Vec<BlockMeta>, Vec<CompactedBlockMeta>), BoxError> {
        let results: Arc<Mutex<(Vec<BlockMeta>, Vec<CompactedBlockMeta>)>> = Arc::default();
        let errors: Arc<Mutex<Vec<BackendError>>> = Arc::default();
        let mut block_tasks = BoundedJoinSet::new(self.cfg.poll_concurrency);

        for (block_id, compacted) in unknown_blocks {
            // Stop admitting block reads once any of them has failed; a systemic
            // store problem should not be amplified by thousands of reads.
            if !errors.lock().expect("error mutex poisoned").is_empty() {
                break;
            }

            let poller = self.clone();
            let tenant = tenant.to_string();
            let results = Arc::clone(&results);
            let errors = Arc::clone(&errors);

            block_tasks
                .spawn(async move {
                    if poller.cfg.poll_jitter_ms > 0 {
                        let jitter = rand::rng().random_range(0..poller.cfg.poll_jitter_ms);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }

                    match poller.poll_block(&tenant, block_id, compacted).await {
                        Ok(Some(ResolvedBlock::Live(meta))) => {
                            results.lock().expect("result mutex poisoned").0.push(meta);
                        }
                        Ok(Some(ResolvedBlock::Compacted(meta))) => {
                            results.lock().expect("result mutex poisoned").1.push(meta);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            errors.lock().expect("error mutex poisoned").push(err);
                        }
                    }
                })
                .await;
        }

        block_tasks.wait().await;

        let errors = Arc::try_unwrap(errors)
            .expect("block tasks have all been joined")
            .into_inner()
            .expect("error mutex poisoned");
        if !errors.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.record_tenant_index_error(tenant);
            }
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(joined.into());
        }

        let (metas, compacted_metas) = Arc::try_unwrap(results)
            .expect("block tasks have all been joined")
            .into_inner()
            .expect("result mutex poisoned");
        Ok((metas, compacted_metas))
    }

    /// Resolves a single unknown block to a live meta, a compacted meta, or
    /// nothing at all for blocks in intermediate states.
    async fn poll_block(
        &self,
        tenant: &str,
        block_id: BlockId,
        compacted: bool,
    ) -> Result<Option<ResolvedBlock>, BackendError> {
        if !compacted
            && self.cfg.skip_no_compact_blocks
            && self.backend.has_no_compact_flag(tenant, block_id).await?
        {
            return Ok(None);
        }

        if !compacted {
            match self.backend.block_meta(tenant, block_id).await {
                Ok(meta) => return Ok(Some(ResolvedBlock::Live(meta))),
                // The live meta may have disappeared because the block was just
                // compacted; check for the compacted meta below.
                Err(err) if err.is_does_not_exist() => {}
                Err(err) => return Err(err),
            }
        }

        match self.backend.compacted_block_meta(tenant, block_id).await {
            Ok(meta) => Ok(Some(ResolvedBlock::Compacted(meta))),
            // Blocks in intermediate states may have neither meta. Not an error,
            // just drop the block.
            Err(err) if err.is_does_not_exist() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns true if this instance owns one of the tenant's builder slots.
    fn tenant_index_builder(&self, tenant: &str) -> bool {
        (0..self.cfg.tenant_index_builders)
            .any(|slot| self.sharder.owns(&format!("{JOB_PREFIX}{slot}-{tenant}")))
    }

    /// Deletes all of a tenant's leftover objects once no tenant index is present
    /// and nothing has been written recently.
    async fn delete_tenant(&self, tenant: &str) -> Result<(), BoxError> {
        if !self.cfg.empty_tenant_deletion_enabled {
            return Ok(());
        }

        tracing::info!(tenant, "deleting empty tenant");

        let deletion_age: Duration = self.cfg.empty_tenant_deletion_age.into();
        if deletion_age.is_zero() {
            return Err("empty tenant deletion age must be greater than 0".into());
        }

        let mut stale_objects = Vec::new();
        let mut recent_objects = 0;
        let now = Utc::now();
        for object in self.backend.find(tenant).await? {
            tracing::info!(
                object = %object.location,
                modified = %object.last_modified,
                "checking object for deletion",
            );

            let age = (now - object.last_modified).to_std().unwrap_or_default();
            if age > deletion_age {
                stale_objects.push(object.location);
            } else {
                recent_objects += 1;
            }
        }

        // The tenant is still being written to, leave it alone.
        if recent_objects > 0 {
            return Ok(());
        }

        // Only proceed when the index is known not to exist. Any other outcome (it
        // reappeared, or the store is unhealthy) errs on the side of preservation.
        match self.backend.tenant_index(tenant).await {
            Err(err) if err.is_does_not_exist() => {}
            _ => return Ok(()),
        }

        for location in stale_objects {
            tracing::info!(tenant, object = %location, "deleting");
            self.backend.delete(&location).await?;
        }

        Ok(())
    }
}

enum ResolvedBlock {
    Live(BlockMeta),
    Compacted(CompactedBlockMeta),
}
