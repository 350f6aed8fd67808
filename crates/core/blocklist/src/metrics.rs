use std::time::Duration;

use backend::{BlockMeta, CompactedBlockMeta};
use monitoring::telemetry::metrics::{Counter, Gauge, Histogram, KeyValue, Meter};

const STATUS_LIVE: &str = "live";
const STATUS_COMPACTED: &str = "compacted";

/// Metrics recorded by the blocklist poller.
#[derive(Debug, Clone)]
pub struct PollerMetrics {
    /// Total number of objects (traces) in the store, per tenant and block status
    backend_objects: Gauge<u64>,
    /// Total number of bytes in the store, per tenant and block status
    backend_bytes: Gauge<u64>,
    /// Number of blocks in a tenant's blocklist
    blocklist_length: Gauge<u64>,
    /// Count of errors encountered while polling the blocklist
    poll_errors: Counter,
    /// Count of errors encountered while pulling or building a tenant index
    tenant_index_errors: Counter,
    /// 1 when this instance builds the tenant's index, 0 when it follows
    tenant_index_builder: Gauge<u64>,
    /// Age in seconds of the last pulled tenant index
    tenant_index_age: Gauge<u64>,
    /// Time taken by a full polling cycle
    poll_duration: Histogram<f64>,
}

impl PollerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            backend_objects: Gauge::new_u64(
                meter,
                "blocklist_backend_objects",
                "Total number of objects (traces) in the store",
                "objects",
            ),
            backend_bytes: Gauge::new_u64(
                meter,
                "blocklist_backend_bytes",
                "Total number of bytes in the store",
                "bytes",
            ),
            blocklist_length: Gauge::new_u64(
                meter,
                "blocklist_length",
                "Total number of blocks per tenant",
                "blocks",
            ),
            poll_errors: Counter::new(
                meter,
                "blocklist_poll_errors_total",
                "Total number of times an error occurred while polling the blocklist",
            ),
            tenant_index_errors: Counter::new(
                meter,
                "blocklist_tenant_index_errors_total",
                "Total number of times an error occurred while retrieving or building the tenant index",
            ),
            tenant_index_builder: Gauge::new_u64(
                meter,
                "blocklist_tenant_index_builder",
                "A value of 1 indicates this instance is building the tenant index",
                "",
            ),
            tenant_index_age: Gauge::new_u64(
                meter,
                "blocklist_tenant_index_age_seconds",
                "Age in seconds of the last pulled tenant index",
                "seconds",
            ),
            poll_duration: Histogram::new_f64(
                meter,
                "blocklist_poll_duration_seconds",
                "The amount of time taken to poll and update the blocklist",
                "seconds",
            ),
        }
    }

    /// Record the per-tenant gauges derived from one tenant's assembled blocklist.
    pub(crate) fn record_tenant_blocklist(
        &self,
        tenant: &str,
        metas: &[BlockMeta],
        compacted_metas: &[CompactedBlockMeta],
    ) {
        let live_objects: u64 = metas.iter().map(|m| m.total_objects).sum();
        let live_bytes: u64 = metas.iter().map(|m| m.size_bytes).sum();
        let compacted_objects: u64 = compacted_metas.iter().map(|m| m.block.total_objects).sum();
        let compacted_bytes: u64 = compacted_metas.iter().map(|m| m.block.size_bytes).sum();

        let tenant_kv = KeyValue::new("tenant", tenant.to_string());
        let live = [tenant_kv.clone(), KeyValue::new("status", STATUS_LIVE)];
        let compacted = [tenant_kv.clone(), KeyValue::new("status", STATUS_COMPACTED)];

        self.blocklist_length
            .record_with_kvs(metas.len() as u64, &[tenant_kv]);
        self.backend_objects.record_with_kvs(live_objects, &live);
        self.backend_bytes.record_with_kvs(live_bytes, &live);
        self.backend_objects
            .record_with_kvs(compacted_objects, &compacted);
        self.backend_bytes.record_with_kvs(compacted_bytes, &compacted);
    }

    pub(crate) fn record_poll_error(&self, tenant: &str) {
        self.poll_errors
            .inc_with_kvs(&[KeyValue::new("tenant", tenant.to_string())]);
    }

    pub(crate) fn record_tenant_index_error(&self, tenant: &str) {
        self.tenant_index_errors
            .inc_with_kvs(&[KeyValue::new("tenant", tenant.to_string())]);
    }

    pub(crate) fn record_builder(&self, tenant: &str, builder: bool) {
        self.tenant_index_builder
            .record_with_kvs(builder as u64, &[KeyValue::new("tenant", tenant.to_string())]);
    }

    pub(crate) fn record_index_age(&self, tenant: &str, age: Duration) {
        self.tenant_index_age
            .record_with_kvs(age.as_secs(), &[KeyValue::new("tenant", tenant.to_string())]);
    }

    pub(crate) fn record_poll_duration(&self, seconds: f64) {
        self.poll_duration.record(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an exporter installed the global meter is a no-op; recording must
    // still be safe so the poller can run unconditionally instrumented.
    #[test]
    fn recording_against_the_noop_meter_is_harmless() {
        let metrics = PollerMetrics::new(&monitoring::telemetry::metrics::meter());
        metrics.record_tenant_blocklist("t1", &[], &[]);
        metrics.record_poll_error("t1");
        metrics.record_tenant_index_error("t1");
        metrics.record_builder("t1", true);
        metrics.record_index_age("t1", Duration::from_secs(30));
        metrics.record_poll_duration(1.5);
    }
}
