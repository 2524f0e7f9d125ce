//! Prometheus metrics for the control plane.
//!
//! Metrics are registered lazily in the default registry. Handlers record
//! outcomes through the helper functions so label sets stay consistent.

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, opts, register_int_counter_vec, register_int_gauge};

static DISPATCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "castle_dispatch_total",
            "Control-plane dispatch outcomes by classification"
        ),
        &["outcome"]
    )
    .expect("register castle_dispatch_total")
});

static CROSS_SHARD_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "castle_cross_shard_calls_total",
            "Cross-shard control messages by admission group"
        ),
        &["group"]
    )
    .expect("register castle_cross_shard_calls_total")
});

static CREDENTIAL_RELOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "castle_credential_reloads_total",
            "TLS credential reload attempts by result"
        ),
        &["result"]
    )
    .expect("register castle_credential_reloads_total")
});

static SHARDS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "castle_shards_running",
        "Number of shard runtimes currently serving"
    )
    .expect("register castle_shards_running")
});

/// Record the outcome of one dispatched control operation.
pub fn record_dispatch(outcome: &str) {
    DISPATCH_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record one cross-shard message sent under the named admission group.
pub fn record_cross_shard_call(group: &str) {
    CROSS_SHARD_CALLS.with_label_values(&[group]).inc();
}

/// Record a TLS credential reload attempt.
pub fn record_credential_reload(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    CREDENTIAL_RELOADS.with_label_values(&[result]).inc();
}

/// Track the number of serving shards.
pub fn set_shards_running(n: i64) {
    SHARDS_RUNNING.set(n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_dispatch("success");
        record_dispatch("not_found");
        record_cross_shard_call("raft");
        record_credential_reload(true);
        record_credential_reload(false);
        set_shards_running(4);
    }
}
