//! Pipeline metrics
//!
//! Lightweight atomic counters shared across the runner, the handlers, and
//! the execution engine, rendered in Prometheus text format on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared pipeline counters
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Records consumed and translated
    pub records_processed: AtomicU64,
    /// Records skipped by the tolerance policy
    pub records_skipped: AtomicU64,
    /// Records routed to the dead-letter topic
    pub records_dead_lettered: AtomicU64,
    /// Batches committed to the graph
    pub batches_committed: AtomicU64,
    /// Batch attempts retried after a transient failure
    pub batches_retried: AtomicU64,
    /// Batches that failed permanently
    pub batches_failed: AtomicU64,
    /// Statement invocations issued (post-chunking)
    pub statements_executed: AtomicU64,
    /// Change events dropped because no qualifying constraint was present
    pub cdc_dropped_no_constraint: AtomicU64,
}

impl PipelineMetrics {
    /// Create a shared metrics handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Increment a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by a given amount
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, counter) in [
            ("records_processed_total", &self.records_processed),
            ("records_skipped_total", &self.records_skipped),
            ("records_dead_lettered_total", &self.records_dead_lettered),
            ("batches_committed_total", &self.batches_committed),
            ("batches_retried_total", &self.batches_retried),
            ("batches_failed_total", &self.batches_failed),
            ("statements_executed_total", &self.statements_executed),
            (
                "cdc_dropped_no_constraint_total",
                &self.cdc_dropped_no_constraint,
            ),
        ] {
            out.push_str(&format!(
                "# TYPE neo4j_connect_{name} counter\nneo4j_connect_{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_render() {
        let metrics = PipelineMetrics::shared();
        PipelineMetrics::add(&metrics.records_processed, 5);
        PipelineMetrics::incr(&metrics.batches_committed);

        let text = metrics.render();
        assert!(text.contains("neo4j_connect_records_processed_total 5"));
        assert!(text.contains("neo4j_connect_batches_committed_total 1"));
        assert!(text.contains("cdc_dropped_no_constraint_total 0"));
    }
}
