use std::sync::atomic::{AtomicU64, Ordering};

/// Write-only counters logged at a fixed interval. Nothing in the operator
/// depends on these being delivered anywhere.
#[derive(Debug, Default)]
pub struct Metrics {
    pub pods_intercepted: AtomicU64,
    pub admission_errors: AtomicU64,
    pub remote_creates: AtomicU64,
    pub remote_teardowns: AtomicU64,
    pub transient_retries: AtomicU64,
    pub teardown_failures: AtomicU64,
}

impl Metrics {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> String {
        format!(
            "intercepted={} admission_errors={} creates={} teardowns={} retries={} teardown_failures={}",
            self.pods_intercepted.load(Ordering::Relaxed),
            self.admission_errors.load(Ordering::Relaxed),
            self.remote_creates.load(Ordering::Relaxed),
            self.remote_teardowns.load(Ordering::Relaxed),
            self.transient_retries.load(Ordering::Relaxed),
            self.teardown_failures.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let metrics = Metrics::default();

        Metrics::increment(&metrics.pods_intercepted);
        Metrics::increment(&metrics.pods_intercepted);
        Metrics::increment(&metrics.teardown_failures);

        let snapshot = metrics.snapshot();
        assert!(snapshot.contains("intercepted=2"));
        assert!(snapshot.contains("teardown_failures=1"));
    }
}
