use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Values of the last integration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SabakanSnapshot {
    pub successful: bool,
    /// Unix time of the last run; `None` before the first one.
    pub timestamp: Option<i64>,
    pub workers: BTreeMap<String, usize>,
    pub unused: usize,
}

/// Integration gauges shared with the metrics endpoint.
#[derive(Debug, Default)]
pub struct SabakanMetrics {
    inner: Mutex<SabakanSnapshot>,
}

impl SabakanMetrics {
    pub fn record_success(&self, workers: BTreeMap<String, usize>, unused: usize, now: DateTime<Utc>) {
        if let Ok(mut s) = self.inner.lock() {
            *s = SabakanSnapshot {
                successful: true,
                timestamp: Some(now.timestamp()),
                workers,
                unused,
            };
        }
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        if let Ok(mut s) = self.inner.lock() {
            s.successful = false;
            s.timestamp = Some(now.timestamp());
        }
    }

    pub fn snapshot(&self) -> SabakanSnapshot {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_keeps_last_counts() {
        let m = SabakanMetrics::default();
        assert_eq!(m.snapshot(), SabakanSnapshot::default());
        let now = Utc::now();
        m.record_success(BTreeMap::from([("cs".to_string(), 2)]), 1, now);
        m.record_failure(now);
        let s = m.snapshot();
        assert!(!s.successful);
        assert_eq!(s.timestamp, Some(now.timestamp()));
        assert_eq!(s.workers["cs"], 2);
    }
}
