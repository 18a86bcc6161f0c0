use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An immutable record of one fetch attempt's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub success: bool,
    pub duration_ms: f64,
    pub proxy_id: Option<i64>,
    pub error_kind: Option<String>,
    pub content_length: Option<u64>,
    pub attempt_count: u32,
}

/// Per-day rollup of request metrics, keyed by local calendar date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_duration_ms: f64,
    pub error_kinds: HashMap<String, u64>,
    pub proxy_usage: HashMap<String, u64>,
    pub methods_used: HashMap<String, u64>,
}

impl DailyAggregate {
    pub fn new(date: NaiveDate) -> Self {
        DailyAggregate {
            date,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_duration_ms: 0.0,
            error_kinds: HashMap::new(),
            proxy_usage: HashMap::new(),
            methods_used: HashMap::new(),
        }
    }

    /// Incorporate one metric using the incremental running-average formula:
    /// `avg' = (avg * (n - 1) + x) / n`.
    pub fn record(&mut self, metric: &RequestMetric) {
        self.total_requests += 1;
        if metric.success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        self.avg_duration_ms = ((self.avg_duration_ms * (self.total_requests - 1) as f64)
            + metric.duration_ms)
            / self.total_requests as f64;

        if let Some(kind) = &metric.error_kind {
            *self.error_kinds.entry(kind.clone()).or_insert(0) += 1;
        }

        let proxy_key = match metric.proxy_id {
            Some(id) => id.to_string(),
            None => "direct".to_string(),
        };
        *self.proxy_usage.entry(proxy_key).or_insert(0) += 1;
        *self.methods_used.entry(metric.method.clone()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(success: bool, duration_ms: f64, proxy_id: Option<i64>) -> RequestMetric {
        RequestMetric {
            timestamp: Utc::now(),
            request_id: "r1".to_string(),
            url: "http://example.test".to_string(),
            method: "GET".to_string(),
            success,
            duration_ms,
            proxy_id,
            error_kind: if success {
                None
            } else {
                Some("Timeout".to_string())
            },
            content_length: Some(10),
            attempt_count: 1,
        }
    }

    #[test]
    fn daily_aggregate_running_average() {
        let mut agg = DailyAggregate::new(Utc::now().date_naive());
        agg.record(&metric(true, 100.0, Some(1)));
        agg.record(&metric(true, 200.0, None));
        assert_eq!(agg.total_requests, 2);
        assert_eq!(agg.successful_requests, 2);
        assert!((agg.avg_duration_ms - 150.0).abs() < 1e-9);
        assert_eq!(agg.proxy_usage.get("1"), Some(&1));
        assert_eq!(agg.proxy_usage.get("direct"), Some(&1));
    }

    #[test]
    fn daily_aggregate_tracks_error_kinds() {
        let mut agg = DailyAggregate::new(Utc::now().date_naive());
        agg.record(&metric(false, 50.0, Some(2)));
        assert_eq!(agg.failed_requests, 1);
        assert_eq!(agg.error_kinds.get("Timeout"), Some(&1));
    }
}
