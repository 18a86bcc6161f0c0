pub mod embedded;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::config::MetricsConfig;
use crate::error::Result;
use crate::models::{DailyAggregate, RequestMetric};

use embedded::EmbeddedStore;

const RESPONSE_TIME_WINDOW: usize = 1000;

struct Inner {
    ring: VecDeque<RequestMetric>,
    counters: HashMap<String, u64>,
    response_times: VecDeque<f64>,
    today: DailyAggregate,
}

impl Inner {
    fn new() -> Self {
        Inner {
            ring: VecDeque::new(),
            counters: HashMap::new(),
            response_times: VecDeque::new(),
            today: DailyAggregate::new(Local::now().date_naive()),
        }
    }
}

/// Last-hour window plus percentile breakdown over the response-time buffer.
#[derive(Debug, Clone, Serialize)]
pub struct RecentHour {
    pub requests: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub proxy_usage_rate: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ResponseTimeStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub rss_mb: f64,
    pub buffer_len: usize,
    pub max_memory_entries: usize,
    pub buffer_usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentStats {
    pub timestamp: DateTime<Utc>,
    pub counters: HashMap<String, u64>,
    pub recent_hour: RecentHour,
    pub response_times: ResponseTimeStats,
    pub today: DailyAggregate,
    pub memory_usage: MemoryUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlyBucket {
    pub hour: u32,
    pub requests: u64,
    pub successful: u64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalStats {
    pub daily: Vec<DailyAggregate>,
    pub hourly_today: Vec<HourlyBucket>,
    pub period_days: i64,
}

/// In-memory ring of recent request outcomes plus durable daily rollups in an
/// embedded SQLite store. The ring and counters are behind one lock, held
/// only long enough to mutate; persistence (when enabled) happens after the
/// lock is released, awaited rather than fire-and-forget.
pub struct MetricsRecorder {
    inner: Mutex<Inner>,
    config: MetricsConfig,
    store: Option<EmbeddedStore>,
}

impl MetricsRecorder {
    /// Connects the embedded SQLite store for durable daily rollups.
    pub async fn new(config: MetricsConfig) -> Result<Self> {
        let store = EmbeddedStore::connect(&config.db_path).await?;
        info!(db_path = %config.db_path, "metrics database initialized");
        Ok(MetricsRecorder {
            inner: Mutex::new(Inner::new()),
            config,
            store: Some(store),
        })
    }

    /// In-memory-only recorder, for tests and for callers that don't want
    /// durable rollups.
    pub fn new_in_memory(config: MetricsConfig) -> Self {
        MetricsRecorder {
            inner: Mutex::new(Inner::new()),
            config,
            store: None,
        }
    }

    #[instrument(skip(self, metric))]
    pub async fn record(&self, metric: RequestMetric) {
        let metric_local_date = metric.timestamp.with_timezone(&Local).date_naive();

        let rolled_over = {
            let mut inner = self.inner.lock();

            if inner.today.date != metric_local_date {
                Some(std::mem::replace(
                    &mut inner.today,
                    DailyAggregate::new(metric_local_date),
                ))
            } else {
                None
            }
        };

        if let (Some(store), Some(previous)) = (&self.store, &rolled_over) {
            if let Err(e) = store.upsert_daily(previous).await {
                warn!(error = %e, "failed to persist rolled-over daily aggregate");
            }
        }

        {
            let mut inner = self.inner.lock();

            if inner.ring.len() >= self.config.max_memory_entries {
                inner.ring.pop_front();
            }
            inner.ring.push_back(metric.clone());

            *inner.counters.entry("total_requests".to_string()).or_insert(0) += 1;
            *inner
                .counters
                .entry(if metric.success { "successful_requests" } else { "failed_requests" }.to_string())
                .or_insert(0) += 1;
            *inner
                .counters
                .entry(format!("method_{}", metric.method))
                .or_insert(0) += 1;
            *inner
                .counters
                .entry(if metric.proxy_id.is_some() { "proxy_requests" } else { "direct_requests" }.to_string())
                .or_insert(0) += 1;

            inner.response_times.push_back(metric.duration_ms);
            if inner.response_times.len() > RESPONSE_TIME_WINDOW {
                inner.response_times.pop_front();
            }

            inner.today.record(&metric);
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_raw(&metric).await {
                warn!(error = %e, "failed to persist raw request metric");
            }
            if let Err(e) = store.upsert_daily(&self.inner.lock().today.clone()).await {
                warn!(error = %e, "failed to persist today's aggregate");
            }
        }
    }

    pub fn current_stats(&self) -> CurrentStats {
        let inner = self.inner.lock();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let recent: Vec<&RequestMetric> = inner
            .ring
            .iter()
            .filter(|m| m.timestamp > cutoff)
            .collect();

        let recent_hour = if recent.is_empty() {
            RecentHour {
                requests: 0,
                success_rate: 0.0,
                avg_duration_ms: 0.0,
                proxy_usage_rate: 0.0,
            }
        } else {
            let n = recent.len() as f64;
            let successful = recent.iter().filter(|m| m.success).count() as f64;
            let proxy_used = recent.iter().filter(|m| m.proxy_id.is_some()).count() as f64;
            let total_duration: f64 = recent.iter().map(|m| m.duration_ms).sum();
            RecentHour {
                requests: recent.len() as u64,
                success_rate: successful / n * 100.0,
                avg_duration_ms: total_duration / n,
                proxy_usage_rate: proxy_used / n * 100.0,
            }
        };

        let response_times = response_time_stats(&inner.response_times);

        let memory_usage = process_memory_usage(inner.ring.len(), self.config.max_memory_entries);

        CurrentStats {
            timestamp: Utc::now(),
            counters: inner.counters.clone(),
            recent_hour,
            response_times,
            today: inner.today.clone(),
            memory_usage,
        }
    }

    pub async fn historical_stats(&self, days: i64) -> Result<HistoricalStats> {
        let daily = match &self.store {
            Some(store) => store.daily_stats_since(days).await?,
            None => Vec::new(),
        };

        let hourly_today = match &self.store {
            Some(store) => store
                .hourly_breakdown_today()
                .await?
                .into_iter()
                .map(|(hour, requests, successful, avg_duration_ms)| HourlyBucket {
                    hour,
                    requests,
                    successful,
                    avg_duration_ms,
                    success_rate: if requests > 0 {
                        successful as f64 / requests as f64 * 100.0
                    } else {
                        0.0
                    },
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(HistoricalStats {
            daily,
            hourly_today,
            period_days: days,
        })
    }

    pub async fn export(&self) -> Result<serde_json::Value> {
        let current = self.current_stats();
        let historical = self.historical_stats(30).await?;
        Ok(serde_json::json!({
            "current_stats": current,
            "historical_stats": historical,
        }))
    }

    /// Background retention: evict ring entries older than
    /// `memory_retention_hours` and, when persistence is enabled, rows older
    /// than `db_retention_days`. Runs on an hourly tick until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(std::time::Duration::from_secs(3600));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.evict_expired().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn evict_expired(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.memory_retention_hours);
        let evicted = {
            let mut inner = self.inner.lock();
            let before = inner.ring.len();
            while inner.ring.front().map(|m| m.timestamp < cutoff).unwrap_or(false) {
                inner.ring.pop_front();
            }
            before - inner.ring.len()
        };
        if evicted > 0 {
            info!(evicted, "evicted expired in-memory metrics");
        }

        if let Some(store) = &self.store {
            match store.evict_older_than(self.config.db_retention_days).await {
                Ok(n) if n > 0 => info!(rows = n, "evicted expired metrics database rows"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "metrics retention sweep failed"),
            }
        }
    }
}

fn response_time_stats(samples: &VecDeque<f64>) -> ResponseTimeStats {
    if samples.is_empty() {
        return ResponseTimeStats::default();
    }

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let sum: f64 = sorted.iter().sum();
    let avg = sum / sorted.len() as f64;

    ResponseTimeStats {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        avg,
        median: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    }
}

/// `k = (n-1) * p/100`; linear interpolation between the bracketing samples,
/// clamped at the last element. `sorted` must already be ascending.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let k = (n - 1) as f64 * (p / 100.0);
    let lo = k.floor() as usize;
    let hi = (k.ceil() as usize).min(n - 1);
    sorted[lo] + (k - lo as f64) * (sorted[hi] - sorted[lo])
}

fn process_memory_usage(buffer_len: usize, max_memory_entries: usize) -> MemoryUsage {
    let mut system = System::new_all();
    system.refresh_all();
    let pid = Pid::from_u32(std::process::id());

    let rss_mb = system
        .process(pid)
        .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
        .unwrap_or(0.0);

    MemoryUsage {
        rss_mb,
        buffer_len,
        max_memory_entries,
        buffer_usage_percent: if max_memory_entries > 0 {
            buffer_len as f64 / max_memory_entries as f64 * 100.0
        } else {
            0.0
        },
    }
}
