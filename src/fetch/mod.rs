pub mod transport;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::MetricsRecorder;
use crate::models::{PoolEntry, RequestMetric};
use crate::pool::Pool;

pub use transport::{ReqwestTransport, Transport, TransportResponse};

/// The result of a successful fetch: response body, the proxy that won (if
/// any), and the total number of attempts taken.
pub struct FetchOutcome {
    pub body: bytes::Bytes,
    pub proxy_id: Option<i64>,
    pub attempt_count: u32,
}

/// Exponential-backoff retry loop that acquires a proxy per attempt,
/// excludes proxies already failed this request, and falls back to a direct
/// connection on the final attempt.
pub struct Executor<T: Transport = ReqwestTransport> {
    transport: T,
    config: FetchConfig,
    permits: Arc<Semaphore>,
}

impl Executor<ReqwestTransport> {
    pub fn new(config: FetchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Executor {
            transport: ReqwestTransport,
            config,
            permits,
        }
    }
}

impl<T: Transport> Executor<T> {
    pub fn with_transport(transport: T, config: FetchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Executor {
            transport,
            config,
            permits,
        }
    }

    #[instrument(skip(self, pool, metrics))]
    pub async fn fetch(
        &self,
        url: &str,
        use_proxy: bool,
        pool: Option<&Pool>,
        metrics: &MetricsRecorder,
    ) -> Result<FetchOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("fetch semaphore is never closed");

        let request_id = Uuid::new_v4().to_string();
        let mut tried: HashSet<i64> = HashSet::new();
        let max_retries = self.config.proxy_retry_count;
        let start = Instant::now();
        let mut last_error: Option<Error> = None;

        for attempt in 0..=max_retries {
            let force_direct = attempt == max_retries;

            let entry: Option<PoolEntry> = if use_proxy && !force_direct {
                match pool {
                    Some(pool) => pool.acquire(&tried).await,
                    None => None,
                }
            } else {
                None
            };

            let proxy_connect_url = entry.as_ref().map(|e| e.connect_url.as_str());

            let attempt_result = self
                .transport
                .get(
                    url,
                    proxy_connect_url,
                    self.config.connect_timeout,
                    self.config.request_timeout,
                    &self.config.user_agent,
                    self.config.max_content_length_bytes,
                )
                .await;

            match attempt_result {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    if let (Some(pool), Some(e)) = (pool, entry) {
                        let proxy_id = e.id;
                        pool.release(e, true);
                        let outcome = FetchOutcome {
                            body: resp.body,
                            proxy_id: Some(proxy_id),
                            attempt_count: attempt + 1,
                        };
                        self.record(metrics, &request_id, url, true, start, Some(proxy_id), None, outcome.attempt_count, Some(outcome.body.len() as u64)).await;
                        return Ok(outcome);
                    }
                    let outcome = FetchOutcome {
                        attempt_count: attempt + 1,
                        proxy_id: None,
                        body: resp.body,
                    };
                    self.record(metrics, &request_id, url, true, start, None, None, outcome.attempt_count, Some(outcome.body.len() as u64)).await;
                    return Ok(outcome);
                }
                Ok(resp) => {
                    let err = Error::HttpError {
                        status: resp.status,
                        message: format!("unexpected status {}", resp.status),
                    };
                    let kind = err.kind();
                    let used_proxy_id = entry.as_ref().map(|e| e.id);

                    if let (Some(pool), Some(e)) = (pool, entry) {
                        tried.insert(e.id);
                        pool.release(e, false);
                    }

                    if !kind.is_retryable() {
                        self.record(metrics, &request_id, url, false, start, used_proxy_id, Some(kind), attempt + 1, None).await;
                        return Err(err);
                    }

                    last_error = Some(err);
                    self.backoff(attempt).await;
                }
                Err(e) => {
                    let used_proxy_id = entry.as_ref().map(|entry| entry.id);

                    if let (Some(pool), Some(entry)) = (pool, entry) {
                        tried.insert(entry.id);
                        pool.release(entry, false);
                    }

                    let kind = e.kind();
                    if !kind.is_retryable() {
                        self.record(metrics, &request_id, url, false, start, used_proxy_id, Some(kind), attempt + 1, None).await;
                        return Err(e);
                    }

                    last_error = Some(e);
                    self.backoff(attempt).await;
                }
            }
        }

        let attempts = max_retries + 1;
        let last_kind = last_error.as_ref().map(|e| e.kind());
        let message = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.record(metrics, &request_id, url, false, start, None, last_kind, attempts, None).await;

        Err(Error::AllAttemptsFailed {
            attempts,
            last_error: message,
        })
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.config.backoff_base * (attempt + 1);
        tokio::time::sleep(delay).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        metrics: &MetricsRecorder,
        request_id: &str,
        url: &str,
        success: bool,
        start: Instant,
        proxy_id: Option<i64>,
        error_kind: Option<ErrorKind>,
        attempt_count: u32,
        content_length: Option<u64>,
    ) {
        if !success {
            warn!(request_id, url, attempt_count, "fetch failed");
        }
        metrics
            .record(RequestMetric {
                timestamp: Utc::now(),
                request_id: request_id.to_string(),
                url: url.to_string(),
                method: "GET".to_string(),
                success,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                proxy_id,
                error_kind: error_kind.map(|k| k.as_str().to_string()),
                content_length,
                attempt_count,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::config::MetricsConfig as RecorderConfig;
    use crate::models::{Proxy, ProxyScheme};
    use crate::store::{ConnectionCheck, ProxyStoreBackend, Store, StoreStats, TableProbe};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn fetch_config() -> FetchConfig {
        FetchConfig {
            proxy_retry_count: 3,
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            max_content_length_bytes: 10_485_760,
            worker_pool_size: 10,
            user_agent: "test-agent".to_string(),
        }
    }

    fn test_metrics() -> MetricsRecorder {
        MetricsRecorder::new_in_memory(RecorderConfig {
            max_memory_entries: 1000,
            memory_retention_hours: 24,
            db_retention_days: 30,
            db_path: ":memory:".to_string(),
        })
    }

    struct ScriptedTransport {
        responses: Mutex<std::collections::VecDeque<Result<TransportResponse>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse>>) -> Self {
            ScriptedTransport {
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            _url: &str,
            _proxy_connect_url: Option<&str>,
            _connect_timeout: Duration,
            _request_timeout: Duration,
            _user_agent: &str,
            _max_content_length: u64,
        ) -> Result<TransportResponse> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse { status: 200, body: bytes::Bytes::from("") }))
        }
    }

    fn ok(body: &str) -> Result<TransportResponse> {
        Ok(TransportResponse {
            status: 200,
            body: bytes::Bytes::from(body.to_string()),
        })
    }

    fn http_status(status: u16) -> Result<TransportResponse> {
        Ok(TransportResponse {
            status,
            body: bytes::Bytes::new(),
        })
    }

    fn connection_error() -> Result<TransportResponse> {
        Err(Error::ConnectionError("refused".to_string()))
    }

    fn proxy(id: i64) -> Proxy {
        Proxy {
            id,
            address: "10.0.0.1".to_string(),
            port: 8080,
            scheme: "http".to_string(),
            username: None,
            password: None,
            status: "active".to_string(),
            error_count: 0,
            success_count: 0,
            last_used: None,
            last_tested: None,
            response_time_ms: None,
            country: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    struct FakeBackend {
        proxies: Mutex<Vec<Proxy>>,
    }

    #[async_trait]
    impl ProxyStoreBackend for FakeBackend {
        async fn test_connection(&self) -> Result<ConnectionCheck> {
            Ok(ConnectionCheck { ok: true, message: "ok".into() })
        }
        async fn probe_proxies_table(&self) -> Result<TableProbe> {
            Ok(TableProbe { ok: true, message: "ok".into(), active_count: 0 })
        }
        async fn probe_schema_features(&self) -> Result<()> {
            Ok(())
        }
        async fn fetch_active(&self, limit: i64) -> Result<Vec<Proxy>> {
            Ok(self.proxies.lock().iter().take(limit as usize).cloned().collect())
        }
        async fn increment_error(&self, _id: i64) -> Result<(i32, String)> {
            Ok((1, "active".to_string()))
        }
        async fn mark_last_used(&self, _id: i64) -> Result<()> {
            Ok(())
        }
        async fn reset_errors(&self, _max_error_count: i32) -> Result<u64> {
            Ok(0)
        }
        async fn stats(&self) -> Result<StoreStats> {
            Ok(StoreStats::default())
        }
    }

    fn test_pool(proxy_ids: &[i64]) -> Pool {
        let backend = Arc::new(FakeBackend {
            proxies: Mutex::new(proxy_ids.iter().map(|id| proxy(*id)).collect()),
        });
        let store = Arc::new(Store::new(
            backend,
            CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
            },
        ));
        Pool::new(
            store,
            crate::config::PoolConfig {
                proxy_pool_size: 50,
                min_proxy_pool_size: 10,
                refresh_interval: Duration::from_secs(300),
                batch_update_interval: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn happy_path_no_proxy() {
        let transport = ScriptedTransport::new(vec![ok("OK")]);
        let executor = Executor::with_transport(transport, fetch_config());
        let metrics = test_metrics();

        let outcome = executor
            .fetch("http://example.test/a", false, None, &metrics)
            .await
            .unwrap();

        assert_eq!(outcome.body, bytes::Bytes::from("OK"));
        assert_eq!(outcome.proxy_id, None);
        assert_eq!(outcome.attempt_count, 1);
    }

    #[tokio::test]
    async fn proxy_succeeds_on_second_attempt() {
        let pool = test_pool(&[1, 2, 3]);
        pool.force_refresh().await.unwrap();

        let transport = ScriptedTransport::new(vec![connection_error(), ok("page")]);
        let executor = Executor::with_transport(transport, fetch_config());
        let metrics = test_metrics();

        let outcome = executor
            .fetch("http://example.test/a", true, Some(&pool), &metrics)
            .await
            .unwrap();

        assert_eq!(outcome.body, bytes::Bytes::from("page"));
        assert_eq!(outcome.attempt_count, 2);
        assert!(outcome.proxy_id.is_some());
    }

    #[tokio::test]
    async fn all_proxies_fail_direct_fallback_wins() {
        let pool = test_pool(&[1, 2, 3]);
        pool.force_refresh().await.unwrap();

        let transport = ScriptedTransport::new(vec![
            connection_error(),
            connection_error(),
            connection_error(),
            ok("direct-body"),
        ]);
        let executor = Executor::with_transport(transport, fetch_config());
        let metrics = test_metrics();

        let outcome = executor
            .fetch("http://example.test/a", true, Some(&pool), &metrics)
            .await
            .unwrap();

        assert_eq!(outcome.body, bytes::Bytes::from("direct-body"));
        assert_eq!(outcome.proxy_id, None);
        assert_eq!(outcome.attempt_count, 4);
        assert_eq!(pool.snapshot().fail_set_size, 3);
    }

    #[tokio::test]
    async fn client_error_terminates_immediately() {
        let pool = test_pool(&[1]);
        pool.force_refresh().await.unwrap();

        let transport = ScriptedTransport::new(vec![http_status(404)]);
        let executor = Executor::with_transport(transport, fetch_config());
        let metrics = test_metrics();

        let result = executor
            .fetch("http://example.test/a", true, Some(&pool), &metrics)
            .await;

        assert!(result.is_err());
        match result.unwrap_err() {
            Error::HttpError { status, .. } => assert_eq!(status, 404),
            other => panic!("expected HttpError, got {other:?}"),
        }
        assert_eq!(pool.snapshot().fail_set_size, 1);
    }

    #[tokio::test]
    async fn server_error_retries_then_succeeds() {
        let pool = test_pool(&[1, 2]);
        pool.force_refresh().await.unwrap();

        let transport = ScriptedTransport::new(vec![http_status(503), ok("recovered")]);
        let executor = Executor::with_transport(transport, fetch_config());
        let metrics = test_metrics();

        let outcome = executor
            .fetch("http://example.test/a", true, Some(&pool), &metrics)
            .await
            .unwrap();

        assert_eq!(outcome.body, bytes::Bytes::from("recovered"));
        assert_eq!(outcome.attempt_count, 2);
    }

    #[tokio::test]
    async fn last_attempt_never_uses_a_proxy() {
        let pool = test_pool(&[1]);
        pool.force_refresh().await.unwrap();

        // Every attempt including the last one fails, so max_retries + 1
        // attempts happen and the final one must have been direct.
        let transport = ScriptedTransport::new(vec![
            connection_error(),
            connection_error(),
            connection_error(),
            connection_error(),
        ]);
        let executor = Executor::with_transport(transport, fetch_config());
        let metrics = test_metrics();

        let result = executor
            .fetch("http://example.test/a", true, Some(&pool), &metrics)
            .await;

        assert!(result.is_err());
        if let Err(Error::AllAttemptsFailed { attempts, .. }) = result {
            assert_eq!(attempts, 4);
        } else {
            panic!("expected AllAttemptsFailed");
        }
    }
}
