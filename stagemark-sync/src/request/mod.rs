//! Resilient request layer
//!
//! Every outbound call goes through [`ResilientClient`]: it derives a timeout
//! from the operation class and current link, retries transient failures with
//! exponential backoff, supports cooperative cancellation and fronts reads
//! with a stale-while-revalidate response cache.
//!
//! Timeouts are advisory. When one fires the caller stops waiting, but the
//! underlying I/O is only stopped if an [`AbortSignal`] was threaded through.

pub mod cache;
pub mod cancel;
pub mod retry;
pub mod timeout;
pub mod transport;

pub use cache::{CacheOptions, Priority};
pub use cancel::{abort_pair, cancellable, AbortHandle, AbortSignal, CancellableRequest};
pub use retry::{with_retry, RetryPolicy};
pub use timeout::{calculate_dynamic_timeout, RequestClass, TimeoutContext};
pub use transport::{HttpTransport, Method, Transport, TransportRequest};

use error_common::{sanitize_for_logging, RequestError, RequestResult};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, RequestConfig};
use crate::network::NetworkMonitor;
use cache::{Lookup, ResponseCache};
use timeout::calculate_dynamic_timeout_with;

pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    network: Arc<NetworkMonitor>,
    config: RequestConfig,
    cache: ResponseCache,
    cache_defaults: CacheOptions,
}

impl ResilientClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        network: Arc<NetworkMonitor>,
        config: RequestConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            transport,
            network,
            config,
            cache: ResponseCache::new(cache_config.max_responses, cache_config.response_retention),
            cache_defaults: CacheOptions::new(cache_config.default_ttl, cache_config.default_max_stale_age),
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Default cache options; adjust with the builder methods on [`CacheOptions`]
    pub fn cache_options(&self) -> CacheOptions {
        self.cache_defaults
    }

    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.base_delay)
    }

    /// Timeout for a call of `class`. The link speed is read from the
    /// network monitor unless `ctx` already carries one.
    pub fn timeout_for(&self, class: RequestClass, ctx: TimeoutContext) -> Duration {
        let ctx = TimeoutContext {
            speed: ctx.speed.or_else(|| Some(self.network.network_speed())),
            ..ctx
        };
        calculate_dynamic_timeout_with(
            self.config.base_timeout(class),
            &ctx,
            self.config.min_retry_timeout,
            self.config.max_timeout,
        )
    }

    /// Race `fut` against the derived timeout
    pub async fn request<T, Fut>(&self, class: RequestClass, ctx: TimeoutContext, fut: Fut) -> RequestResult<T>
    where
        Fut: Future<Output = RequestResult<T>>,
    {
        let limit = self.timeout_for(class, ctx);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(?class, timeout_ms = duration_ms(limit), "Request timed out");
                Err(RequestError::Timeout(limit))
            }
        }
    }

    pub async fn with_retry<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> RequestResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RequestResult<T>>,
    {
        with_retry(policy, op).await
    }

    pub fn cancellable<T, F, Fut>(&self, f: F) -> CancellableRequest<T>
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = RequestResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        cancellable(f)
    }

    /// Run every future concurrently under one shared deadline. Results keep
    /// input order; futures still pending at the deadline yield `Timeout`.
    pub async fn parallel<T, Fut>(&self, futures: Vec<Fut>, limit: Duration) -> Vec<RequestResult<T>>
    where
        Fut: Future<Output = RequestResult<T>>,
    {
        let deadline = tokio::time::Instant::now() + limit;
        join_all(futures.into_iter().map(|fut| async move {
            match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(RequestError::Timeout(limit)),
            }
        }))
        .await
    }

    /// Run futures in consecutive batches of `concurrency`. With `fail_fast`
    /// no further batch is started once a batch contains an error, so the
    /// returned vector may be shorter than the input.
    pub async fn batch<T, Fut>(&self, futures: Vec<Fut>, concurrency: usize, fail_fast: bool) -> Vec<RequestResult<T>>
    where
        Fut: Future<Output = RequestResult<T>>,
    {
        let concurrency = concurrency.max(1);
        let mut pending = futures.into_iter();
        let mut results = Vec::new();

        loop {
            let chunk: Vec<Fut> = pending.by_ref().take(concurrency).collect();
            if chunk.is_empty() {
                break;
            }

            let outcome = join_all(chunk).await;
            let failed = outcome.iter().any(Result::is_err);
            results.extend(outcome);

            if fail_fast && failed {
                tracing::debug!(completed = results.len(), "Batch stopped after failure");
                break;
            }
        }

        results
    }

    /// Send through the transport with the default retry policy
    pub async fn send(&self, request: &TransportRequest, class: RequestClass) -> RequestResult<Value> {
        self.send_with_policy(request, class, &self.default_retry_policy(), AbortSignal::never())
            .await
    }

    /// Send with an explicit retry policy and abort signal. Each attempt gets
    /// its own timeout, shortened as the attempt number grows.
    pub async fn send_with_policy(
        &self,
        request: &TransportRequest,
        class: RequestClass,
        policy: &RetryPolicy,
        signal: AbortSignal,
    ) -> RequestResult<Value> {
        let payload_bytes = request.payload_bytes();
        with_retry(policy, |attempt| {
            let signal = signal.clone();
            let ctx = TimeoutContext {
                retry_count: attempt,
                speed: None,
                payload_bytes,
            };
            async move {
                if signal.is_aborted() {
                    return Err(RequestError::Cancelled);
                }
                self.request(class, ctx, self.transport.send(request, signal)).await
            }
        })
        .await
    }

    /// Stale-while-revalidate read.
    ///
    /// A value younger than `ttl` is returned as is. One older than `ttl` but
    /// younger than the stale window is returned immediately and refreshed in
    /// the background. Otherwise `fetch` runs (with retry and timeout) and
    /// its result is stored. Concurrent callers for the same key share one
    /// fetch.
    pub async fn cached_request<F, Fut>(self: &Arc<Self>, key: &str, options: CacheOptions, fetch: F) -> RequestResult<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestResult<Value>> + Send + 'static,
    {
        if !options.force_refresh {
            match self.cache.lookup(key, options.ttl, options.effective_max_stale_age()).await {
                Lookup::Fresh(value) => {
                    tracing::trace!(key, "Response cache hit");
                    return Ok(value);
                }
                Lookup::Stale(value) => {
                    tracing::debug!(key, "Serving stale response, revalidating");
                    let client = Arc::clone(self);
                    let key = key.to_string();
                    let fetch = Arc::new(fetch);
                    tokio::spawn(async move {
                        if let Err(e) = client.fetch_shared(&key, options, fetch).await {
                            tracing::warn!(
                                key = %key,
                                kind = e.kind(),
                                error = %sanitize_for_logging(&e.to_string()),
                                "Background revalidation failed"
                            );
                        }
                    });
                    return Ok(value);
                }
                Lookup::Missing => {}
            }
        }

        self.fetch_shared(key, options, Arc::new(fetch)).await
    }

    async fn fetch_shared<F, Fut>(self: &Arc<Self>, key: &str, options: CacheOptions, fetch: Arc<F>) -> RequestResult<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestResult<Value>> + Send + 'static,
    {
        let shared = self.cache.join_or_start(key, || {
            let client = Arc::clone(self);
            let key = key.to_string();
            let policy = options.retry_policy(&self.default_retry_policy());
            async move {
                let result = with_retry(&policy, |attempt| {
                    client.request(RequestClass::ReadHeavy, TimeoutContext::retry(attempt), fetch())
                })
                .await;
                if let Ok(value) = &result {
                    client.cache.store(&key, value.clone()).await;
                }
                client.cache.finish(&key);
                result
            }
            .boxed()
            .shared()
        });

        shared.await
    }

    /// Drop one cached response
    pub async fn invalidate(&self, key: &str) -> bool {
        self.cache.invalidate(key).await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub async fn cached_len(&self) -> u64 {
        self.cache.len().await
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport replaying scripted responses and recording every request
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<RequestResult<Value>>>,
        fallback: Mutex<Option<RequestResult<Value>>>,
        pub sent: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, response: RequestResult<Value>) {
            self.responses.lock().push_back(response);
        }

        /// Response used once the script is exhausted
        pub fn always(&self, response: RequestResult<Value>) {
            *self.fallback.lock() = Some(response);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &TransportRequest, _signal: AbortSignal) -> RequestResult<Value> {
            self.sent.lock().push(request.clone());
            if let Some(response) = self.responses.lock().pop_front() {
                return response;
            }
            self.fallback
                .lock()
                .clone()
                .unwrap_or_else(|| Ok(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client_with(transport: Arc<ScriptedTransport>) -> Arc<ResilientClient> {
        let config = RequestConfig {
            base_delay: Duration::from_millis(10),
            ..RequestConfig::default()
        };
        Arc::new(ResilientClient::new(
            transport,
            Arc::new(NetworkMonitor::new(true)),
            config,
            &CacheConfig::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let result: RequestResult<()> = client
            .request(RequestClass::Default, TimeoutContext::default(), async {
                tokio::time::sleep(Duration::from_secs(120)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(RequestError::Timeout(d)) if d <= Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_server_errors() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Err(RequestError::from_status(503, "unavailable")));
        transport.push(Ok(json!({"id": "C1"})));
        let client = client_with(transport.clone());

        let body = client
            .send(&TransportRequest::post("/comments", json!({"text": "hi"})), RequestClass::WriteHeavy)
            .await
            .unwrap();

        assert_eq!(body["id"], "C1");
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_send_honours_aborted_signal() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client_with(transport.clone());
        let (handle, signal) = abort_pair();
        handle.abort();

        let result = client
            .send_with_policy(&TransportRequest::get("/sessions"), RequestClass::Default, &RetryPolicy::none(), signal)
            .await;

        assert_eq!(result, Err(RequestError::Cancelled));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_shares_deadline() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let fast = async { Ok::<_, RequestError>(1) }.boxed();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(2)
        }
        .boxed();

        let results = client.parallel(vec![fast, slow], Duration::from_secs(1)).await;
        assert_eq!(results[0], Ok(1));
        assert!(matches!(results[1], Err(RequestError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_batch_fail_fast_stops_issuing() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let started = Arc::new(AtomicU32::new(0));

        let futures: Vec<_> = (0..6)
            .map(|i| {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        Err(RequestError::from_status(400, "bad"))
                    } else {
                        Ok(i)
                    }
                }
                .boxed()
            })
            .collect();

        let results = client.batch(futures, 2, true).await;
        assert_eq!(results.len(), 2);
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_without_fail_fast_runs_everything() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let futures: Vec<_> = (0..5)
            .map(|i| async move { if i % 2 == 0 { Ok(i) } else { Err(RequestError::Network("x".into())) } }.boxed())
            .collect();

        let results = client.batch(futures, 2, false).await;
        assert_eq!(results.len(), 5);
        assert_eq!(results[4], Ok(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_request_serves_fresh_value() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let options = CacheOptions::new(Duration::from_secs(60), Duration::from_secs(600));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = client
                .cached_request("sessions", options, move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(["S1"]))
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, json!(["S1"]));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_request_revalidates_stale_value() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let version = Arc::new(AtomicU32::new(0));
        let options = CacheOptions::new(Duration::from_secs(10), Duration::from_secs(600));

        let fetch = {
            let version = version.clone();
            move || {
                let version = version.clone();
                async move { Ok(json!(version.fetch_add(1, Ordering::SeqCst))) }
            }
        };

        assert_eq!(client.cached_request("k", options, fetch.clone()).await.unwrap(), json!(0));

        tokio::time::advance(Duration::from_secs(20)).await;
        // Stale value served at once, refresh happens in the background
        assert_eq!(client.cached_request("k", options, fetch.clone()).await.unwrap(), json!(0));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(client.cached_request("k", options, fetch).await.unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_request_expired_value_is_refetched() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let options = CacheOptions::new(Duration::from_secs(10), Duration::from_secs(30));

        let fetch = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) }
            }
        };

        client.cached_request("k", options, fetch.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(client.cached_request("k", options, fetch).await.unwrap(), json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cached_requests_share_fetch() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let options = client.cache_options();

        let fetch = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("shared"))
                }
            }
        };

        let (a, b) = tokio::join!(
            client.cached_request("templates", options, fetch.clone()),
            client.cached_request("templates", options, fetch)
        );

        assert_eq!(a.unwrap(), json!("shared"));
        assert_eq!(b.unwrap(), json!("shared"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_request_errors_are_not_swallowed() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let options = client.cache_options().with_priority(Priority::Low);

        let result = client
            .cached_request("evaluations", options, || async { Err(RequestError::from_status(404, "missing")) })
            .await;

        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(client.cached_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_and_invalidate() {
        let client = client_with(Arc::new(ScriptedTransport::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let options = client.cache_options();

        let fetch = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move { Ok(json!(calls.fetch_add(1, Ordering::SeqCst))) }
            }
        };

        client.cached_request("k", options, fetch.clone()).await.unwrap();
        assert_eq!(
            client.cached_request("k", options.force_refresh(), fetch.clone()).await.unwrap(),
            json!(1)
        );

        assert!(client.invalidate("k").await);
        assert_eq!(client.cached_request("k", options, fetch).await.unwrap(), json!(2));

        client.clear_cache();
        assert_eq!(client.cached_len().await, 0);
    }
}
