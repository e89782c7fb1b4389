//! Request interception.
//!
//! [`CacheInterceptor`] decorates a [`RequestExecutor`]: it snapshots the
//! outbound request, runs it, and hands back a tapped response stream that
//! the caller consumes exactly as it would the original. Once the caller
//! has seen end-of-stream, a background task (optionally) completes the
//! extracted usage from the generation metadata endpoint, folds it into the
//! shared [`SessionAggregator`], and passes it to the host's
//! [`UsagePersistence`] hook. [`CacheInterceptor::settle`] waits for that
//! work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use cachelens_core::{PersistedUsage, RequestDescriptor, UsageRecord};
use cachelens_diagnosis::RequestSnapshot;
use cachelens_stream::{
    ByteStream, MetadataClient, StreamError, TapMode, TapOutcome, TapSink, tap_stream,
};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::aggregator::SessionAggregator;

/// Something that performs the actual HTTP request.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Execute the request and return its response body as a byte stream.
    async fn execute(&self, request: &RequestDescriptor) -> cachelens_stream::Result<ByteStream>;
}

/// Host hook that stores usage on the latest non-user message.
#[async_trait]
pub trait UsagePersistence: Send + Sync {
    async fn persist(&self, usage: PersistedUsage);
}

/// Source of dispatch timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Decorates a [`RequestExecutor`] with cache observation.
pub struct CacheInterceptor<E> {
    executor: E,
    aggregator: Arc<Mutex<SessionAggregator>>,
    metadata: Option<MetadataClient>,
    persistence: Option<Arc<dyn UsagePersistence>>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<InFlight>,
}

impl<E: RequestExecutor> CacheInterceptor<E> {
    pub fn new(executor: E, aggregator: Arc<Mutex<SessionAggregator>>) -> Self {
        Self {
            executor,
            aggregator,
            metadata: None,
            persistence: None,
            clock: Arc::new(SystemClock),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Replace the clock used to timestamp request snapshots.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Recover zeroed cache counters from the generation endpoint.
    pub fn with_metadata(mut self, client: MetadataClient) -> Self {
        self.metadata = client.is_enabled().then_some(client);
        self
    }

    /// Forward each accepted usage record to the host.
    pub fn with_persistence(mut self, persistence: Arc<dyn UsagePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Shared aggregator handle.
    pub fn aggregator(&self) -> Arc<Mutex<SessionAggregator>> {
        Arc::clone(&self.aggregator)
    }

    /// Number of observed responses whose stream is still alive or whose
    /// usage has not been recorded yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait until every observed response has been recorded or abandoned.
    pub async fn settle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Execute a request, observing its response.
    ///
    /// Requests without a message list are forwarded untouched. Executor
    /// errors are returned as is; nothing is retried.
    pub async fn execute(&self, request: &RequestDescriptor) -> cachelens_stream::Result<ByteStream> {
        if !request.has_messages() {
            trace!(url = %request.url, "request has no messages; not observed");
            return self.executor.execute(request).await;
        }

        let snapshot = RequestSnapshot::capture(request, self.clock.now());
        let request_model = request.model().map(str::to_owned);
        let mode = if request.is_stream() {
            TapMode::EventStream
        } else {
            TapMode::JsonBody
        };
        let dispatched = Instant::now();

        let inner = self.executor.execute(request).await?;

        debug!(
            url = %request.url,
            messages = snapshot.len(),
            stream = request.is_stream(),
            "observing response"
        );

        let sink = Arc::new(InterceptSink {
            snapshot: Mutex::new(Some(snapshot)),
            request_model,
            aggregator: Arc::clone(&self.aggregator),
            metadata: self.metadata.clone(),
            persistence: self.persistence.clone(),
            dispatched,
            _guard: InFlightGuard::acquire(Arc::clone(&self.in_flight)),
        });

        Ok(tap_stream(inner, mode, sink))
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts one observed response until its sink is dropped.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn acquire(in_flight: Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct InterceptSink {
    snapshot: Mutex<Option<RequestSnapshot>>,
    request_model: Option<String>,
    aggregator: Arc<Mutex<SessionAggregator>>,
    metadata: Option<MetadataClient>,
    persistence: Option<Arc<dyn UsagePersistence>>,
    dispatched: Instant,
    _guard: InFlightGuard,
}

impl InterceptSink {
    /// Fill in cache counters the primary response did not carry.
    async fn complete_counters(&self, mut usage: UsageRecord, generation_id: Option<&str>) -> UsageRecord {
        if usage.has_cache_counters() {
            return usage;
        }
        let (Some(metadata), Some(id)) = (&self.metadata, generation_id) else {
            return usage;
        };

        if let Some(counters) = metadata.fetch_cache_counters(id).await {
            usage.cache_read_input_tokens = counters.cache_read_input_tokens;
            usage.cache_creation_input_tokens = counters.cache_creation_input_tokens;
        }
        usage
    }
}

#[async_trait]
impl TapSink for InterceptSink {
    async fn on_complete(&self, outcome: TapOutcome) {
        let Some(mut usage) = outcome.usage else {
            debug!(bytes = outcome.bytes, frames = outcome.frames, "response carried no usage");
            return;
        };
        if usage.model.is_empty() {
            if let Some(model) = &self.request_model {
                usage.model = model.clone();
            }
        }
        if !usage.is_claude() {
            trace!(model = %usage.model, "skipping non-Claude usage");
            return;
        }
        let Some(snapshot) = self.snapshot.lock().await.take() else {
            return;
        };

        let usage = self
            .complete_counters(usage, outcome.generation_id.as_deref())
            .await;
        let persisted = usage.persisted();
        let response_time_ms = self.dispatched.elapsed().as_millis() as u64;

        {
            let mut aggregator = self.aggregator.lock().await;
            aggregator.process(usage, snapshot, response_time_ms);
        }

        if let Some(persistence) = &self.persistence {
            persistence.persist(persisted).await;
        }
    }

    async fn on_failed(&self, error: &StreamError) {
        debug!(error = %error, "response failed; request abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SessionConfig;
    use bytes::Bytes;
    use cachelens_cost::PriceTable;
    use cachelens_diagnosis::MissDiagnoser;
    use futures_util::{StreamExt, stream};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    struct CannedExecutor {
        body: &'static str,
    }

    #[async_trait]
    impl RequestExecutor for CannedExecutor {
        async fn execute(&self, _request: &RequestDescriptor) -> cachelens_stream::Result<ByteStream> {
            let chunks: Vec<cachelens_stream::Result<Bytes>> = self
                .body
                .as_bytes()
                .chunks(16)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl RequestExecutor for FailingExecutor {
        async fn execute(&self, _request: &RequestDescriptor) -> cachelens_stream::Result<ByteStream> {
            Err(StreamError::Execution("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct RecordingPersistence {
        saved: std::sync::Mutex<Vec<PersistedUsage>>,
    }

    #[async_trait]
    impl UsagePersistence for RecordingPersistence {
        async fn persist(&self, usage: PersistedUsage) {
            self.saved.lock().unwrap().push(usage);
        }
    }

    const HIT_STREAM: &str = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1,\"cache_read_input_tokens\":4000,\"cache_creation_input_tokens\":0}}}\n\nevent: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":64}}\n\n";

    const GATEWAY_STREAM: &str = "data: {\"id\":\"gen-77\",\"model\":\"anthropic/claude-sonnet-4.5\",\"choices\":[],\"usage\":{\"prompt_tokens\":5000,\"completion_tokens\":40}}\n\ndata: [DONE]\n\n";

    fn shared_aggregator() -> Arc<Mutex<SessionAggregator>> {
        Arc::new(Mutex::new(SessionAggregator::new(
            SessionConfig::default(),
            PriceTable::default(),
            MissDiagnoser::default(),
        )))
    }

    fn chat_request(stream: bool) -> RequestDescriptor {
        RequestDescriptor::new(
            "https://api.anthropic.com/v1/messages",
            json!({
                "model": "claude-sonnet-4-5",
                "stream": stream,
                "messages": [{"role": "user", "content": "hello"}]
            }),
        )
    }

    #[tokio::test]
    async fn test_stream_observed_and_persisted() {
        let persistence = Arc::new(RecordingPersistence::default());
        let interceptor = CacheInterceptor::new(CannedExecutor { body: HIT_STREAM }, shared_aggregator())
            .with_persistence(persistence.clone());

        let tapped = interceptor.execute(&chat_request(true)).await.unwrap();
        assert_eq!(interceptor.in_flight(), 1);

        let bytes: Vec<u8> = tapped
            .map(|c| c.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(bytes, HIT_STREAM.as_bytes());

        interceptor.settle().await;
        assert_eq!(interceptor.in_flight(), 0);

        let aggregator = interceptor.aggregator();
        let agg = aggregator.lock().await;
        assert_eq!(agg.stats().cache_hits, 1);
        assert_eq!(agg.history().latest().unwrap().usage.output_tokens, 64);

        let saved = persistence.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].cache_read_input_tokens, 4000);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_in_flight() {
        let interceptor = CacheInterceptor::new(CannedExecutor { body: HIT_STREAM }, shared_aggregator());
        let mut tapped = interceptor.execute(&chat_request(true)).await.unwrap();
        let _ = tapped.next().await;
        assert_eq!(interceptor.in_flight(), 1);
        drop(tapped);
        assert_eq!(interceptor.in_flight(), 0);

        let aggregator = interceptor.aggregator();
        assert_eq!(aggregator.lock().await.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn test_executor_error_propagates() {
        let interceptor = CacheInterceptor::new(FailingExecutor, shared_aggregator());
        let result = interceptor.execute(&chat_request(true)).await;
        assert!(matches!(result, Err(StreamError::Execution(_))));
        assert_eq!(interceptor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_without_messages_not_observed() {
        let interceptor = CacheInterceptor::new(CannedExecutor { body: HIT_STREAM }, shared_aggregator());
        let request = RequestDescriptor::new("https://example.test/v1/models", json!({}));
        let tapped = interceptor.execute(&request).await.unwrap();
        assert_eq!(interceptor.in_flight(), 0);
        let _ = tapped.collect::<Vec<_>>().await;
        interceptor.settle().await;

        let aggregator = interceptor.aggregator();
        assert_eq!(aggregator.lock().await.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn test_metadata_fills_missing_counters() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/generation"))
            .and(matchers::query_param("id", "gen-77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"native_tokens_cached": 4800, "cache_creation_input_tokens": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata =
            MetadataClient::new(server.uri(), Some("or-key".into()), Duration::from_secs(2)).unwrap();
        let interceptor = CacheInterceptor::new(CannedExecutor { body: GATEWAY_STREAM }, shared_aggregator())
            .with_metadata(metadata);

        let tapped = interceptor.execute(&chat_request(true)).await.unwrap();
        let _ = tapped.collect::<Vec<_>>().await;
        interceptor.settle().await;

        let aggregator = interceptor.aggregator();
        let agg = aggregator.lock().await;
        let entry = agg.history().latest().unwrap();
        assert!(entry.cache_hit);
        assert_eq!(entry.usage.cache_read_input_tokens, 4800);
    }

    #[tokio::test]
    async fn test_json_body_response() {
        const BODY: &str = r#"{"id":"msg_9","type":"message","model":"claude-haiku-4-5","content":[],"usage":{"input_tokens":20,"output_tokens":5,"cache_creation_input_tokens":1500,"cache_read_input_tokens":0}}"#;
        let interceptor = CacheInterceptor::new(CannedExecutor { body: BODY }, shared_aggregator());

        let tapped = interceptor.execute(&chat_request(false)).await.unwrap();
        let _ = tapped.collect::<Vec<_>>().await;
        interceptor.settle().await;

        let aggregator = interceptor.aggregator();
        let agg = aggregator.lock().await;
        assert_eq!(agg.stats().cache_misses, 1);
        assert!(agg.history().latest().unwrap().diagnosis.as_ref().unwrap().reasons[0].contains("First request"));
    }

    #[tokio::test]
    async fn test_stream_ends_before_slow_metadata() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/generation"))
            .and(matchers::query_param("id", "gen-77"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"native_tokens_cached": 4800}}))
                    .set_delay(Duration::from_millis(1500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let metadata =
            MetadataClient::new(server.uri(), Some("or-key".into()), Duration::from_secs(5)).unwrap();
        let interceptor = CacheInterceptor::new(CannedExecutor { body: GATEWAY_STREAM }, shared_aggregator())
            .with_metadata(metadata);

        let tapped = interceptor.execute(&chat_request(true)).await.unwrap();
        let drained = tokio::time::timeout(Duration::from_millis(500), tapped.collect::<Vec<_>>()).await;
        assert!(drained.is_ok(), "consumer waited on the metadata lookup");
        assert_eq!(interceptor.in_flight(), 1);

        let aggregator = interceptor.aggregator();
        assert_eq!(aggregator.lock().await.stats().total_requests, 0);

        interceptor.settle().await;
        assert_eq!(interceptor.in_flight(), 0);
        let agg = aggregator.lock().await;
        assert_eq!(agg.history().latest().unwrap().usage.cache_read_input_tokens, 4800);
    }

    #[tokio::test]
    async fn test_usage_without_model_uses_request_model() {
        const BODY: &str = "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":900,\"completion_tokens\":12,\"prompt_tokens_details\":{\"cached_tokens\":0}}}\n\ndata: [DONE]\n\n";
        let interceptor = CacheInterceptor::new(CannedExecutor { body: BODY }, shared_aggregator());

        let tapped = interceptor.execute(&chat_request(true)).await.unwrap();
        let _ = tapped.collect::<Vec<_>>().await;
        interceptor.settle().await;

        let aggregator = interceptor.aggregator();
        let agg = aggregator.lock().await;
        assert_eq!(agg.stats().total_requests, 1);
        assert_eq!(agg.history().latest().unwrap().usage.model, "claude-sonnet-4-5");
    }
}
