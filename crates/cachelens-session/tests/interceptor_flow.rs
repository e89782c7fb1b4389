//! Integration tests driving the interceptor through a multi-request session.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cachelens_core::RequestDescriptor;
use cachelens_cost::PriceTable;
use cachelens_diagnosis::{MissDiagnoser, PrimaryIssue};
use cachelens_session::{
    CacheInterceptor, RequestExecutor, SessionAggregator, SessionConfig, SessionEvent,
};
use cachelens_stream::ByteStream;
use futures_util::{StreamExt, stream};
use serde_json::json;
use tokio::sync::Mutex;

/// Replays canned SSE bodies in order.
struct ScriptedExecutor {
    responses: std::sync::Mutex<VecDeque<String>>,
}

impl ScriptedExecutor {
    fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn execute(&self, _request: &RequestDescriptor) -> cachelens_stream::Result<ByteStream> {
        let body = self.responses.lock().unwrap().pop_front().unwrap_or_default();
        let chunks: Vec<cachelens_stream::Result<Bytes>> = body
            .into_bytes()
            .chunks(23)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

fn sse(read: u64, write: u64) -> String {
    format!(
        "event: message_start\ndata: {{\"type\":\"message_start\",\"message\":{{\"id\":\"msg\",\"model\":\"claude-opus-4-5-20251101\",\"usage\":{{\"input_tokens\":30,\"output_tokens\":1,\"cache_read_input_tokens\":{read},\"cache_creation_input_tokens\":{write}}}}}}}\n\n\
         event: message_delta\ndata: {{\"type\":\"message_delta\",\"usage\":{{\"output_tokens\":120}}}}\n\n\
         event: message_stop\ndata: {{\"type\":\"message_stop\"}}\n\n"
    )
}

fn request(turns: usize, system: &str) -> RequestDescriptor {
    let mut messages = vec![json!({"role": "system", "content": system})];
    for i in 0..turns {
        messages.push(json!({"role": "user", "content": format!("question {i}")}));
        messages.push(json!({"role": "assistant", "content": format!("answer {i}")}));
    }
    messages.push(json!({"role": "user", "content": "next"}));
    RequestDescriptor::new(
        "https://api.anthropic.com/v1/messages",
        json!({"model": "claude-opus-4-5-20251101", "stream": true, "messages": messages}),
    )
}

async fn drain(stream: ByteStream) -> usize {
    stream.map(|c| c.unwrap().len()).collect::<Vec<_>>().await.iter().sum()
}

#[tokio::test]
async fn test_unstable_system_prompt_triggers_waste_warning() {
    let aggregator = Arc::new(Mutex::new(SessionAggregator::new(
        SessionConfig::default().with_threshold(3),
        PriceTable::default(),
        MissDiagnoser::default(),
    )));
    let mut events = aggregator.lock().await.subscribe();

    let executor = ScriptedExecutor::new(vec![sse(0, 5000), sse(0, 5000), sse(0, 5000)]);
    let interceptor = CacheInterceptor::new(executor, Arc::clone(&aggregator));

    // A timestamp in the system prompt changes on every request
    for minute in 0..3 {
        let req = request(4, &format!("Current time: 12:0{minute}. Be helpful."));
        let tapped = interceptor.execute(&req).await.unwrap();
        assert!(drain(tapped).await > 0);
        interceptor.settle().await;
    }

    let agg = aggregator.lock().await;
    assert_eq!(agg.stats().cache_misses, 3);
    assert_eq!(agg.stats().consecutive_misses, 3);
    assert_eq!(agg.stats().waste_warnings, 1);
    assert!(agg.stats().total_savings < 0.0);

    let last = agg.history().latest().unwrap();
    let diagnosis = last.diagnosis.as_ref().unwrap();
    assert!(diagnosis.system_prompt_changed);
    assert_eq!(
        diagnosis.primary_diagnosis.as_ref().unwrap().issue,
        PrimaryIssue::SystemPromptChange
    );
    drop(agg);

    let mut saw_waste = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::WasteDetected { threshold, .. } = event {
            assert_eq!(threshold, 3);
            saw_waste = true;
        }
    }
    assert!(saw_waste);
}

#[tokio::test]
async fn test_stable_prefix_hits_after_first_write() {
    let aggregator = Arc::new(Mutex::new(SessionAggregator::new(
        SessionConfig::default(),
        PriceTable::default(),
        MissDiagnoser::default(),
    )));
    let executor = ScriptedExecutor::new(vec![sse(0, 6000), sse(6000, 200), sse(6200, 180)]);
    let interceptor = CacheInterceptor::new(executor, Arc::clone(&aggregator));

    for turns in 1..=3 {
        let tapped = interceptor.execute(&request(turns, "Be helpful.")).await.unwrap();
        drain(tapped).await;
        interceptor.settle().await;
    }

    let agg = aggregator.lock().await;
    let stats = agg.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(stats.consecutive_misses, 0);
    assert!((stats.request_hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    assert!(stats.total_savings > 0.0);
    assert_eq!(stats.total_output_tokens, 360);
    assert_eq!(interceptor.in_flight(), 0);
}
