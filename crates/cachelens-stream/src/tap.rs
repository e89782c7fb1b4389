//! Pass-through stream tap.
//!
//! [`tap_stream`] wraps a response byte stream and yields every chunk to the
//! consumer unmodified, while splitting the decoded text into SSE frames and
//! feeding each `data:` payload to the usage extractor. When the stream ends
//! the accumulated usage is handed to a [`TapSink`] on a spawned task, after
//! the consumer has already seen end-of-stream.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cachelens_stream::{ByteStream, TapMode, TapOutcome, TapSink, tap_stream};
//! use futures_util::StreamExt;
//!
//! struct PrintSink;
//!
//! #[async_trait::async_trait]
//! impl TapSink for PrintSink {
//!     async fn on_complete(&self, outcome: TapOutcome) {
//!         println!("usage: {:?}", outcome.usage);
//!     }
//! }
//!
//! # async fn example(upstream: ByteStream) {
//! let mut tapped = tap_stream(upstream, TapMode::EventStream, Arc::new(PrintSink));
//! while let Some(chunk) = tapped.next().await {
//!     // forward chunk to the original consumer
//!     let _ = chunk;
//! }
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use cachelens_core::UsageRecord;
use futures_util::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::extractor::{UsageAccumulator, extract_from_body};
use crate::sse::{FrameSplitter, Utf8Decoder};

/// Boxed response byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// How the response body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapMode {
    /// `text/event-stream` body split into frames as it arrives
    EventStream,
    /// Single JSON document, parsed once the body is complete
    JsonBody,
}

/// Summary of one fully consumed response.
#[derive(Debug, Clone, Default)]
pub struct TapOutcome {
    /// Accumulated usage, if any usage event was seen
    pub usage: Option<UsageRecord>,
    /// Provider generation id, if any payload carried one
    pub generation_id: Option<String>,
    /// Wall time from first poll to end of stream
    pub elapsed_ms: u64,
    /// Bytes passed through
    pub bytes: usize,
    /// SSE frames split
    pub frames: usize,
}

/// Receiver of tap results.
#[async_trait]
pub trait TapSink: Send + Sync {
    /// Called once when the underlying stream ends cleanly, off the
    /// consumer's poll.
    async fn on_complete(&self, outcome: TapOutcome);

    /// Called once when the underlying stream fails, before the error is
    /// forwarded to the consumer. Keep it cheap.
    async fn on_failed(&self, error: &StreamError) {
        debug!(error = %error, "tapped stream failed");
    }
}

/// Synchronous frame-splitting and extraction state for one response.
#[derive(Debug)]
pub struct StreamTap {
    mode: TapMode,
    decoder: Utf8Decoder,
    splitter: FrameSplitter,
    accumulator: UsageAccumulator,
    body: Vec<u8>,
    bytes: usize,
}

impl StreamTap {
    pub fn new(mode: TapMode) -> Self {
        Self {
            mode,
            decoder: Utf8Decoder::new(),
            splitter: FrameSplitter::new(),
            accumulator: UsageAccumulator::new(),
            body: Vec::new(),
            bytes: 0,
        }
    }

    /// Observe one chunk of the response.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len();
        match self.mode {
            TapMode::EventStream => {
                let text = self.decoder.decode(chunk);
                for payload in self.splitter.push(&text) {
                    self.accumulator.feed_payload(&payload);
                }
            }
            TapMode::JsonBody => self.body.extend_from_slice(chunk),
        }
    }

    /// Flush buffered state and summarize the response.
    pub fn finish(mut self, elapsed_ms: u64) -> TapOutcome {
        match self.mode {
            TapMode::EventStream => {
                let tail = self.decoder.finish();
                let mut payloads = self.splitter.push(&tail);
                payloads.extend(self.splitter.finish());
                for payload in payloads {
                    self.accumulator.feed_payload(&payload);
                }
            }
            TapMode::JsonBody => {
                if let Some(extracted) = extract_from_body(&self.body) {
                    self.accumulator.absorb(extracted);
                }
            }
        }

        let frames = self.splitter.frames();
        let (usage, generation_id) = match self.accumulator.finish() {
            Some((record, id)) => (Some(record), id),
            None => (None, None),
        };

        trace!(bytes = self.bytes, frames, has_usage = usage.is_some(), "tap finished");

        TapOutcome {
            usage,
            generation_id,
            elapsed_ms,
            bytes: self.bytes,
            frames,
        }
    }
}

/// Logs when a tapped stream is dropped before reaching its end.
struct CompletionWatch {
    finished: bool,
}

impl Drop for CompletionWatch {
    fn drop(&mut self) {
        if !self.finished {
            debug!("tapped stream dropped before completion; usage discarded");
        }
    }
}

/// Wrap `inner` so every chunk passes through unchanged while usage is
/// extracted on the side.
///
/// `sink.on_complete` runs on a spawned task once the inner stream ends, so
/// the consumer sees end-of-stream without waiting on it. Outside a tokio
/// runtime it is awaited inline. Transport errors are forwarded to the
/// consumer after `sink.on_failed`; the tap never retries and never
/// swallows an error.
pub fn tap_stream(inner: ByteStream, mode: TapMode, sink: Arc<dyn TapSink>) -> ByteStream {
    let stream = async_stream::stream! {
        let mut inner = inner;
        let mut watch = CompletionWatch { finished: false };
        let started = Instant::now();
        let mut tap = StreamTap::new(mode);

        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    tap.feed(&chunk);
                    yield Ok(chunk);
                }
                Err(e) => {
                    warn!(error = %e, "upstream stream error");
                    watch.finished = true;
                    sink.on_failed(&e).await;
                    yield Err(e);
                    return;
                }
            }
        }

        watch.finished = true;
        let outcome = tap.finish(started.elapsed().as_millis() as u64);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sink = Arc::clone(&sink);
                handle.spawn(async move { sink.on_complete(outcome).await });
            }
            Err(_) => sink.on_complete(outcome).await,
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        completed: Mutex<Vec<TapOutcome>>,
        failures: Mutex<usize>,
        done: Notify,
    }

    #[async_trait]
    impl TapSink for RecordingSink {
        async fn on_complete(&self, outcome: TapOutcome) {
            self.completed.lock().unwrap().push(outcome);
            self.done.notify_one();
        }

        async fn on_failed(&self, _error: &StreamError) {
            *self.failures.lock().unwrap() += 1;
        }
    }

    fn chunks(parts: &[&str]) -> ByteStream {
        let items: Vec<Result<Bytes, StreamError>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        Box::pin(stream::iter(items))
    }

    const START: &str = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1,\"cache_creation_input_tokens\":0,\"cache_read_input_tokens\":2048}}}\n\n";
    const DELTA: &str = "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":77}}\n\n";

    #[test]
    fn test_stream_tap_sync_feed() {
        let mut tap = StreamTap::new(TapMode::EventStream);
        let all = format!("{START}{DELTA}");
        let (a, b) = all.as_bytes().split_at(37);
        tap.feed(a);
        tap.feed(b);
        let outcome = tap.finish(5);

        let usage = outcome.usage.unwrap();
        assert_eq!(usage.cache_read_input_tokens, 2048);
        assert_eq!(usage.output_tokens, 77);
        assert_eq!(outcome.frames, 2);
        assert_eq!(outcome.bytes, all.len());
    }

    #[test]
    fn test_json_body_mode() {
        let mut tap = StreamTap::new(TapMode::JsonBody);
        tap.feed(br#"{"id":"msg_2","type":"message","model":"claude-haiku-4-5","#);
        tap.feed(br#""usage":{"input_tokens":9,"output_tokens":3,"cache_creation_input_tokens":600}}"#);
        let outcome = tap.finish(1);

        let usage = outcome.usage.unwrap();
        assert_eq!(usage.model, "claude-haiku-4-5");
        assert_eq!(usage.cache_creation_input_tokens, 600);
        assert_eq!(outcome.generation_id.as_deref(), Some("msg_2"));
    }

    #[tokio::test]
    async fn test_tap_passes_bytes_through_unchanged() {
        let parts = [&START[..50], &START[50..], DELTA, "data: [DONE]\n\n"];
        let sink = Arc::new(RecordingSink::default());
        let tapped = tap_stream(chunks(&parts), TapMode::EventStream, sink.clone());

        let received: Vec<Bytes> = tapped.map(|c| c.unwrap()).collect().await;
        let joined: Vec<u8> = received.iter().flat_map(|b| b.iter().copied()).collect();
        let expected: Vec<u8> = parts.concat().into_bytes();
        assert_eq!(joined, expected);
        assert_eq!(received.len(), parts.len());

        sink.done.notified().await;
        let completed = sink.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].usage.as_ref().unwrap().output_tokens, 77);
    }

    #[tokio::test]
    async fn test_tap_forwards_errors() {
        let items: Vec<Result<Bytes, StreamError>> = vec![
            Ok(Bytes::from_static(START.as_bytes())),
            Err(StreamError::Transport("connection reset".into())),
            Ok(Bytes::from_static(DELTA.as_bytes())),
        ];
        let sink = Arc::new(RecordingSink::default());
        let mut tapped = tap_stream(Box::pin(stream::iter(items)), TapMode::EventStream, sink.clone());

        assert!(tapped.next().await.unwrap().is_ok());
        let err = tapped.next().await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Transport(_)));
        assert!(tapped.next().await.is_none());

        assert_eq!(*sink.failures.lock().unwrap(), 1);
        assert!(sink.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_does_not_complete() {
        let sink = Arc::new(RecordingSink::default());
        let mut tapped = tap_stream(chunks(&[START, DELTA]), TapMode::EventStream, sink.clone());
        let _ = tapped.next().await;
        drop(tapped);

        assert!(sink.completed.lock().unwrap().is_empty());
        assert_eq!(*sink.failures.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_garbage_frames_do_not_abort() {
        let sink = Arc::new(RecordingSink::default());
        let tapped = tap_stream(
            chunks(&["data: {broken\n\n", "data: not json\n\n", DELTA]),
            TapMode::EventStream,
            sink.clone(),
        );
        let count = tapped.count().await;
        assert_eq!(count, 3);

        sink.done.notified().await;

        let completed = sink.completed.lock().unwrap();
        assert_eq!(completed[0].usage.as_ref().unwrap().output_tokens, 77);
    }

    struct SlowSink {
        completed: Mutex<bool>,
        done: Notify,
    }

    #[async_trait]
    impl TapSink for SlowSink {
        async fn on_complete(&self, _outcome: TapOutcome) {
            tokio::time::sleep(Duration::from_millis(300)).await;
            *self.completed.lock().unwrap() = true;
            self.done.notify_one();
        }
    }

    #[tokio::test]
    async fn test_end_of_stream_does_not_wait_for_sink() {
        let sink = Arc::new(SlowSink {
            completed: Mutex::new(false),
            done: Notify::new(),
        });
        let tapped = tap_stream(chunks(&[START, DELTA]), TapMode::EventStream, sink.clone());

        let drained = tokio::time::timeout(Duration::from_millis(100), tapped.count()).await;
        assert_eq!(drained.unwrap(), 2);
        assert!(!*sink.completed.lock().unwrap());

        sink.done.notified().await;
        assert!(*sink.completed.lock().unwrap());
    }
}
