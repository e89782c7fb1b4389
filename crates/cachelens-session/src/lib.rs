//! # cachelens-session
//!
//! Session-level cache observation.
//!
//! This crate provides:
//! - [`SessionAggregator`] - Running counters, history and the previous-request snapshot
//! - [`HistoryRing`] - Bounded FIFO of processed requests
//! - [`SessionEvent`] - Typed events broadcast to renderers
//! - [`CacheInterceptor`] - Wraps a [`RequestExecutor`] and taps its responses
//!
//! ## Example
//!
//! ```
//! use cachelens_core::{Message, Role, UsageRecord};
//! use cachelens_cost::PriceTable;
//! use cachelens_diagnosis::{MissDiagnoser, RequestSnapshot};
//! use cachelens_session::{SessionAggregator, SessionConfig};
//! use chrono::Utc;
//!
//! let mut session = SessionAggregator::new(
//!     SessionConfig::default(),
//!     PriceTable::default(),
//!     MissDiagnoser::default(),
//! );
//!
//! let snapshot = RequestSnapshot::from_messages(
//!     vec![Message::new(Role::User, "hello")],
//!     None,
//!     Utc::now(),
//! );
//! let usage = UsageRecord::new("claude-sonnet-4-5").with_tokens(10, 5).with_cache(0, 1200);
//!
//! let entry = session.process(usage, snapshot, 850).unwrap();
//! assert!(entry.cache_write);
//! assert_eq!(session.stats().consecutive_misses, 1);
//! ```

pub mod aggregator;
pub mod events;
pub mod history;
pub mod interceptor;
pub mod stats;

// Re-export main types
pub use aggregator::{SessionAggregator, SessionConfig};
pub use events::{EVENT_CHANNEL_CAPACITY, SessionEvent};
pub use history::{HistoryEntry, HistoryRing};
pub use interceptor::{CacheInterceptor, Clock, RequestExecutor, SystemClock, UsagePersistence};
pub use stats::SessionStats;
