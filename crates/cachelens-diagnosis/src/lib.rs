//! # cachelens-diagnosis
//!
//! Explains why a prompt-cache miss happened.
//!
//! This crate provides:
//! - [`fingerprint`] - Per-message hashes, previews and [`RequestSnapshot`]s
//! - [`divergence`] - First differing message and character between two requests
//! - [`patterns`] - Pluggable detection of lorebook, depth and role-structure cues
//! - [`diagnoser`] - [`MissDiagnoser`], which combines the above with a TTL check
//!
//! ## Example
//!
//! ```
//! use cachelens_core::{Message, Role};
//! use cachelens_diagnosis::{MissDiagnoser, RequestSnapshot};
//! use chrono::{Duration, Utc};
//!
//! let start = Utc::now();
//! let first = vec![Message::new(Role::System, "rules"), Message::new(Role::User, "hi")];
//! let mut second = first.clone();
//! second.push(Message::new(Role::User, "again"));
//!
//! let previous = RequestSnapshot::from_messages(first, None, start);
//! let current = RequestSnapshot::from_messages(second, None, start + Duration::seconds(30));
//!
//! let result = MissDiagnoser::default().diagnose(Some(&previous), &current);
//! assert_eq!(result.divergence.unwrap().index(), 2);
//! ```

pub mod diagnoser;
pub mod divergence;
pub mod fingerprint;
pub mod patterns;

// Re-export main types
pub use diagnoser::{
    CACHE_TTL_MS, DiagnosisResult, FIRST_REQUEST_REASON, Location, LocationAnalysis, LocationCause,
    LoreDetails, LoreIssue, LoreIssueKind, MissDiagnoser, PrimaryDiagnosis, PrimaryIssue, Severity,
};
pub use divergence::{CharDivergence, DivergencePoint, locate_char_divergence, locate_divergence};
pub use fingerprint::{MessageFingerprint, RequestSnapshot, content_hash, fingerprint_messages};
pub use patterns::{PatternDetector, PatternFlags, RegexPatternDetector};
