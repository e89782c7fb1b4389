//! First-difference search between two fingerprint sequences.

use cachelens_core::Role;
use serde::Serialize;

use crate::fingerprint::MessageFingerprint;

/// Characters of context kept on either side of a differing offset.
pub const CONTEXT_RADIUS: usize = 100;

/// Where two message sequences first differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergencePoint {
    /// The message at `index` exists on both sides with different content
    ContentChanged {
        index: usize,
        previous_role: Role,
        current_role: Role,
        detail: Option<CharDivergence>,
    },
    /// All shared messages match; one side has more messages
    LengthChanged {
        index: usize,
        previous_len: usize,
        current_len: usize,
    },
}

impl DivergencePoint {
    pub fn index(&self) -> usize {
        match self {
            Self::ContentChanged { index, .. } | Self::LengthChanged { index, .. } => *index,
        }
    }

    /// Human-readable reason line.
    pub fn describe(&self) -> String {
        match self {
            Self::ContentChanged {
                index,
                previous_role,
                current_role,
                ..
            } if previous_role != current_role => format!(
                "Message {} changed role from {} to {}",
                index, previous_role, current_role
            ),
            Self::ContentChanged {
                index,
                current_role,
                ..
            } => format!("Message {} ({}) content changed", index, current_role),
            Self::LengthChanged {
                previous_len,
                current_len,
                ..
            } if current_len > previous_len => format!(
                "Message count grew from {} to {}; all previous messages unchanged",
                previous_len, current_len
            ),
            Self::LengthChanged {
                previous_len,
                current_len,
                ..
            } => format!(
                "Message count shrank from {} to {}",
                previous_len, current_len
            ),
        }
    }
}

/// First differing character inside a changed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharDivergence {
    /// Offset in characters
    pub offset: usize,
    pub previous_context: String,
    pub current_context: String,
    /// Present when the two contents differ in length
    pub length_note: Option<String>,
}

/// Find the first index at which `current` departs from `previous`.
///
/// Comparison runs strictly from index 0; the first differing hash wins even
/// if later messages differ too. Returns `None` for identical sequences.
pub fn locate_divergence(
    previous: &[MessageFingerprint],
    current: &[MessageFingerprint],
) -> Option<DivergencePoint> {
    let changed = previous
        .iter()
        .zip(current)
        .position(|(p, c)| !p.same_content(c));

    if let Some(index) = changed {
        let (p, c) = (&previous[index], &current[index]);
        return Some(DivergencePoint::ContentChanged {
            index,
            previous_role: p.role.clone(),
            current_role: c.role.clone(),
            detail: locate_char_divergence(&p.full_content, &c.full_content),
        });
    }

    (previous.len() != current.len()).then(|| DivergencePoint::LengthChanged {
        index: previous.len().min(current.len()),
        previous_len: previous.len(),
        current_len: current.len(),
    })
}

/// Locate the first differing character between two texts.
///
/// Returns `None` when the texts are identical (the message differed only in
/// role or non-text fields).
pub fn locate_char_divergence(previous: &str, current: &str) -> Option<CharDivergence> {
    let prev: Vec<char> = previous.chars().collect();
    let cur: Vec<char> = current.chars().collect();

    let offset = match prev.iter().zip(&cur).position(|(a, b)| a != b) {
        Some(offset) => offset,
        None if prev.len() == cur.len() => return None,
        None => prev.len().min(cur.len()),
    };

    let length_note = (prev.len() != cur.len()).then(|| {
        let delta = cur.len() as i64 - prev.len() as i64;
        format!(
            "previous {} chars, current {} chars ({:+})",
            prev.len(),
            cur.len(),
            delta
        )
    });

    Some(CharDivergence {
        offset,
        previous_context: context_window(&prev, offset),
        current_context: context_window(&cur, offset),
        length_note,
    })
}

fn context_window(chars: &[char], offset: usize) -> String {
    let start = offset.saturating_sub(CONTEXT_RADIUS).min(chars.len());
    let end = (offset + CONTEXT_RADIUS).min(chars.len());
    chars[start..end].iter().collect()
}
