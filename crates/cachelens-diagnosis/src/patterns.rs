//! Structural cue detection in message text.
//!
//! Detection is advisory: the regexes look for the markers that prompt
//! builders commonly emit (lorebook/world-info entries, depth directives,
//! character and persona sections) and miss anything more creative.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Structural cues found in one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatternFlags {
    /// Lorebook entry names in order of appearance
    pub lore_entries: Vec<String>,
    /// Depth directive values in order of appearance
    pub depth_values: Vec<u32>,
    pub has_system_language: bool,
    pub has_character_card: bool,
    pub has_persona: bool,
    pub has_chat_history: bool,
}

impl PatternFlags {
    pub fn has_lore(&self) -> bool {
        !self.lore_entries.is_empty()
    }

    pub fn has_depth(&self) -> bool {
        !self.depth_values.is_empty()
    }
}

/// Strategy for scanning message content.
///
/// Implementations must be cheap and must not panic on arbitrary input;
/// the diagnoser still guards against a panicking strategy.
pub trait PatternDetector: Send + Sync {
    /// Scan one message's text.
    fn detect(&self, content: &str) -> PatternFlags;

    /// Strategy name for logs.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Default regex-based detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexPatternDetector;

struct Patterns {
    lore_tag: Regex,
    lore_bracket: Regex,
    depth_at: Regex,
    depth_bracket: Regex,
    system_language: Regex,
    character_card: Regex,
    persona: Regex,
    chat_history: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        // <lorebook_entry name="..."> / <lore-entry name="...">
        lore_tag: Regex::new(r#"(?i)<lore(?:book)?[ _-]?entry\s+name\s*=\s*"([^"]+)""#)
            .expect("invalid lore tag regex"),
        // [Lorebook: name] / [World Info: name] / [WI: name]
        lore_bracket: Regex::new(r"(?i)\[(?:lorebook|world info|wi):\s*([^\]]+)\]")
            .expect("invalid lore bracket regex"),
        depth_at: Regex::new(r"(?i)@depth\s*[:=]?\s*(\d+)").expect("invalid depth regex"),
        depth_bracket: Regex::new(r"(?i)\[depth\s*[:=]\s*(\d+)\]").expect("invalid depth regex"),
        system_language: Regex::new(
            r"(?i)\b(you are an? |you will act as|your role is|system prompt|\[system\]|<system>|instructions:)",
        )
        .expect("invalid system language regex"),
        character_card: Regex::new(
            r"(?i)(\{\{char\}\}|<character>|\[character|character card|char_name|description of \{\{char\}\}|scenario:)",
        )
        .expect("invalid character card regex"),
        persona: Regex::new(r"(?i)(\{\{user\}\}'s persona|<persona>|\[persona|persona:|user persona)")
            .expect("invalid persona regex"),
        chat_history: Regex::new(
            r"(?i)(<chat_history>|\[chat history\]|\[start a new chat\]|<previous conversation>|chat history:)",
        )
        .expect("invalid chat history regex"),
    })
}

impl PatternDetector for RegexPatternDetector {
    fn detect(&self, content: &str) -> PatternFlags {
        let p = patterns();

        // Both lore conventions may appear in one message; keep textual order
        let mut lore: Vec<(usize, String)> = p
            .lore_tag
            .captures_iter(content)
            .chain(p.lore_bracket.captures_iter(content))
            .filter_map(|c| c.get(1).map(|m| (m.start(), m.as_str().trim().to_string())))
            .filter(|(_, name)| !name.is_empty())
            .collect();
        lore.sort_by_key(|(pos, _)| *pos);

        let mut depth: Vec<(usize, u32)> = p
            .depth_at
            .captures_iter(content)
            .chain(p.depth_bracket.captures_iter(content))
            .filter_map(|c| {
                let m = c.get(1)?;
                m.as_str().parse().ok().map(|v| (m.start(), v))
            })
            .collect();
        depth.sort_by_key(|(pos, _)| *pos);

        PatternFlags {
            lore_entries: lore.into_iter().map(|(_, name)| name).collect(),
            depth_values: depth.into_iter().map(|(_, v)| v).collect(),
            has_system_language: p.system_language.is_match(content),
            has_character_card: p.character_card.is_match(content),
            has_persona: p.persona.is_match(content),
            has_chat_history: p.chat_history.is_match(content),
        }
    }

    fn name(&self) -> &str {
        "regex"
    }
}
