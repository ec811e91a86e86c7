//! Multi-agent Response Parsing
//!
//! The backend answers for every selected agent in one text block, one line per
//! agent, each line tagged with the agent's display name:
//!
//! ```text
//! [Alice] morning! | anyone up?
//! [Bob] SKIP (still asleep)
//! ```
//!
//! The text is untrusted. Lines are matched to agents by exact name, never by
//! position; anything that does not match is dropped.

use serde::{Deserialize, Serialize};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub agent_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurn {
    pub agent_id: String,
    pub display_name: String,
    pub content: String,
    pub abstained: bool,
    /// Reason given as `SKIP (reason)`, if any.
    #[serde(default)]
    pub abstain_reason: Option<String>,
}

/// Everything recognisable in one raw response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    /// Speaking turns in response order.
    pub turns: Vec<AgentTurn>,
    /// Recognised abstentions, kept apart so callers can tell
    /// "everyone passed" from "nothing usable came back".
    pub abstentions: Vec<AgentTurn>,
}

impl ParsedReply {
    pub fn is_unrecognised(&self) -> bool {
        self.turns.is_empty() && self.abstentions.is_empty()
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Speaking turns only; abstentions and unknown tags are dropped.
pub fn parse_turns(raw: &str, roster: &[RosterEntry], sentinels: &[String]) -> Vec<AgentTurn> {
    parse_reply(raw, roster, sentinels).turns
}

pub fn parse_reply(raw: &str, roster: &[RosterEntry], sentinels: &[String]) -> ParsedReply {
    let mut reply = ParsedReply::default();

    for line in raw.lines() {
        let Some((tag, content)) = split_tagged_line(line) else {
            continue;
        };
        let Some(member) = roster.iter().find(|m| m.display_name == tag) else {
            tracing::debug!(target: "group_chat", "dropping line for unknown speaker {:?}", tag);
            continue;
        };

        match abstention(content, sentinels) {
            Some(reason) => reply.abstentions.push(AgentTurn {
                agent_id: member.agent_id.clone(),
                display_name: member.display_name.clone(),
                content: String::new(),
                abstained: true,
                abstain_reason: reason,
            }),
            None => reply.turns.push(AgentTurn {
                agent_id: member.agent_id.clone(),
                display_name: member.display_name.clone(),
                content: content.to_string(),
                abstained: false,
                abstain_reason: None,
            }),
        }
    }

    reply
}

/// `[Name] text` -> (`Name`, `text`). Leading noise before the tag (list
/// markers, quotes) is tolerated; an empty name or empty text is not.
fn split_tagged_line(line: &str) -> Option<(&str, &str)> {
    let open = line.find('[')?;
    let rest = &line[open + 1..];
    let close = rest.find(']')?;
    let tag = rest[..close].trim();
    let content = rest[close + 1..].trim();
    if tag.is_empty() || content.is_empty() {
        return None;
    }
    Some((tag, content))
}

/// `Some(reason)` when `content` is an abstain sentinel, optionally followed by
/// a parenthesised reason in ASCII or full-width brackets.
fn abstention(content: &str, sentinels: &[String]) -> Option<Option<String>> {
    for sentinel in sentinels.iter().filter(|s| !s.is_empty()) {
        if content.eq_ignore_ascii_case(sentinel) {
            return Some(None);
        }

        let Some(head) = content.get(..sentinel.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(sentinel) {
            continue;
        }
        let tail = content[sentinel.len()..].trim_start();
        if let Some(reason) = bracketed(tail) {
            let reason = reason.trim();
            return Some(if reason.is_empty() {
                None
            } else {
                Some(reason.to_string())
            });
        }
    }
    None
}

fn bracketed(s: &str) -> Option<&str> {
    for (open, close) in [('(', ')'), ('（', '）')] {
        if let Some(inner) = s.strip_prefix(open).and_then(|r| r.strip_suffix(close)) {
            return Some(inner);
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================
