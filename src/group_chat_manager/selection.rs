//! Replier Selection for Group Chats
//!
//! This module handles:
//! - @mention parsing to detect which agents the human addressed directly
//! - Picking the bounded random subset of agents that may reply this cycle

use rand::seq::SliceRandom;
use rand::Rng;

use crate::storage_manager::AgentMember;

// ============================================================================
// @Mention Parsing
// ============================================================================

/// Agent ids mentioned in `message`: quoted mentions first, then bare ones.
///
/// Supports:
/// - @"Agent Name" (quoted, for names with spaces)
/// - @AgentName (unquoted, single word, exact then prefix match)
pub fn parse_mentions(message: &str, agents: &[AgentMember]) -> Vec<String> {
    fn push(id: &str, found: &mut Vec<String>) {
        if !found.iter().any(|f| f == id) {
            found.push(id.to_string());
        }
    }

    let mut found: Vec<String> = Vec::new();

    // Quoted mentions: @"Agent Name"
    let chars: Vec<char> = message.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '@' && i + 1 < chars.len() && chars[i + 1] == '"' {
            let start = i + 2;
            let mut end = start;
            while end < chars.len() && chars[end] != '"' {
                end += 1;
            }

            if end > start && end < chars.len() {
                let mentioned: String = chars[start..end].iter().collect();
                let mentioned_lower = mentioned.to_lowercase();
                if let Some(agent) = agents
                    .iter()
                    .find(|a| a.display_name.to_lowercase() == mentioned_lower)
                {
                    push(&agent.agent_id, &mut found);
                }
                i = end;
            }
        }
        i += 1;
    }

    // Unquoted mentions: @AgentName
    for word in message.split_whitespace() {
        let Some(mentioned) = word.strip_prefix('@') else {
            continue;
        };
        let mentioned = mentioned.trim_end_matches(|c: char| c.is_ascii_punctuation());
        if mentioned.is_empty() || mentioned.starts_with('"') {
            continue;
        }
        let mentioned_lower = mentioned.to_lowercase();

        let exact = agents
            .iter()
            .find(|a| a.display_name.to_lowercase() == mentioned_lower);
        let partial = || {
            agents
                .iter()
                .find(|a| a.display_name.to_lowercase().starts_with(&mentioned_lower))
        };
        if let Some(agent) = exact.or_else(partial) {
            push(&agent.agent_id, &mut found);
        }
    }

    found
}

// ============================================================================
// Replier Selection
// ============================================================================

/// Pick `min(max_repliers, agents.len())` agents in shuffled order. Mentioned
/// agents are always picked (up to the bound); the rest is filled at random.
pub fn choose_repliers<R: Rng + ?Sized>(
    agents: &[AgentMember],
    mentioned: &[String],
    max_repliers: usize,
    rng: &mut R,
) -> Vec<AgentMember> {
    let bound = max_repliers.min(agents.len());

    let mut chosen: Vec<AgentMember> = mentioned
        .iter()
        .filter_map(|id| agents.iter().find(|a| &a.agent_id == id))
        .take(bound)
        .cloned()
        .collect();

    let mut others: Vec<&AgentMember> = agents
        .iter()
        .filter(|a| !chosen.iter().any(|c| c.agent_id == a.agent_id))
        .collect();
    others.shuffle(rng);

    let room = bound - chosen.len();
    chosen.extend(others.into_iter().take(room).cloned());
    chosen.shuffle(rng);
    chosen
}

// ============================================================================
// Tests
// ============================================================================
