//! Splits one agent turn into delivery segments: text bubbles separated by the
//! bubble separator, and reactions written as `[<tag>:<index>]`.

use serde::{Deserialize, Serialize};

use super::parser::AgentTurn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconEntry {
    pub icon_index: usize,
    /// Short description shown in history and in the prompt's icon catalog.
    pub match_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SegmentPayload {
    Text { text: String },
    Reaction { icon_index: usize, token: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySegment {
    pub agent_id: String,
    pub payload: SegmentPayload,
    pub sequence_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRules {
    pub separator: String,
    pub icon_tag: String,
}

impl Default for SegmentRules {
    fn default() -> Self {
        Self {
            separator: "|".to_string(),
            icon_tag: "icon".to_string(),
        }
    }
}

pub fn segment(turn: &AgentTurn, icon_table: &[IconEntry], rules: &SegmentRules) -> Vec<DeliverySegment> {
    let mut payloads = Vec::new();

    for fragment in turn.content.split(rules.separator.as_str()) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }

        let (text, reactions) = extract_icons(fragment, icon_table, &rules.icon_tag);
        let text = text.trim();
        if !text.is_empty() {
            payloads.push(SegmentPayload::Text {
                text: text.to_string(),
            });
        }
        payloads.extend(reactions);
    }

    payloads
        .into_iter()
        .enumerate()
        .map(|(sequence_index, payload)| DeliverySegment {
            agent_id: turn.agent_id.clone(),
            payload,
            sequence_index,
        })
        .collect()
}

/// Pull valid icon references out of `fragment`. References whose index is
/// outside the table stay in the text untouched.
fn extract_icons(fragment: &str, icon_table: &[IconEntry], tag: &str) -> (String, Vec<SegmentPayload>) {
    let opener = format!("[{}:", tag);
    let mut text = String::with_capacity(fragment.len());
    let mut reactions = Vec::new();
    let mut rest = fragment;

    while let Some(start) = rest.find(&opener) {
        text.push_str(&rest[..start]);
        let after = &rest[start + opener.len()..];

        let reference = after.find(']').and_then(|close| {
            let digits = after[..close].trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let entry = digits.parse::<usize>().ok().and_then(|i| icon_table.get(i))?;
            Some((entry, close))
        });

        match reference {
            Some((entry, close)) => {
                reactions.push(SegmentPayload::Reaction {
                    icon_index: entry.icon_index,
                    token: entry.match_token.clone(),
                });
                rest = &after[close + 1..];
            }
            None => {
                text.push_str(&opener);
                rest = after;
            }
        }
    }
    text.push_str(rest);

    (text, reactions)
}
