//! Prompt assembly for one multi-agent generation call.

use std::collections::HashMap;

use super::segmenter::IconEntry;
use crate::lottery::LotteryInstance;
use crate::storage_manager::{AgentMember, EntryKind, GroupRoster, HistoryEntry};
use crate::utils::truncate_chars;

const MAX_HISTORY_LINE_CHARS: usize = 200;

pub struct PromptContext<'a> {
    pub roster: &'a GroupRoster,
    pub repliers: &'a [AgentMember],
    pub history: &'a [HistoryEntry],
    pub lotteries: &'a HashMap<String, LotteryInstance>,
    pub trigger_text: &'a str,
    pub icons: &'a [IconEntry],
    pub separator: &'a str,
    pub icon_tag: &'a str,
    pub abstain_sentinel: &'a str,
    pub local_time: String,
}

/// One line of conversation as the model should see it.
pub fn render_history_line(entry: &HistoryEntry, lotteries: &HashMap<String, LotteryInstance>) -> String {
    match entry.kind {
        EntryKind::Lottery => {
            let detail = entry
                .lottery_id
                .as_ref()
                .and_then(|id| lotteries.get(id))
                .map(|l| format!(" ({}/{} shares)", l.total_amount, l.share_count))
                .unwrap_or_default();
            format!(
                "{}: [sent a red envelope] {}{}",
                entry.sender_name, entry.content, detail
            )
        }
        EntryKind::Reaction => format!("{}: [reaction: {}]", entry.sender_name, entry.content),
        _ => format!(
            "{}: {}",
            entry.sender_name,
            truncate_chars(&entry.content, MAX_HISTORY_LINE_CHARS)
        ),
    }
}

pub fn build_group_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are directing a realistic group chat. Based on the conversation and each member's persona, decide who replies, what they say, and whether they split it into several messages.\n\n",
    );

    prompt.push_str("## Ground Rules\n\n");
    prompt.push_str("1. **Stay in character**: every reply must match its speaker's persona.\n");
    prompt.push_str("2. **Not everyone talks**: busy or uninterested members stay quiet.\n");
    prompt.push_str(
        "3. **Read the room**: lively topics draw more replies, niche or private ones draw few.\n",
    );
    prompt.push_str("4. **Talk to each other**: members may answer or @mention one another.\n");
    prompt.push_str(&format!(
        "5. **Split naturally**: separate multiple short messages with `{}`.\n\n",
        ctx.separator
    ));

    prompt.push_str("## Group\n\n");
    if !ctx.roster.group_name.is_empty() {
        prompt.push_str(&format!("- Name: {}\n", ctx.roster.group_name));
    }
    if let Some(announcement) = ctx.roster.announcement.as_deref().filter(|a| !a.trim().is_empty()) {
        prompt.push_str(&format!("- Announcement: {}\n", announcement.trim()));
    }
    let mut members: Vec<&str> = vec![ctx.roster.human_display_name.as_str()];
    members.extend(ctx.roster.agent_members.iter().map(|a| a.display_name.as_str()));
    prompt.push_str(&format!("- Members: {}\n", members.join(", ")));
    prompt.push_str(&format!("- Local time: {}\n\n", ctx.local_time));

    prompt.push_str("## Personas\n\n");
    for member in ctx.repliers {
        prompt.push_str(&format!("### {}\n", member.display_name));
        let persona = member.persona_description.trim();
        if persona.is_empty() {
            prompt.push_str("- Persona: an ordinary group member\n\n");
        } else {
            prompt.push_str(&format!("- Persona: {}\n\n", persona));
        }
    }

    prompt.push_str("## Recent Conversation\n\n");
    if ctx.history.is_empty() {
        prompt.push_str("(no messages yet)\n");
    }
    for entry in ctx.history {
        prompt.push_str(&render_history_line(entry, ctx.lotteries));
        prompt.push('\n');
    }

    prompt.push_str("\n## New Message\n\n");
    prompt.push_str(&format!(
        "{}: {}\n\n",
        ctx.roster.human_display_name, ctx.trigger_text
    ));

    if !ctx.icons.is_empty() {
        prompt.push_str("## Reactions\n\n");
        for (position, icon) in ctx.icons.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", position, icon.match_token));
        }
        prompt.push_str(&format!(
            "Send one by writing [{}:number], e.g. [{}:0].\n\n",
            ctx.icon_tag, ctx.icon_tag
        ));
    }

    prompt.push_str("## Response Format\n\n");
    prompt.push_str("Answer with exactly one line per member, nothing else:\n");
    for member in ctx.repliers {
        prompt.push_str(&format!(
            "[{}] reply text or {}\n",
            member.display_name, ctx.abstain_sentinel
        ));
    }
    prompt.push_str(&format!(
        "\nUse the names exactly as written. A member with nothing to say answers {} (optionally `{} (reason)`).",
        ctx.abstain_sentinel, ctx.abstain_sentinel
    ));

    prompt
}
