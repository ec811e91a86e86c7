//! Persistence collaborators: turn history, lottery instances and group rosters.
//!
//! The engine only talks to these traits. [`memory::MemoryStore`] keeps everything
//! in process; [`db::SqliteStore`] persists to SQLite through an r2d2 pool.

pub mod db;
pub mod memory;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::lottery::LotteryInstance;
use crate::utils::now_millis;

pub use db::SqliteStore;
pub use memory::MemoryStore;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryRole {
    Human,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    Text,
    Reaction,
    Lottery,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub role: EntryRole,
    pub kind: EntryKind,
    pub content: String,
    #[serde(default)]
    pub icon_index: Option<usize>,
    #[serde(default)]
    pub lottery_id: Option<String>,
    pub created_at: u64,
}

pub const SYSTEM_SENDER_ID: &str = "system";

impl HistoryEntry {
    fn new(
        group_id: &str,
        sender_id: &str,
        sender_name: &str,
        role: EntryRole,
        kind: EntryKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            role,
            kind,
            content: content.into(),
            icon_index: None,
            lottery_id: None,
            created_at: now_millis(),
        }
    }

    pub fn human_text(group_id: &str, sender_id: &str, sender_name: &str, content: &str) -> Self {
        Self::new(
            group_id,
            sender_id,
            sender_name,
            EntryRole::Human,
            EntryKind::Text,
            content,
        )
    }

    pub fn agent_text(group_id: &str, agent_id: &str, agent_name: &str, content: &str) -> Self {
        Self::new(
            group_id,
            agent_id,
            agent_name,
            EntryRole::Agent,
            EntryKind::Text,
            content,
        )
    }

    pub fn agent_reaction(
        group_id: &str,
        agent_id: &str,
        agent_name: &str,
        icon_index: usize,
        description: &str,
    ) -> Self {
        let mut entry = Self::new(
            group_id,
            agent_id,
            agent_name,
            EntryRole::Agent,
            EntryKind::Reaction,
            description,
        );
        entry.icon_index = Some(icon_index);
        entry
    }

    pub fn lottery_sent(lottery: &LotteryInstance, role: EntryRole) -> Self {
        let mut entry = Self::new(
            &lottery.group_id,
            &lottery.initiator_id,
            &lottery.initiator_display_name,
            role,
            EntryKind::Lottery,
            lottery.blessing_message.clone(),
        );
        entry.lottery_id = Some(lottery.id.clone());
        entry
    }

    pub fn notice(group_id: &str, content: impl Into<String>) -> Self {
        Self::new(
            group_id,
            SYSTEM_SENDER_ID,
            "System",
            EntryRole::System,
            EntryKind::Notice,
            content,
        )
    }

    pub fn is_notice(&self) -> bool {
        self.role == EntryRole::System
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMember {
    pub agent_id: String,
    pub display_name: String,
    #[serde(default)]
    pub persona_description: String,
    #[serde(default)]
    pub display_icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRoster {
    pub group_id: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub announcement: Option<String>,
    pub human_participant_id: String,
    #[serde(default = "default_human_name")]
    pub human_display_name: String,
    #[serde(default)]
    pub agent_members: Vec<AgentMember>,
}

fn default_human_name() -> String {
    "Me".to_string()
}

// ============================================================================
// Collaborator traits
// ============================================================================

pub trait HistoryStore: Send + Sync {
    fn append_turn_history(&self, group_id: &str, entry: &HistoryEntry) -> Result<(), AppError>;

    /// Most recent `limit` entries, oldest first.
    fn read_recent_history(&self, group_id: &str, limit: usize)
        -> Result<Vec<HistoryEntry>, AppError>;
}

/// Calls are synchronous; `LotteryStore` runs them on tokio's blocking pool.
pub trait LotteryRepository: Send + Sync {
    fn load_lotteries(&self, group_id: &str) -> Result<Vec<LotteryInstance>, AppError>;

    fn save_lottery_instance(&self, instance: &LotteryInstance) -> Result<(), AppError>;
}

pub trait RosterProvider: Send + Sync {
    fn get_roster(&self, group_id: &str) -> Result<GroupRoster, AppError>;
}
