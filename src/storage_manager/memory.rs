use std::collections::HashMap;
use std::sync::RwLock;

use super::{GroupRoster, HistoryEntry, HistoryStore, LotteryRepository, RosterProvider};
use crate::error::AppError;
use crate::lottery::LotteryInstance;

/// In-process store. Each group's history is append-only.
#[derive(Default)]
pub struct MemoryStore {
    history: RwLock<HashMap<String, Vec<HistoryEntry>>>,
    lotteries: RwLock<HashMap<String, LotteryInstance>>,
    rosters: RwLock<HashMap<String, GroupRoster>>,
}

fn poisoned(what: &str) -> AppError {
    AppError::Other(format!("{} lock poisoned", what))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_roster(&self, roster: GroupRoster) -> Result<(), AppError> {
        let mut rosters = self.rosters.write().map_err(|_| poisoned("roster"))?;
        rosters.insert(roster.group_id.clone(), roster);
        Ok(())
    }

    pub fn history_len(&self, group_id: &str) -> usize {
        self.history
            .read()
            .map(|h| h.get(group_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn full_history(&self, group_id: &str) -> Vec<HistoryEntry> {
        self.history
            .read()
            .map(|h| h.get(group_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl HistoryStore for MemoryStore {
    fn append_turn_history(&self, group_id: &str, entry: &HistoryEntry) -> Result<(), AppError> {
        let mut history = self.history.write().map_err(|_| poisoned("history"))?;
        history
            .entry(group_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn read_recent_history(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, AppError> {
        let history = self.history.read().map_err(|_| poisoned("history"))?;
        let entries = history.get(group_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }
}

impl LotteryRepository for MemoryStore {
    fn load_lotteries(&self, group_id: &str) -> Result<Vec<LotteryInstance>, AppError> {
        let lotteries = self.lotteries.read().map_err(|_| poisoned("lottery"))?;
        let mut found: Vec<LotteryInstance> = lotteries
            .values()
            .filter(|l| l.group_id == group_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn save_lottery_instance(&self, instance: &LotteryInstance) -> Result<(), AppError> {
        let mut lotteries = self.lotteries.write().map_err(|_| poisoned("lottery"))?;
        lotteries.insert(instance.id.clone(), instance.clone());
        Ok(())
    }
}

impl RosterProvider for MemoryStore {
    fn get_roster(&self, group_id: &str) -> Result<GroupRoster, AppError> {
        let rosters = self.rosters.read().map_err(|_| poisoned("roster"))?;
        rosters
            .get(group_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("roster for group {}", group_id)))
    }
}
