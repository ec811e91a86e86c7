//! Group Chat Manager
//!
//! This module drives one group-turn cycle:
//! - Agents autonomously claim shares of any active red envelope, one at a time
//! - A bounded random subset of agents (plus anyone @mentioned) is picked to reply
//! - One prompt goes to the generative backend naming only those repliers
//! - The raw reply is parsed into per-agent turns and delivered bubble by bubble
//!   with human-like pacing, each bubble appended to history as it goes out
//!
//! Cycles for the same group never interleave; different groups run independently.

pub mod parser;
pub mod prompt;
pub mod segmenter;
pub mod selection;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::abort_manager::AbortRegistry;
use crate::chat_manager::TextBackend;
use crate::error::AppError;
use crate::lottery::{ExpiredLottery, LotteryInstance, LotteryStore};
use crate::settings::{DelayRange, EngineSettings};
use crate::storage_manager::{
    AgentMember, EntryKind, EntryRole, GroupRoster, HistoryEntry, HistoryStore, RosterProvider,
};
use crate::utils::{format_minor_units, jitter_ms};

use parser::{parse_reply, RosterEntry};
use prompt::{build_group_prompt, PromptContext};
use segmenter::{segment, DeliverySegment, IconEntry, SegmentPayload, SegmentRules};

pub use parser::AgentTurn;
pub use selection::parse_mentions;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleTrigger {
    /// The human just said something; it is appended to history first.
    HumanMessage(String),
    /// "Act autonomously": reply to the latest human message, or liven up a quiet group.
    Autonomous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAttempt {
    pub lottery_id: String,
    pub agent_id: String,
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "reason")]
pub enum CycleOutcome {
    Completed,
    NoAgents,
    /// Every selected agent explicitly passed.
    AllAbstained,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub group_id: String,
    pub claim_attempts: Vec<ClaimAttempt>,
    pub repliers: Vec<String>,
    pub delivered: Vec<DeliverySegment>,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            claim_attempts: Vec::new(),
            repliers: Vec::new(),
            delivered: Vec::new(),
            outcome: CycleOutcome::Completed,
        }
    }

    fn finish(mut self, outcome: CycleOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Unregisters the cycle's abort handle however the cycle ends, including
/// when the host drops the cycle future.
struct AbortGuard<'a> {
    registry: &'a AbortRegistry,
    group_id: &'a str,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.group_id);
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct GroupOrchestrator {
    settings: EngineSettings,
    backend: Arc<dyn TextBackend>,
    history: Arc<dyn HistoryStore>,
    rosters: Arc<dyn RosterProvider>,
    lotteries: Arc<LotteryStore>,
    icons: Vec<IconEntry>,
    rng: StdMutex<StdRng>,
    group_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    aborts: AbortRegistry,
}

impl GroupOrchestrator {
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn TextBackend>,
        history: Arc<dyn HistoryStore>,
        rosters: Arc<dyn RosterProvider>,
        lotteries: Arc<LotteryStore>,
    ) -> Self {
        Self {
            settings: settings.normalized(),
            backend,
            history,
            rosters,
            lotteries,
            icons: Vec::new(),
            rng: StdMutex::new(StdRng::from_entropy()),
            group_locks: StdMutex::new(HashMap::new()),
            aborts: AbortRegistry::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdMutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_icons(mut self, icons: Vec<IconEntry>) -> Self {
        self.icons = icons;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn lottery_store(&self) -> &Arc<LotteryStore> {
        &self.lotteries
    }

    /// Stop the group's in-flight cycle at its next suspension point.
    pub fn abort(&self, group_id: &str) -> Result<(), AppError> {
        self.aborts.abort(group_id).map_err(AppError::from)
    }

    pub fn is_cycle_running(&self, group_id: &str) -> bool {
        self.aborts.is_registered(group_id)
    }

    // ------------------------------------------------------------------------
    // Randomness helpers; the rng lock is never held across an await.
    // ------------------------------------------------------------------------

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    fn jitter(&self, range: DelayRange) -> Duration {
        Duration::from_millis(self.with_rng(|rng| jitter_ms(rng, range.min, range.max)))
    }

    fn group_lock(&self, group_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.group_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn append(&self, group_id: &str, entry: &HistoryEntry) -> Result<(), AppError> {
        self.history.append_turn_history(group_id, entry)
    }

    fn append_notice(&self, group_id: &str, content: String) {
        if let Err(e) = self.append(group_id, &HistoryEntry::notice(group_id, content)) {
            tracing::warn!(target: "group_chat", "failed to append notice for {}: {}", group_id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Human actions
    // ------------------------------------------------------------------------

    /// The human sends a red envelope into the group.
    pub async fn send_lottery(
        &self,
        group_id: &str,
        total_amount: u64,
        share_count: u32,
        blessing_message: &str,
    ) -> Result<LotteryInstance, AppError> {
        let roster = self.rosters.get_roster(group_id)?;
        let lottery = self
            .lotteries
            .create(
                group_id,
                &roster.human_participant_id,
                &roster.human_display_name,
                total_amount,
                share_count,
                blessing_message,
            )
            .await?;
        self.append(group_id, &HistoryEntry::lottery_sent(&lottery, EntryRole::Human))?;
        Ok(lottery)
    }

    /// The human opens a red envelope. `None` when there is nothing to take.
    pub async fn claim_as_human(
        &self,
        group_id: &str,
        lottery_id: &str,
    ) -> Result<Option<u64>, AppError> {
        let roster = self.rosters.get_roster(group_id)?;
        self.lotteries.hydrate_group(group_id).await?;
        match self.lotteries.get(lottery_id).await {
            Some(lottery) if lottery.group_id == group_id => {}
            _ => return Ok(None),
        }
        let receipt = self
            .lotteries
            .claim_receipt(
                lottery_id,
                &roster.human_participant_id,
                &roster.human_display_name,
                None,
            )
            .await;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        self.announce_claim(
            group_id,
            lottery_id,
            &roster.human_display_name,
            receipt.amount,
            receipt.finished_lottery,
        )
        .await;
        Ok(Some(receipt.amount))
    }

    /// Apply the expiry policy to every live lottery and note each expiry in
    /// its group's history. Refunding the initiator is up to the host.
    pub async fn expire_lotteries(&self, now: u64) -> Vec<ExpiredLottery> {
        let expired = self
            .lotteries
            .expire_stale(now, self.settings.lottery_ttl_ms)
            .await;
        for lottery in &expired {
            self.append_notice(
                &lottery.group_id,
                format!(
                    "A red envelope expired; {} returned to its sender",
                    format_minor_units(lottery.refund_amount)
                ),
            );
        }
        expired
    }

    async fn announce_claim(
        &self,
        group_id: &str,
        lottery_id: &str,
        claimant_name: &str,
        amount: u64,
        finished_lottery: bool,
    ) {
        let snapshot = self.lotteries.get(lottery_id).await;
        let sender = snapshot
            .as_ref()
            .map(|l| l.initiator_display_name.clone())
            .unwrap_or_default();

        self.append_notice(
            group_id,
            format!(
                "{} claimed {} from {}'s red envelope",
                claimant_name,
                format_minor_units(amount),
                sender
            ),
        );

        if !finished_lottery {
            return;
        }
        if let Some(luckiest) = snapshot.as_ref().and_then(|l| l.luckiest()) {
            self.append_notice(
                group_id,
                format!(
                    "{}'s red envelope is all claimed; luckiest: {} ({})",
                    sender,
                    luckiest.display_name,
                    format_minor_units(luckiest.amount)
                ),
            );
        }
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    pub async fn run_cycle(&self, group_id: &str, trigger: CycleTrigger) -> CycleReport {
        let lock = self.group_lock(group_id);
        let _serial = lock.lock().await;

        let token = self.aborts.register(group_id);
        let _registration = AbortGuard {
            registry: &self.aborts,
            group_id,
        };

        tracing::info!(target: "group_chat", "cycle start for group {} ({:?})", group_id, trigger);
        let report = self.cycle(group_id, trigger, &token).await;
        tracing::info!(
            target: "group_chat",
            "cycle end for group {}: {:?}, {} claim attempts, {} segments",
            group_id,
            report.outcome,
            report.claim_attempts.len(),
            report.delivered.len()
        );
        report
    }

    async fn cycle(
        &self,
        group_id: &str,
        trigger: CycleTrigger,
        token: &CancellationToken,
    ) -> CycleReport {
        let mut report = CycleReport::new(group_id);

        let roster = match self.rosters.get_roster(group_id) {
            Ok(roster) => roster,
            Err(e) => {
                tracing::error!(target: "group_chat", "no roster for {}: {}", group_id, e);
                return report.finish(CycleOutcome::Failed(e.to_string()));
            }
        };

        let trigger_entry = match &trigger {
            CycleTrigger::HumanMessage(text) => {
                let entry = HistoryEntry::human_text(
                    group_id,
                    &roster.human_participant_id,
                    &roster.human_display_name,
                    text,
                );
                if let Err(e) = self.append(group_id, &entry) {
                    return report.finish(CycleOutcome::Failed(e.to_string()));
                }
                Some(entry)
            }
            CycleTrigger::Autonomous => None,
        };

        if let Err(e) = self.lotteries.hydrate_group(group_id).await {
            tracing::warn!(target: "group_chat", "could not load lotteries for {}: {}", group_id, e);
        }

        if !self.claim_pass(&roster, token, &mut report).await {
            return report.finish(CycleOutcome::Cancelled);
        }

        if roster.agent_members.is_empty() {
            return report.finish(CycleOutcome::NoAgents);
        }

        let trigger_text = match &trigger_entry {
            Some(entry) => entry.content.clone(),
            None => self.latest_human_text(group_id, &roster),
        };

        let mentioned = parse_mentions(&trigger_text, &roster.agent_members);
        let repliers = self.with_rng(|rng| {
            selection::choose_repliers(
                &roster.agent_members,
                &mentioned,
                self.settings.max_repliers,
                rng,
            )
        });
        report.repliers = repliers.iter().map(|a| a.agent_id.clone()).collect();

        let prompt = match self
            .assemble_prompt(&roster, &repliers, &trigger_text, trigger_entry.as_ref())
            .await
        {
            Ok(prompt) => prompt,
            Err(e) => return self.fail(group_id, report, e.to_string()),
        };

        let raw = tokio::select! {
            biased;
            _ = token.cancelled() => return report.finish(CycleOutcome::Cancelled),
            result = self.backend.generate(&prompt) => result,
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(target: "group_chat", "generation failed for {}: {}", group_id, e);
                return self.fail(group_id, report, e.to_string());
            }
        };

        let subset: Vec<RosterEntry> = repliers
            .iter()
            .map(|a| RosterEntry {
                agent_id: a.agent_id.clone(),
                display_name: a.display_name.clone(),
            })
            .collect();
        let parsed = parse_reply(&raw, &subset, &self.settings.abstain_sentinels);

        if parsed.is_unrecognised() {
            tracing::warn!(
                target: "group_chat",
                "unusable response for {} ({} chars)",
                group_id,
                raw.len()
            );
            return self.fail(group_id, report, "no recognisable replies".to_string());
        }
        for abstention in &parsed.abstentions {
            tracing::debug!(
                target: "group_chat",
                "{} passed: {}",
                abstention.display_name,
                abstention.abstain_reason.as_deref().unwrap_or("no reason")
            );
        }
        if parsed.turns.is_empty() {
            return report.finish(CycleOutcome::AllAbstained);
        }

        let outcome = self.deliver(&roster, &parsed.turns, token, &mut report).await;
        report.finish(outcome)
    }

    fn fail(&self, group_id: &str, report: CycleReport, reason: String) -> CycleReport {
        self.append_notice(group_id, self.settings.failure_notice.clone());
        report.finish(CycleOutcome::Failed(reason))
    }

    /// Sequential, jittered claim attempts by agents on every active lottery.
    /// Returns `false` if the cycle was cancelled.
    async fn claim_pass(
        &self,
        roster: &GroupRoster,
        token: &CancellationToken,
        report: &mut CycleReport,
    ) -> bool {
        let active = self.lotteries.active_for_group(&roster.group_id).await;

        for lottery in active {
            let mut order: Vec<&AgentMember> = roster.agent_members.iter().collect();
            self.with_rng(|rng| order.shuffle(rng));

            for agent in order {
                match self.lotteries.get(&lottery.id).await {
                    Some(current) if current.is_active() => {}
                    _ => break,
                }
                if self.lotteries.has_claimed(&lottery.id, &agent.agent_id).await {
                    continue;
                }

                let keep_going = self.with_rng(|rng| {
                    rng.gen_bool(self.settings.claim_continue_probability)
                });
                if !keep_going {
                    tracing::debug!(target: "group_chat", "agents lost interest in {}", lottery.id);
                    break;
                }

                if !pause(token, self.jitter(self.settings.claim_delay_ms)).await {
                    return false;
                }

                let receipt = self
                    .lotteries
                    .claim_receipt(
                        &lottery.id,
                        &agent.agent_id,
                        &agent.display_name,
                        agent.display_icon.as_deref(),
                    )
                    .await;

                report.claim_attempts.push(ClaimAttempt {
                    lottery_id: lottery.id.clone(),
                    agent_id: agent.agent_id.clone(),
                    amount: receipt.as_ref().map(|r| r.amount),
                });

                if let Some(receipt) = receipt {
                    self.announce_claim(
                        &roster.group_id,
                        &lottery.id,
                        &agent.display_name,
                        receipt.amount,
                        receipt.finished_lottery,
                    )
                    .await;
                }
            }
        }
        true
    }

    fn latest_human_text(&self, group_id: &str, roster: &GroupRoster) -> String {
        let window = self.settings.history_window.max(1) * 3;
        let recent = self
            .history
            .read_recent_history(group_id, window)
            .unwrap_or_default();
        recent
            .iter()
            .rev()
            .find(|e| {
                e.role == EntryRole::Human
                    && e.kind == EntryKind::Text
                    && e.sender_id == roster.human_participant_id
            })
            .map(|e| e.content.clone())
            .unwrap_or_else(|| self.settings.quiet_group_hint.clone())
    }

    async fn assemble_prompt(
        &self,
        roster: &GroupRoster,
        repliers: &[AgentMember],
        trigger_text: &str,
        trigger_entry: Option<&HistoryEntry>,
    ) -> Result<String, AppError> {
        let window = self.settings.history_window;
        let recent = self
            .history
            .read_recent_history(&roster.group_id, window * 3 + 1)?;
        let mut history: Vec<HistoryEntry> = recent
            .into_iter()
            .filter(|e| !e.is_notice())
            .filter(|e| trigger_entry.map_or(true, |t| t.id != e.id))
            .collect();
        if history.len() > window {
            history.drain(..history.len() - window);
        }

        let lotteries: HashMap<String, LotteryInstance> = self
            .lotteries
            .group_lotteries(&roster.group_id)
            .await
            .into_iter()
            .map(|l| (l.id.clone(), l))
            .collect();

        let sentinel = self
            .settings
            .abstain_sentinels
            .first()
            .map(String::as_str)
            .unwrap_or("SKIP");

        Ok(build_group_prompt(&PromptContext {
            roster,
            repliers,
            history: &history,
            lotteries: &lotteries,
            trigger_text,
            icons: &self.icons,
            separator: &self.settings.bubble_separator,
            icon_tag: &self.settings.icon_tag,
            abstain_sentinel: sentinel,
            local_time: chrono::Local::now().format("%Y-%m-%d %H:%M %A").to_string(),
        }))
    }

    /// Deliver turns in parse order. Each segment is appended to history before
    /// the next delay starts; a cancellation only ever lands between segments.
    async fn deliver(
        &self,
        roster: &GroupRoster,
        turns: &[AgentTurn],
        token: &CancellationToken,
        report: &mut CycleReport,
    ) -> CycleOutcome {
        let rules = SegmentRules {
            separator: self.settings.bubble_separator.clone(),
            icon_tag: self.settings.icon_tag.clone(),
        };

        for (i, turn) in turns.iter().enumerate() {
            if i > 0 && !pause(token, self.settings.inter_agent_delay()).await {
                return CycleOutcome::Cancelled;
            }

            for (j, seg) in segment(turn, &self.icons, &rules).into_iter().enumerate() {
                let delay = if j > 0 {
                    self.jitter(self.settings.intra_turn_delay_ms)
                } else {
                    Duration::ZERO
                };
                if !pause(token, delay).await {
                    return CycleOutcome::Cancelled;
                }

                let entry = match &seg.payload {
                    SegmentPayload::Text { text } => HistoryEntry::agent_text(
                        &roster.group_id,
                        &turn.agent_id,
                        &turn.display_name,
                        text,
                    ),
                    SegmentPayload::Reaction {
                        icon_index,
                        token: description,
                    } => HistoryEntry::agent_reaction(
                        &roster.group_id,
                        &turn.agent_id,
                        &turn.display_name,
                        *icon_index,
                        description,
                    ),
                };
                if let Err(e) = self.append(&roster.group_id, &entry) {
                    tracing::error!(
                        target: "group_chat",
                        "failed to append segment for {}: {}",
                        turn.display_name,
                        e
                    );
                    return CycleOutcome::Failed(e.to_string());
                }
                report.delivered.push(seg);
            }
        }
        CycleOutcome::Completed
    }
}

/// Sleep for `delay` unless the cycle is cancelled first. `false` means stop.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    if token.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
