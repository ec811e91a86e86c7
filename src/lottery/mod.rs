//! Red envelope lotteries
//!
//! A lottery is a fixed pool split up front into randomly sized shares
//! (see [`allocation::allocate`]) and handed out first-come-first-served.
//! [`store::LotteryStore`] owns live instances and serialises claims per lottery.

pub mod allocation;
pub mod store;

use serde::{Deserialize, Serialize};

pub use allocation::allocate;
pub use store::{ClaimReceipt, ExpiredLottery, LotteryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LotteryStatus {
    Active,
    Finished,
    /// Swept by the host's expiry policy before every share was claimed.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub participant_id: String,
    pub amount: u64,
    pub claimed_at: u64,
    pub display_name: String,
    #[serde(default)]
    pub display_icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotteryInstance {
    pub id: String,
    pub group_id: String,
    pub initiator_id: String,
    pub initiator_display_name: String,
    pub total_amount: u64,
    pub share_count: u32,
    pub blessing_message: String,
    pub created_at: u64,
    pub status: LotteryStatus,
    pub shares: Vec<u64>,
    /// Claim order; participant ids are unique.
    #[serde(default)]
    pub claims: Vec<ClaimRecord>,
}

impl LotteryInstance {
    pub fn is_active(&self) -> bool {
        self.status == LotteryStatus::Active
    }

    pub fn has_claimed(&self, participant_id: &str) -> bool {
        self.claims.iter().any(|c| c.participant_id == participant_id)
    }

    pub fn remaining_shares(&self) -> usize {
        self.shares.len().saturating_sub(self.claims.len())
    }

    pub fn claimed_amount(&self) -> u64 {
        self.claims.iter().map(|c| c.amount).sum()
    }

    /// Sum of the shares nobody has been awarded yet.
    pub fn unawarded_amount(&self) -> u64 {
        self.shares.iter().skip(self.claims.len()).sum()
    }

    /// Largest claim of a finished lottery; ties go to the earlier claim.
    pub fn luckiest(&self) -> Option<&ClaimRecord> {
        if self.status != LotteryStatus::Finished {
            return None;
        }
        let mut best: Option<&ClaimRecord> = None;
        for claim in &self.claims {
            best = match best {
                None => Some(claim),
                Some(current) if claim.amount > current.amount => Some(claim),
                Some(current)
                    if claim.amount == current.amount && claim.claimed_at < current.claimed_at =>
                {
                    Some(claim)
                }
                keep => keep,
            };
        }
        best
    }

    /// Award the next unclaimed share. Callers must hold the lottery's lock.
    fn apply_claim(
        &mut self,
        participant_id: &str,
        display_name: &str,
        display_icon: Option<&str>,
        now: u64,
    ) -> Option<u64> {
        if !self.is_active() || self.has_claimed(participant_id) {
            return None;
        }
        let amount = *self.shares.get(self.claims.len())?;
        self.claims.push(ClaimRecord {
            participant_id: participant_id.to_string(),
            amount,
            claimed_at: now,
            display_name: display_name.to_string(),
            display_icon: display_icon.map(str::to_string),
        });
        if self.claims.len() >= self.shares.len() {
            self.status = LotteryStatus::Finished;
        }
        Some(amount)
    }
}
