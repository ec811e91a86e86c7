use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{allocate, LotteryInstance, LotteryStatus};
use crate::error::AppError;
use crate::storage_manager::LotteryRepository;
use crate::utils::now_millis;

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Other(format!("repository task failed: {}", e))
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub amount: u64,
    /// This claim took the last share.
    pub finished_lottery: bool,
}

/// An active lottery moved to `Expired` by [`LotteryStore::expire_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLottery {
    pub lottery_id: String,
    pub group_id: String,
    pub initiator_id: String,
    pub refund_amount: u64,
}

/// Owns live lottery instances. Every mutation of one instance happens under
/// that instance's own lock, so claims on different lotteries never contend.
pub struct LotteryStore {
    lotteries: RwLock<HashMap<String, Arc<Mutex<LotteryInstance>>>>,
    repository: Arc<dyn LotteryRepository>,
    rng: StdMutex<StdRng>,
}

impl LotteryStore {
    pub fn new(repository: Arc<dyn LotteryRepository>) -> Self {
        Self::with_rng(repository, StdRng::from_entropy())
    }

    pub fn with_seed(repository: Arc<dyn LotteryRepository>, seed: u64) -> Self {
        Self::with_rng(repository, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(repository: Arc<dyn LotteryRepository>, rng: StdRng) -> Self {
        Self {
            lotteries: RwLock::new(HashMap::new()),
            repository,
            rng: StdMutex::new(rng),
        }
    }

    async fn handle(&self, lottery_id: &str) -> Option<Arc<Mutex<LotteryInstance>>> {
        self.lotteries.read().await.get(lottery_id).cloned()
    }

    /// Repository calls may block on disk, so they run on the blocking pool.
    async fn persist(&self, instance: LotteryInstance) -> Result<(), AppError> {
        let repository = self.repository.clone();
        tokio::task::spawn_blocking(move || repository.save_lottery_instance(&instance))
            .await
            .map_err(join_error)?
    }

    async fn load(&self, group_id: &str) -> Result<Vec<LotteryInstance>, AppError> {
        let repository = self.repository.clone();
        let group_id = group_id.to_string();
        tokio::task::spawn_blocking(move || repository.load_lotteries(&group_id))
            .await
            .map_err(join_error)?
    }

    pub async fn create(
        &self,
        group_id: &str,
        initiator_id: &str,
        initiator_display_name: &str,
        total_amount: u64,
        share_count: u32,
        blessing_message: &str,
    ) -> Result<LotteryInstance, AppError> {
        let shares = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            allocate(total_amount, share_count, &mut *rng)?
        };

        let instance = LotteryInstance {
            id: format!("lottery_{}", Uuid::new_v4()),
            group_id: group_id.to_string(),
            initiator_id: initiator_id.to_string(),
            initiator_display_name: initiator_display_name.to_string(),
            total_amount,
            share_count,
            blessing_message: blessing_message.to_string(),
            created_at: now_millis(),
            status: LotteryStatus::Active,
            shares,
            claims: Vec::new(),
        };

        self.persist(instance.clone()).await?;
        self.lotteries
            .write()
            .await
            .insert(instance.id.clone(), Arc::new(Mutex::new(instance.clone())));

        tracing::info!(
            target: "lottery",
            "created lottery {} in group {}: {} units over {} shares",
            instance.id,
            group_id,
            total_amount,
            share_count
        );
        Ok(instance)
    }

    /// Load a group's persisted lotteries into the live set. Instances already
    /// live are left untouched so in-flight claims are never overwritten.
    pub async fn hydrate_group(&self, group_id: &str) -> Result<usize, AppError> {
        let persisted = self.load(group_id).await?;
        let mut lotteries = self.lotteries.write().await;
        let mut added = 0;
        for instance in persisted {
            if !lotteries.contains_key(&instance.id) {
                lotteries.insert(instance.id.clone(), Arc::new(Mutex::new(instance)));
                added += 1;
            }
        }
        Ok(added)
    }

    /// Award the next share to `participant_id`, or `None` when the participant
    /// already claimed, the lottery is unknown or not active, or no share is left.
    pub async fn claim(
        &self,
        lottery_id: &str,
        participant_id: &str,
        display_name: &str,
        display_icon: Option<&str>,
    ) -> Option<u64> {
        self.claim_receipt(lottery_id, participant_id, display_name, display_icon)
            .await
            .map(|r| r.amount)
    }

    pub async fn claim_receipt(
        &self,
        lottery_id: &str,
        participant_id: &str,
        display_name: &str,
        display_icon: Option<&str>,
    ) -> Option<ClaimReceipt> {
        let handle = self.handle(lottery_id).await?;
        let mut live = handle.lock().await;

        let mut next = live.clone();
        let amount = next.apply_claim(participant_id, display_name, display_icon, now_millis())?;

        if let Err(e) = self.persist(next.clone()).await {
            tracing::error!(
                target: "lottery",
                "failed to persist claim on {} by {}: {}",
                lottery_id,
                participant_id,
                e
            );
            return None;
        }

        let finished_lottery = next.status == LotteryStatus::Finished;
        *live = next;

        tracing::debug!(
            target: "lottery",
            "{} claimed {} from {} ({} shares left)",
            participant_id,
            amount,
            lottery_id,
            live.remaining_shares()
        );
        Some(ClaimReceipt {
            amount,
            finished_lottery,
        })
    }

    pub async fn has_claimed(&self, lottery_id: &str, participant_id: &str) -> bool {
        match self.handle(lottery_id).await {
            Some(handle) => handle.lock().await.has_claimed(participant_id),
            None => false,
        }
    }

    pub async fn get_luckiest(&self, lottery_id: &str) -> Option<String> {
        let handle = self.handle(lottery_id).await?;
        let lottery = handle.lock().await;
        lottery.luckiest().map(|c| c.participant_id.clone())
    }

    pub async fn get(&self, lottery_id: &str) -> Option<LotteryInstance> {
        let handle = self.handle(lottery_id).await?;
        let lottery = handle.lock().await;
        Some(lottery.clone())
    }

    /// Snapshots of a group's live lotteries, oldest first.
    pub async fn group_lotteries(&self, group_id: &str) -> Vec<LotteryInstance> {
        let handles: Vec<Arc<Mutex<LotteryInstance>>> =
            self.lotteries.read().await.values().cloned().collect();

        let mut found = Vec::new();
        for handle in handles {
            let lottery = handle.lock().await;
            if lottery.group_id == group_id {
                found.push(lottery.clone());
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    pub async fn active_for_group(&self, group_id: &str) -> Vec<LotteryInstance> {
        self.group_lotteries(group_id)
            .await
            .into_iter()
            .filter(LotteryInstance::is_active)
            .collect()
    }

    /// Expire active lotteries created more than `ttl_ms` before `now`.
    /// When to sweep is the host's policy; this only applies it.
    pub async fn expire_stale(&self, now: u64, ttl_ms: u64) -> Vec<ExpiredLottery> {
        let handles: Vec<Arc<Mutex<LotteryInstance>>> =
            self.lotteries.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for handle in handles {
            let mut live = handle.lock().await;
            if !live.is_active() || now.saturating_sub(live.created_at) <= ttl_ms {
                continue;
            }

            let mut next = live.clone();
            next.status = LotteryStatus::Expired;
            if let Err(e) = self.persist(next.clone()).await {
                tracing::warn!(target: "lottery", "failed to persist expiry of {}: {}", next.id, e);
                continue;
            }

            let refund_amount = next.unawarded_amount();
            tracing::info!(
                target: "lottery",
                "lottery {} expired, refunding {} to {}",
                next.id,
                refund_amount,
                next.initiator_id
            );
            expired.push(ExpiredLottery {
                lottery_id: next.id.clone(),
                group_id: next.group_id.clone(),
                initiator_id: next.initiator_id.clone(),
                refund_amount,
            });
            *live = next;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::storage_manager::MemoryStore;

    struct FailingRepository;

    impl LotteryRepository for FailingRepository {
        fn load_lotteries(&self, _group_id: &str) -> Result<Vec<LotteryInstance>, AppError> {
            Ok(vec![])
        }

        fn save_lottery_instance(&self, _instance: &LotteryInstance) -> Result<(), AppError> {
            Err(AppError::Database("disk full".to_string()))
        }
    }

    #[derive(Default)]
    struct ThreadRecordingRepository {
        threads: StdMutex<Vec<std::thread::ThreadId>>,
    }

    impl LotteryRepository for ThreadRecordingRepository {
        fn load_lotteries(&self, _group_id: &str) -> Result<Vec<LotteryInstance>, AppError> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(vec![])
        }

        fn save_lottery_instance(&self, _instance: &LotteryInstance) -> Result<(), AppError> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(())
        }
    }

    fn store() -> (Arc<MemoryStore>, LotteryStore) {
        let repo = Arc::new(MemoryStore::new());
        let store = LotteryStore::with_seed(repo.clone(), 11);
        (repo, store)
    }

    #[tokio::test]
    async fn test_create_allocates_and_persists() {
        let (repo, store) = store();
        let lottery = store
            .create("g1", "human", "Me", 1000, 4, "Cheers")
            .await
            .unwrap();

        assert_eq!(lottery.status, LotteryStatus::Active);
        assert_eq!(lottery.shares.len(), 4);
        assert_eq!(lottery.shares.iter().sum::<u64>(), 1000);
        assert!(lottery.claims.is_empty());
        assert_eq!(repo.load_lotteries("g1").unwrap(), vec![lottery]);
    }

    #[tokio::test]
    async fn test_create_rejects_insufficient_amount() {
        let (_, store) = store();
        let err = store.create("g1", "human", "Me", 2, 3, "").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::InsufficientAmount { total: 2, shares: 3 })
        ));
        assert!(store.group_lotteries("g1").await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_claim_succeeds_once() {
        let (_, store) = store();
        let lottery = store.create("g1", "human", "Me", 1000, 3, "").await.unwrap();

        let first = store.claim(&lottery.id, "a1", "Alice", None).await;
        assert_eq!(first, Some(lottery.shares[0]));
        assert_eq!(store.claim(&lottery.id, "a1", "Alice", None).await, None);

        let snapshot = store.get(&lottery.id).await.unwrap();
        assert_eq!(snapshot.claims.len(), 1);
        assert!(store.has_claimed(&lottery.id, "a1").await);
        assert!(!store.has_claimed(&lottery.id, "a2").await);
    }

    #[tokio::test]
    async fn test_lottery_finishes_after_share_count_claims() {
        let (_, store) = store();
        let lottery = store.create("g1", "human", "Me", 1000, 2, "").await.unwrap();

        let r1 = store.claim_receipt(&lottery.id, "a1", "Alice", None).await.unwrap();
        assert!(!r1.finished_lottery);
        let r2 = store.claim_receipt(&lottery.id, "a2", "Bob", None).await.unwrap();
        assert!(r2.finished_lottery);
        assert_eq!(r1.amount + r2.amount, 1000);

        assert_eq!(store.claim(&lottery.id, "a3", "Carol", None).await, None);
        let snapshot = store.get(&lottery.id).await.unwrap();
        assert_eq!(snapshot.status, LotteryStatus::Finished);
        assert!(store.active_for_group("g1").await.is_empty());
        assert!(store.get_luckiest(&lottery.id).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_lottery_claim_is_none() {
        let (_, store) = store();
        assert_eq!(store.claim("nope", "a1", "Alice", None).await, None);
        assert!(!store.has_claimed("nope", "a1").await);
        assert_eq!(store.get_luckiest("nope").await, None);
    }

    #[tokio::test]
    async fn test_luckiest_only_once_finished() {
        let (_, store) = store();
        let lottery = store.create("g1", "human", "Me", 1000, 3, "").await.unwrap();
        store.claim(&lottery.id, "a", "A", None).await.unwrap();
        assert_eq!(store.get_luckiest(&lottery.id).await, None);
        store.claim(&lottery.id, "b", "B", None).await.unwrap();
        store.claim(&lottery.id, "c", "C", None).await.unwrap();

        let snapshot = store.get(&lottery.id).await.unwrap();
        let max = snapshot.claims.iter().map(|c| c.amount).max().unwrap();
        let expected = snapshot
            .claims
            .iter()
            .find(|c| c.amount == max)
            .map(|c| c.participant_id.clone());
        assert_eq!(store.get_luckiest(&lottery.id).await, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_an_index() {
        let repo = Arc::new(MemoryStore::new());
        let store = Arc::new(LotteryStore::with_seed(repo, 5));
        let lottery = store.create("g1", "human", "Me", 10_000, 5, "").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = lottery.id.clone();
            tasks.push(tokio::spawn(async move {
                let pid = format!("p{}", i % 10);
                store.claim(&id, &pid, &pid, None).await
            }));
        }

        let mut awarded = Vec::new();
        for task in tasks {
            if let Some(amount) = task.await.unwrap() {
                awarded.push(amount);
            }
        }

        let snapshot = store.get(&lottery.id).await.unwrap();
        assert_eq!(awarded.len(), 5);
        assert_eq!(awarded.iter().sum::<u64>(), 10_000);
        assert_eq!(snapshot.claims.len(), 5);
        assert_eq!(snapshot.status, LotteryStatus::Finished);
        let mut ids: Vec<&str> = snapshot.claims.iter().map(|c| c.participant_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_claim_unapplied() {
        let store = LotteryStore::with_seed(Arc::new(MemoryStore::new()), 3);
        let lottery = store.create("g1", "human", "Me", 100, 2, "").await.unwrap();

        let failing = LotteryStore::with_seed(Arc::new(FailingRepository), 3);
        failing
            .lotteries
            .write()
            .await
            .insert(lottery.id.clone(), Arc::new(Mutex::new(lottery.clone())));

        assert_eq!(failing.claim(&lottery.id, "a1", "Alice", None).await, None);
        assert!(!failing.has_claimed(&lottery.id, "a1").await);
    }

    #[tokio::test]
    async fn test_hydrate_group_loads_persisted_instances() {
        let (repo, store) = store();
        let lottery = store.create("g1", "human", "Me", 500, 2, "").await.unwrap();

        let fresh = LotteryStore::with_seed(repo, 1);
        assert_eq!(fresh.hydrate_group("g1").await.unwrap(), 1);
        assert_eq!(fresh.hydrate_group("g1").await.unwrap(), 0);
        assert_eq!(fresh.get(&lottery.id).await.unwrap(), lottery);
    }

    #[tokio::test]
    async fn test_expire_stale_refunds_unawarded_shares() {
        let (_, store) = store();
        let lottery = store.create("g1", "human", "Me", 1000, 3, "").await.unwrap();
        let got = store.claim(&lottery.id, "a1", "Alice", None).await.unwrap();

        assert!(store.expire_stale(lottery.created_at + 10, 1000).await.is_empty());

        let expired = store.expire_stale(lottery.created_at + 5000, 1000).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].refund_amount, 1000 - got);
        assert_eq!(expired[0].initiator_id, "human");

        assert_eq!(store.claim(&lottery.id, "a2", "Bob", None).await, None);
        assert_eq!(
            store.get(&lottery.id).await.unwrap().status,
            LotteryStatus::Expired
        );
        assert!(store.expire_stale(lottery.created_at + 9000, 1000).await.is_empty());
    }

    #[tokio::test]
    async fn test_repository_calls_leave_the_runtime_thread() {
        let repo = Arc::new(ThreadRecordingRepository::default());
        let store = LotteryStore::with_seed(repo.clone(), 2);

        store.hydrate_group("g1").await.unwrap();
        let lottery = store.create("g1", "human", "Me", 100, 2, "").await.unwrap();
        store.claim(&lottery.id, "a1", "Alice", None).await.unwrap();

        let here = std::thread::current().id();
        let threads = repo.threads.lock().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|id| *id != here));
    }
}
