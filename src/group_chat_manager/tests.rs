use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::*;
use crate::lottery::LotteryStatus;
use crate::storage_manager::MemoryStore;
use crate::utils::now_millis;

struct ScriptedBackend {
    replies: StdMutex<VecDeque<Result<String, AppError>>>,
    prompts: StdMutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(replies: Vec<Result<String, AppError>>) -> Self {
        Self {
            replies: StdMutex::new(replies.into()),
            prompts: StdMutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl TextBackend for ScriptedBackend {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, AppError>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()));
        async move { reply }.boxed()
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    backend: Arc<ScriptedBackend>,
    orchestrator: Arc<GroupOrchestrator>,
}

fn agent(id: &str, name: &str) -> AgentMember {
    AgentMember {
        agent_id: id.to_string(),
        display_name: name.to_string(),
        persona_description: format!("{} likes snacks", name),
        display_icon: None,
    }
}

fn roster(agents: Vec<AgentMember>) -> GroupRoster {
    GroupRoster {
        group_id: "g1".to_string(),
        group_name: "Snack club".to_string(),
        announcement: None,
        human_participant_id: "human".to_string(),
        human_display_name: "Sam".to_string(),
        agent_members: agents,
    }
}

fn quick_settings() -> EngineSettings {
    EngineSettings {
        max_repliers: 2,
        claim_continue_probability: 1.0,
        ..EngineSettings::default()
    }
    .without_delays()
}

fn fixture_with(
    settings: EngineSettings,
    agents: Vec<AgentMember>,
    replies: Vec<Result<String, AppError>>,
) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store.put_roster(roster(agents)).unwrap();
    let backend = Arc::new(ScriptedBackend::new(replies));
    let lotteries = Arc::new(LotteryStore::with_seed(store.clone(), 11));
    let orchestrator = GroupOrchestrator::new(
        settings,
        backend.clone(),
        store.clone(),
        store.clone(),
        lotteries,
    )
    .with_seed(5)
    .with_icons(vec![IconEntry {
        icon_index: 0,
        match_token: "thumbs up".to_string(),
    }]);
    Fixture {
        store,
        backend,
        orchestrator: Arc::new(orchestrator),
    }
}

fn fixture(replies: Vec<&str>) -> Fixture {
    fixture_with(
        quick_settings(),
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        replies.into_iter().map(|r| Ok(r.to_string())).collect(),
    )
}

fn agent_texts(store: &MemoryStore) -> Vec<String> {
    store
        .full_history("g1")
        .into_iter()
        .filter(|e| e.role == EntryRole::Agent && e.kind == EntryKind::Text)
        .map(|e| e.content)
        .collect()
}

fn notices(store: &MemoryStore) -> Vec<String> {
    store
        .full_history("g1")
        .into_iter()
        .filter(HistoryEntry::is_notice)
        .map(|e| e.content)
        .collect()
}

// ============================================================================
// Lottery pass
// ============================================================================

#[tokio::test]
async fn test_cycle_claims_before_replies() {
    let f = fixture(vec!["[Alice] thanks boss|so lucky\n[Bob] SKIP"]);
    let lottery = f
        .orchestrator
        .send_lottery("g1", 1000, 2, "Lunch money")
        .await
        .unwrap();

    let report = f
        .orchestrator
        .run_cycle("g1", CycleTrigger::HumanMessage("grab it!".to_string()))
        .await;

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert!(report.claim_attempts.len() <= 2);
    let awarded: u64 = report.claim_attempts.iter().filter_map(|c| c.amount).sum();
    assert_eq!(awarded, 1000);

    let stored = f.orchestrator.lottery_store().get(&lottery.id).await.unwrap();
    assert_eq!(stored.status, LotteryStatus::Finished);

    let history = f.store.full_history("g1");
    let last_notice = history.iter().rposition(HistoryEntry::is_notice).unwrap();
    let first_reply = history
        .iter()
        .position(|e| e.role == EntryRole::Agent)
        .unwrap();
    assert!(last_notice < first_reply);
    assert!(notices(&f.store).iter().any(|n| n.contains("luckiest")));

    assert_eq!(agent_texts(&f.store), vec!["thanks boss", "so lucky"]);
    assert_eq!(report.delivered.len(), 2);
}

#[tokio::test]
async fn test_agents_never_claim_twice() {
    let f = fixture(vec!["[Alice] yay", "[Bob] hi"]);
    f.orchestrator
        .send_lottery("g1", 900, 3, "Three ways")
        .await
        .unwrap();

    let first = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;
    assert_eq!(first.claim_attempts.len(), 2);

    let second = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;
    assert!(second.claim_attempts.is_empty());
}

#[tokio::test]
async fn test_unwilling_agents_skip_lottery() {
    let settings = EngineSettings {
        claim_continue_probability: 1e-9,
        ..quick_settings()
    };
    let f = fixture_with(
        settings,
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![Ok("[Alice] hm".to_string())],
    );
    f.orchestrator
        .send_lottery("g1", 500, 2, "Anyone?")
        .await
        .unwrap();

    let report = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;
    assert!(report.claim_attempts.is_empty());
    assert!(notices(&f.store).is_empty());
}

#[tokio::test]
async fn test_claim_as_human() {
    let f = fixture(vec![]);
    let lottery = f
        .orchestrator
        .send_lottery("g1", 300, 1, "Just one")
        .await
        .unwrap();

    let amount = f
        .orchestrator
        .claim_as_human("g1", &lottery.id)
        .await
        .unwrap();
    assert_eq!(amount, Some(300));
    assert_eq!(
        f.orchestrator
            .claim_as_human("g1", &lottery.id)
            .await
            .unwrap(),
        None
    );

    let notices = notices(&f.store);
    assert_eq!(notices.len(), 2);
    assert!(notices[0].contains("Sam claimed 3.00"));
    assert!(notices[1].contains("luckiest: Sam (3.00)"));
}

#[tokio::test]
async fn test_claim_as_human_ignores_other_groups_lottery() {
    let f = fixture(vec![]);
    f.store
        .put_roster(GroupRoster {
            group_id: "g2".to_string(),
            human_participant_id: "eve".to_string(),
            human_display_name: "Eve".to_string(),
            ..roster(vec![])
        })
        .unwrap();
    let lottery = f
        .orchestrator
        .send_lottery("g1", 300, 1, "Just one")
        .await
        .unwrap();

    let amount = f
        .orchestrator
        .claim_as_human("g2", &lottery.id)
        .await
        .unwrap();
    assert_eq!(amount, None);
    assert_eq!(f.store.history_len("g2"), 0);
    assert!(!f
        .orchestrator
        .lottery_store()
        .has_claimed(&lottery.id, "eve")
        .await);
    assert_eq!(
        f.orchestrator.claim_as_human("g1", &lottery.id).await.unwrap(),
        Some(300)
    );
}

#[tokio::test]
async fn test_send_lottery_rejects_invalid_split() {
    let f = fixture(vec![]);
    let err = f
        .orchestrator
        .send_lottery("g1", 1, 2, "Too thin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(f.store.history_len("g1"), 0);
}

#[tokio::test]
async fn test_expire_lotteries_appends_refund_notice() {
    let f = fixture(vec![]);
    f.orchestrator
        .send_lottery("g1", 1000, 2, "Slow group")
        .await
        .unwrap();

    let ttl = f.orchestrator.settings().lottery_ttl_ms;
    let expired = f.orchestrator.expire_lotteries(now_millis() + ttl + 1).await;

    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].refund_amount, 1000);
    assert!(notices(&f.store)[0].contains("10.00"));
}

// ============================================================================
// Generation outcomes
// ============================================================================

#[tokio::test]
async fn test_backend_error_appends_one_failure_notice() {
    let f = fixture_with(
        quick_settings(),
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![Err(AppError::Generation("boom".to_string()))],
    );

    let report = f
        .orchestrator
        .run_cycle("g1", CycleTrigger::HumanMessage("hello?".to_string()))
        .await;

    assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
    assert_eq!(
        notices(&f.store),
        vec![f.orchestrator.settings().failure_notice.clone()]
    );
    assert!(agent_texts(&f.store).is_empty());
}

#[tokio::test]
async fn test_unrecognised_reply_is_failure() {
    let f = fixture(vec!["sure, here is a group chat for you"]);
    let report = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;

    assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
    assert_eq!(notices(&f.store).len(), 1);
}

#[tokio::test]
async fn test_all_abstained_is_silent() {
    let f = fixture(vec!["[Alice] SKIP\n[Bob] pass (busy)"]);
    let report = f
        .orchestrator
        .run_cycle("g1", CycleTrigger::HumanMessage("anyone?".to_string()))
        .await;

    assert_eq!(report.outcome, CycleOutcome::AllAbstained);
    assert!(notices(&f.store).is_empty());
    assert_eq!(f.store.history_len("g1"), 1);
}

#[tokio::test]
async fn test_empty_sentinel_list_still_abstains_on_skip() {
    let settings = EngineSettings {
        abstain_sentinels: vec![],
        ..quick_settings()
    };
    let f = fixture_with(
        settings,
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![Ok("[Alice] hi\n[Bob] SKIP".to_string())],
    );

    let report = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(agent_texts(&f.store), vec!["hi"]);
    assert!(f.backend.prompts()[0].contains("reply text or SKIP"));
}

#[tokio::test]
async fn test_no_agents_skips_backend() {
    let f = fixture_with(quick_settings(), vec![], vec![]);
    let report = f
        .orchestrator
        .run_cycle("g1", CycleTrigger::HumanMessage("echo".to_string()))
        .await;

    assert_eq!(report.outcome, CycleOutcome::NoAgents);
    assert!(f.backend.prompts().is_empty());
}

#[tokio::test]
async fn test_missing_roster_fails_without_calling_backend() {
    let f = fixture(vec!["[Alice] hi"]);
    let report = f.orchestrator.run_cycle("nope", CycleTrigger::Autonomous).await;

    assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
    assert!(f.backend.prompts().is_empty());
}

#[tokio::test]
async fn test_unknown_speakers_are_dropped() {
    let f = fixture(vec!["[Mallory] let me in\n[Alice] hey"]);
    let report = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(agent_texts(&f.store), vec!["hey"]);
}

#[tokio::test]
async fn test_reactions_are_delivered_as_reaction_entries() {
    let f = fixture(vec!["[Alice] nice [icon:0]"]);
    f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;

    let history = f.store.full_history("g1");
    let reaction = history
        .iter()
        .find(|e| e.kind == EntryKind::Reaction)
        .unwrap();
    assert_eq!(reaction.icon_index, Some(0));
    assert_eq!(reaction.content, "thumbs up");
    assert_eq!(agent_texts(&f.store), vec!["nice"]);
}

// ============================================================================
// Replier selection and prompt
// ============================================================================

#[tokio::test]
async fn test_mentioned_agent_is_always_asked() {
    let settings = EngineSettings {
        max_repliers: 1,
        ..quick_settings()
    };
    let f = fixture_with(
        settings,
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![Ok("[Bob] here".to_string())],
    );

    let report = f
        .orchestrator
        .run_cycle("g1", CycleTrigger::HumanMessage("@Bob you there?".to_string()))
        .await;

    assert_eq!(report.repliers, vec!["a2".to_string()]);
    let prompt = &f.backend.prompts()[0];
    assert!(prompt.contains("[Bob] reply text"));
    assert!(!prompt.contains("[Alice] reply text"));
}

#[tokio::test]
async fn test_autonomous_cycle_prompts() {
    let f = fixture(vec!["[Alice] hi", "[Bob] yo"]);

    f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;
    let hint = f.orchestrator.settings().quiet_group_hint.clone();
    assert!(f.backend.prompts()[0].contains(&hint));

    f.store
        .append_turn_history("g1", &HistoryEntry::human_text("g1", "human", "Sam", "pizza tonight?"))
        .unwrap();
    f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;
    assert!(f.backend.prompts()[1].contains("## New Message\n\nSam: pizza tonight?"));
}

#[tokio::test]
async fn test_prompt_excludes_notices_and_trigger_from_history() {
    let f = fixture(vec!["[Alice] ok"]);
    f.orchestrator
        .send_lottery("g1", 1000, 2, "Lunch money")
        .await
        .unwrap();

    f.orchestrator
        .run_cycle("g1", CycleTrigger::HumanMessage("grab it!".to_string()))
        .await;

    let prompt = &f.backend.prompts()[0];
    assert!(!prompt.contains(" claimed "));
    assert!(prompt.contains("Sam: [sent a red envelope] Lunch money (1000/2 shares)"));
    assert_eq!(prompt.matches("grab it!").count(), 1);
}

// ============================================================================
// Pacing and cancellation
// ============================================================================

fn paced_settings(inter_ms: u64, intra_ms: u64) -> EngineSettings {
    EngineSettings {
        inter_agent_delay_ms: inter_ms,
        intra_turn_delay_ms: DelayRange::fixed(intra_ms),
        ..quick_settings()
    }
}

#[tokio::test(start_paused = true)]
async fn test_delivery_pacing() {
    let f = fixture_with(
        paced_settings(2000, 500),
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![Ok("[Alice] a|b\n[Bob] c".to_string())],
    );

    let start = tokio::time::Instant::now();
    let report = f.orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await;
    let elapsed = start.elapsed();

    assert_eq!(report.delivered.len(), 3);
    assert!(elapsed >= Duration::from_millis(2500));
    assert!(elapsed < Duration::from_millis(2600));
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_between_segments() {
    let f = fixture_with(
        paced_settings(60_000, 0),
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![Ok("[Alice] first|second\n[Bob] never".to_string())],
    );

    let orchestrator = f.orchestrator.clone();
    let handle =
        tokio::spawn(async move { orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(f.orchestrator.is_cycle_running("g1"));
    f.orchestrator.abort("g1").unwrap();

    let report = handle.await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Cancelled);
    assert_eq!(agent_texts(&f.store), vec!["first", "second"]);
    assert!(!f.orchestrator.is_cycle_running("g1"));
    assert!(f.orchestrator.abort("g1").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_same_group_cycles_never_interleave() {
    let f = fixture_with(
        paced_settings(0, 1000),
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![
            Ok("[Alice] one|two".to_string()),
            Ok("[Alice] three|four".to_string()),
        ],
    );

    let first = {
        let orchestrator = f.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await })
    };
    let second = {
        let orchestrator = f.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(agent_texts(&f.store), vec!["one", "two", "three", "four"]);
}

#[tokio::test(start_paused = true)]
async fn test_different_groups_run_concurrently() {
    let f = fixture_with(
        paced_settings(2000, 500),
        vec![agent("a1", "Alice"), agent("a2", "Bob")],
        vec![
            Ok("[Alice] a|b\n[Bob] c".to_string()),
            Ok("[Alice] x|y\n[Bob] z".to_string()),
        ],
    );
    f.store
        .put_roster(GroupRoster {
            group_id: "g2".to_string(),
            ..roster(vec![agent("a1", "Alice"), agent("a2", "Bob")])
        })
        .unwrap();

    let start = tokio::time::Instant::now();
    let first = {
        let orchestrator = f.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle("g1", CycleTrigger::Autonomous).await })
    };
    let second = {
        let orchestrator = f.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle("g2", CycleTrigger::Autonomous).await })
    };
    let first = first.await.unwrap();
    let second = second.await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(first.outcome, CycleOutcome::Completed);
    assert_eq!(second.outcome, CycleOutcome::Completed);
    assert!(elapsed >= Duration::from_millis(2500));
    assert!(elapsed < Duration::from_millis(3000));

    let texts = |group_id: &str| -> Vec<String> {
        f.store
            .full_history(group_id)
            .into_iter()
            .filter(|e| e.role == EntryRole::Agent)
            .map(|e| e.content)
            .collect()
    };
    assert_eq!(texts("g1"), vec!["a", "b", "c"]);
    assert_eq!(texts("g2"), vec!["x", "y", "z"]);
    assert!(f
        .store
        .full_history("g2")
        .iter()
        .all(|e| e.group_id == "g2"));
}
