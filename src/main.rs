use std::env;
use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context};

use group_engine_lib::{
    logger, CycleTrigger, EngineSettings, GroupOrchestrator, GroupRoster, LotteryStore,
    MemoryStore, OpenAiCompatibleBackend, SegmentPayload,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        bail!("usage: group-engine <settings.json> <roster.json> <message>");
    }

    let settings = EngineSettings::load(&args[1])
        .with_context(|| format!("failed to load settings from {}", args[1]))?;
    logger::init_logging(&settings.logging)?;

    let roster_raw = fs::read_to_string(&args[2])
        .with_context(|| format!("failed to read roster {}", args[2]))?;
    let roster: GroupRoster = serde_json::from_str(&roster_raw).context("invalid roster")?;
    let group_id = roster.group_id.clone();

    let store = Arc::new(MemoryStore::new());
    store.put_roster(roster)?;

    let backend = Arc::new(OpenAiCompatibleBackend::new(settings.backend.clone())?);
    let lotteries = Arc::new(LotteryStore::new(store.clone()));
    let orchestrator =
        GroupOrchestrator::new(settings, backend, store.clone(), store.clone(), lotteries);

    let message = args[3..].join(" ");
    let report = orchestrator
        .run_cycle(&group_id, CycleTrigger::HumanMessage(message))
        .await;

    for seg in &report.delivered {
        match &seg.payload {
            SegmentPayload::Text { text } => println!("{}: {}", seg.agent_id, text),
            SegmentPayload::Reaction { token, .. } => println!("{}: [{}]", seg.agent_id, token),
        }
    }
    println!("{}", serde_json::to_string_pretty(&report.outcome)?);
    Ok(())
}
