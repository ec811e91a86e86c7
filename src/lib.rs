pub mod abort_manager;
pub mod chat_manager;
pub mod error;
pub mod group_chat_manager;
pub mod logger;
pub mod lottery;
pub mod settings;
pub mod storage_manager;
pub mod utils;

pub use chat_manager::{OpenAiCompatibleBackend, TextBackend};
pub use error::{AppError, ValidationError};
pub use group_chat_manager::{
    segmenter::{DeliverySegment, IconEntry, SegmentPayload},
    AgentTurn, ClaimAttempt, CycleOutcome, CycleReport, CycleTrigger, GroupOrchestrator,
};
pub use lottery::{allocate, ClaimRecord, LotteryInstance, LotteryStatus, LotteryStore};
pub use settings::EngineSettings;
pub use storage_manager::{
    AgentMember, GroupRoster, HistoryEntry, HistoryStore, LotteryRepository, MemoryStore,
    RosterProvider, SqliteStore,
};
