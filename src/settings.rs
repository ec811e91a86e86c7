//! Engine configuration.
//!
//! Every field has a default so a partial (or empty) JSON document is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl DelayRange {
    pub const fn fixed(ms: u64) -> Self {
        Self { min: ms, max: ms }
    }

    fn normalized(self) -> Self {
        if self.min <= self.max {
            self
        } else {
            Self {
                min: self.max,
                max: self.min,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default = "default_max_repliers")]
    pub max_repliers: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_inter_agent_delay_ms")]
    pub inter_agent_delay_ms: u64,
    #[serde(default = "default_intra_turn_delay")]
    pub intra_turn_delay_ms: DelayRange,
    #[serde(default = "default_claim_delay")]
    pub claim_delay_ms: DelayRange,
    #[serde(default = "default_claim_continue_probability")]
    pub claim_continue_probability: f64,
    #[serde(default = "default_bubble_separator")]
    pub bubble_separator: String,
    #[serde(default = "default_icon_tag")]
    pub icon_tag: String,
    #[serde(default = "default_abstain_sentinels")]
    pub abstain_sentinels: Vec<String>,
    #[serde(default = "default_failure_notice")]
    pub failure_notice: String,
    #[serde(default = "default_quiet_group_hint")]
    pub quiet_group_hint: String,
    #[serde(default = "default_lottery_ttl_ms")]
    pub lottery_ttl_ms: u64,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_repliers: default_max_repliers(),
            history_window: default_history_window(),
            inter_agent_delay_ms: default_inter_agent_delay_ms(),
            intra_turn_delay_ms: default_intra_turn_delay(),
            claim_delay_ms: default_claim_delay(),
            claim_continue_probability: default_claim_continue_probability(),
            bubble_separator: default_bubble_separator(),
            icon_tag: default_icon_tag(),
            abstain_sentinels: default_abstain_sentinels(),
            failure_notice: default_failure_notice(),
            quiet_group_hint: default_quiet_group_hint(),
            lottery_ttl_ms: default_lottery_ttl_ms(),
            backend: BackendSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let settings: EngineSettings = serde_json::from_str(raw)?;
        Ok(settings.normalized())
    }

    /// Clamp out-of-range values into something the engine can run with.
    pub fn normalized(mut self) -> Self {
        self.max_repliers = self.max_repliers.max(1);
        self.intra_turn_delay_ms = self.intra_turn_delay_ms.normalized();
        self.claim_delay_ms = self.claim_delay_ms.normalized();
        if !(self.claim_continue_probability > 0.0) {
            self.claim_continue_probability = default_claim_continue_probability();
        }
        self.claim_continue_probability = self.claim_continue_probability.min(1.0);
        if self.bubble_separator.is_empty() {
            self.bubble_separator = default_bubble_separator();
        }
        if self.icon_tag.is_empty() {
            self.icon_tag = default_icon_tag();
        }
        self.abstain_sentinels = self
            .abstain_sentinels
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if self.abstain_sentinels.is_empty() {
            self.abstain_sentinels = default_abstain_sentinels();
        }
        self
    }

    /// Zero pacing; handy for hosts that render instantly and for tests.
    pub fn without_delays(mut self) -> Self {
        self.inter_agent_delay_ms = 0;
        self.intra_turn_delay_ms = DelayRange::fixed(0);
        self.claim_delay_ms = DelayRange::fixed(0);
        self
    }

    pub fn inter_agent_delay(&self) -> Duration {
        Duration::from_millis(self.inter_agent_delay_ms)
    }
}

fn default_max_repliers() -> usize {
    3
}

fn default_history_window() -> usize {
    10
}

fn default_inter_agent_delay_ms() -> u64 {
    2000
}

fn default_intra_turn_delay() -> DelayRange {
    DelayRange {
        min: 500,
        max: 1000,
    }
}

fn default_claim_delay() -> DelayRange {
    DelayRange {
        min: 500,
        max: 2000,
    }
}

fn default_claim_continue_probability() -> f64 {
    0.85
}

fn default_bubble_separator() -> String {
    "|".to_string()
}

fn default_icon_tag() -> String {
    "icon".to_string()
}

fn default_abstain_sentinels() -> Vec<String> {
    ["SKIP", "PASS", "...", "…"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_failure_notice() -> String {
    "The group could not reply right now, please try again later.".to_string()
}

fn default_quiet_group_hint() -> String {
    "(The group is quiet; members may greet each other, chat, or share what they are up to.)"
        .to_string()
}

fn default_lottery_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.9
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}
