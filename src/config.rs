//! FactoryConfig: every recognised knob of the production factory.
//!
//! The config lives as JSON inside the factory_config singleton row; missing
//! keys fall back to the defaults below so old rows keep working after
//! upgrades. Realm ladders are configuration, not code: deployments override
//! them per genre without touching the power tracker.

use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::model::Genre;

fn default_max_workers() -> usize {
    10
}

fn default_max_active_projects() -> usize {
    200
}

fn default_chapters_per_project_per_day() -> i64 {
    3
}

fn default_session_budget_usd() -> f64 {
    5.0
}

fn default_daily_budget_usd() -> f64 {
    10.0
}

fn default_qc_threshold() -> f64 {
    7.0
}

fn default_auto_rewrite_threshold() -> f64 {
    5.0
}

fn default_max_rewrite_attempts() -> u32 {
    3
}

fn default_rewrite_target_score() -> f64 {
    6.5
}

fn default_context_max_chars() -> usize {
    12_000
}

fn default_recent_chapters_for_context() -> usize {
    3
}

fn default_rag_excerpts() -> usize {
    5
}

fn default_rag_chars_budget() -> usize {
    3_000
}

fn default_canon_snapshot_size() -> usize {
    50
}

fn default_beat_window() -> i64 {
    20
}

fn default_beat_overuse_soft() -> i64 {
    3
}

fn default_min_inter_chapter_delay_ms() -> u64 {
    1_000
}

fn default_writer_timeout_secs() -> u64 {
    300
}

fn default_writer_retries() -> u32 {
    2
}

fn default_scheduler_tick_secs() -> u64 {
    60
}

fn default_publish_tick_secs() -> u64 {
    180
}

fn default_lease_secs() -> i64 {
    900
}

fn default_publish_max_retries() -> i64 {
    5
}

fn default_word_count_band() -> (f64, f64) {
    (0.6, 1.6)
}

fn default_usd_per_1k_input() -> f64 {
    0.0005
}

fn default_usd_per_1k_output() -> f64 {
    0.0015
}

// Production runs against Vietnamese reader traffic; daily caps and slots
// are computed in that local day unless overridden.
fn default_tz_offset_minutes() -> i32 {
    7 * 60
}

fn default_realm_lists() -> HashMap<Genre, Vec<String>> {
    let mut m = HashMap::new();
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    m.insert(
        Genre::Cultivation,
        owned(&[
            "Luyện Khí",
            "Trúc Cơ",
            "Kim Đan",
            "Nguyên Anh",
            "Hóa Thần",
            "Luyện Hư",
            "Hợp Thể",
            "Đại Thừa",
            "Độ Kiếp",
        ]),
    );
    m.insert(
        Genre::Wuxia,
        owned(&["Tam Lưu", "Nhị Lưu", "Nhất Lưu", "Tông Sư", "Đại Tông Sư", "Truyền Thuyết"]),
    );
    m.insert(
        Genre::Fantasy,
        owned(&["Apprentice", "Adept", "Master", "Grandmaster", "Archmage", "Sage"]),
    );
    m.insert(
        Genre::Apocalypse,
        owned(&["F-Class", "E-Class", "D-Class", "C-Class", "B-Class", "A-Class", "S-Class"]),
    );
    m.insert(
        Genre::Game,
        owned(&["Bronze", "Silver", "Gold", "Platinum", "Diamond", "Legend"]),
    );
    m
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct FactoryConfig {
    // Fleet
    pub max_workers: usize,
    pub max_active_projects: usize,
    pub chapters_per_project_per_day: i64,
    pub lease_secs: i64,

    // Budget
    pub session_budget_usd: f64,
    pub daily_budget_usd: f64,
    pub usd_per_1k_input_tokens: f64,
    pub usd_per_1k_output_tokens: f64,

    // Quality gates
    pub qc_threshold: f64,
    pub auto_rewrite_threshold: f64,
    pub max_rewrite_attempts: u32,
    pub rewrite_target_score: f64,
    /// (min, max) fractions of target_chapter_length.
    pub word_count_band: (f64, f64),

    // Context
    pub context_max_chars: usize,
    pub recent_chapters_for_context: usize,
    pub rag_excerpts: usize,
    pub rag_chars_budget: usize,
    pub canon_snapshot_size: usize,

    // Beats
    pub beat_window: i64,
    /// Repeats of the primary beat in the window before a soft diagnostic;
    /// soft + 2 forces an auto rewrite.
    pub beat_overuse_soft: i64,

    // Pacing & ticks
    pub min_inter_chapter_delay_ms: u64,
    pub writer_timeout_secs: u64,
    pub writer_retries: u32,
    pub scheduler_tick_secs: u64,
    pub publish_tick_secs: u64,
    pub publish_max_retries: i64,

    // Locale
    pub tz_offset_minutes: i32,

    // Power ladders per genre; genres without a ladder skip realm validation.
    pub realm_lists: HashMap<Genre, Vec<String>>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_active_projects: default_max_active_projects(),
            chapters_per_project_per_day: default_chapters_per_project_per_day(),
            lease_secs: default_lease_secs(),
            session_budget_usd: default_session_budget_usd(),
            daily_budget_usd: default_daily_budget_usd(),
            usd_per_1k_input_tokens: default_usd_per_1k_input(),
            usd_per_1k_output_tokens: default_usd_per_1k_output(),
            qc_threshold: default_qc_threshold(),
            auto_rewrite_threshold: default_auto_rewrite_threshold(),
            max_rewrite_attempts: default_max_rewrite_attempts(),
            rewrite_target_score: default_rewrite_target_score(),
            word_count_band: default_word_count_band(),
            context_max_chars: default_context_max_chars(),
            recent_chapters_for_context: default_recent_chapters_for_context(),
            rag_excerpts: default_rag_excerpts(),
            rag_chars_budget: default_rag_chars_budget(),
            canon_snapshot_size: default_canon_snapshot_size(),
            beat_window: default_beat_window(),
            beat_overuse_soft: default_beat_overuse_soft(),
            min_inter_chapter_delay_ms: default_min_inter_chapter_delay_ms(),
            writer_timeout_secs: default_writer_timeout_secs(),
            writer_retries: default_writer_retries(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            publish_tick_secs: default_publish_tick_secs(),
            publish_max_retries: default_publish_max_retries(),
            tz_offset_minutes: default_tz_offset_minutes(),
            realm_lists: default_realm_lists(),
        }
    }
}

impl FactoryConfig {
    /// Parse the factory_config JSON payload, falling back to defaults for
    /// anything missing. A corrupt payload yields full defaults rather than
    /// killing the factory at startup.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str::<FactoryConfig>(json) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("⚠️ factory_config JSON invalid ({e}). Using defaults.");
                FactoryConfig::default()
            }
        }
    }

    pub fn writer_timeout(&self) -> Duration {
        Duration::from_secs(self.writer_timeout_secs)
    }

    pub fn min_word_count(&self, target: i64) -> i64 {
        (target as f64 * self.word_count_band.0).round() as i64
    }

    pub fn max_word_count(&self, target: i64) -> i64 {
        (target as f64 * self.word_count_band.1).round() as i64
    }

    /// Rough USD estimate for a call, from token counts.
    pub fn estimate_cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        input_tokens as f64 / 1000.0 * self.usd_per_1k_input_tokens
            + output_tokens as f64 / 1000.0 * self.usd_per_1k_output_tokens
    }

    pub fn realm_ladder(&self, genre: Genre) -> Option<&[String]> {
        self.realm_lists.get(&genre).map(|v| v.as_slice())
    }

    /// Start of the configured local day containing `now` (unixepoch secs).
    pub fn local_day_start(&self, now: i64) -> i64 {
        let offset = self.tz_offset_minutes as i64 * 60;
        let local = now + offset;
        let day_start_local = local - local.rem_euclid(86_400);
        day_start_local - offset
    }
}
