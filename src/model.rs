use sqlx::FromRow;
use std::fmt;
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

// --- GENRE ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum Genre {
    Cultivation,
    Urban,
    Fantasy,
    Historical,
    Apocalypse,
    Game,
    Mystical,
    Romance,
    Wuxia,
    SciFi,
    Politics,
    FanFiction,
}

impl Genre {
    pub fn as_str(&self) -> &'static str {
        match self {
            Genre::Cultivation => "cultivation",
            Genre::Urban => "urban",
            Genre::Fantasy => "fantasy",
            Genre::Historical => "historical",
            Genre::Apocalypse => "apocalypse",
            Genre::Game => "game",
            Genre::Mystical => "mystical",
            Genre::Romance => "romance",
            Genre::Wuxia => "wuxia",
            Genre::SciFi => "sci-fi",
            Genre::Politics => "politics",
            Genre::FanFiction => "fan-fiction",
        }
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// --- PROJECT ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub novel_id: String,
    pub genre: Genre,
    pub main_character: String,
    pub current_chapter: i64,
    pub total_planned_chapters: i64,
    pub target_chapter_length: i64,
    pub model_preference: String,
    pub status: ProjectStatus,
    pub updated_at: i64, // unixepoch seconds
}

impl Project {
    /// Next chapter this project should produce (1-based).
    pub fn next_chapter(&self) -> i64 {
        self.current_chapter + 1
    }

    pub fn is_complete(&self) -> bool {
        self.current_chapter >= self.total_planned_chapters
    }
}

// --- OUTLINE ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcOutline {
    pub arc_number: i64,
    pub title: String,
    pub start_chapter: i64,
    pub end_chapter: i64,
    pub theme: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub climax: String,
}

impl ArcOutline {
    pub fn covers(&self, chapter_number: i64) -> bool {
        self.start_chapter <= chapter_number && chapter_number <= self.end_chapter
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub chapter_number: i64,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    /// 0..100
    #[serde(default)]
    pub tension_target: i64,
    #[serde(default)]
    pub dopamine_type: String,
    /// Characters expected on screen; drives canon snapshot selection.
    #[serde(default)]
    pub characters: Vec<String>,
}

/// Per-project plan. Immutable after creation; regeneration replaces the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub project_id: String,
    pub tagline: String,
    pub world_description: String,
    pub power_system: String,
    pub main_character_name: String,
    pub main_character_motivation: String,
    pub arc_outlines: Vec<ArcOutline>,
    pub chapter_outlines: Vec<ChapterOutline>,
}

impl Outline {
    pub fn arc_for(&self, chapter_number: i64) -> Option<&ArcOutline> {
        self.arc_outlines.iter().find(|a| a.covers(chapter_number))
    }

    pub fn chapter(&self, chapter_number: i64) -> Option<&ChapterOutline> {
        self.chapter_outlines
            .iter()
            .find(|c| c.chapter_number == chapter_number)
    }
}

// --- CHAPTERS ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChapterStatus {
    Draft,
    Published,
    Failed,
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub novel_id: String,
    pub chapter_number: i64,
    pub title: String,
    pub content: String,
    pub word_count: i64,
    pub status: ChapterStatus,
    pub created_at: i64,
    pub published_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub project_id: String,
    pub chapter_number: i64,
    pub title: String,
    pub summary: String,
}

// --- CANON ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FactStatus {
    Active,
    Retracted,
}

/// Atomic verified statement about the world. Referenced by name-as-string,
/// never by pointer, so cross-chapter graphs stay acyclic.
#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct CanonFact {
    pub project_id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub first_chapter: i64,
    pub last_confirmed_chapter: i64,
    pub status: FactStatus,
}

impl CanonFact {
    pub fn new(
        project_id: &str,
        subject: &str,
        predicate: &str,
        object: &str,
        chapter: i64,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object: object.to_string(),
            first_chapter: chapter,
            last_confirmed_chapter: chapter,
            status: FactStatus::Active,
        }
    }
}

/// Well-known predicates used by the gates.
pub mod predicates {
    pub const ALIVE: &str = "alive";
    pub const REALM: &str = "realm";
    pub const LEVEL: &str = "level";
    pub const KNOWS_SKILL: &str = "knows-skill";
    pub const HAS_ITEM: &str = "has-item";
    pub const IS_LOCATION: &str = "is-location";
}

// --- BEATS ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum BeatType {
    Breakthrough,
    Reveal,
    Betrayal,
    Rescue,
    Confrontation,
    Training,
    Romance,
    FaceSlap,
    WorldExpansion,
    Twist,
    Cliffhanger,
    Recovery,
}

impl BeatType {
    pub const ALL: [BeatType; 12] = [
        BeatType::Breakthrough,
        BeatType::Reveal,
        BeatType::Betrayal,
        BeatType::Rescue,
        BeatType::Confrontation,
        BeatType::Training,
        BeatType::Romance,
        BeatType::FaceSlap,
        BeatType::WorldExpansion,
        BeatType::Twist,
        BeatType::Cliffhanger,
        BeatType::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BeatType::Breakthrough => "breakthrough",
            BeatType::Reveal => "reveal",
            BeatType::Betrayal => "betrayal",
            BeatType::Rescue => "rescue",
            BeatType::Confrontation => "confrontation",
            BeatType::Training => "training",
            BeatType::Romance => "romance",
            BeatType::FaceSlap => "face-slap",
            BeatType::WorldExpansion => "world-expansion",
            BeatType::Twist => "twist",
            BeatType::Cliffhanger => "cliffhanger",
            BeatType::Recovery => "recovery",
        }
    }
}

impl fmt::Display for BeatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct BeatEntry {
    pub project_id: String,
    pub chapter_number: i64,
    pub beat_type: BeatType,
    pub category: String,
    /// 1..10
    pub intensity: i64,
    pub at: i64,
}

// --- POWER PROGRESSION ---
#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct PowerEvent {
    pub project_id: String,
    pub character: String,
    pub chapter_number: i64,
    /// breakthrough | level-up | skill | item
    pub kind: String,
    pub realm: Option<String>,
    pub level: Option<i64>,
    pub skill: Option<String>,
    pub item: Option<String>,
}

/// Computed per-character progression, folded from power_events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    pub character: String,
    pub realm: String,
    pub level: i64,
    pub abilities: Vec<String>,
    pub items: Vec<String>,
    pub total_breakthroughs: i64,
}

// --- COSTS ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskKind {
    Writing,
    Evaluation,
    Summary,
    Rewrite,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Writing => "writing",
            TaskKind::Evaluation => "evaluation",
            TaskKind::Summary => "summary",
            TaskKind::Rewrite => "rewrite",
        }
    }
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub project_id: String,
    pub at: i64,
    pub task: TaskKind,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

// --- WORK QUEUE ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Writing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Slot {
    Morning,
    Afternoon,
    Evening,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Morning, Slot::Afternoon, Slot::Evening];

    /// Local start hour of the slot.
    pub fn start_hour(&self) -> u32 {
        match self {
            Slot::Morning => 7,
            Slot::Afternoon => 13,
            Slot::Evening => 19,
        }
    }
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub project_id: String,
    pub chapter_number: i64,
    pub status: WorkStatus,
    pub scheduled_at: i64,
    pub slot: Slot,
    pub priority: i64,
    pub attempts: i64,
    pub lease_expires_at: Option<i64>,
    pub claimed_by: Option<String>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
}

// --- PUBLISH QUEUE ---
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PublishStatus {
    Scheduled,
    Publishing,
    Published,
    Failed,
}

#[derive(Debug, Clone, FromRow, PartialEq, Serialize, Deserialize)]
pub struct PublishItem {
    pub chapter_id: String,
    pub scheduled_at: i64,
    pub status: PublishStatus,
    pub retries: i64,
    pub last_error: Option<String>,
    pub published_at: Option<i64>,
}

// --- RUN RESULTS (in-memory, reported to the control plane) ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterResult {
    pub chapter_number: i64,
    pub success: bool,
    pub needs_human_review: bool,
    pub qc_score: Option<f64>,
    pub rewrite_attempts: i64,
    pub word_count: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub session_cost: f64,
    pub daily_spent: f64,
    pub daily_remaining: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub project_id: String,
    pub start_chapter: i64,
    pub end_chapter: i64,
    pub chapters_written: i64,
    pub chapters_failed: i64,
    pub chapters_needing_review: i64,
    pub total_rewrites: i64,
    /// Mean composite qc over completed chapters only.
    pub avg_qc_score: f64,
    pub stopped_reason: Option<String>,
    pub cost: CostSnapshot,
    pub results: Vec<ChapterResult>,
}

impl RunSummary {
    pub fn push(&mut self, r: ChapterResult) {
        if r.success {
            self.chapters_written += 1;
        } else {
            self.chapters_failed += 1;
        }
        if r.needs_human_review {
            self.chapters_needing_review += 1;
        }
        self.total_rewrites += r.rewrite_attempts;
        self.results.push(r);

        let scores: Vec<f64> = self
            .results
            .iter()
            .filter(|c| c.success)
            .filter_map(|c| c.qc_score)
            .collect();
        if !scores.is_empty() {
            self.avg_qc_score = scores.iter().sum::<f64>() / scores.len() as f64;
        }
    }
}

// --- STATUS SURFACE ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatusView {
    pub project_id: String,
    pub current_chapter: i64,
    pub total_chapters: i64,
    pub project_status: ProjectStatus,
    pub session_status: Option<String>,
    pub recent_results: Vec<ChapterResult>,
}

/// Formatting helper shared by logs and the status surface.
pub fn format_unixepoch(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| format!("ts:{ts}"))
}
