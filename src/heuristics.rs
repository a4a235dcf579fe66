//! Extraction heuristics: keyword/pattern tables keyed by genre.
//!
//! These tables are DATA. The built-in defaults below cover the production
//! genres (Vietnamese-first, with the English signal words that survive
//! machine-assisted drafting); deployments ship their own versioned JSON and
//! the gates never hard-code a single keyword. Matching is case-insensitive
//! on word boundaries.

use regex::Regex;
use serde::{Serialize, Deserialize};
use std::collections::HashMap;

use crate::model::{BeatType, Genre};

// --- SCENE TYPES (style hint key) ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneType {
    Action,
    Dialogue,
    Emotional,
    Climax,
    Transition,
}

impl Default for SceneType {
    fn default() -> Self {
        SceneType::Transition
    }
}

impl SceneType {
    /// Derive the dominant scene type from the chapter outline row.
    pub fn infer(tension_target: i64, dopamine_type: &str) -> Self {
        if tension_target >= 80 {
            return SceneType::Climax;
        }
        let d = dopamine_type.to_lowercase();
        if d.contains("romance") || d.contains("emotional") {
            SceneType::Emotional
        } else if d.contains("breakthrough") || d.contains("face-slap") || d.contains("battle") {
            SceneType::Action
        } else if d.contains("reveal") || d.contains("dialogue") {
            SceneType::Dialogue
        } else {
            SceneType::Transition
        }
    }
}

// --- RAW TABLES (serde-loadable) ---
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lexicon {
    pub dialogue_markers: Vec<String>,
    pub action_verbs: Vec<String>,
    pub inner_thought: Vec<String>,
    pub dopamine_signals: Vec<String>,
    pub hook_signals: Vec<String>,
    pub cliffhanger_signals: Vec<String>,
    pub beat_keywords: HashMap<BeatType, Vec<String>>,
    pub breakthrough_markers: Vec<String>,
    pub death_markers: Vec<String>,
    pub resurrection_markers: Vec<String>,
    pub skill_gain_markers: Vec<String>,
    pub item_gain_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsTable {
    pub version: u32,
    pub base: Lexicon,
    /// Per-genre additions merged on top of base.
    pub genre_extra: HashMap<Genre, Lexicon>,
    /// Style hints keyed by genre then scene type.
    pub style_hints: HashMap<Genre, HashMap<SceneType, Vec<String>>>,
}

fn owned(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

impl Default for HeuristicsTable {
    fn default() -> Self {
        let mut beat_keywords = HashMap::new();
        beat_keywords.insert(
            BeatType::Breakthrough,
            owned(&["đột phá", "breakthrough", "thăng cấp", "cảnh giới mới", "bình cảnh"]),
        );
        beat_keywords.insert(
            BeatType::Reveal,
            owned(&["bí mật", "hóa ra", "chân tướng", "sự thật là", "tiết lộ", "revealed"]),
        );
        beat_keywords.insert(
            BeatType::Betrayal,
            owned(&["phản bội", "bán đứng", "trở mặt", "betrayed", "đâm sau lưng"]),
        );
        beat_keywords.insert(
            BeatType::Rescue,
            owned(&["cứu", "giải cứu", "kịp thời xuất hiện", "rescued", "thoát hiểm"]),
        );
        beat_keywords.insert(
            BeatType::Confrontation,
            owned(&["đối đầu", "giao chiến", "quyết đấu", "khiêu chiến", "động thủ", "showdown"]),
        );
        beat_keywords.insert(
            BeatType::Training,
            owned(&["tu luyện", "khổ luyện", "rèn luyện", "bế quan", "lĩnh ngộ", "training"]),
        );
        beat_keywords.insert(
            BeatType::Romance,
            owned(&["rung động", "ánh mắt dịu dàng", "đỏ mặt", "nắm tay", "thầm thương"]),
        );
        beat_keywords.insert(
            BeatType::FaceSlap,
            owned(&["vả mặt", "mất mặt", "nuốt lời", "quỳ xuống", "hối hận", "sửng sốt nhìn"]),
        );
        beat_keywords.insert(
            BeatType::WorldExpansion,
            owned(&["vùng đất mới", "thế lực", "đại lục", "tông môn", "bí cảnh", "vương quốc"]),
        );
        beat_keywords.insert(
            BeatType::Twist,
            owned(&["không ngờ", "bất ngờ thay", "đảo ngược", "twist", "ai ngờ"]),
        );
        beat_keywords.insert(
            BeatType::Cliffhanger,
            owned(&["đúng lúc này", "bỗng nhiên", "một bóng đen", "chưa kịp", "thì đột nhiên"]),
        );
        beat_keywords.insert(
            BeatType::Recovery,
            owned(&["dưỡng thương", "hồi phục", "tĩnh dưỡng", "bình phục", "recovered"]),
        );

        let base = Lexicon {
            dialogue_markers: owned(&["\u{201c}", "\u{201d}", "\"", "nói", "hỏi", "đáp", "quát", "thì thầm"]),
            action_verbs: owned(&[
                "lao tới", "né", "chém", "đấm", "đá", "xông", "phóng", "tấn công", "phản kích",
                "rút kiếm", "vung", "nổ tung",
            ]),
            inner_thought: owned(&[
                "nghĩ thầm", "tự nhủ", "trong lòng", "thầm nghĩ", "tâm trí", "hắn nghĩ", "cô nghĩ",
            ]),
            dopamine_signals: owned(&[
                "chiến thắng", "thu hoạch", "bảo vật", "kinh ngạc", "ngưỡng mộ", "tán thưởng",
                "vượt mặt", "phần thưởng", "thần khí", "sửng sốt",
            ]),
            hook_signals: owned(&[
                "máu", "chết", "nguy hiểm", "bí ẩn", "tiếng nổ", "khẩn cấp", "đột nhiên", "lạnh lùng",
                "sát khí",
            ]),
            cliffhanger_signals: owned(&[
                "đúng lúc này", "bỗng nhiên", "chưa kịp", "một giọng nói", "bóng đen", "thì đột nhiên",
                "không ngờ", "…", "?!",
            ]),
            beat_keywords,
            breakthrough_markers: owned(&[
                "đột phá", "tiến vào", "bước vào", "đạt tới", "thăng lên", "advanced to",
            ]),
            death_markers: owned(&[
                "đã chết", "tử vong", "bỏ mạng", "tắt thở", "qua đời", "chết trận", "hồn phi phách tán",
            ]),
            resurrection_markers: owned(&[
                "sống lại", "hồi sinh", "phục sinh", "trở về từ cõi chết", "chưa chết",
            ]),
            skill_gain_markers: owned(&[
                "học được", "lĩnh ngộ", "thi triển lần đầu", "nắm giữ tuyệt kỹ", "giác ngộ",
            ]),
            item_gain_markers: owned(&[
                "nhận được", "thu được", "đoạt được", "tìm thấy", "rơi vào tay",
            ]),
        };

        let mut genre_extra = HashMap::new();
        genre_extra.insert(
            Genre::Cultivation,
            Lexicon {
                dopamine_signals: owned(&["linh khí", "đan dược", "linh thạch", "truyền thừa"]),
                breakthrough_markers: owned(&["kết đan", "ngưng đan", "độ kiếp"]),
                ..Lexicon::default()
            },
        );
        genre_extra.insert(
            Genre::Urban,
            Lexicon {
                dopamine_signals: owned(&["tỷ phú", "siêu xe", "hợp đồng", "thần y"]),
                ..Lexicon::default()
            },
        );
        genre_extra.insert(
            Genre::Game,
            Lexicon {
                dopamine_signals: owned(&["lên cấp", "trang bị hiếm", "boss", "bảng xếp hạng"]),
                breakthrough_markers: owned(&["level up", "lên cấp"]),
                ..Lexicon::default()
            },
        );

        let mut style_hints = HashMap::new();
        for genre in [
            Genre::Cultivation,
            Genre::Urban,
            Genre::Fantasy,
            Genre::Historical,
            Genre::Apocalypse,
            Genre::Game,
            Genre::Mystical,
            Genre::Romance,
            Genre::Wuxia,
            Genre::SciFi,
            Genre::Politics,
            Genre::FanFiction,
        ] {
            let mut per_scene = HashMap::new();
            per_scene.insert(
                SceneType::Action,
                owned(&[
                    "Câu ngắn, nhịp nhanh, động từ mạnh.",
                    "Miêu tả đòn thế cụ thể, tránh tóm tắt trận đánh.",
                ]),
            );
            per_scene.insert(
                SceneType::Dialogue,
                owned(&[
                    "Mỗi nhân vật một giọng riêng, xưng hô nhất quán.",
                    "Chen hành động nhỏ giữa các lượt thoại.",
                ]),
            );
            per_scene.insert(
                SceneType::Emotional,
                owned(&[
                    "Chậm nhịp, tập trung nội tâm và chi tiết giác quan.",
                ]),
            );
            per_scene.insert(
                SceneType::Climax,
                owned(&[
                    "Đẩy xung đột lên đỉnh, không giải quyết hết trong chương.",
                    "Kết thúc bằng tình huống treo.",
                ]),
            );
            per_scene.insert(
                SceneType::Transition,
                owned(&[
                    "Gieo mầm cho xung đột kế tiếp, giữ một móc câu mở.",
                ]),
            );
            if genre == Genre::Cultivation || genre == Genre::Wuxia {
                per_scene
                    .entry(SceneType::Action)
                    .or_default()
                    .push("Gọi đúng tên chiêu thức và cảnh giới đã thiết lập.".to_string());
            }
            style_hints.insert(genre, per_scene);
        }

        Self {
            version: 1,
            base,
            genre_extra,
            style_hints,
        }
    }
}

impl HeuristicsTable {
    /// Load a versioned table from JSON; invalid payloads keep the defaults.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str::<HeuristicsTable>(json) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("⚠️ heuristics table invalid ({e}). Using built-in defaults.");
                HeuristicsTable::default()
            }
        }
    }

    pub fn style_hints_for(&self, genre: Genre, scene: SceneType) -> Vec<String> {
        self.style_hints
            .get(&genre)
            .and_then(|m| m.get(&scene))
            .cloned()
            .unwrap_or_default()
    }

    /// Compile the merged (base + genre extras) lexicon for one genre.
    pub fn compile(&self, genre: Genre) -> CompiledLexicon {
        let extra = self.genre_extra.get(&genre);
        let merged = |pick: fn(&Lexicon) -> &Vec<String>| -> Vec<String> {
            let mut v = pick(&self.base).clone();
            if let Some(ex) = extra {
                v.extend(pick(ex).iter().cloned());
            }
            v
        };

        let mut beats = HashMap::new();
        for beat in BeatType::ALL {
            let mut terms = self
                .base
                .beat_keywords
                .get(&beat)
                .cloned()
                .unwrap_or_default();
            if let Some(ex) = extra {
                if let Some(more) = ex.beat_keywords.get(&beat) {
                    terms.extend(more.iter().cloned());
                }
            }
            if let Some(re) = compile_terms(&terms) {
                beats.insert(beat, re);
            }
        }

        CompiledLexicon {
            dialogue: compile_terms(&merged(|l| &l.dialogue_markers)),
            action: compile_terms(&merged(|l| &l.action_verbs)),
            inner_thought: compile_terms(&merged(|l| &l.inner_thought)),
            dopamine: compile_terms(&merged(|l| &l.dopamine_signals)),
            hook: compile_terms(&merged(|l| &l.hook_signals)),
            cliffhanger: compile_terms(&merged(|l| &l.cliffhanger_signals)),
            breakthrough: compile_terms(&merged(|l| &l.breakthrough_markers)),
            death: compile_terms(&merged(|l| &l.death_markers)),
            resurrection: compile_terms(&merged(|l| &l.resurrection_markers)),
            skill_gain: compile_terms(&merged(|l| &l.skill_gain_markers)),
            item_gain: compile_terms(&merged(|l| &l.item_gain_markers)),
            beats,
        }
    }
}

fn compile_terms(terms: &[String]) -> Option<Regex> {
    let parts: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            // \b solo pega contra caracteres de palabra; términos que son
            // puntuación ("…", "?!", comillas) van sin anclas.
            let escaped = regex::escape(t);
            let lead = t.chars().next().map(char::is_alphanumeric).unwrap_or(false);
            let trail = t.chars().last().map(char::is_alphanumeric).unwrap_or(false);
            format!(
                "{}{}{}",
                if lead { r"\b" } else { "" },
                escaped,
                if trail { r"\b" } else { "" }
            )
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    let pattern = format!("(?i)(?:{})", parts.join("|"));
    Regex::new(&pattern).ok()
}

/// One genre's lexicon with every table pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledLexicon {
    pub dialogue: Option<Regex>,
    pub action: Option<Regex>,
    pub inner_thought: Option<Regex>,
    pub dopamine: Option<Regex>,
    pub hook: Option<Regex>,
    pub cliffhanger: Option<Regex>,
    pub breakthrough: Option<Regex>,
    pub death: Option<Regex>,
    pub resurrection: Option<Regex>,
    pub skill_gain: Option<Regex>,
    pub item_gain: Option<Regex>,
    pub beats: HashMap<BeatType, Regex>,
}

impl CompiledLexicon {
    pub fn count(&self, which: &Option<Regex>, text: &str) -> usize {
        which.as_ref().map(|re| re.find_iter(text).count()).unwrap_or(0)
    }

    pub fn hits(&self, which: &Option<Regex>, text: &str) -> bool {
        which.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
    }

    /// Count matches for every beat type; only non-zero entries returned.
    pub fn beat_counts(&self, text: &str) -> Vec<(BeatType, usize)> {
        let mut out: Vec<(BeatType, usize)> = self
            .beats
            .iter()
            .map(|(beat, re)| (*beat, re.find_iter(text).count()))
            .filter(|(_, n)| *n > 0)
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.as_str().cmp(b.0.as_str())));
        out
    }
}

/// Whitespace-separated token count: the word-count definition every gate
/// and the writer share.
pub fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

/// First ~n words of a text (opening-hook window).
pub fn leading_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

/// Last ~n words of a text (cliffhanger window).
pub fn trailing_words(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(n);
    words[start..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex() -> CompiledLexicon {
        HeuristicsTable::default().compile(Genre::Cultivation)
    }

    #[test]
    fn detects_breakthrough_beat() {
        let lex = lex();
        let body = "Hắn hét lớn một tiếng, linh khí cuồn cuộn, cuối cùng đột phá Trúc Cơ.";
        let beats = lex.beat_counts(body);
        assert!(beats.iter().any(|(b, _)| *b == BeatType::Breakthrough));
    }

    #[test]
    fn death_and_resurrection_are_distinct() {
        let lex = lex();
        assert!(lex.hits(&lex.death, "Trưởng lão đã chết dưới kiếm của hắn."));
        assert!(!lex.hits(&lex.resurrection, "Trưởng lão đã chết dưới kiếm của hắn."));
        assert!(lex.hits(&lex.resurrection, "Không ngờ lão quỷ này còn có thể sống lại."));
    }

    #[test]
    fn negative_strings_do_not_fire() {
        let lex = lex();
        assert_eq!(lex.count(&lex.death, "Bầu trời trong xanh, gió nhẹ thổi qua."), 0);
        assert!(lex.beat_counts("Một buổi sáng yên bình ở trấn nhỏ.").is_empty());
    }

    #[test]
    fn genre_extras_merge_on_top_of_base() {
        let table = HeuristicsTable::default();
        let cult = table.compile(Genre::Cultivation);
        // "kết đan" only exists in the cultivation extras.
        assert!(cult.hits(&cult.breakthrough, "Đêm đó hắn kết đan thành công."));
        let urban = table.compile(Genre::Urban);
        assert!(!urban.hits(&urban.breakthrough, "Đêm đó hắn kết đan thành công."));
    }

    #[test]
    fn scene_type_inference() {
        assert_eq!(SceneType::infer(90, "anything"), SceneType::Climax);
        assert_eq!(SceneType::infer(50, "romance-progress"), SceneType::Emotional);
        assert_eq!(SceneType::infer(50, "face-slap"), SceneType::Action);
        assert_eq!(SceneType::infer(10, "slice-of-life"), SceneType::Transition);
    }

    #[test]
    fn word_windows() {
        let text = "một hai ba bốn năm";
        assert_eq!(word_count(text), 5);
        assert_eq!(leading_words(text, 2), "một hai");
        assert_eq!(trailing_words(text, 2), "bốn năm");
    }

    #[test]
    fn from_json_falls_back_on_garbage() {
        let t = HeuristicsTable::from_json("{{{");
        assert_eq!(t.version, 1);
    }
}
