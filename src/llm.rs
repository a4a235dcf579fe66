//! Injected collaborators: the text generator and the semantic index.
//!
//! The factory never talks HTTP itself. Deployments hand it a `Generator`
//! (the LLM gateway) and a `SemanticIndex` (RAG search over prior chapters);
//! both are dyn trait objects so tests can script them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::WriterError;

// --- GENERATOR ---
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// One completion call. The caller wraps this in its own deadline;
    /// implementations should still honour upstream timeouts where they can.
    async fn generate(&self, req: GenerateRequest) -> Result<Generation, WriterError>;
}

/// Rough token estimate used for budget pre-checks before a call exists.
/// Four characters per token is the planning figure the cost gate uses.
pub fn estimate_tokens(text_chars: usize) -> i64 {
    (text_chars as i64 / 4).max(1)
}

// --- SEMANTIC INDEX ---
#[derive(Debug, Clone)]
pub struct IndexSection {
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct Excerpt {
    pub chapter_number: i64,
    pub text: String,
    pub score: f64,
}

/// Best-effort collaborator: failures are strings the worker logs, never
/// errors that fail a chapter.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn upsert(
        &self,
        project_id: &str,
        chapter_number: i64,
        sections: Vec<IndexSection>,
    ) -> Result<(), String>;

    async fn search(
        &self,
        project_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<Excerpt>, String>;
}

/// No-op index for deployments that run without RAG.
pub struct NoopIndex;

#[async_trait]
impl SemanticIndex for NoopIndex {
    async fn upsert(
        &self,
        _project_id: &str,
        _chapter_number: i64,
        _sections: Vec<IndexSection>,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn search(
        &self,
        _project_id: &str,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<Excerpt>, String> {
        Ok(Vec::new())
    }
}

/// In-process index: naive token-overlap scoring. Good enough for the demo
/// binary and for tests; production injects a real vector store.
#[derive(Default)]
pub struct MemoryIndex {
    entries: Mutex<Vec<(String, i64, String)>>, // (project, chapter, text)
}

impl MemoryIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SemanticIndex for MemoryIndex {
    async fn upsert(
        &self,
        project_id: &str,
        chapter_number: i64,
        sections: Vec<IndexSection>,
    ) -> Result<(), String> {
        let mut entries = self.entries.lock().await;
        // Idempotente por (project, chapter): reemplaza lo anterior.
        entries.retain(|(p, c, _)| !(p == project_id && *c == chapter_number));
        let text = sections
            .into_iter()
            .map(|s| format!("{}\n{}", s.heading, s.body))
            .collect::<Vec<_>>()
            .join("\n");
        entries.push((project_id.to_string(), chapter_number, text));
        Ok(())
    }

    async fn search(
        &self,
        project_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<Excerpt>, String> {
        let needles: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .filter(|w| w.chars().count() > 2)
            .collect();
        if needles.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.entries.lock().await;
        let mut scored: Vec<Excerpt> = entries
            .iter()
            .filter(|(p, _, _)| p == project_id)
            .map(|(_, chapter, text)| {
                let haystack = text.to_lowercase();
                let hits = needles.iter().filter(|n| haystack.contains(n.as_str())).count();
                Excerpt {
                    chapter_number: *chapter,
                    text: text.chars().take(600).collect(),
                    score: hits as f64 / needles.len() as f64,
                }
            })
            .filter(|e| e.score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

// --- DEMO GENERATOR ---

/// Prosa determinista con textura creíble: oraciones compuestas por bancos
/// de fragmentos de tamaños coprimos (7/11/13/9), así casi ningún 4-grama se
/// repite y las métricas de calidad la tratan como prosa sana.
pub fn demo_prose(chapter_number: i64, target_words: usize) -> String {
    const SUBJECTS: [&str; 7] = [
        "Lâm Phong", "Tô Nhi", "Đối thủ", "Lão giả", "Gã áo đen", "Kiếm quang", "Cả võ đài",
    ];
    const VERBS: [&str; 11] = [
        "vung kiếm chém", "lùi lại tránh", "tung chưởng đánh", "gầm lên xông",
        "nghiến răng đỡ", "phất tay áo", "dậm chân nhảy", "dồn linh khí",
        "ép sát khí", "thu kiếm thế", "đảo thân hình",
    ];
    const MANNERS: [&str; 13] = [
        "về phía trước,", "qua một bên,", "lên không trung,", "vào trận đài,",
        "giữa tiếng nổ,", "trong bụi mù,", "dưới kiếm quang,", "theo thế sấm,",
        "ngược hướng gió,", "sát mặt đất,", "xuyên màn bụi,", "đầy uy hiếp,",
        "không chút sợ,",
    ];
    const OUTCOMES: [&str; 9] = [
        "cả điện rung chuyển.", "đối thủ tái mặt.", "người xem kinh ngạc.",
        "ai nấy ngưỡng mộ.", "tiếng hô vang dội.", "trưởng lão biến sắc.",
        "không ai chớp mắt.", "máu bắn tung tóe.", "thắng bại chưa rõ.",
    ];
    const SHORTS: [&str; 10] = [
        "“Không thể nào!” có kẻ thốt lên.",
        "“Hảo kiếm pháp!” ai đó tán thưởng.",
        "“Lui ra!” hắn nói, giọng rất nhẹ.",
        "“Tiếp chiêu.” Lâm Phong hỏi thẳng.",
        "“Khoan đã!” Tô Nhi kêu lên.",
        "“Ngươi thua rồi.” hắn đáp gọn.",
        "“Đỡ này!” đối thủ quát lớn.",
        "“Giỏi lắm.” lão giả thì thầm.",
        "“Cẩn thận!” có người nhắc vội.",
        "“Kết thúc thôi.” hắn nói khẽ.",
    ];
    const LONGS: [&str; 7] = [
        "Tô Nhi đứng ngoài trận, trong lòng thầm nghĩ thiếu niên trước mặt đã không còn là kẻ bị người người giẫm dưới chân ngày nào.",
        "Hắn nhớ lời sư phụ dặn, tự nhủ con đường kiếm đạo còn dài, thắng một trận nhỏ chưa từng là đích đến cuối cùng.",
        "Phần thưởng của vòng đấu là ba nghìn linh thạch cùng một thanh trường kiếm cũ, nhưng thứ hắn muốn là cái tên trên bảng đá.",
        "Trận chiến thắng lợi, hắn thu được một mảnh bảo vật cổ, ánh sáng lưu chuyển trong lòng bàn tay như nước chảy.",
        "Gió đêm thổi qua quảng trường, mang theo mùi máu tanh và tiếng bàn tán chưa dứt của đám tu sĩ vây xem.",
        "Trên khán đài cao nhất, một ánh mắt già nua lặng lẽ dõi theo từng bước chân của thiếu niên áo xám.",
        "Kiếm trong tay hắn không nhanh, nhưng mỗi nhát chém đều rơi đúng chỗ đối thủ vừa lộ ra sơ hở.",
    ];
    // Línea de "sabor" por capítulo: rota el beat dominante para que el
    // ledger no se sature de cliffhangers en runs largos.
    const FLAVORS: [&str; 4] = [
        "Hai bên chính thức động thủ, một trận quyết đấu mà kẻ khiêu chiến không còn đường lui, giao chiến rồi đối đầu đến cùng.",
        "Đám người từng chế giễu giờ quỳ xuống xin lỗi, nuốt lời ngày trước, mất mặt đến mức sửng sốt nhìn nhau, hối hận muộn màng.",
        "Bí mật của trận pháp dần lộ ra, hóa ra chân tướng năm đó bị che giấu, sự thật là một màn tiết lộ động trời.",
        "Sau trận đấu hắn bế quan khổ luyện, ngày đêm tu luyện không nghỉ, rèn luyện từng chiêu, lĩnh ngộ nhịp kiếm của riêng mình.",
    ];

    let hook = "Máu nhỏ giọt xuống nền đá lạnh, sát khí trong đại điện đặc đến mức \
                nến cũng lụi đi một nửa.";
    let closer = "Đúng lúc này, một bóng đen xuất hiện trên nóc điện, giọng nói lạnh \
                  lùng vang vọng: “Giao kiếm phổ ra đây.” Lâm Phong chưa kịp quay đầu \
                  thì đột nhiên…";

    let mut out = String::with_capacity(target_words * 6);
    out.push_str(hook);
    out.push('\n');

    let flavor = FLAVORS[(chapter_number.rem_euclid(FLAVORS.len() as i64)) as usize];
    out.push_str(flavor);
    out.push('\n');

    let mut i = 0usize;
    while out.split_whitespace().count() + 40 < target_words {
        out.push_str(SUBJECTS[i % 7]);
        out.push(' ');
        out.push_str(VERBS[i % 11]);
        out.push(' ');
        out.push_str(MANNERS[i % 13]);
        out.push(' ');
        out.push_str(OUTCOMES[i % 9]);
        out.push(' ');
        if i % 5 == 4 {
            out.push_str(SHORTS[(i / 5) % 10]);
            out.push(' ');
        }
        if i % 7 == 6 {
            out.push('\n');
            out.push_str(LONGS[(i / 7) % 7]);
            out.push('\n');
        }
        i += 1;
    }

    out.push('\n');
    out.push_str(closer);
    out
}

/// Deterministic generator used by the demo binary and the test harness:
/// renders a plausible chapter from the directives embedded in the prompt.
/// No network, no cost.
pub struct DemoGenerator {
    pub latency: Duration,
}

impl DemoGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(20),
        })
    }
}

#[async_trait]
impl Generator for DemoGenerator {
    async fn generate(&self, req: GenerateRequest) -> Result<Generation, WriterError> {
        tokio::time::sleep(self.latency).await;

        // El número de capítulo y el target de palabras viajan en el prompt.
        let number = req
            .user
            .lines()
            .find_map(|l| l.strip_prefix("SỐ CHƯƠNG: "))
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(1);
        let target_words = req
            .user
            .lines()
            .find_map(|l| l.strip_prefix("ĐỘ DÀI MỤC TIÊU: "))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(900);

        let body = format!(
            "Chương {number}: Bước chân không lùi\n\n{}",
            demo_prose(number, target_words)
        );

        let output_tokens = estimate_tokens(body.chars().count());
        Ok(Generation {
            input_tokens: estimate_tokens(req.user.chars().count() + req.system.chars().count()),
            output_tokens,
            text: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_index_is_idempotent_per_chapter() {
        let idx = MemoryIndex::new();
        let sections = vec![IndexSection {
            heading: "Chương 1".into(),
            body: "Lâm Phong đột phá Trúc Cơ".into(),
        }];
        idx.upsert("p1", 1, sections.clone()).await.unwrap();
        idx.upsert("p1", 1, sections).await.unwrap();

        let hits = idx.search("p1", "Trúc Cơ đột phá", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chapter_number, 1);
    }

    #[tokio::test]
    async fn memory_index_scopes_by_project() {
        let idx = MemoryIndex::new();
        idx.upsert(
            "p1",
            1,
            vec![IndexSection {
                heading: "x".into(),
                body: "bảo kiếm thượng cổ".into(),
            }],
        )
        .await
        .unwrap();

        assert!(idx.search("p2", "bảo kiếm", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn demo_generator_emits_title_line() {
        let g = DemoGenerator::new();
        let out = g
            .generate(GenerateRequest {
                system: String::new(),
                user: "SỐ CHƯƠNG: 7\n".into(),
                model: "demo".into(),
                max_tokens: 4096,
                temperature: 0.8,
            })
            .await
            .unwrap();
        assert!(out.text.starts_with("Chương 7:"));
        assert!(out.output_tokens > 0);
    }
}
