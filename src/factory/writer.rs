// ========================================
// writer.rs - Chapter Writer
// ========================================
// Construcción determinista del prompt, llamada al generator con deadline,
// parseo de "Chương N: …" y limpieza de artefactos markdown.

use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::warn;

use crate::config::FactoryConfig;
use crate::error::WriterError;
use crate::factory::context::ContextBundle;
use crate::heuristics::word_count;
use crate::llm::{GenerateRequest, Generation, Generator, estimate_tokens};
use crate::model::{Genre, Project};

/// Resultado del writer: título ya separado del cuerpo.
#[derive(Debug, Clone)]
pub struct Draft {
    pub chapter_number: i64,
    pub title: String,
    pub body: String,
    pub word_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct WriteParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ventana del modelo en caracteres de prompt; la provee el caller.
    pub max_prompt_chars: usize,
}

impl WriteParams {
    pub fn for_project(project: &Project) -> Self {
        Self {
            model: if project.model_preference.is_empty() {
                "default".to_string()
            } else {
                project.model_preference.clone()
            },
            max_tokens: 8_192,
            temperature: 0.85,
            max_prompt_chars: 48_000,
        }
    }
}

// --- PROMPTS ---

/// Mensaje de sistema fijo por género.
pub fn build_system_prompt(genre: Genre) -> String {
    let persona = match genre {
        Genre::Cultivation | Genre::Wuxia | Genre::Mystical => {
            "Bạn là tác giả tiên hiệp/huyền huyễn kỳ cựu, văn phong chặt chẽ, \
             nhịp nhanh, giàu cảm giác sảng khoái."
        }
        Genre::Urban | Genre::Politics => {
            "Bạn là tác giả truyện đô thị chuyên nghiệp, đối thoại sắc, tình tiết \
             thực tế nhưng kịch tính."
        }
        Genre::Romance => {
            "Bạn là tác giả truyện tình cảm, nắm chắc nhịp cảm xúc và hóa học \
             giữa các nhân vật."
        }
        Genre::Game | Genre::SciFi => {
            "Bạn là tác giả truyện hệ thống/khoa học viễn tưởng, thế giới logic, \
             số liệu nhất quán."
        }
        Genre::Fantasy | Genre::Historical | Genre::Apocalypse | Genre::FanFiction => {
            "Bạn là tiểu thuyết gia mạng chuyên nghiệp, kể chuyện bằng cảnh, \
             không tóm tắt."
        }
    };

    format!(
        "{persona} Viết tiếng Việt. TUYỆT ĐỐI không dùng markdown. Dòng đầu tiên \
         phải là tiêu đề dạng \"Chương N: Tên chương\". Kết chương bằng tình \
         huống treo (cliffhanger)."
    )
}

/// Mensaje de usuario: secciones en orden fijo. Determinista dados los inputs.
pub fn build_user_prompt(
    project: &Project,
    bundle: &ContextBundle,
    chapter_number: i64,
    extra_directives: &[String],
) -> String {
    let mut out = String::with_capacity(8_192);

    out.push_str(&format!("SỐ CHƯƠNG: {chapter_number}\n"));
    out.push_str(&format!(
        "ĐỘ DÀI MỤC TIÊU: {} từ (±40%)\n\n",
        project.target_chapter_length
    ));

    if let Some(world) = &bundle.world {
        out.push_str("## BỐI CẢNH THẾ GIỚI\n");
        if !world.tagline.is_empty() {
            out.push_str(&format!("Tagline: {}\n", world.tagline));
        }
        out.push_str(&format!("{}\n", world.world_description));
        if !world.power_system.is_empty() {
            out.push_str(&format!("Hệ thống sức mạnh: {}\n", world.power_system));
        }
        out.push_str(&format!(
            "Nhân vật chính: {} — {}\n\n",
            world.main_character_name, world.main_character_motivation
        ));
    }

    if !bundle.style_hints.is_empty() {
        out.push_str("## VĂN PHONG\n");
        for hint in &bundle.style_hints {
            out.push_str(&format!("- {hint}\n"));
        }
        out.push('\n');
    }

    if let Some(arc) = &bundle.arc {
        out.push_str(&format!(
            "## ARC HIỆN TẠI (chương {}-{}): {}\n",
            arc.start_chapter, arc.end_chapter, arc.title
        ));
        out.push_str(&format!("Chủ đề: {}\n", arc.theme));
        if !arc.key_events.is_empty() {
            out.push_str(&format!("Sự kiện then chốt: {}\n", arc.key_events.join("; ")));
        }
        if !arc.climax.is_empty() {
            out.push_str(&format!("Cao trào arc: {}\n", arc.climax));
        }
        out.push('\n');
    }

    if !bundle.previous_summaries.is_empty() {
        out.push_str("## TÓM TẮT CÁC CHƯƠNG TRƯỚC\n");
        for s in &bundle.previous_summaries {
            out.push_str(&format!("Chương {} — {}: {}\n", s.chapter_number, s.title, s.summary));
        }
        out.push('\n');
    }

    if !bundle.canon.is_empty() {
        out.push_str("## SỰ THẬT ĐÃ THIẾT LẬP (không được mâu thuẫn)\n");
        for f in &bundle.canon {
            out.push_str(&format!("- {} | {} | {}\n", f.subject, f.predicate, f.object));
        }
        out.push('\n');
    }

    if !bundle.beat_recommendations.is_empty() {
        out.push_str("## NHỊP TRUYỆN NÊN DÙNG (đã lâu chưa xuất hiện)\n");
        for b in &bundle.beat_recommendations {
            out.push_str(&format!("- {b}\n"));
        }
        out.push('\n');
    }

    if !bundle.rag_excerpts.is_empty() {
        out.push_str("## TRÍCH ĐOẠN LIÊN QUAN TỪ CÁC CHƯƠNG CŨ\n");
        for e in &bundle.rag_excerpts {
            out.push_str(&format!("[Chương {}] {}\n", e.chapter_number, e.text));
        }
        out.push('\n');
    }

    if let Some(co) = &bundle.chapter_outline {
        out.push_str(&format!("## DÀN Ý CHƯƠNG {chapter_number}\n"));
        out.push_str(&format!("Tiêu đề gợi ý: {}\n", co.title));
        out.push_str(&format!("Tóm tắt: {}\n", co.summary));
        if !co.key_points.is_empty() {
            out.push_str(&format!("Điểm bắt buộc: {}\n", co.key_points.join("; ")));
        }
        out.push_str(&format!("Mức căng thẳng mục tiêu: {}/100\n\n", co.tension_target));
    }

    out.push_str("## YÊU CẦU\n");
    out.push_str(&format!(
        "- Dòng đầu: \"Chương {chapter_number}: Tên chương\"\n"
    ));
    out.push_str("- Không markdown, không chú thích của tác giả.\n");
    out.push_str("- Mở đầu phải có móc câu trong 100 từ đầu tiên.\n");
    out.push_str("- Kết chương bằng cliffhanger.\n");
    for d in extra_directives {
        out.push_str(&format!("- {d}\n"));
    }

    out
}

/// Si el prompt excede la ventana, recorta primero los resúmenes más viejos,
/// después el canon menos reciente. El dàn ý del capítulo no se toca.
pub fn fit_prompt(
    project: &Project,
    bundle: &ContextBundle,
    chapter_number: i64,
    extra_directives: &[String],
    max_prompt_chars: usize,
) -> String {
    let mut trimmed = bundle.clone();
    let mut prompt = build_user_prompt(project, &trimmed, chapter_number, extra_directives);

    while prompt.chars().count() > max_prompt_chars {
        if trimmed.previous_summaries.len() > 1 {
            trimmed.previous_summaries.remove(0);
        } else if !trimmed.rag_excerpts.is_empty() {
            trimmed.rag_excerpts.pop();
        } else if trimmed.canon.len() > 3 {
            // El snapshot viene ordenado por relevancia: cae la cola.
            trimmed.canon.pop();
        } else {
            break;
        }
        prompt = build_user_prompt(project, &trimmed, chapter_number, extra_directives);
    }

    prompt
}

// --- PARSEO ---

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*Chương\s+(\d+)\s*[:：]\s*(.+?)\s*$").expect("title regex")
    })
}

/// Extrae (número, título) de la línea "Chương N: …" y devuelve el cuerpo
/// sin ella.
pub fn parse_title(expected_number: i64, text: &str) -> Result<(String, String), WriterError> {
    let caps = title_regex().captures(text).ok_or(WriterError::TitleUnparsable)?;

    let number: i64 = caps[1].parse().map_err(|_| WriterError::TitleUnparsable)?;
    if number != expected_number {
        return Err(WriterError::TitleUnparsable);
    }

    let title = caps[2].trim().to_string();
    let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
    let mut body = String::with_capacity(text.len());
    body.push_str(&text[..whole.0]);
    body.push_str(&text[whole.1..]);

    Ok((title, body.trim().to_string()))
}

/// Limpia residuos markdown que a veces se cuelan pese a las directivas.
pub fn clean_artifacts(body: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    static HEADING: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?m)^```.*$").expect("fence regex"));
    let heading = HEADING.get_or_init(|| Regex::new(r"(?m)^#{1,6}\s+").expect("heading regex"));

    let without_fences = fence.replace_all(body, "");
    let without_headings = heading.replace_all(&without_fences, "");
    without_headings
        .replace("**", "")
        .replace("__", "")
        .trim()
        .to_string()
}

// --- WRITE ---

/// `WriteChapter`: prompt + generator + parseo. El retry acotado con backoff
/// cubre solo errores transitorios (timeout/upstream); contenido inválido
/// sube directo para que el rewriter lo trate.
pub async fn write_chapter(
    generator: &Arc<dyn Generator>,
    config: &FactoryConfig,
    project: &Project,
    bundle: &ContextBundle,
    chapter_number: i64,
    params: &WriteParams,
    extra_directives: &[String],
) -> Result<Draft, WriterError> {
    let system = build_system_prompt(project.genre);
    let user = fit_prompt(
        project,
        bundle,
        chapter_number,
        extra_directives,
        params.max_prompt_chars,
    );

    let mut last_err: Option<WriterError> = None;

    for attempt in 0..=config.writer_retries {
        if attempt > 0 {
            let delay = crate::db::helpers::backoff_delay(attempt);
            warn!(
                "🔁 Writer retry {}/{} for chapter {} of {} in {:?}",
                attempt, config.writer_retries, chapter_number, project.id, delay
            );
            tokio::time::sleep(delay).await;
        }

        let request = GenerateRequest {
            system: system.clone(),
            user: user.clone(),
            model: params.model.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let result = tokio::time::timeout(config.writer_timeout(), generator.generate(request))
            .await
            .map_err(|_| WriterError::Timeout(config.writer_timeout()))
            .and_then(|inner| inner);

        match result {
            Ok(generation) => return finish_draft(chapter_number, params, generation),
            Err(e) if e.is_transient() => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or(WriterError::Upstream("retries exhausted".into())))
}

fn finish_draft(
    chapter_number: i64,
    params: &WriteParams,
    generation: Generation,
) -> Result<Draft, WriterError> {
    let text = generation.text.trim();
    if text.is_empty() {
        return Err(WriterError::Empty);
    }

    // Tope de tokens alcanzado: el final del capítulo casi seguro se perdió.
    if generation.output_tokens >= params.max_tokens as i64 {
        return Err(WriterError::Truncated(format!(
            "hit max_tokens={}",
            params.max_tokens
        )));
    }

    let (title, raw_body) = parse_title(chapter_number, text)?;
    let body = clean_artifacts(&raw_body);
    if body.is_empty() {
        return Err(WriterError::Empty);
    }

    let words = word_count(&body);
    Ok(Draft {
        chapter_number,
        title,
        body,
        word_count: words,
        input_tokens: if generation.input_tokens > 0 {
            generation.input_tokens
        } else {
            estimate_tokens(text.len())
        },
        output_tokens: generation.output_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChapterSummary, ProjectStatus};

    fn project() -> Project {
        Project {
            id: "p1".into(),
            novel_id: "n1".into(),
            genre: Genre::Cultivation,
            main_character: "Lâm Phong".into(),
            current_chapter: 0,
            total_planned_chapters: 100,
            target_chapter_length: 2000,
            model_preference: String::new(),
            status: ProjectStatus::Active,
            updated_at: 0,
        }
    }

    #[test]
    fn parse_title_strips_line() {
        let text = "Chương 5: Kiếm xuất Vạn Trủng\n\nGió lạnh thổi qua nghĩa địa kiếm.";
        let (title, body) = parse_title(5, text).unwrap();
        assert_eq!(title, "Kiếm xuất Vạn Trủng");
        assert_eq!(body, "Gió lạnh thổi qua nghĩa địa kiếm.");
    }

    #[test]
    fn parse_title_rejects_wrong_number() {
        let text = "Chương 4: Sai số\n\nNội dung.";
        assert!(matches!(parse_title(5, text), Err(WriterError::TitleUnparsable)));
    }

    #[test]
    fn parse_title_rejects_missing_line() {
        assert!(matches!(
            parse_title(1, "Một chương không có tiêu đề."),
            Err(WriterError::TitleUnparsable)
        ));
    }

    #[test]
    fn clean_artifacts_removes_markdown() {
        let dirty = "## Mở màn\n**Lâm Phong** rút kiếm.\n```\nx\n```\nHết.";
        let clean = clean_artifacts(dirty);
        assert!(!clean.contains("##"));
        assert!(!clean.contains("**"));
        assert!(!clean.contains("```"));
        assert!(clean.contains("Lâm Phong rút kiếm."));
    }

    #[test]
    fn prompt_sections_are_ordered_and_deterministic() {
        let p = project();
        let bundle = ContextBundle {
            project_id: "p1".into(),
            chapter_number: 3,
            world: Some(crate::factory::context::WorldInfo {
                tagline: "t".into(),
                world_description: "thế giới".into(),
                power_system: "hệ thống".into(),
                main_character_name: "Lâm Phong".into(),
                main_character_motivation: "trả thù".into(),
            }),
            previous_summaries: vec![ChapterSummary {
                project_id: "p1".into(),
                chapter_number: 2,
                title: "Trước đó".into(),
                summary: "tóm tắt".into(),
            }],
            ..ContextBundle::default()
        };

        let a = build_user_prompt(&p, &bundle, 3, &[]);
        let b = build_user_prompt(&p, &bundle, 3, &[]);
        assert_eq!(a, b);

        let world_pos = a.find("BỐI CẢNH THẾ GIỚI").unwrap();
        let prev_pos = a.find("TÓM TẮT CÁC CHƯƠNG TRƯỚC").unwrap();
        let req_pos = a.find("## YÊU CẦU").unwrap();
        assert!(world_pos < prev_pos && prev_pos < req_pos);
        assert!(a.starts_with("SỐ CHƯƠNG: 3"));
    }

    #[test]
    fn fit_prompt_drops_oldest_summaries_first() {
        let p = project();
        let bundle = ContextBundle {
            project_id: "p1".into(),
            chapter_number: 9,
            previous_summaries: (6..=8)
                .map(|n| ChapterSummary {
                    project_id: "p1".into(),
                    chapter_number: n,
                    title: format!("Chương {n}"),
                    summary: "nội dung ".repeat(200),
                })
                .collect(),
            ..ContextBundle::default()
        };

        let full = build_user_prompt(&p, &bundle, 9, &[]);
        let budget = full.chars().count() - 500;
        let fitted = fit_prompt(&p, &bundle, 9, &[], budget);

        assert!(fitted.chars().count() <= budget);
        // El resumen más reciente sobrevive.
        assert!(fitted.contains("Chương 8"));
        assert!(!fitted.contains("Chương 6 —"));
    }

    #[tokio::test]
    async fn write_chapter_happy_path() {
        let p = project();
        let generator: Arc<dyn Generator> = crate::llm::DemoGenerator::new();
        let cfg = FactoryConfig::default();
        let bundle = ContextBundle {
            project_id: "p1".into(),
            chapter_number: 1,
            ..ContextBundle::default()
        };

        let draft = write_chapter(
            &generator,
            &cfg,
            &p,
            &bundle,
            1,
            &WriteParams::for_project(&p),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(draft.chapter_number, 1);
        assert!(!draft.title.is_empty());
        assert!(draft.word_count > 100);
        assert!(!draft.body.contains("Chương 1:"));
    }

    #[tokio::test]
    async fn empty_generation_is_content_error() {
        struct EmptyGen;
        #[async_trait::async_trait]
        impl Generator for EmptyGen {
            async fn generate(&self, _req: GenerateRequest) -> Result<Generation, WriterError> {
                Ok(Generation {
                    text: "   ".into(),
                    input_tokens: 1,
                    output_tokens: 1,
                })
            }
        }

        let p = project();
        let generator: Arc<dyn Generator> = Arc::new(EmptyGen);
        let cfg = FactoryConfig::default();
        let bundle = ContextBundle::default();

        let err = write_chapter(
            &generator,
            &cfg,
            &p,
            &bundle,
            1,
            &WriteParams::for_project(&p),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WriterError::Empty));
    }
}
