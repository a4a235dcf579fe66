// ========================================
// context.rs - Context Loader
// ========================================
// Arma el bundle de escritura desde el estado persistente. Best-effort
// aditivo: cada sub-fuente que falle se loggea y se omite, nunca bloquea.

use tracing::warn;

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::heuristics::{HeuristicsTable, SceneType};
use crate::llm::{Excerpt, SemanticIndex};
use crate::model::{
    ArcOutline, BeatType, CanonFact, ChapterOutline, ChapterSummary, Project,
};

/// Información de mundo extraída del outline; va al prompt tal cual.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldInfo {
    pub tagline: String,
    pub world_description: String,
    pub power_system: String,
    pub main_character_name: String,
    pub main_character_motivation: String,
}

/// Campos explícitos, nada de mapas dispersos: el writer y los gates saben
/// exactamente qué secciones pueden faltar.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub project_id: String,
    pub chapter_number: i64,
    pub world: Option<WorldInfo>,
    pub previous_summaries: Vec<ChapterSummary>,
    pub arc: Option<ArcOutline>,
    pub chapter_outline: Option<ChapterOutline>,
    pub canon: Vec<CanonFact>,
    pub beat_recommendations: Vec<BeatType>,
    pub style_hints: Vec<String>,
    pub rag_excerpts: Vec<Excerpt>,
    pub scene_type: SceneType,
}

impl ContextBundle {
    /// Personajes en foco para la selección de canon y los gates.
    pub fn focus_characters(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if let Some(w) = &self.world {
            if !w.main_character_name.is_empty() {
                out.push(w.main_character_name.clone());
            }
        }
        if let Some(co) = &self.chapter_outline {
            for c in &co.characters {
                if !out.iter().any(|x| x.eq_ignore_ascii_case(c)) {
                    out.push(c.clone());
                }
            }
        }
        out
    }

    /// Tamaño textual total del bundle, en CARACTERES (no bytes): el texto
    /// es vietnamita y en UTF-8 cada carácter pesa hasta 3 bytes, así que
    /// contar bytes recortaría ~3x de más contra el tope configurado.
    pub fn char_len(&self) -> usize {
        let chars = |s: &str| s.chars().count();

        let mut n = 0usize;
        if let Some(w) = &self.world {
            n += chars(&w.tagline)
                + chars(&w.world_description)
                + chars(&w.power_system)
                + chars(&w.main_character_motivation);
        }
        n += self
            .previous_summaries
            .iter()
            .map(|s| chars(&s.title) + chars(&s.summary))
            .sum::<usize>();
        if let Some(a) = &self.arc {
            n += chars(&a.title) + chars(&a.theme) + chars(&a.climax);
            n += a.key_events.iter().map(|e| chars(e)).sum::<usize>();
        }
        if let Some(c) = &self.chapter_outline {
            n += chars(&c.title) + chars(&c.summary);
            n += c.key_points.iter().map(|k| chars(k)).sum::<usize>();
        }
        n += self
            .canon
            .iter()
            .map(|f| chars(&f.subject) + chars(&f.predicate) + chars(&f.object))
            .sum::<usize>();
        n += self.style_hints.iter().map(|h| chars(h)).sum::<usize>();
        n += self.rag_excerpts.iter().map(|e| chars(&e.text)).sum::<usize>();
        n
    }

    /// Aplica el tope de caracteres: primero caen los excerpts de RAG,
    /// después los resúmenes más viejos. El outline del capítulo no se toca.
    pub fn enforce_char_budget(&mut self, max_chars: usize) {
        while self.char_len() > max_chars && !self.rag_excerpts.is_empty() {
            self.rag_excerpts.pop();
        }
        while self.char_len() > max_chars && self.previous_summaries.len() > 1 {
            self.previous_summaries.remove(0);
        }
        while self.char_len() > max_chars && self.canon.len() > 5 {
            self.canon.pop();
        }
    }
}

/// `load_context(projectID, nextChapterNumber) -> ContextBundle`
pub async fn load_context(
    db: &Database,
    index: &dyn SemanticIndex,
    heuristics: &HeuristicsTable,
    config: &FactoryConfig,
    project: &Project,
    chapter_number: i64,
) -> ContextBundle {
    let mut bundle = ContextBundle {
        project_id: project.id.clone(),
        chapter_number,
        ..ContextBundle::default()
    };

    // 1) Outline: mundo + arco activo + fila del capítulo.
    match db.get_outline(&project.id).await {
        Ok(Some(outline)) => {
            bundle.world = Some(WorldInfo {
                tagline: outline.tagline.clone(),
                world_description: outline.world_description.clone(),
                power_system: outline.power_system.clone(),
                main_character_name: outline.main_character_name.clone(),
                main_character_motivation: outline.main_character_motivation.clone(),
            });
            bundle.arc = outline.arc_for(chapter_number).cloned();
            bundle.chapter_outline = outline.chapter(chapter_number).cloned();
        }
        Ok(None) => {
            warn!("⚠️ CTX: project {} has no outline", project.id);
        }
        Err(e) => {
            warn!("⚠️ CTX: outline load failed for {}: {}", project.id, e);
        }
    }

    if let Some(co) = &bundle.chapter_outline {
        bundle.scene_type = SceneType::infer(co.tension_target, &co.dopamine_type);
    }

    // 2) Últimos N resúmenes, en orden de lectura.
    match db
        .get_recent_chapter_summaries(&project.id, config.recent_chapters_for_context as i64)
        .await
    {
        Ok(summaries) => bundle.previous_summaries = summaries,
        Err(e) => warn!("⚠️ CTX: summaries load failed for {}: {}", project.id, e),
    }

    // 3) Snapshot de canon, sesgado a los personajes del capítulo.
    let focus = bundle.focus_characters();
    match db
        .get_canon_snapshot(&project.id, &focus, config.canon_snapshot_size)
        .await
    {
        Ok(facts) => bundle.canon = facts,
        Err(e) => warn!("⚠️ CTX: canon snapshot failed for {}: {}", project.id, e),
    }

    // 4) Recomendaciones de beats: los menos usados en la ventana.
    match db
        .beat_counts_in_window(&project.id, chapter_number - 1, config.beat_window)
        .await
    {
        Ok(counts) => {
            let mut all: Vec<(BeatType, i64)> = BeatType::ALL
                .iter()
                .map(|b| (*b, counts.get(b).copied().unwrap_or(0)))
                .collect();
            all.sort_by_key(|(_, n)| *n);
            bundle.beat_recommendations = all
                .into_iter()
                .filter(|(_, n)| *n < config.beat_overuse_soft)
                .take(4)
                .map(|(b, _)| b)
                .collect();
        }
        Err(e) => warn!("⚠️ CTX: beat window failed for {}: {}", project.id, e),
    }

    // 5) Style hints estáticos por (genre, scene_type).
    bundle.style_hints = heuristics.style_hints_for(project.genre, bundle.scene_type);

    // 6) RAG opcional sobre capítulos previos.
    if config.rag_excerpts > 0 {
        let query = bundle
            .chapter_outline
            .as_ref()
            .map(|c| format!("{} {}", c.summary, c.key_points.join(" ")))
            .unwrap_or_else(|| format!("chương {chapter_number}"));

        match index.search(&project.id, &query, config.rag_excerpts).await {
            Ok(mut excerpts) => {
                // Presupuesto combinado de caracteres para todos los excerpts.
                let mut used = 0usize;
                excerpts.retain_mut(|e| {
                    if used >= config.rag_chars_budget {
                        return false;
                    }
                    let room = config.rag_chars_budget - used;
                    if e.text.chars().count() > room {
                        e.text = e.text.chars().take(room).collect();
                    }
                    used += e.text.chars().count();
                    true
                });
                bundle.rag_excerpts = excerpts;
            }
            Err(e) => warn!("⚠️ CTX: rag search failed for {}: {}", project.id, e),
        }
    }

    bundle.enforce_char_budget(config.context_max_chars);
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::NoopIndex;
    use crate::model::Genre;

    async fn demo_db() -> (Database, Project) {
        let db = Database::connect_in_memory().await.unwrap();
        let id = db.inject_demo_project().await.unwrap();
        let project = db.get_project(&id).await.unwrap().unwrap();
        (db, project)
    }

    #[tokio::test]
    async fn bundle_carries_outline_sections() {
        let (db, project) = demo_db().await;
        let cfg = FactoryConfig::default();
        let table = HeuristicsTable::default();

        let bundle = load_context(&db, &NoopIndex, &table, &cfg, &project, 1).await;

        assert_eq!(bundle.chapter_number, 1);
        let world = bundle.world.as_ref().unwrap();
        assert_eq!(world.main_character_name, "Lâm Phong");
        assert!(bundle.arc.is_some());
        assert!(bundle.chapter_outline.is_some());
        assert!(!bundle.canon.is_empty());
        assert!(!bundle.style_hints.is_empty());
        // Sin capítulos previos, el bloque de resúmenes queda vacío.
        assert!(bundle.previous_summaries.is_empty());
        assert!(!bundle.beat_recommendations.is_empty());
    }

    #[tokio::test]
    async fn char_budget_drops_rag_then_old_summaries() {
        let mut bundle = ContextBundle {
            previous_summaries: (1..=4)
                .map(|n| ChapterSummary {
                    project_id: "p".into(),
                    chapter_number: n,
                    title: format!("Chương {n}"),
                    summary: "x".repeat(500),
                })
                .collect(),
            rag_excerpts: vec![Excerpt {
                chapter_number: 1,
                text: "y".repeat(2000),
                score: 1.0,
            }],
            ..ContextBundle::default()
        };

        bundle.enforce_char_budget(1600);

        assert!(bundle.rag_excerpts.is_empty(), "rag cae primero");
        // El más viejo (chapter 1) cayó, los recientes quedan.
        assert!(bundle.previous_summaries.len() < 4);
        assert_eq!(
            bundle.previous_summaries.last().unwrap().chapter_number,
            4
        );
        assert!(bundle.char_len() <= 1600);
    }

    #[tokio::test]
    async fn char_budget_counts_characters_not_bytes() {
        // "ộ" pesa 3 bytes en UTF-8: 400 caracteres ~ 1200 bytes. El tope es
        // en caracteres, así que un presupuesto de 500 NO debe recortar nada.
        let viet = "ộ".repeat(400);
        let mut bundle = ContextBundle {
            previous_summaries: vec![ChapterSummary {
                project_id: "p".into(),
                chapter_number: 1,
                title: String::new(),
                summary: viet.clone(),
            }],
            rag_excerpts: vec![Excerpt {
                chapter_number: 1,
                text: "kiếm".into(),
                score: 1.0,
            }],
            ..ContextBundle::default()
        };

        assert!(viet.len() > 1_000, "el fixture debe ser multibyte de verdad");
        assert_eq!(bundle.char_len(), 400 + "kiếm".chars().count());

        bundle.enforce_char_budget(500);
        assert_eq!(bundle.previous_summaries.len(), 1);
        assert_eq!(bundle.rag_excerpts.len(), 1);

        // Por debajo del conteo de caracteres sí recorta, rag primero.
        bundle.enforce_char_budget(300);
        assert!(bundle.rag_excerpts.is_empty());
    }

    #[tokio::test]
    async fn missing_outline_is_not_fatal() {
        let db = Database::connect_in_memory().await.unwrap();
        db.create_novel("n1", "t").await.unwrap();
        db.create_project(&crate::db::projects::new_project(
            "p1",
            "n1",
            Genre::Urban,
            10,
            2000,
        ))
        .await
        .unwrap();
        let project = db.get_project("p1").await.unwrap().unwrap();

        let bundle = load_context(
            &db,
            &NoopIndex,
            &HeuristicsTable::default(),
            &FactoryConfig::default(),
            &project,
            1,
        )
        .await;

        assert!(bundle.world.is_none());
        assert!(bundle.chapter_outline.is_none());
        // El loader sigue entregando un bundle usable.
        assert_eq!(bundle.chapter_number, 1);
    }
}
