// ========================================
// canon.rs - Canon Resolver
// ========================================
// Compara lo que el draft afirma contra el snapshot de canon activo.
// Fallos duros: personaje muerto reapareciendo sin resurrección, y muerte
// del protagonista. Hechos nuevos compatibles quedan pendientes y se
// commitean solo si el capítulo se acepta.

use regex::Regex;
use std::sync::OnceLock;

use crate::db::Database;
use crate::factory::context::ContextBundle;
use crate::factory::gates::{Diagnostic, GateAction, GateResult, Severity};
use crate::factory::writer::Draft;
use crate::heuristics::CompiledLexicon;
use crate::model::{CanonFact, Project, predicates};

const MAX_ITEM_FACTS_PER_CHAPTER: usize = 3;

fn sentences(body: &str) -> Vec<&str> {
    body.split(|c| matches!(c, '.' | '!' | '?' | '…' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "thu được một mảnh bảo vật cổ" -> objeto = frase tras el marcador.
        Regex::new(r"(?:nhận được|thu được|đoạt được|tìm thấy)\s+(?:một\s+)?([^,\.!?\n]{3,48})")
            .expect("item regex")
    })
}

pub async fn evaluate(
    db: &Database,
    lexicon: &CompiledLexicon,
    project: &Project,
    bundle: &ContextBundle,
    draft: &Draft,
) -> Result<(GateResult, Vec<CanonFact>), sqlx::Error> {
    let facts = db.get_active_facts(&project.id).await?;
    let body = &draft.body;
    let sents = sentences(body);

    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut pending: Vec<CanonFact> = Vec::new();
    let mut action = GateAction::Accept;

    let mc = if project.main_character.is_empty() {
        bundle
            .world
            .as_ref()
            .map(|w| w.main_character_name.clone())
            .unwrap_or_default()
    } else {
        project.main_character.clone()
    };

    // Personajes conocidos por el canon (cualquier sujeto con hechos de
    // personaje, no de ubicación).
    let known_characters: Vec<&str> = facts
        .iter()
        .filter(|f| f.predicate != predicates::IS_LOCATION)
        .map(|f| f.subject.as_str())
        .collect();

    // 1) Muertos que reaparecen. Resurrección explícita en el mismo capítulo
    //    levanta la restricción y genera el hecho (alive, true).
    let dead_subjects: Vec<&CanonFact> = facts
        .iter()
        .filter(|f| f.predicate == predicates::ALIVE && f.object == "false")
        .collect();

    for fact in dead_subjects {
        if !body.contains(fact.subject.as_str()) {
            continue;
        }

        let resurrected = sents.iter().any(|s| {
            s.contains(fact.subject.as_str()) && lexicon.hits(&lexicon.resurrection, s)
        });

        if resurrected {
            diagnostics.push(Diagnostic::new(
                "resurrection",
                Severity::Info,
                format!("'{}' returns from the dead (explicit revival event)", fact.subject),
            ));
            pending.push(CanonFact::new(
                &project.id,
                &fact.subject,
                predicates::ALIVE,
                "true",
                draft.chapter_number,
            ));
        } else {
            diagnostics.push(Diagnostic::new(
                "dead_character",
                Severity::Hard,
                format!(
                    "'{}' is dead since chapter {} but appears in this draft",
                    fact.subject, fact.last_confirmed_chapter
                ),
            ));
            action = action.max(GateAction::AutoRewrite);
        }
    }

    // 2) Muertes nuevas. La del protagonista rompe la novela.
    for sent in &sents {
        if !lexicon.hits(&lexicon.death, sent) {
            continue;
        }
        for subject in &known_characters {
            if !sent.contains(*subject) {
                continue;
            }
            if !mc.is_empty() && *subject == mc {
                diagnostics.push(Diagnostic::new(
                    "mc_death",
                    Severity::Hard,
                    format!("draft kills the main character '{mc}'"),
                ));
                action = action.max(GateAction::AutoRewrite);
            } else if !pending
                .iter()
                .any(|f| f.subject == *subject && f.predicate == predicates::ALIVE)
            {
                diagnostics.push(Diagnostic::new(
                    "character_death",
                    Severity::Warn,
                    format!("'{subject}' dies in this chapter"),
                ));
                pending.push(CanonFact::new(
                    &project.id,
                    subject,
                    predicates::ALIVE,
                    "false",
                    draft.chapter_number,
                ));
            }
        }
    }

    // 3) Adquisiciones de ítems del protagonista (tope por capítulo).
    if !mc.is_empty() {
        let mut item_facts = 0usize;
        for sent in &sents {
            if item_facts >= MAX_ITEM_FACTS_PER_CHAPTER {
                break;
            }
            if !sent.contains(mc.as_str()) && !sent.contains("hắn") && !sent.contains("cô") {
                continue;
            }
            if let Some(caps) = item_regex().captures(sent) {
                let object = caps[1].trim().to_string();
                if object.split_whitespace().count() >= 2 {
                    pending.push(CanonFact::new(
                        &project.id,
                        &mc,
                        predicates::HAS_ITEM,
                        &object,
                        draft.chapter_number,
                    ));
                    item_facts += 1;
                }
            }
        }
    }

    // 4) Re-confirmación: personajes vivos mencionados refrescan su hecho.
    //    Quien ya tiene un delta de vida pendiente (muerte detectada arriba)
    //    no se re-confirma.
    for fact in facts.iter().filter(|f| {
        f.predicate == predicates::ALIVE && f.object == "true" && body.contains(f.subject.as_str())
    }) {
        let already_pending = pending
            .iter()
            .any(|p| p.subject == fact.subject && p.predicate == predicates::ALIVE);
        if !already_pending {
            pending.push(CanonFact::new(
                &project.id,
                &fact.subject,
                predicates::ALIVE,
                "true",
                draft.chapter_number,
            ));
        }
    }

    let passed = action == GateAction::Accept;
    Ok((
        GateResult {
            gate: "canon",
            passed,
            score: None,
            action,
            diagnostics,
        },
        pending,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::HeuristicsTable;
    use crate::model::{Genre, ProjectStatus};

    fn project() -> Project {
        Project {
            id: "p1".into(),
            novel_id: "n1".into(),
            genre: Genre::Cultivation,
            main_character: "Lâm Phong".into(),
            current_chapter: 49,
            total_planned_chapters: 100,
            target_chapter_length: 2000,
            model_preference: String::new(),
            status: ProjectStatus::Active,
            updated_at: 0,
        }
    }

    fn draft_of(body: &str) -> Draft {
        Draft {
            chapter_number: 50,
            title: "t".into(),
            body: body.into(),
            word_count: crate::heuristics::word_count(body),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    async fn db_with_dead_elder() -> Database {
        let db = Database::connect_in_memory().await.unwrap();
        db.create_novel("n1", "t").await.unwrap();
        db.create_project(&crate::db::projects::new_project(
            "p1",
            "n1",
            Genre::Cultivation,
            100,
            2000,
        ))
        .await
        .unwrap();
        db.upsert_canon_fact(&CanonFact::new("p1", "Trưởng lão Hắc", "alive", "false", 30))
            .await
            .unwrap();
        db.upsert_canon_fact(&CanonFact::new("p1", "Lâm Phong", "alive", "true", 1))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn dead_character_reappearance_is_hard_failure() {
        let db = db_with_dead_elder().await;
        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft = draft_of("Trưởng lão Hắc bước ra từ bóng tối, ánh mắt âm trầm.");

        let (result, _) = evaluate(&db, &lex, &project(), &ContextBundle::default(), &draft)
            .await
            .unwrap();

        assert_eq!(result.action, GateAction::AutoRewrite);
        assert!(result.diagnostics.iter().any(|d| d.code == "dead_character"));
    }

    #[tokio::test]
    async fn resurrection_event_lifts_the_ban() {
        let db = db_with_dead_elder().await;
        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft =
            draft_of("Không ngờ Trưởng lão Hắc còn có thể sống lại nhờ cấm thuật huyết tế.");

        let (result, pending) = evaluate(&db, &lex, &project(), &ContextBundle::default(), &draft)
            .await
            .unwrap();

        assert_eq!(result.action, GateAction::Accept);
        assert!(pending
            .iter()
            .any(|f| f.subject == "Trưởng lão Hắc" && f.predicate == "alive" && f.object == "true"));
    }

    #[tokio::test]
    async fn clean_draft_passes_and_reconfirms() {
        let db = db_with_dead_elder().await;
        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft = draft_of("Lâm Phong rời khỏi đại điện, hướng về phía núi xa.");

        let (result, pending) = evaluate(&db, &lex, &project(), &ContextBundle::default(), &draft)
            .await
            .unwrap();

        assert_eq!(result.action, GateAction::Accept);
        assert!(result.passed);
        assert!(pending
            .iter()
            .any(|f| f.subject == "Lâm Phong" && f.object == "true"));
    }

    #[tokio::test]
    async fn side_character_death_becomes_pending_fact() {
        let db = db_with_dead_elder().await;
        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        db.upsert_canon_fact(&CanonFact::new("p1", "Triệu Khôn", "alive", "true", 10))
            .await
            .unwrap();
        let draft = draft_of("Một kiếm xuyên tim, Triệu Khôn đã chết ngay tại chỗ.");

        let (result, pending) = evaluate(&db, &lex, &project(), &ContextBundle::default(), &draft)
            .await
            .unwrap();

        assert_eq!(result.action, GateAction::Accept);
        assert!(pending
            .iter()
            .any(|f| f.subject == "Triệu Khôn" && f.predicate == "alive" && f.object == "false"));
    }

    #[tokio::test]
    async fn mc_death_is_hard() {
        let db = db_with_dead_elder().await;
        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft = draft_of("Lâm Phong trúng một chưởng, hộc máu, cuối cùng đã chết.");

        let (result, _) = evaluate(&db, &lex, &project(), &ContextBundle::default(), &draft)
            .await
            .unwrap();

        assert_eq!(result.action, GateAction::AutoRewrite);
        assert!(result.diagnostics.iter().any(|d| d.code == "mc_death"));
    }

    #[tokio::test]
    async fn item_acquisition_pends_has_item_fact() {
        let db = db_with_dead_elder().await;
        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft = draft_of("Lâm Phong thu được một mảnh bảo vật cổ xưa trong hang động.");

        let (_, pending) = evaluate(&db, &lex, &project(), &ContextBundle::default(), &draft)
            .await
            .unwrap();

        assert!(pending
            .iter()
            .any(|f| f.predicate == "has-item" && f.object.contains("bảo vật")));
    }
}
