// ========================================
// consistency.rs - Consistency Checker (best-effort)
// ========================================
// Checks estructurales globales. Este gate nunca tumba un capítulo: solo
// produce diagnósticos. Las violaciones de política quedan visibles, la
// protección dura la da el CAS del commit.

use crate::db::Database;
use crate::factory::gates::{Diagnostic, GateAction, GateResult, Severity};
use crate::factory::writer::Draft;
use crate::heuristics::CompiledLexicon;
use crate::model::{Project, predicates};

pub async fn evaluate(
    db: &Database,
    lexicon: &CompiledLexicon,
    project: &Project,
    draft: &Draft,
) -> Result<GateResult, sqlx::Error> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    // 1) Título presente (el writer ya validó el patrón "Chương N: …").
    if draft.title.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            "empty_title",
            Severity::Warn,
            "chapter title is empty after parsing",
        ));
    }

    // 2) Número de capítulo duplicado en el store. El upsert del commit lo
    //    vuelve benigno, pero la política exige que quede a la vista.
    if db.chapter_exists(&project.novel_id, draft.chapter_number).await? {
        diagnostics.push(Diagnostic::new(
            "duplicate_chapter_number",
            Severity::Major,
            format!(
                "chapter {} already exists for novel {}",
                draft.chapter_number, project.novel_id
            ),
        ));
    }

    let facts = db.get_active_facts(&project.id).await?;

    // 3) Eco suave del check vivo/muerto (el canon gate es el que actúa).
    for fact in facts
        .iter()
        .filter(|f| f.predicate == predicates::ALIVE && f.object == "false")
    {
        if draft.body.contains(fact.subject.as_str())
            && !lexicon.hits(&lexicon.resurrection, &draft.body)
        {
            diagnostics.push(Diagnostic::new(
                "dead_character_mention",
                Severity::Warn,
                format!("dead character '{}' is mentioned", fact.subject),
            ));
        }
    }

    // 4) Ubicaciones retiradas del canon que siguen apareciendo.
    for fact in facts
        .iter()
        .filter(|f| f.predicate == predicates::IS_LOCATION && f.object == "false")
    {
        if draft.body.contains(fact.subject.as_str()) {
            diagnostics.push(Diagnostic::new(
                "stale_location",
                Severity::Info,
                format!("location '{}' was retired from canon", fact.subject),
            ));
        }
    }

    Ok(GateResult {
        gate: "consistency",
        passed: true,
        score: None,
        // Best-effort: informa, no bloquea.
        action: GateAction::Accept,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::HeuristicsTable;
    use crate::model::{CanonFact, Genre};

    #[tokio::test]
    async fn duplicate_chapter_is_surfaced_not_blocking() {
        let db = Database::connect_in_memory().await.unwrap();
        db.create_novel("n1", "t").await.unwrap();
        let project = crate::db::projects::new_project("p1", "n1", Genre::Cultivation, 100, 2000);
        db.create_project(&project).await.unwrap();

        let commit = crate::db::ChapterCommit {
            project_id: "p1".into(),
            chapter: crate::db::chapters::draft_chapter("n1", 1, "t", "body", 10),
            summary: crate::model::ChapterSummary {
                project_id: "p1".into(),
                chapter_number: 1,
                title: "t".into(),
                summary: "s".into(),
            },
            canon_deltas: vec![],
            beats: vec![],
            power_events: vec![],
            costs: vec![],
            advance_to: Some(1),
        };
        db.persist_chapter_commit(&commit).await.unwrap();

        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft = Draft {
            chapter_number: 1,
            title: "t".into(),
            body: "nội dung".into(),
            word_count: 2,
            input_tokens: 0,
            output_tokens: 0,
        };

        let result = evaluate(&db, &lex, &project, &draft).await.unwrap();
        assert_eq!(result.action, GateAction::Accept);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == "duplicate_chapter_number" && d.severity == Severity::Major));
    }

    #[tokio::test]
    async fn dead_mention_is_soft_echo() {
        let db = Database::connect_in_memory().await.unwrap();
        db.create_novel("n1", "t").await.unwrap();
        let project = crate::db::projects::new_project("p1", "n1", Genre::Cultivation, 100, 2000);
        db.create_project(&project).await.unwrap();
        db.upsert_canon_fact(&CanonFact::new("p1", "Trưởng lão Hắc", "alive", "false", 30))
            .await
            .unwrap();

        let lex = HeuristicsTable::default().compile(Genre::Cultivation);
        let draft = Draft {
            chapter_number: 31,
            title: "t".into(),
            body: "Trưởng lão Hắc cười lạnh.".into(),
            word_count: 5,
            input_tokens: 0,
            output_tokens: 0,
        };

        let result = evaluate(&db, &lex, &project, &draft).await.unwrap();
        assert_eq!(result.action, GateAction::Accept);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == "dead_character_mention"));
    }
}
