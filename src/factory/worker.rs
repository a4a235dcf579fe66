// ========================================
// worker.rs - Production Worker
// ========================================
// Máquina de estados de UN capítulo:
//   IDLE → LOADING_CTX → WRITING → EVALUATING → [REWRITING] → PERSISTING
//        → INDEXING → DONE | FAILED
// PERSISTING es un único commit transaccional con CAS-advance. INDEXING es
// best-effort post-commit.

use tracing::{info, warn};

use crate::db::{ChapterCommit, PersistOutcome};
use crate::db::chapters::draft_chapter;
use crate::error::{FactoryError, FactoryResult, WriterError};
use crate::factory::Factory;
use crate::factory::context::load_context;
use crate::factory::gates::cost::CostGate;
use crate::factory::gates::{
    Diagnostic, GateAction, GateReport, GateResult, Severity, evaluate_draft,
};
use crate::factory::rewriter::rewrite_until_pass;
use crate::factory::writer::{Draft, WriteParams, write_chapter};
use crate::llm::{IndexSection, estimate_tokens};
use crate::model::{
    CanonFact, ChapterResult, ChapterSummary, CostRecord, TaskKind, predicates,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    LoadingCtx,
    Writing,
    Evaluating,
    Rewriting,
    Persisting,
    Indexing,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct ChapterOutcome {
    pub result: ChapterResult,
    /// true si el capítulo quedó como borrador para revisión (sin avance).
    pub needs_human_review: bool,
}

/// Resumen local del capítulo para chapter_summaries: título + primeras
/// oraciones. Evita una llamada extra al LLM por chương.
fn summarize_draft(draft: &Draft) -> String {
    let mut summary = String::new();
    for sent in draft.body.split_inclusive(|c| matches!(c, '.' | '!' | '?' | '…')) {
        if summary.chars().count() + sent.chars().count() > 280 {
            break;
        }
        summary.push_str(sent);
    }
    if summary.is_empty() {
        summary = draft.body.chars().take(280).collect();
    }
    summary.trim().to_string()
}

/// GateReport sintético para contenido inválido (vacío/truncado/sin título):
/// la falla de contenido se trata como el gate más duro y va al rewriter.
fn invalid_content_report(err: &WriterError) -> GateReport {
    GateReport {
        action: GateAction::AutoRewrite,
        composite: Some(0.0),
        results: vec![GateResult {
            gate: "writer",
            passed: false,
            score: Some(0.0),
            action: GateAction::AutoRewrite,
            diagnostics: vec![Diagnostic::new(
                "invalid_content",
                Severity::Hard,
                format!("generator produced invalid content: {err}"),
            )],
        }],
        pending_facts: vec![],
        beats: vec![],
        power_events: vec![],
    }
}

/// Produce el capítulo `chapter_number` del project. El caller (scheduler)
/// garantiza que es el siguiente en orden; el CAS del commit lo re-verifica.
pub async fn produce_chapter(
    factory: &Factory,
    cost_gate: &CostGate,
    project_id: &str,
    chapter_number: i64,
    worker_tag: &str,
) -> FactoryResult<ChapterOutcome> {
    let mut state = WorkerState::Idle;
    let db = &factory.db;
    let config = factory.config().await;
    tracing::debug!("[{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);

    db.require_flag("writing").await?;

    let project = db
        .get_project(project_id)
        .await?
        .ok_or_else(|| FactoryError::ProjectNotFound(project_id.to_string()))?;

    // --- LOADING_CTX ---
    state = WorkerState::LoadingCtx;
    info!("📖 [{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);
    let bundle = load_context(
        db,
        factory.index.as_ref(),
        &factory.heuristics,
        &config,
        &project,
        chapter_number,
    )
    .await;

    let lexicon = factory.lexicon_for(project.genre).await;
    let params = WriteParams::for_project(&project);

    // Pre-check de presupuesto ANTES de gastar el primer token.
    let est_input = estimate_tokens(bundle.char_len() + 4_000);
    let est_output = (project.target_chapter_length as f64 * 1.5) as i64;
    let decision = cost_gate
        .can_proceed(db, &config, project_id, est_input, est_output, TaskKind::Writing)
        .await?;
    if !decision.allowed {
        return Err(FactoryError::BudgetExhausted(
            decision.reason.unwrap_or_else(|| "budget".to_string()),
        ));
    }

    // --- WRITING ---
    state = WorkerState::Writing;
    info!("✍️ [{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);

    let mut costs: Vec<CostRecord> = Vec::new();

    let (draft, report) = match write_chapter(
        &factory.generator,
        &config,
        &project,
        &bundle,
        chapter_number,
        &params,
        &[],
    )
    .await
    {
        Ok(draft) => {
            let usd = config.estimate_cost(draft.input_tokens, draft.output_tokens);
            cost_gate.add_session_cost(usd).await;
            costs.push(CostRecord {
                project_id: project_id.to_string(),
                at: 0,
                task: TaskKind::Writing,
                model: params.model.clone(),
                input_tokens: draft.input_tokens,
                output_tokens: draft.output_tokens,
                cost_usd: usd,
            });

            // --- EVALUATING ---
            state = WorkerState::Evaluating;
            info!("⚖️ [{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);
            let report = evaluate_draft(db, &config, &lexicon, &project, &bundle, &draft).await?;
            (draft, report)
        }
        Err(e) if e.is_transient() => {
            // El writer ya agotó su retry acotado: FAILED.
            state = WorkerState::Failed;
            warn!(
                "❌ [{worker_tag}] ch{chapter_number} {project_id}: {:?} ({e})",
                state
            );
            return Ok(ChapterOutcome {
                result: ChapterResult {
                    chapter_number,
                    success: false,
                    needs_human_review: false,
                    qc_score: None,
                    rewrite_attempts: 0,
                    word_count: 0,
                    error: Some(e.to_string()),
                },
                needs_human_review: false,
            });
        }
        Err(e) => {
            // Contenido inválido: draft placeholder + reporte duro, directo
            // al rewriter.
            let placeholder = Draft {
                chapter_number,
                title: String::new(),
                body: String::new(),
                word_count: 0,
                input_tokens: 0,
                output_tokens: 0,
            };
            (placeholder, invalid_content_report(&e))
        }
    };

    // --- REWRITING (si hace falta) ---
    let outcome = match report.action {
        GateAction::Reject => {
            state = WorkerState::Failed;
            warn!(
                "❌ [{worker_tag}] ch{chapter_number} {project_id}: rejected by gates ({:?})",
                state
            );
            return Ok(ChapterOutcome {
                result: ChapterResult {
                    chapter_number,
                    success: false,
                    needs_human_review: false,
                    qc_score: report.composite,
                    rewrite_attempts: 0,
                    word_count: draft.word_count,
                    error: Some("rejected".to_string()),
                },
                needs_human_review: false,
            });
        }
        GateAction::AutoRewrite => {
            state = WorkerState::Rewriting;
            info!("🔁 [{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);
            rewrite_until_pass(
                db,
                &factory.generator,
                &config,
                &lexicon,
                cost_gate,
                &project,
                &bundle,
                &params,
                draft,
                report,
            )
            .await?
        }
        GateAction::Accept | GateAction::HumanReview => crate::factory::rewriter::RewriteOutcome {
            needs_human_review: report.action == GateAction::HumanReview,
            success: report.action == GateAction::Accept,
            stop_reason: None,
            attempts: 0,
            costs: Vec::new(),
            draft,
            report,
        },
    };

    costs.extend(outcome.costs.iter().cloned());
    let draft = outcome.draft;
    let report = outcome.report;
    let needs_review = outcome.needs_human_review;

    // --- PERSISTING ---
    state = WorkerState::Persisting;
    info!("💾 [{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);

    // Deltas de canon: pendientes del canon gate + realms de breakthroughs.
    let mut canon_deltas: Vec<CanonFact> = Vec::new();
    let mut beats = Vec::new();
    let mut power_events = Vec::new();
    if !needs_review {
        canon_deltas = report.pending_facts.clone();
        for ev in &report.power_events {
            if let Some(realm) = &ev.realm {
                canon_deltas.push(CanonFact::new(
                    project_id,
                    &ev.character,
                    predicates::REALM,
                    realm,
                    chapter_number,
                ));
            }
        }
        beats = report.beats.clone();
        power_events = report.power_events.clone();
    }

    let title = if draft.title.is_empty() {
        format!("Chương {chapter_number}")
    } else {
        draft.title.clone()
    };

    let commit = ChapterCommit {
        project_id: project_id.to_string(),
        chapter: draft_chapter(
            &project.novel_id,
            chapter_number,
            &title,
            &draft.body,
            draft.word_count,
        ),
        summary: ChapterSummary {
            project_id: project_id.to_string(),
            chapter_number,
            title: title.clone(),
            summary: summarize_draft(&draft),
        },
        canon_deltas,
        beats,
        power_events,
        costs,
        // Revisión humana: el capítulo se guarda como draft pero el project
        // NO avanza (decisión registrada en DESIGN.md).
        advance_to: if needs_review { None } else { Some(chapter_number) },
    };

    let persist = db.persist_chapter_commit(&commit).await?;

    if persist == PersistOutcome::AdvanceRaced {
        // Otro worker ya dejó este capítulo: duplicado benigno, item done.
        state = WorkerState::Done;
        info!(
            "↩️ [{worker_tag}] ch{chapter_number} {project_id}: benign duplicate ({:?})",
            state
        );
        return Ok(ChapterOutcome {
            result: ChapterResult {
                chapter_number,
                success: true,
                needs_human_review: false,
                qc_score: None,
                rewrite_attempts: outcome.attempts as i64,
                word_count: 0,
                error: None,
            },
            needs_human_review: false,
        });
    }

    // Capítulo aceptado: entra a la cola de publicación (at-least-once; la
    // publicación en sí es idempotente).
    if !needs_review {
        match db.get_chapter(&project.novel_id, chapter_number).await {
            Ok(Some(stored)) => {
                if let Err(e) = db.enqueue_publish(&stored.id, crate::db::helpers::now_epoch()).await
                {
                    warn!("⚠️ [{worker_tag}] enqueue_publish failed (retried next run): {e}");
                }
            }
            Ok(None) => warn!("⚠️ [{worker_tag}] committed chapter row not found for publish"),
            Err(e) => warn!("⚠️ [{worker_tag}] publish scheduling lookup failed: {e}"),
        }
    }

    // --- INDEXING (best-effort, post-commit, idempotente) ---
    state = WorkerState::Indexing;
    tracing::debug!("[{worker_tag}] ch{chapter_number} {project_id}: {:?}", state);
    if db.require_flag("indexing").await.is_ok() {
        let sections = vec![
            IndexSection {
                heading: title.clone(),
                body: commit.summary.summary.clone(),
            },
            IndexSection {
                heading: format!("Chương {chapter_number}"),
                body: draft.body.clone(),
            },
        ];
        if let Err(e) = factory
            .index
            .upsert(project_id, chapter_number, sections)
            .await
        {
            warn!("⚠️ [{worker_tag}] RAG index update failed (non-fatal): {e}");
        }
    }

    state = if needs_review { WorkerState::Failed } else { WorkerState::Done };
    info!(
        "🏁 [{worker_tag}] ch{chapter_number} {project_id}: {:?} (qc={:?}, rewrites={})",
        state, report.composite, outcome.attempts
    );

    Ok(ChapterOutcome {
        result: ChapterResult {
            chapter_number,
            success: !needs_review,
            needs_human_review: needs_review,
            qc_score: report.composite,
            rewrite_attempts: outcome.attempts as i64,
            word_count: draft.word_count,
            error: if needs_review {
                Some(
                    outcome
                        .stop_reason
                        .unwrap_or_else(|| "needs_human_review".to_string()),
                )
            } else {
                None
            },
        },
        needs_human_review: needs_review,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_takes_leading_sentences() {
        let draft = Draft {
            chapter_number: 1,
            title: "t".into(),
            body: "Câu một rất ngắn. Câu hai dài hơn một chút. ".repeat(20),
            word_count: 100,
            input_tokens: 0,
            output_tokens: 0,
        };
        let s = summarize_draft(&draft);
        assert!(s.chars().count() <= 280);
        assert!(s.starts_with("Câu một"));
    }

    #[test]
    fn invalid_content_routes_to_rewriter() {
        let report = invalid_content_report(&WriterError::Empty);
        assert_eq!(report.action, GateAction::AutoRewrite);
        assert!(report.results[0]
            .diagnostics
            .iter()
            .any(|d| d.code == "invalid_content" && d.severity == Severity::Hard));
    }
}
