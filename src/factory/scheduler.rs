// ========================================
// scheduler.rs - Per-run loop y orquestación de flota
// ========================================
// Dos responsabilidades:
//  1) run_project: el loop explícito de un run admin (pause/stop cooperativos
//     en los bordes de capítulo).
//  2) tick: planifica batches diarios por slot y despacha items claimados a
//     un pool acotado de workers.

use std::time::Duration;
use tracing::{info, warn};

use crate::error::{FactoryError, FactoryResult};
use crate::factory::Factory;
use crate::factory::gates::cost::CostGate;
use crate::factory::worker::produce_chapter;
use crate::model::{ChapterResult, ProjectStatus, RunSummary, Slot};

const PAUSE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Si true, un capítulo en revisión humana no corta el run.
    pub continue_on_review: bool,
}

/// `StartRun(projectID, chaptersToWrite) -> RunSummary`
pub async fn run_project(
    factory: &Factory,
    project_id: &str,
    chapters_to_write: i64,
    opts: RunOptions,
) -> FactoryResult<RunSummary> {
    factory.db.require_flag("writing").await?;

    let project = factory
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| FactoryError::ProjectNotFound(project_id.to_string()))?;

    let start_chapter = project.current_chapter + 1;
    if start_chapter > project.total_planned_chapters {
        return Err(FactoryError::AlreadyComplete(project_id.to_string()));
    }
    let end_chapter =
        (start_chapter + chapters_to_write - 1).min(project.total_planned_chapters);

    let session = factory
        .sessions
        .begin(project_id, start_chapter, end_chapter)
        .await?;

    info!(
        "🚀 Run start: {} chapters {}..{} (planned {})",
        project_id, start_chapter, end_chapter, project.total_planned_chapters
    );

    let result = run_loop(factory, project_id, start_chapter, end_chapter, opts, &session).await;

    // La sesión muere con el run, pase lo que pase.
    factory.sessions.end(project_id).await;
    result
}

async fn run_loop(
    factory: &Factory,
    project_id: &str,
    start_chapter: i64,
    end_chapter: i64,
    opts: RunOptions,
    session: &crate::factory::session::SessionHandle,
) -> FactoryResult<RunSummary> {
    let config = factory.config().await;
    let cost_gate = CostGate::new();

    let mut summary = RunSummary {
        project_id: project_id.to_string(),
        start_chapter,
        end_chapter,
        ..RunSummary::default()
    };

    'chapters: for chapter_number in start_chapter..=end_chapter {
        // Stop: observable en el borde de capítulo.
        if session.should_stop() {
            summary.stopped_reason = Some("stopped".to_string());
            break;
        }

        // Pause: espera cooperativa, respetando stop durante el poll.
        while session.is_paused() {
            if session.should_stop() {
                summary.stopped_reason = Some("stopped".to_string());
                break 'chapters;
            }
            tokio::time::sleep(PAUSE_POLL).await;
        }

        match produce_chapter(factory, &cost_gate, project_id, chapter_number, "run").await {
            Ok(outcome) => {
                session.record_result(outcome.result.clone()).await;
                let needs_review = outcome.needs_human_review;
                let success = outcome.result.success;
                summary.push(outcome.result);

                if needs_review && !opts.continue_on_review {
                    summary.stopped_reason = Some("human_review".to_string());
                    break;
                }
                // Un capítulo FAILED bloquea los siguientes: el orden N-1
                // antes que N es invariante, no preferencia.
                if !success && !needs_review {
                    summary.stopped_reason = Some("error".to_string());
                    break;
                }
            }
            Err(FactoryError::BudgetExhausted(reason)) => {
                warn!("💸 Run stopped by budget on chapter {chapter_number}: {reason}");
                summary.stopped_reason = Some("budget".to_string());
                // El project queda pausado; ningún capítulo se pierde.
                factory
                    .db
                    .set_project_status(project_id, ProjectStatus::Paused)
                    .await?;
                break;
            }
            Err(e) => {
                warn!("❌ Run aborted on chapter {chapter_number}: {e}");
                summary.push(ChapterResult {
                    chapter_number,
                    success: false,
                    needs_human_review: false,
                    qc_score: None,
                    rewrite_attempts: 0,
                    word_count: 0,
                    error: Some(e.to_string()),
                });
                summary.stopped_reason = Some("error".to_string());
                break;
            }
        }

        // Pacing entre capítulos (no después del último).
        if chapter_number < end_chapter {
            tokio::time::sleep(Duration::from_millis(config.min_inter_chapter_delay_ms)).await;
        }
    }

    summary.cost = cost_gate.snapshot(&factory.db, &config, project_id).await?;

    // Proyecto completo: estado terminal.
    if let Some(p) = factory.db.get_project(project_id).await? {
        if p.is_complete() && p.status == ProjectStatus::Active {
            factory
                .db
                .set_project_status(project_id, ProjectStatus::Completed)
                .await?;
        }
    }

    info!(
        "🏁 Run done: {} written={} failed={} review={} rewrites={} avg_qc={:.2} reason={:?}",
        project_id,
        summary.chapters_written,
        summary.chapters_failed,
        summary.chapters_needing_review,
        summary.total_rewrites,
        summary.avg_qc_score,
        summary.stopped_reason
    );
    Ok(summary)
}

// --- FLOTA ---

/// Reparte el batch diario de un project en los tres slots con minutos
/// aleatorios, sin mover items ya agendados.
pub async fn plan_daily_batches(factory: &Factory) -> FactoryResult<u32> {
    let config = factory.config().await;
    let now = crate::db::helpers::now_epoch();
    let day_start = config.local_day_start(now);

    let projects = factory
        .db
        .list_active_projects(config.max_active_projects as i64)
        .await?;

    let mut planned = 0u32;
    for project in projects {
        if project.is_complete() {
            continue;
        }
        let first = project.current_chapter + 1;
        let last = (project.current_chapter + config.chapters_per_project_per_day)
            .min(project.total_planned_chapters);

        for (i, chapter_number) in (first..=last).enumerate() {
            // Idempotente: un item ya agendado conserva su hora.
            if factory
                .db
                .get_write_item(&project.id, chapter_number)
                .await?
                .is_some()
            {
                continue;
            }

            let slot = Slot::ALL[i % Slot::ALL.len()];
            let offset_minutes = fastrand::i64(0..55);
            // day_start es la medianoche LOCAL en epoch UTC; la hora del slot
            // se suma directo.
            let scheduled_at =
                day_start + (slot.start_hour() as i64) * 3_600 + offset_minutes * 60;

            factory
                .db
                .enqueue_write(&project.id, chapter_number, scheduled_at, slot, 0)
                .await?;
            planned += 1;
        }
    }

    Ok(planned)
}

/// `TickScheduler()`: barre items obsoletos, planifica el día y despacha lo
/// que esté due hasta llenar el pool. Espera a que el batch despachado
/// termine (los claims ya garantizan exclusión entre ticks concurrentes).
pub async fn tick(factory: &Factory) -> FactoryResult<u32> {
    factory.db.require_flag("writing").await?;

    let config = factory.config().await;
    let now = crate::db::helpers::now_epoch();
    let day_start = config.local_day_start(now);

    let swept = factory.db.sweep_stale_write_items().await?;
    if swept > 0 {
        info!("🧹 Swept {swept} stale write items");
    }

    plan_daily_batches(factory).await?;

    let mut handles = Vec::new();
    let mut dispatched = 0u32;

    loop {
        // Pool global acotado: sin permiso no hay claim.
        let Ok(permit) = factory.fleet_pool.clone().try_acquire_owned() else {
            break;
        };

        let worker_tag = format!("w-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let item = factory
            .db
            .claim_write_item(
                &worker_tag,
                now,
                config.lease_secs,
                day_start,
                config.chapters_per_project_per_day,
            )
            .await?;

        let Some(item) = item else {
            drop(permit);
            break;
        };

        dispatched += 1;
        let factory = factory.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let cost_gate = CostGate::new();

            let outcome = produce_chapter(
                &factory,
                &cost_gate,
                &item.project_id,
                item.chapter_number,
                &worker_tag,
            )
            .await;

            let done = match outcome {
                Ok(outcome) => {
                    let ok = outcome.result.success;
                    factory
                        .db
                        .complete_write_item(
                            &item.project_id,
                            item.chapter_number,
                            ok,
                            outcome.result.error.as_deref(),
                        )
                        .await
                }
                Err(FactoryError::BudgetExhausted(reason)) => {
                    warn!(
                        "💸 Fleet: {} paused by budget on ch{}: {reason}",
                        item.project_id, item.chapter_number
                    );
                    let _ = factory
                        .db
                        .set_project_status(&item.project_id, ProjectStatus::Paused)
                        .await;
                    factory
                        .db
                        .release_write_item(&item.project_id, item.chapter_number, Some(&reason))
                        .await
                }
                Err(e) => {
                    warn!(
                        "❌ Fleet: ch{} of {} failed: {e}",
                        item.chapter_number, item.project_id
                    );
                    factory
                        .db
                        .complete_write_item(
                            &item.project_id,
                            item.chapter_number,
                            false,
                            Some(&e.to_string()),
                        )
                        .await
                }
            };

            if let Err(e) = done {
                warn!("⚠️ Fleet bookkeeping failed for {}: {e}", item.project_id);
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("⚠️ Fleet worker task panicked: {e}");
        }
    }

    Ok(dispatched)
}
