// ========================================
// rewriter.rs - Auto-Rewriter
// ========================================
// Reintenta un draft reprobado con un prompt de revisión dirigido: draft
// original + diagnósticos priorizados + directivas de continuidad. Corta en
// el primer intento aceptado (o con score >= target) y siempre pasa por el
// cost gate antes de gastar.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::error::WriterError;
use crate::factory::context::ContextBundle;
use crate::factory::gates::cost::CostGate;
use crate::factory::gates::{GateReport, evaluate_draft};
use crate::factory::writer::{Draft, WriteParams, write_chapter};
use crate::heuristics::CompiledLexicon;
use crate::llm::{Generator, estimate_tokens};
use crate::model::{CostRecord, Project, TaskKind};

#[derive(Debug)]
pub struct RewriteOutcome {
    pub draft: Draft,
    pub report: GateReport,
    /// Intentos de reescritura consumidos (0 = el draft original pasó).
    pub attempts: u32,
    pub success: bool,
    pub needs_human_review: bool,
    pub stop_reason: Option<String>,
    /// Costo real de cada intento; el worker los persiste junto al capítulo.
    pub costs: Vec<CostRecord>,
}

/// Directivas fijas de continuidad para cada revisión.
fn continuity_directives() -> Vec<String> {
    vec![
        "Giữ nguyên mạch truyện và các sự kiện chính của chương.".to_string(),
        "Không đổi tên nhân vật, không thêm nhân vật đã chết.".to_string(),
        "Sửa đúng các lỗi được liệt kê, không viết lại từ đầu.".to_string(),
    ]
}

fn revise_directives(previous: &Draft, report: &GateReport) -> Vec<String> {
    let mut directives = continuity_directives();

    directives.push("CÁC LỖI PHẢI SỬA (theo thứ tự ưu tiên):".to_string());
    for (i, diag) in report.prioritised_diagnostics().iter().take(8).enumerate() {
        directives.push(format!("{}. [{}] {}", i + 1, diag.code, diag.message));
    }

    // El draft anterior viaja como directiva final para que el modelo revise
    // en vez de re-imaginar.
    directives.push(format!(
        "BẢN NHÁP TRƯỚC (để chỉnh sửa):\n{}\n{}",
        previous.title, previous.body
    ));

    directives
}

/// `RewriteUntilPass(draft, gateResult, context, maxAttempts, targetScore)`.
#[allow(clippy::too_many_arguments)]
pub async fn rewrite_until_pass(
    db: &Database,
    generator: &Arc<dyn Generator>,
    config: &FactoryConfig,
    lexicon: &CompiledLexicon,
    cost_gate: &CostGate,
    project: &Project,
    bundle: &ContextBundle,
    params: &WriteParams,
    first_draft: Draft,
    first_report: GateReport,
) -> Result<RewriteOutcome, crate::error::FactoryError> {
    if first_report.accepted() {
        return Ok(RewriteOutcome {
            draft: first_draft,
            report: first_report,
            attempts: 0,
            success: true,
            needs_human_review: false,
            stop_reason: None,
            costs: Vec::new(),
        });
    }

    let mut best_draft = first_draft;
    let mut best_report = first_report;
    let mut attempts = 0u32;
    let mut costs: Vec<CostRecord> = Vec::new();

    while attempts < config.max_rewrite_attempts {
        // Presupuesto primero: sin fondos no hay intento.
        let est_input =
            estimate_tokens(best_draft.body.len()) + estimate_tokens(8_000);
        let est_output = (project.target_chapter_length as f64 * 1.5) as i64;
        let decision = cost_gate
            .can_proceed(db, config, &project.id, est_input, est_output, TaskKind::Rewrite)
            .await?;

        if !decision.allowed {
            warn!(
                "💸 Rewrite loop stopped by budget for chapter {} of {}: {:?}",
                best_draft.chapter_number, project.id, decision.reason
            );
            return Ok(RewriteOutcome {
                draft: best_draft,
                report: best_report,
                attempts,
                success: false,
                needs_human_review: true,
                stop_reason: Some("budget".to_string()),
                costs,
            });
        }

        attempts += 1;
        let directives = revise_directives(&best_draft, &best_report);

        let candidate = match write_chapter(
            generator,
            config,
            project,
            bundle,
            best_draft.chapter_number,
            params,
            &directives,
        )
        .await
        {
            Ok(draft) => draft,
            Err(e @ WriterError::Empty)
            | Err(e @ WriterError::Truncated(_))
            | Err(e @ WriterError::TitleUnparsable) => {
                // Contenido inválido en una revisión: se cuenta el intento y
                // se sigue con el mejor draft conocido.
                warn!("✏️ Rewrite attempt {attempts} produced invalid content: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let attempt_cost = config.estimate_cost(candidate.input_tokens, candidate.output_tokens);
        cost_gate.add_session_cost(attempt_cost).await;
        costs.push(CostRecord {
            project_id: project.id.clone(),
            at: 0,
            task: TaskKind::Rewrite,
            model: params.model.clone(),
            input_tokens: candidate.input_tokens,
            output_tokens: candidate.output_tokens,
            cost_usd: attempt_cost,
        });

        let report = evaluate_draft(db, config, lexicon, project, bundle, &candidate).await?;

        // Corte del loop: el INTENTO actual queda aceptado, o su compuesto
        // alcanza el target de reescritura.
        if report.accepted() || report.composite.unwrap_or(0.0) >= config.rewrite_target_score {
            info!(
                "✅ Rewrite accepted chapter {} of {} after {attempts} attempt(s)",
                candidate.chapter_number, project.id
            );
            return Ok(RewriteOutcome {
                draft: candidate,
                report,
                attempts,
                success: true,
                needs_human_review: false,
                stop_reason: None,
                costs,
            });
        }

        // Mejor intento conocido, para la revisión humana si todo falla.
        let better = match (report.composite, best_report.composite) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best_draft = candidate;
            best_report = report;
        }
    }

    // Se agotaron los intentos: el mejor draft queda para revisión humana.
    Ok(RewriteOutcome {
        draft: best_draft,
        report: best_report,
        attempts,
        success: false,
        needs_human_review: true,
        stop_reason: Some("max_attempts".to_string()),
        costs,
    })
}
