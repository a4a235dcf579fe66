// ========================================
// beats.rs - Beat Ledger Gate
// ========================================
// Detecta los beats del draft con la tabla de patrones y mide diversidad
// contra la ventana deslizante del ledger. Sobreuso del beat primario:
// soft diagnostic al llegar a K, auto_rewrite al llegar a K+2.

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::factory::gates::{Diagnostic, GateAction, GateResult, Severity};
use crate::factory::writer::Draft;
use crate::heuristics::CompiledLexicon;
use crate::model::{BeatEntry, BeatType, Project};

/// Categoría gruesa del beat, para la columna `category` del ledger.
fn category_of(beat: BeatType) -> &'static str {
    match beat {
        BeatType::Breakthrough | BeatType::Training | BeatType::Recovery => "power",
        BeatType::Confrontation | BeatType::Rescue | BeatType::FaceSlap => "conflict",
        BeatType::Reveal | BeatType::Twist | BeatType::Cliffhanger => "tension",
        BeatType::Betrayal | BeatType::Romance => "relationship",
        BeatType::WorldExpansion => "world",
    }
}

pub async fn evaluate(
    db: &Database,
    config: &FactoryConfig,
    lexicon: &CompiledLexicon,
    project: &Project,
    draft: &Draft,
) -> Result<(GateResult, Vec<BeatEntry>), sqlx::Error> {
    let counts = lexicon.beat_counts(&draft.body);

    let entries: Vec<BeatEntry> = counts
        .iter()
        .map(|(beat, hits)| BeatEntry {
            project_id: project.id.clone(),
            chapter_number: draft.chapter_number,
            beat_type: *beat,
            category: category_of(*beat).to_string(),
            intensity: (*hits as i64 * 2).clamp(1, 10),
            at: 0,
        })
        .collect();

    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut action = GateAction::Accept;

    if entries.is_empty() {
        diagnostics.push(Diagnostic::new(
            "no_beats_detected",
            Severity::Info,
            "no narrative beats detected in the draft",
        ));
    }

    // Diversidad: solo el beat PRIMARIO (más señales) cuenta contra la
    // ventana.
    if let Some((primary, _)) = counts.first() {
        let window = db
            .beat_counts_in_window(&project.id, draft.chapter_number - 1, config.beat_window)
            .await?;
        let used = window.get(primary).copied().unwrap_or(0);

        let soft = config.beat_overuse_soft;
        if used >= soft + 2 {
            diagnostics.push(Diagnostic::new(
                "beat_overuse",
                Severity::Major,
                format!(
                    "primary beat '{primary}' already used {used} times in the last {} chapters",
                    config.beat_window
                ),
            ));
            action = GateAction::AutoRewrite;
        } else if used >= soft {
            diagnostics.push(Diagnostic::new(
                "beat_repetition",
                Severity::Warn,
                format!(
                    "primary beat '{primary}' used {used} times in the last {} chapters; \
                     consider a different beat",
                    config.beat_window
                ),
            ));
        }
    }

    let passed = action == GateAction::Accept;
    Ok((
        GateResult {
            gate: "beats",
            passed,
            score: None,
            action,
            diagnostics,
        },
        entries,
    ))
}
