// ========================================
// gates/mod.rs - Evaluadores de calidad y canon
// ========================================
// Cada gate es una función de (draft, contexto, estado persistente) que
// devuelve GateResult. Corren en paralelo; la decisión global es la acción
// de MÁXIMA severidad y la unión de diagnósticos.

pub mod quality;
pub mod canon;
pub mod beats;
pub mod power;
pub mod consistency;
pub mod cost;

use serde::{Serialize, Deserialize};

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::factory::context::ContextBundle;
use crate::factory::writer::Draft;
use crate::heuristics::CompiledLexicon;
use crate::model::{BeatEntry, CanonFact, PowerEvent, Project};

/// Ordenado por severidad: accept < auto_rewrite < human_review < reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Accept,
    AutoRewrite,
    HumanReview,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Major,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateResult {
    pub gate: &'static str,
    pub passed: bool,
    /// Solo el quality gate produce score compuesto (0..10).
    pub score: Option<f64>,
    pub action: GateAction,
    pub diagnostics: Vec<Diagnostic>,
}

impl GateResult {
    pub fn accept(gate: &'static str) -> Self {
        Self {
            gate,
            passed: true,
            score: None,
            action: GateAction::Accept,
            diagnostics: Vec::new(),
        }
    }
}

/// Salida agregada de la evaluación completa de un draft.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub action: GateAction,
    /// Score compuesto del quality gate, si corrió.
    pub composite: Option<f64>,
    pub results: Vec<GateResult>,
    /// Hechos nuevos compatibles, a commitear si el draft se acepta.
    pub pending_facts: Vec<CanonFact>,
    /// Beats detectados, a registrar en el ledger.
    pub beats: Vec<BeatEntry>,
    /// Eventos de progresión detectados.
    pub power_events: Vec<PowerEvent>,
}

impl GateReport {
    /// Diagnósticos de todos los gates, ordenados de más a menos severo.
    pub fn prioritised_diagnostics(&self) -> Vec<&Diagnostic> {
        let mut all: Vec<&Diagnostic> = self
            .results
            .iter()
            .flat_map(|r| r.diagnostics.iter())
            .collect();
        all.sort_by(|a, b| b.severity.cmp(&a.severity));
        all
    }

    pub fn accepted(&self) -> bool {
        self.action == GateAction::Accept
    }
}

/// Acción global = máximo de severidad entre los gates.
pub fn aggregate_action(results: &[GateResult]) -> GateAction {
    results
        .iter()
        .map(|r| r.action)
        .max()
        .unwrap_or(GateAction::Accept)
}

/// Corre los cinco evaluadores de contenido en paralelo y agrega.
/// (El cost gate no está acá: es un pre-check ANTES de cada llamada al LLM.)
pub async fn evaluate_draft(
    db: &Database,
    config: &FactoryConfig,
    lexicon: &CompiledLexicon,
    project: &Project,
    bundle: &ContextBundle,
    draft: &Draft,
) -> Result<GateReport, sqlx::Error> {
    let (quality_res, canon_res, beats_res, power_res, consistency_res) = tokio::join!(
        quality::evaluate(config, lexicon, project, bundle, draft),
        canon::evaluate(db, lexicon, project, bundle, draft),
        beats::evaluate(db, config, lexicon, project, draft),
        power::evaluate(db, config, lexicon, project, bundle, draft),
        consistency::evaluate(db, lexicon, project, draft),
    );

    let quality = quality_res;
    let (canon_gate, pending_facts) = canon_res?;
    let (beats_gate, beat_entries) = beats_res?;
    let (power_gate, power_events) = power_res?;
    // El consistency checker es best-effort: un error de store se degrada a
    // un gate vacío en vez de tumbar el capítulo.
    let consistency_gate = consistency_res.unwrap_or_else(|e| {
        tracing::warn!("⚠️ Consistency checker unavailable: {e}");
        GateResult::accept("consistency")
    });

    let composite = quality.score;
    let results = vec![quality, canon_gate, beats_gate, power_gate, consistency_gate];
    let action = aggregate_action(&results);

    Ok(GateReport {
        action,
        composite,
        results,
        pending_facts,
        beats: beat_entries,
        power_events,
    })
}
