// ========================================
// quality.rs - Quality Gate
// ========================================
// Métricas sobre el cuerpo del draft: banda de palabras, ratios de diálogo /
// acción / pensamiento, varianza de oraciones, repetición, hook, cliffhanger
// y señales de dopamina. Compuesto:
//   0.25·writing + 0.15·(plot + character + pacing + engagement + dopamine)

use crate::config::FactoryConfig;
use crate::factory::context::ContextBundle;
use crate::factory::gates::{Diagnostic, GateAction, GateResult, Severity};
use crate::factory::writer::Draft;
use crate::heuristics::{CompiledLexicon, leading_words, trailing_words};
use crate::model::Project;

const HOOK_WINDOW_WORDS: usize = 100;

fn clamp10(x: f64) -> f64 {
    x.clamp(0.0, 10.0)
}

fn sentences(body: &str) -> Vec<&str> {
    body.split(|c| matches!(c, '.' | '!' | '?' | '…'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Desviación estándar de longitudes de oración (en palabras).
fn sentence_length_stddev(sents: &[&str]) -> f64 {
    if sents.len() < 2 {
        return 0.0;
    }
    let lens: Vec<f64> = sents
        .iter()
        .map(|s| s.split_whitespace().count() as f64)
        .collect();
    let mean = lens.iter().sum::<f64>() / lens.len() as f64;
    let var = lens.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lens.len() as f64;
    var.sqrt()
}

/// Fracción de 4-gramas repetidos. Prosa sana queda bien por debajo de 0.2.
fn repetition_ratio(body: &str) -> f64 {
    let words: Vec<&str> = body.split_whitespace().collect();
    if words.len() < 8 {
        return 0.0;
    }
    let mut seen = std::collections::HashSet::new();
    let mut repeats = 0usize;
    let total = words.len() - 3;
    for w in words.windows(4) {
        let key = w.join(" ").to_lowercase();
        if !seen.insert(key) {
            repeats += 1;
        }
    }
    repeats as f64 / total as f64
}

pub async fn evaluate(
    config: &FactoryConfig,
    lexicon: &CompiledLexicon,
    project: &Project,
    bundle: &ContextBundle,
    draft: &Draft,
) -> GateResult {
    let body = &draft.body;
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    let sents = sentences(body);
    let sent_count = sents.len().max(1) as f64;

    // --- writing: banda de palabras + varianza + repetición ---
    let min_wc = config.min_word_count(project.target_chapter_length);
    let max_wc = config.max_word_count(project.target_chapter_length);
    let in_band = draft.word_count >= min_wc && draft.word_count <= max_wc;

    let stddev = sentence_length_stddev(&sents);
    // Varianza sana: entre ~4 y ~18 palabras de desviación.
    let var_score = if stddev < 1.0 {
        2.0
    } else if stddev < 4.0 {
        5.0 + (stddev - 1.0)
    } else if stddev <= 18.0 {
        10.0
    } else {
        (10.0 - (stddev - 18.0) * 0.5).max(4.0)
    };

    let rep = repetition_ratio(body);
    let rep_score = clamp10(10.0 - rep * 40.0);
    if rep > 0.15 {
        diagnostics.push(Diagnostic::new(
            "high_repetition",
            Severity::Major,
            format!("repeated 4-gram ratio {:.2}", rep),
        ));
    }

    let mut writing = clamp10(0.5 * var_score + 0.5 * rep_score);
    if !in_band {
        diagnostics.push(Diagnostic::new(
            "word_count_out_of_band",
            Severity::Major,
            format!(
                "word count {} outside [{}, {}]",
                draft.word_count, min_wc, max_wc
            ),
        ));
        writing = clamp10(writing - 3.0);
    }
    // Cada diagnóstico mayor adicional resta del sub-score de escritura.
    let majors = diagnostics
        .iter()
        .filter(|d| d.severity >= Severity::Major)
        .count() as f64;
    writing = clamp10(writing - (majors - if in_band { 0.0 } else { 1.0 }).max(0.0));

    // --- plot: cobertura de key points del dàn ý ---
    let plot = match bundle.chapter_outline.as_ref().filter(|c| !c.key_points.is_empty()) {
        Some(co) => {
            let body_lower = body.to_lowercase();
            let covered = co
                .key_points
                .iter()
                .filter(|kp| {
                    let significant: Vec<&str> = kp
                        .split_whitespace()
                        .filter(|w| w.chars().count() > 2)
                        .collect();
                    !significant.is_empty()
                        && significant
                            .iter()
                            .filter(|w| body_lower.contains(&w.to_lowercase()))
                            .count()
                            * 2
                            >= significant.len()
                })
                .count();
            clamp10(10.0 * covered as f64 / co.key_points.len() as f64)
        }
        None => 7.0,
    };
    if plot < 5.0 {
        diagnostics.push(Diagnostic::new(
            "key_points_missing",
            Severity::Warn,
            "draft covers under half of the outline key points",
        ));
    }

    // --- character: protagonista y elenco del capítulo presentes ---
    let focus = bundle.focus_characters();
    let character = if focus.is_empty() {
        6.0
    } else {
        let mentioned = focus.iter().filter(|c| body.contains(c.as_str())).count();
        let base = 10.0 * mentioned as f64 / focus.len() as f64;
        if mentioned == 0 {
            diagnostics.push(Diagnostic::new(
                "cast_absent",
                Severity::Major,
                "none of the outlined characters appear in the draft",
            ));
        }
        clamp10(base)
    };

    // --- pacing: mezcla de diálogo / acción / pensamiento ---
    let dialogue_ratio = lexicon.count(&lexicon.dialogue, body) as f64 / sent_count;
    let action_ratio = lexicon.count(&lexicon.action, body) as f64 / sent_count;
    let inner_ratio = lexicon.count(&lexicon.inner_thought, body) as f64 / sent_count;

    let mut pacing = 10.0;
    if dialogue_ratio < 0.05 {
        pacing -= 2.5;
        diagnostics.push(Diagnostic::new(
            "no_dialogue",
            Severity::Warn,
            "almost no dialogue in the chapter",
        ));
    }
    if action_ratio < 0.03 && inner_ratio < 0.03 {
        pacing -= 2.0;
    }
    if dialogue_ratio > 1.5 {
        pacing -= 2.0; // muro de diálogo
    }
    let pacing = clamp10(pacing);

    // --- engagement: hook de apertura + cliffhanger de cierre ---
    let opening = leading_words(body, HOOK_WINDOW_WORDS);
    let closing = trailing_words(body, HOOK_WINDOW_WORDS);
    let hook_hits = lexicon.count(&lexicon.hook, &opening);
    let cliff_hits = lexicon.count(&lexicon.cliffhanger, &closing);

    let hook_score = (hook_hits as f64 * 2.5).min(5.0);
    let cliff_score = (cliff_hits as f64 * 2.5).min(5.0);
    if hook_hits == 0 {
        diagnostics.push(Diagnostic::new(
            "weak_opening_hook",
            Severity::Warn,
            "no hook signal in the first 100 words",
        ));
    }
    if cliff_hits == 0 {
        diagnostics.push(Diagnostic::new(
            "no_cliffhanger",
            Severity::Major,
            "no cliffhanger signal in the last 100 words",
        ));
    }
    let engagement = clamp10(hook_score + cliff_score);

    // --- dopamine ---
    let dopamine_hits = lexicon.count(&lexicon.dopamine, body);
    let dopamine = clamp10(dopamine_hits as f64 * 2.0);
    if dopamine_hits == 0 {
        diagnostics.push(Diagnostic::new(
            "no_dopamine_signals",
            Severity::Info,
            "no reader-reward signals detected",
        ));
    }

    let composite = 0.25 * writing
        + 0.15 * (plot + character + pacing + engagement + dopamine);

    let action = if composite >= config.qc_threshold {
        GateAction::Accept
    } else if composite >= config.auto_rewrite_threshold {
        GateAction::AutoRewrite
    } else {
        GateAction::HumanReview
    };

    GateResult {
        gate: "quality",
        passed: action == GateAction::Accept,
        score: Some(composite),
        action,
        diagnostics,
    }
}
