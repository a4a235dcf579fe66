// ========================================
// power.rs - Power Tracker
// ========================================
// Detecta breakthroughs y adquisición de kỹ năng; valida contra la escalera
// de realms del género: el realm nuevo debe ser el actual o exactamente un
// paso arriba, y el personaje debe existir en el canon.

use regex::Regex;
use std::sync::OnceLock;

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::factory::context::ContextBundle;
use crate::factory::gates::{Diagnostic, GateAction, GateResult, Severity};
use crate::factory::writer::Draft;
use crate::heuristics::CompiledLexicon;
use crate::model::{PowerEvent, Project, predicates};

fn sentences(body: &str) -> Vec<&str> {
    body.split(|c| matches!(c, '.' | '!' | '?' | '…' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn quoted_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Nombres de kỹ năng vienen citados: “Vạn Kiếm Quyết”
    RE.get_or_init(|| Regex::new("[“\"]([^”\"]{2,40})[”\"]").expect("quoted regex"))
}

pub async fn evaluate(
    db: &Database,
    config: &FactoryConfig,
    lexicon: &CompiledLexicon,
    project: &Project,
    bundle: &ContextBundle,
    draft: &Draft,
) -> Result<(GateResult, Vec<PowerEvent>), sqlx::Error> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut events: Vec<PowerEvent> = Vec::new();
    let mut action = GateAction::Accept;

    let Some(ladder) = config.realm_ladder(project.genre) else {
        // Género sin escalera: no hay nada que validar.
        return Ok((GateResult::accept("power"), events));
    };

    let facts = db.get_active_facts(&project.id).await?;
    let known_characters: Vec<&str> = facts
        .iter()
        .filter(|f| f.predicate != predicates::IS_LOCATION)
        .map(|f| f.subject.as_str())
        .collect();

    let mc = if project.main_character.is_empty() {
        bundle
            .world
            .as_ref()
            .map(|w| w.main_character_name.clone())
            .unwrap_or_default()
    } else {
        project.main_character.clone()
    };

    let realm_index = |name: &str| ladder.iter().position(|r| r == name);
    let current_realm_of = |character: &str| -> Option<usize> {
        facts
            .iter()
            .find(|f| f.subject == character && f.predicate == predicates::REALM)
            .and_then(|f| realm_index(&f.object))
    };

    for sent in sentences(&draft.body) {
        let is_breakthrough = lexicon.hits(&lexicon.breakthrough, sent);
        let is_skill = lexicon.hits(&lexicon.skill_gain, sent);
        if !is_breakthrough && !is_skill {
            continue;
        }

        // Personaje del evento: primero un personaje conocido nombrado en la
        // oración; si no hay, el protagonista.
        let character = known_characters
            .iter()
            .find(|c| sent.contains(**c))
            .map(|c| c.to_string())
            .or_else(|| {
                if mc.is_empty() {
                    None
                } else {
                    Some(mc.clone())
                }
            });

        let Some(character) = character else { continue };

        if is_breakthrough {
            // Realm de destino: el nombre de la escalera presente en la
            // oración. Marcadores sin realm identificable no generan evento.
            let Some(target) = ladder.iter().find(|r| sent.contains(r.as_str())) else {
                continue;
            };
            let target_idx = realm_index(target).unwrap_or(0);

            // Existencia en canon: también el protagonista debe estar
            // sembrado antes de poder progresar.
            if !known_characters.iter().any(|c| *c == character) {
                diagnostics.push(Diagnostic::new(
                    "unknown_character",
                    Severity::Major,
                    format!("breakthrough for '{character}' who is not in canon"),
                ));
                action = action.max(GateAction::AutoRewrite);
                continue;
            }

            match current_realm_of(&character) {
                Some(current_idx) if target_idx < current_idx => {
                    diagnostics.push(Diagnostic::new(
                        "realm_regression",
                        Severity::Hard,
                        format!(
                            "'{character}' regresses from {} to {target}",
                            ladder[current_idx]
                        ),
                    ));
                    action = action.max(GateAction::AutoRewrite);
                }
                Some(current_idx) if target_idx > current_idx + 1 => {
                    diagnostics.push(Diagnostic::new(
                        "realm_skip",
                        Severity::Hard,
                        format!(
                            "'{character}' jumps from {} to {target} (more than one step)",
                            ladder[current_idx]
                        ),
                    ));
                    action = action.max(GateAction::AutoRewrite);
                }
                Some(current_idx) if target_idx == current_idx => {
                    // Mismo realm re-afirmado: no es un evento.
                }
                _ => {
                    // Un paso arriba, o personaje sin historial de realm.
                    let already = events.iter().any(|e| {
                        e.character == character && e.kind == "breakthrough"
                    });
                    if !already {
                        events.push(PowerEvent {
                            project_id: project.id.clone(),
                            character: character.clone(),
                            chapter_number: draft.chapter_number,
                            kind: "breakthrough".to_string(),
                            realm: Some(target.clone()),
                            level: Some(1),
                            skill: None,
                            item: None,
                        });
                    }
                }
            }
        }

        if is_skill {
            if let Some(caps) = quoted_regex().captures(sent) {
                let skill = caps[1].trim().to_string();
                let already = events
                    .iter()
                    .any(|e| e.kind == "skill" && e.skill.as_deref() == Some(skill.as_str()));
                if !already {
                    events.push(PowerEvent {
                        project_id: project.id.clone(),
                        character: character.clone(),
                        chapter_number: draft.chapter_number,
                        kind: "skill".to_string(),
                        realm: None,
                        level: None,
                        skill: Some(skill),
                        item: None,
                    });
                }
            }
        }
    }

    let passed = action == GateAction::Accept;
    Ok((
        GateResult {
            gate: "power",
            passed,
            score: None,
            action,
            diagnostics,
        },
        events,
    ))
}
