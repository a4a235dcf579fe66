// ========================================
// ledger.rs - Beat ledger, power events y cost records
// ========================================
// Los tres historiales append-only que alimentan a los gates. Las escrituras
// de producción entran por persist_chapter_commit; aquí están las consultas
// agregadas y los appends sueltos para seeds/admin.

use std::collections::HashMap;

use crate::db::Database;
use crate::model::{BeatEntry, BeatType, CostRecord, PowerEvent, PowerState};

impl Database {
    // --- BEATS ---

    pub async fn record_beat(&self, beat: &BeatEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO beat_ledger (project_id, chapter_number, beat_type,
                                      category, intensity, at)
             VALUES (?, ?, ?, ?, ?, unixepoch())",
        )
            .bind(&beat.project_id)
            .bind(beat.chapter_number)
            .bind(beat.beat_type)
            .bind(&beat.category)
            .bind(beat.intensity)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Conteo por tipo de beat en la ventana (before_chapter - window,
    /// before_chapter]. El gate de diversidad trabaja sobre esto.
    pub async fn beat_counts_in_window(
        &self,
        project_id: &str,
        before_chapter: i64,
        window: i64,
    ) -> Result<HashMap<BeatType, i64>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (BeatType, i64)>(
            "SELECT beat_type, COUNT(*) FROM beat_ledger
             WHERE project_id = ? AND chapter_number > ? AND chapter_number <= ?
             GROUP BY beat_type",
        )
            .bind(project_id)
            .bind(before_chapter - window)
            .bind(before_chapter)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().collect())
    }

    // --- POWER ---

    pub async fn record_power_event(&self, ev: &PowerEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO power_events (project_id, character, chapter_number,
                                       kind, realm, level, skill, item)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
            .bind(&ev.project_id)
            .bind(&ev.character)
            .bind(ev.chapter_number)
            .bind(&ev.kind)
            .bind(&ev.realm)
            .bind(ev.level)
            .bind(&ev.skill)
            .bind(&ev.item)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Estado de progresión plegado desde el historial, en orden de capítulo.
    pub async fn power_state(
        &self,
        project_id: &str,
        character: &str,
    ) -> Result<PowerState, sqlx::Error> {
        let events = sqlx::query_as::<_, PowerEvent>(
            "SELECT project_id, character, chapter_number, kind, realm, level, skill, item
             FROM power_events
             WHERE project_id = ? AND character = ?
             ORDER BY chapter_number ASC, rowid ASC",
        )
            .bind(project_id)
            .bind(character)
            .fetch_all(&self.pool)
            .await?;

        let mut state = PowerState {
            character: character.to_string(),
            level: 1,
            ..PowerState::default()
        };

        for ev in events {
            match ev.kind.as_str() {
                "breakthrough" => {
                    if let Some(realm) = ev.realm {
                        state.realm = realm;
                        // El nivel resetea a 1 al avanzar de realm.
                        state.level = ev.level.unwrap_or(1);
                        state.total_breakthroughs += 1;
                    }
                }
                "level-up" => {
                    if let Some(level) = ev.level {
                        state.level = level;
                    }
                }
                "skill" => {
                    if let Some(skill) = ev.skill {
                        if !state.abilities.contains(&skill) {
                            state.abilities.push(skill);
                        }
                    }
                }
                "item" => {
                    if let Some(item) = ev.item {
                        if !state.items.contains(&item) {
                            state.items.push(item);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(state)
    }

    // --- COSTS ---

    pub async fn record_cost(&self, c: &CostRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO cost_records (project_id, at, task, model,
                                       input_tokens, output_tokens, cost_usd)
             VALUES (?, unixepoch(), ?, ?, ?, ?, ?)",
        )
            .bind(&c.project_id)
            .bind(c.task)
            .bind(&c.model)
            .bind(c.input_tokens)
            .bind(c.output_tokens)
            .bind(c.cost_usd)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Gasto acumulado desde `since` (unixepoch). Con since = inicio del día
    /// local, es el total diario que blinda el presupuesto tras un restart.
    pub async fn total_cost_since(&self, project_id: &str, since: i64) -> Result<f64, sqlx::Error> {
        let total: Option<f64> = sqlx::query_scalar(
            "SELECT SUM(cost_usd) FROM cost_records WHERE project_id = ? AND at >= ?",
        )
            .bind(project_id)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        Ok(total.unwrap_or(0.0))
    }
}
