// ========================================
// chapters.rs - Capítulos, resúmenes y el commit transaccional
// ========================================
// Aquí vive el núcleo de corrección del pipeline: persist_chapter_commit
// escribe capítulo + resumen + deltas de canon + beats + power + costo y
// avanza current_chapter con CAS, TODO dentro de UNA transacción.

use tracing::info;

use crate::db::Database;
use crate::model::{
    BeatEntry, CanonFact, Chapter, ChapterStatus, ChapterSummary, CostRecord, FactStatus,
    PowerEvent,
};

/// Todo lo que un capítulo aceptado deposita en el store.
#[derive(Debug, Clone)]
pub struct ChapterCommit {
    pub project_id: String,
    pub chapter: Chapter,
    pub summary: ChapterSummary,
    pub canon_deltas: Vec<CanonFact>,
    pub beats: Vec<BeatEntry>,
    pub power_events: Vec<PowerEvent>,
    pub costs: Vec<CostRecord>,
    /// Some(n): CAS current_chapter n-1 -> n. None: borrador para revisión
    /// humana, se guarda el capítulo y el costo pero el proyecto NO avanza.
    pub advance_to: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Committed,
    /// Otro worker ya avanzó este número de capítulo. Nada fue escrito.
    AdvanceRaced,
}

impl Database {
    // --- CHAPTER ROWS ---

    pub async fn get_chapter(
        &self,
        novel_id: &str,
        chapter_number: i64,
    ) -> Result<Option<Chapter>, sqlx::Error> {
        sqlx::query_as::<_, Chapter>(
            "SELECT id, novel_id, chapter_number, title, content, word_count,
                    status, created_at, published_at
             FROM chapters WHERE novel_id = ? AND chapter_number = ?",
        )
            .bind(novel_id)
            .bind(chapter_number)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_chapter_by_id(&self, chapter_id: &str) -> Result<Option<Chapter>, sqlx::Error> {
        sqlx::query_as::<_, Chapter>(
            "SELECT id, novel_id, chapter_number, title, content, word_count,
                    status, created_at, published_at
             FROM chapters WHERE id = ?",
        )
            .bind(chapter_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn chapter_exists(
        &self,
        novel_id: &str,
        chapter_number: i64,
    ) -> Result<bool, sqlx::Error> {
        let hit: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM chapters WHERE novel_id = ? AND chapter_number = ? LIMIT 1",
        )
            .bind(novel_id)
            .bind(chapter_number)
            .fetch_optional(&self.pool)
            .await?;

        Ok(hit.is_some())
    }

    pub async fn count_chapters(&self, novel_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM chapters WHERE novel_id = ?")
            .bind(novel_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Números de capítulo persistidos, en orden. Para checks de integridad.
    pub async fn chapter_numbers(&self, novel_id: &str) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT chapter_number FROM chapters WHERE novel_id = ? ORDER BY chapter_number ASC",
        )
            .bind(novel_id)
            .fetch_all(&self.pool)
            .await
    }

    // --- SUMMARIES ---

    pub async fn get_recent_chapter_summaries(
        &self,
        project_id: &str,
        k: i64,
    ) -> Result<Vec<ChapterSummary>, sqlx::Error> {
        // Últimos k, devueltos en orden de lectura (ascendente).
        let mut rows = sqlx::query_as::<_, ChapterSummary>(
            "SELECT project_id, chapter_number, title, summary
             FROM chapter_summaries
             WHERE project_id = ?
             ORDER BY chapter_number DESC
             LIMIT ?",
        )
            .bind(project_id)
            .bind(k)
            .fetch_all(&self.pool)
            .await?;

        rows.reverse();
        Ok(rows)
    }

    // --- EL COMMIT ---

    /// Commit parcial está prohibido: o entra todo, o no entra nada.
    pub async fn persist_chapter_commit(
        &self,
        commit: &ChapterCommit,
    ) -> Result<PersistOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // 1) CAS-advance primero: si otro worker ganó la carrera no tocamos
        //    nada más.
        if let Some(to_chapter) = commit.advance_to {
            let res = sqlx::query(
                "UPDATE projects
                 SET current_chapter = ?, updated_at = unixepoch()
                 WHERE id = ? AND current_chapter = ?",
            )
                .bind(to_chapter)
                .bind(&commit.project_id)
                .bind(to_chapter - 1)
                .execute(&mut *tx)
                .await?;

            if res.rows_affected() != 1 {
                tx.rollback().await?;
                info!(
                    "↩️ Chapter {} of {} already advanced elsewhere (benign duplicate)",
                    to_chapter, commit.project_id
                );
                return Ok(PersistOutcome::AdvanceRaced);
            }
        }

        // 2) Fila de capítulo, idempotente por (novel_id, chapter_number).
        let ch = &commit.chapter;
        sqlx::query(
            "INSERT INTO chapters (id, novel_id, chapter_number, title, content,
                                   word_count, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, unixepoch())
             ON CONFLICT(novel_id, chapter_number) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                word_count = excluded.word_count,
                status = excluded.status",
        )
            .bind(&ch.id)
            .bind(&ch.novel_id)
            .bind(ch.chapter_number)
            .bind(&ch.title)
            .bind(&ch.content)
            .bind(ch.word_count)
            .bind(ch.status)
            .execute(&mut *tx)
            .await?;

        // 3) Resumen del capítulo (story graph node).
        let s = &commit.summary;
        sqlx::query(
            "INSERT INTO chapter_summaries (project_id, chapter_number, title, summary)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(project_id, chapter_number) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary",
        )
            .bind(&s.project_id)
            .bind(s.chapter_number)
            .bind(&s.title)
            .bind(&s.summary)
            .execute(&mut *tx)
            .await?;

        // 4) Deltas de canon. Retracciones llegan como status=retracted.
        for fact in &commit.canon_deltas {
            sqlx::query(
                "INSERT INTO canon_facts (project_id, subject, predicate, object,
                                          first_chapter, last_confirmed_chapter, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(project_id, subject, predicate, object) DO UPDATE SET
                    last_confirmed_chapter = excluded.last_confirmed_chapter,
                    status = excluded.status",
            )
                .bind(&fact.project_id)
                .bind(&fact.subject)
                .bind(&fact.predicate)
                .bind(&fact.object)
                .bind(fact.first_chapter)
                .bind(fact.last_confirmed_chapter)
                .bind(fact.status)
                .execute(&mut *tx)
                .await?;

            // Una progresión retira los objetos anteriores del mismo
            // (subject, predicate). Ej: realm nuevo retira el realm viejo.
            if fact.status == FactStatus::Active {
                sqlx::query(
                    "UPDATE canon_facts SET status = 'retracted'
                     WHERE project_id = ? AND subject = ? AND predicate = ?
                       AND object != ? AND status = 'active'
                       AND predicate IN ('realm', 'level', 'alive')",
                )
                    .bind(&fact.project_id)
                    .bind(&fact.subject)
                    .bind(&fact.predicate)
                    .bind(&fact.object)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        // 5) Beats: delete+insert para que un re-commit no duplique filas.
        sqlx::query("DELETE FROM beat_ledger WHERE project_id = ? AND chapter_number = ?")
            .bind(&commit.project_id)
            .bind(ch.chapter_number)
            .execute(&mut *tx)
            .await?;
        for beat in &commit.beats {
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
                .execute(&mut *tx)
                .await?;
        }

        // 6) Power events, mismo criterio de idempotencia.
        sqlx::query("DELETE FROM power_events WHERE project_id = ? AND chapter_number = ?")
            .bind(&commit.project_id)
            .bind(ch.chapter_number)
            .execute(&mut *tx)
            .await?;
        for ev in &commit.power_events {
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
                .execute(&mut *tx)
                .await?;
        }

        // 7) Costos: append puro. El gate de presupuesto lee estos agregados
        //    en la MISMA conexión, así que no hay ventana de sobre-gasto.
        for cost in &commit.costs {
            sqlx::query(
                "INSERT INTO cost_records (project_id, at, task, model,
                                           input_tokens, output_tokens, cost_usd)
                 VALUES (?, unixepoch(), ?, ?, ?, ?, ?)",
            )
                .bind(&cost.project_id)
                .bind(cost.task)
                .bind(&cost.model)
                .bind(cost.input_tokens)
                .bind(cost.output_tokens)
                .bind(cost.cost_usd)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(
            "💾 Persisted chapter {} of {} ({} words, advance={})",
            ch.chapter_number,
            commit.project_id,
            ch.word_count,
            commit.advance_to.is_some()
        );
        Ok(PersistOutcome::Committed)
    }
}

/// Builder del capítulo para el worker (id nuevo, status draft).
pub fn draft_chapter(novel_id: &str, number: i64, title: &str, content: &str, words: i64) -> Chapter {
    Chapter {
        id: format!("ch-{}", uuid::Uuid::new_v4()),
        novel_id: novel_id.to_string(),
        chapter_number: number,
        title: title.to_string(),
        content: content.to_string(),
        word_count: words,
        status: ChapterStatus::Draft,
        created_at: crate::db::helpers::now_epoch(),
        published_at: None,
    }
}
