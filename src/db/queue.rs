// ========================================
// queue.rs - write_queue y publish_queue
// ========================================
// El claim es el único punto de coordinación entre schedulers concurrentes:
// select + update dentro de una transacción, con lease y tope diario.

use tracing::{info, warn};

use crate::db::Database;
use crate::model::{PublishItem, Slot, WorkItem, WorkStatus};

const WORK_ITEM_COLUMNS: &str =
    "project_id, chapter_number, status, scheduled_at, slot, priority, attempts,
     lease_expires_at, claimed_by, completed_at, last_error";

impl Database {
    // --- WRITE QUEUE ---

    /// Idempotente por (project_id, chapter_number): re-agendar mueve la hora
    /// y el slot, nunca duplica el item.
    pub async fn enqueue_write(
        &self,
        project_id: &str,
        chapter_number: i64,
        scheduled_at: i64,
        slot: Slot,
        priority: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO write_queue (project_id, chapter_number, status, scheduled_at,
                                      slot, priority)
             VALUES (?, ?, 'pending', ?, ?, ?)
             ON CONFLICT(project_id, chapter_number) DO UPDATE SET
                scheduled_at = excluded.scheduled_at,
                slot = excluded.slot,
                priority = excluded.priority
             WHERE write_queue.status != 'succeeded'",
        )
            .bind(project_id)
            .bind(chapter_number)
            .bind(scheduled_at)
            .bind(slot)
            .bind(priority)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Claim atómico: toma el item elegible de mayor prioridad / menor
    /// scheduled_at, lo marca writing y estampa el lease. Devuelve None si
    /// no hay nada elegible (incluye: otro worker ya tiene el lease, el
    /// proyecto llegó a su tope diario, o el capítulo no es el siguiente).
    pub async fn claim_write_item(
        &self,
        worker_id: &str,
        now: i64,
        lease_secs: i64,
        day_start: i64,
        daily_cap: i64,
    ) -> Result<Option<WorkItem>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, WorkItem>(
            "SELECT q.project_id, q.chapter_number, q.status, q.scheduled_at, q.slot,
                    q.priority, q.attempts, q.lease_expires_at, q.claimed_by,
                    q.completed_at, q.last_error
             FROM write_queue q
             JOIN projects p ON p.id = q.project_id
             WHERE q.scheduled_at <= ?1
               AND p.status = 'active'
               AND q.chapter_number = p.current_chapter + 1
               AND (q.status = 'pending'
                    OR (q.status = 'writing' AND q.lease_expires_at IS NOT NULL
                        AND q.lease_expires_at <= ?1))
               AND (SELECT COUNT(*) FROM write_queue d
                    WHERE d.project_id = q.project_id
                      AND d.status = 'succeeded'
                      AND d.completed_at IS NOT NULL
                      AND d.completed_at >= ?2) < ?3
             ORDER BY q.priority DESC, q.scheduled_at ASC
             LIMIT 1",
        )
            .bind(now)
            .bind(day_start)
            .bind(daily_cap)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(item) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        let res = sqlx::query(
            "UPDATE write_queue
             SET status = 'writing', lease_expires_at = ?, claimed_by = ?,
                 attempts = attempts + 1
             WHERE project_id = ? AND chapter_number = ?
               AND (status = 'pending'
                    OR (status = 'writing' AND lease_expires_at IS NOT NULL
                        AND lease_expires_at <= ?))",
        )
            .bind(now + lease_secs)
            .bind(worker_id)
            .bind(&item.project_id)
            .bind(item.chapter_number)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        if res.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;

        info!(
            "🎯 {} claimed chapter {} of {}",
            worker_id, item.chapter_number, item.project_id
        );
        Ok(Some(WorkItem {
            status: WorkStatus::Writing,
            lease_expires_at: Some(now + lease_secs),
            claimed_by: Some(worker_id.to_string()),
            attempts: item.attempts + 1,
            ..item
        }))
    }

    pub async fn complete_write_item(
        &self,
        project_id: &str,
        chapter_number: i64,
        success: bool,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let status = if success { WorkStatus::Succeeded } else { WorkStatus::Failed };

        sqlx::query(
            "UPDATE write_queue
             SET status = ?, completed_at = unixepoch(), lease_expires_at = NULL,
                 last_error = ?
             WHERE project_id = ? AND chapter_number = ?",
        )
            .bind(status)
            .bind(last_error)
            .bind(project_id)
            .bind(chapter_number)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Devuelve un item claimed a pending (retry tras fallo transitorio).
    pub async fn release_write_item(
        &self,
        project_id: &str,
        chapter_number: i64,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        warn!(
            "↩️ Releasing chapter {} of {} back to pending",
            chapter_number, project_id
        );

        sqlx::query(
            "UPDATE write_queue
             SET status = 'pending', lease_expires_at = NULL, claimed_by = NULL,
                 last_error = ?
             WHERE project_id = ? AND chapter_number = ?",
        )
            .bind(last_error)
            .bind(project_id)
            .bind(chapter_number)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Items pendientes que apuntan a capítulos ya persistidos (otro worker
    /// los completó): se cierran como succeeded sin trabajo.
    pub async fn sweep_stale_write_items(&self) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE write_queue
             SET status = 'succeeded', completed_at = unixepoch()
             WHERE status = 'pending'
               AND chapter_number <= (SELECT current_chapter FROM projects
                                      WHERE projects.id = write_queue.project_id)",
        )
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected())
    }

    pub async fn get_write_item(
        &self,
        project_id: &str,
        chapter_number: i64,
    ) -> Result<Option<WorkItem>, sqlx::Error> {
        sqlx::query_as::<_, WorkItem>(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM write_queue
             WHERE project_id = ? AND chapter_number = ?"
        ))
            .bind(project_id)
            .bind(chapter_number)
            .fetch_optional(&self.pool)
            .await
    }

    // --- PUBLISH QUEUE ---

    pub async fn enqueue_publish(
        &self,
        chapter_id: &str,
        scheduled_at: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO publish_queue (chapter_id, scheduled_at, status)
             VALUES (?, ?, 'scheduled')
             ON CONFLICT(chapter_id) DO UPDATE SET
                scheduled_at = excluded.scheduled_at
             WHERE publish_queue.status NOT IN ('published', 'publishing')",
        )
            .bind(chapter_id)
            .bind(scheduled_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Publish nunca corre antes de scheduled_at; los claimed pasan a
    /// publishing dentro de la misma transacción.
    pub async fn claim_due_publishes(
        &self,
        now: i64,
        limit: i64,
    ) -> Result<Vec<PublishItem>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let due = sqlx::query_as::<_, PublishItem>(
            "SELECT chapter_id, scheduled_at, status, retries, last_error, published_at
             FROM publish_queue
             WHERE status IN ('scheduled', 'failed') AND scheduled_at <= ?
             ORDER BY scheduled_at ASC
             LIMIT ?",
        )
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        for item in &due {
            sqlx::query("UPDATE publish_queue SET status = 'publishing' WHERE chapter_id = ?")
                .bind(&item.chapter_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(due)
    }

    /// Transición draft -> published + novel.updated_at, en UNA transacción.
    /// Re-publicar un capítulo ya publicado es un no-op estable.
    pub async fn mark_published(&self, chapter_id: &str, now: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE chapters
             SET status = 'published',
                 published_at = COALESCE(published_at, ?)
             WHERE id = ?",
        )
            .bind(now)
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE novels SET updated_at = ?
             WHERE id = (SELECT novel_id FROM chapters WHERE id = ?)",
        )
            .bind(now)
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE publish_queue
             SET status = 'published', published_at = COALESCE(published_at, ?),
                 last_error = NULL
             WHERE chapter_id = ?",
        )
            .bind(now)
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Fallo de publish: backoff exponencial hasta max_retries, después
    /// queda failed terminal (visible para operación).
    pub async fn mark_publish_failed(
        &self,
        chapter_id: &str,
        error: &str,
        now: i64,
        max_retries: i64,
    ) -> Result<(), sqlx::Error> {
        let retries: i64 = sqlx::query_scalar(
            "SELECT retries FROM publish_queue WHERE chapter_id = ?",
        )
            .bind(chapter_id)
            .fetch_optional(&self.pool)
            .await?
            .unwrap_or(0);

        let next_retries = retries + 1;
        if next_retries >= max_retries {
            warn!("🛑 Publish of {} failed permanently: {}", chapter_id, error);
            sqlx::query(
                "UPDATE publish_queue
                 SET status = 'failed', retries = ?, last_error = ?,
                     scheduled_at = ?
                 WHERE chapter_id = ?",
            )
                .bind(next_retries)
                .bind(error)
                // Empujado fuera del horizonte: un operador decide.
                .bind(now + 365 * 86_400)
                .bind(chapter_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let delay = 60 * (1i64 << next_retries.min(10));
        sqlx::query(
            "UPDATE publish_queue
             SET status = 'failed', retries = ?, last_error = ?, scheduled_at = ?
             WHERE chapter_id = ?",
        )
            .bind(next_retries)
            .bind(error)
            .bind(now + delay)
            .bind(chapter_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::projects::new_project;
    use crate::model::Genre;

    async fn seeded() -> Database {
        let db = Database::connect_in_memory().await.unwrap();
        db.create_novel("n1", "t").await.unwrap();
        db.create_project(&new_project("p1", "n1", Genre::Cultivation, 100, 2000))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let db = seeded().await;
        db.enqueue_write("p1", 1, 100, Slot::Morning, 0).await.unwrap();

        let first = db.claim_write_item("w1", 200, 900, 0, 10).await.unwrap();
        assert!(first.is_some());

        // Segundo claim mientras el lease vive: nada.
        let second = db.claim_write_item("w2", 300, 900, 0, 10).await.unwrap();
        assert!(second.is_none());

        // Lease vencido: reclamable de nuevo.
        let third = db.claim_write_item("w2", 2000, 900, 0, 10).await.unwrap();
        assert!(third.is_some());
        assert_eq!(third.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn claim_respects_chapter_order() {
        let db = seeded().await;
        // Capítulo 2 encolado pero current_chapter=0: no elegible.
        db.enqueue_write("p1", 2, 100, Slot::Morning, 0).await.unwrap();
        assert!(db.claim_write_item("w1", 200, 900, 0, 10).await.unwrap().is_none());

        db.enqueue_write("p1", 1, 100, Slot::Morning, 0).await.unwrap();
        let item = db.claim_write_item("w1", 200, 900, 0, 10).await.unwrap().unwrap();
        assert_eq!(item.chapter_number, 1);
    }

    #[tokio::test]
    async fn claim_respects_daily_cap() {
        let db = seeded().await;

        db.enqueue_write("p1", 1, 100, Slot::Morning, 0).await.unwrap();
        db.claim_write_item("w1", 200, 900, 0, 1).await.unwrap().unwrap();
        db.complete_write_item("p1", 1, true, None).await.unwrap();
        db.advance_project_chapter("p1", 1).await.unwrap();

        db.enqueue_write("p1", 2, 100, Slot::Afternoon, 0).await.unwrap();
        // Cap de 1 por día ya consumido.
        assert!(db.claim_write_item("w1", 300, 900, 0, 1).await.unwrap().is_none());
        // Con cap 2 sí sale.
        assert!(db.claim_write_item("w1", 300, 900, 0, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn priority_breaks_ties_at_claim_time() {
        let db = seeded().await;
        db.create_novel("n2", "t2").await.unwrap();
        db.create_project(&new_project("p2", "n2", Genre::Urban, 100, 2000))
            .await
            .unwrap();

        db.enqueue_write("p1", 1, 100, Slot::Morning, 0).await.unwrap();
        db.enqueue_write("p2", 1, 100, Slot::Morning, 5).await.unwrap();

        let item = db.claim_write_item("w1", 200, 900, 0, 10).await.unwrap().unwrap();
        assert_eq!(item.project_id, "p2");
    }

    #[tokio::test]
    async fn publish_cycle_is_idempotent() {
        let db = seeded().await;
        let ch = crate::db::chapters::draft_chapter("n1", 1, "t", "body", 100);
        let commit = crate::db::ChapterCommit {
            project_id: "p1".into(),
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
            chapter: ch.clone(),
        };
        db.persist_chapter_commit(&commit).await.unwrap();
        let stored = db.get_chapter("n1", 1).await.unwrap().unwrap();

        db.enqueue_publish(&stored.id, 100).await.unwrap();

        // Antes de tiempo: nada due.
        assert!(db.claim_due_publishes(50, 10).await.unwrap().is_empty());

        let due = db.claim_due_publishes(200, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        db.mark_published(&stored.id, 200).await.unwrap();

        let published = db.get_chapter("n1", 1).await.unwrap().unwrap();
        assert_eq!(published.status, crate::model::ChapterStatus::Published);
        assert_eq!(published.published_at, Some(200));
        assert_eq!(db.novel_updated_at("n1").await.unwrap(), 200);

        // Segundo tick: no-op (published es terminal).
        assert!(db.claim_due_publishes(300, 10).await.unwrap().is_empty());
        db.mark_published(&stored.id, 400).await.unwrap();
        let still = db.get_chapter("n1", 1).await.unwrap().unwrap();
        assert_eq!(still.published_at, Some(200));
    }

    #[tokio::test]
    async fn publish_failure_backs_off_then_goes_terminal() {
        let db = seeded().await;
        db.enqueue_publish("ch-x", 100).await.unwrap();

        db.mark_publish_failed("ch-x", "boom", 100, 3).await.unwrap();
        // Reintento agendado en el futuro.
        assert!(db.claim_due_publishes(150, 10).await.unwrap().is_empty());
        let later = db.claim_due_publishes(100 + 300, 10).await.unwrap();
        assert_eq!(later.len(), 1);

        db.mark_publish_failed("ch-x", "boom", 500, 3).await.unwrap();
        db.mark_publish_failed("ch-x", "boom", 900, 3).await.unwrap();
        // retries >= max: empujado fuera del horizonte.
        assert!(db.claim_due_publishes(2000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_closes_already_done_items() {
        let db = seeded().await;
        db.enqueue_write("p1", 1, 100, Slot::Morning, 0).await.unwrap();
        db.advance_project_chapter("p1", 1).await.unwrap();

        let swept = db.sweep_stale_write_items().await.unwrap();
        assert_eq!(swept, 1);
        let item = db.get_write_item("p1", 1).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Succeeded);
    }
}
