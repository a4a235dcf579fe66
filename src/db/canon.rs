// ========================================
// canon.rs - Hechos de canon (subject, predicate, object)
// ========================================
// Snapshot de lectura para el Context Loader y el Canon Resolver. Las
// escrituras pasan por persist_chapter_commit; aquí solo hay upserts
// administrativos y consultas.

use crate::db::Database;
use crate::model::CanonFact;

impl Database {
    pub async fn get_active_facts(&self, project_id: &str) -> Result<Vec<CanonFact>, sqlx::Error> {
        sqlx::query_as::<_, CanonFact>(
            "SELECT project_id, subject, predicate, object, first_chapter,
                    last_confirmed_chapter, status
             FROM canon_facts
             WHERE project_id = ? AND status = 'active'
             ORDER BY last_confirmed_chapter DESC",
        )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Top-K hechos para el prompt: primero los que mencionan a los
    /// personajes del outline, después el resto por frescura.
    pub async fn get_canon_snapshot(
        &self,
        project_id: &str,
        focus_subjects: &[String],
        limit: usize,
    ) -> Result<Vec<CanonFact>, sqlx::Error> {
        let all = self.get_active_facts(project_id).await?;

        let focus: Vec<String> = focus_subjects.iter().map(|s| s.to_lowercase()).collect();
        let is_focused =
            |f: &CanonFact| focus.iter().any(|s| f.subject.to_lowercase() == *s);

        let mut snapshot: Vec<CanonFact> = Vec::with_capacity(limit);
        snapshot.extend(all.iter().filter(|f| is_focused(f)).cloned());
        snapshot.extend(all.iter().filter(|f| !is_focused(f)).cloned());
        snapshot.truncate(limit);
        Ok(snapshot)
    }

    /// Upsert administrativo (seeds, correcciones manuales).
    pub async fn upsert_canon_fact(&self, fact: &CanonFact) -> Result<(), sqlx::Error> {
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
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn retract_fact(
        &self,
        project_id: &str,
        subject: &str,
        predicate: &str,
        object: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE canon_facts SET status = 'retracted'
             WHERE project_id = ? AND subject = ? AND predicate = ? AND object = ?",
        )
            .bind(project_id)
            .bind(subject)
            .bind(predicate)
            .bind(object)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
