// ========================================
// projects.rs - Gestión de novels, projects y outlines
// ========================================
// Este módulo maneja la unidad de producción: el project, su novel padre y
// el plan (outline) inmutable.

use sqlx::Row;
use tracing::info;

use crate::db::Database;
use crate::db::helpers::now_epoch;
use crate::model::{ArcOutline, ChapterOutline, Genre, Outline, Project, ProjectStatus};

impl Database {
    // --- NOVELS ---

    pub async fn create_novel(&self, novel_id: &str, title: &str) -> Result<(), sqlx::Error> {
        if title.trim().is_empty() {
            return Err(sqlx::Error::Protocol("Title cannot be empty".into()));
        }

        sqlx::query("INSERT INTO novels (id, title) VALUES (?, ?)")
            .bind(novel_id)
            .bind(title)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn novel_updated_at(&self, novel_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT updated_at FROM novels WHERE id = ?")
            .bind(novel_id)
            .fetch_one(&self.pool)
            .await
    }

    // --- PROJECTS ---

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            "SELECT id, novel_id, genre, main_character, current_chapter,
                    total_planned_chapters, target_chapter_length, model_preference,
                    status, updated_at
             FROM projects WHERE id = ?",
        )
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_active_projects(&self, limit: i64) -> Result<Vec<Project>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            "SELECT id, novel_id, genre, main_character, current_chapter,
                    total_planned_chapters, target_chapter_length, model_preference,
                    status, updated_at
             FROM projects WHERE status = 'active'
             ORDER BY updated_at ASC
             LIMIT ?",
        )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn create_project(&self, p: &Project) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO projects (id, novel_id, genre, main_character, current_chapter,
                                   total_planned_chapters, target_chapter_length,
                                   model_preference, status, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, unixepoch())",
        )
            .bind(&p.id)
            .bind(&p.novel_id)
            .bind(p.genre)
            .bind(&p.main_character)
            .bind(p.current_chapter)
            .bind(p.total_planned_chapters)
            .bind(p.target_chapter_length)
            .bind(&p.model_preference)
            .bind(p.status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), sqlx::Error> {
        info!("📦 Project {} -> {:?}", project_id, status);

        sqlx::query("UPDATE projects SET status = ?, updated_at = unixepoch() WHERE id = ?")
            .bind(status)
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Compare-and-set del contador de capítulos: solo avanza si el valor
    /// actual es exactamente `to_chapter - 1`. Devuelve false si otro worker
    /// ya avanzó (duplicado benigno).
    pub async fn advance_project_chapter(
        &self,
        project_id: &str,
        to_chapter: i64,
    ) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(
            "UPDATE projects
             SET current_chapter = ?, updated_at = unixepoch()
             WHERE id = ? AND current_chapter = ?",
        )
            .bind(to_chapter)
            .bind(project_id)
            .bind(to_chapter - 1)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    // --- OUTLINES ---

    pub async fn get_outline(&self, project_id: &str) -> Result<Option<Outline>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT project_id, tagline, world_description, power_system,
                    main_character_name, main_character_motivation,
                    arc_outlines, chapter_outlines
             FROM outlines WHERE project_id = ?",
        )
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let arcs_json: String = row.try_get("arc_outlines")?;
        let chapters_json: String = row.try_get("chapter_outlines")?;

        let arc_outlines: Vec<ArcOutline> = serde_json::from_str(&arcs_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let chapter_outlines: Vec<ChapterOutline> = serde_json::from_str(&chapters_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Some(Outline {
            project_id: row.try_get("project_id")?,
            tagline: row.try_get("tagline")?,
            world_description: row.try_get("world_description")?,
            power_system: row.try_get("power_system")?,
            main_character_name: row.try_get("main_character_name")?,
            main_character_motivation: row.try_get("main_character_motivation")?,
            arc_outlines,
            chapter_outlines,
        }))
    }

    /// Solo los arcos del plan, para consumidores que no necesitan las filas
    /// por capítulo.
    pub async fn get_arcs(&self, project_id: &str) -> Result<Vec<ArcOutline>, sqlx::Error> {
        Ok(self
            .get_outline(project_id)
            .await?
            .map(|o| o.arc_outlines)
            .unwrap_or_default())
    }

    /// Regeneración reemplaza, nunca muta: upsert completo de la fila.
    pub async fn replace_outline(&self, o: &Outline) -> Result<(), sqlx::Error> {
        let arcs = serde_json::to_string(&o.arc_outlines)
            .map_err(|e| sqlx::Error::Protocol(format!("arc_outlines serialize: {e}")))?;
        let chapters = serde_json::to_string(&o.chapter_outlines)
            .map_err(|e| sqlx::Error::Protocol(format!("chapter_outlines serialize: {e}")))?;

        sqlx::query(
            "INSERT INTO outlines (project_id, tagline, world_description, power_system,
                                   main_character_name, main_character_motivation,
                                   arc_outlines, chapter_outlines)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(project_id) DO UPDATE SET
                tagline = excluded.tagline,
                world_description = excluded.world_description,
                power_system = excluded.power_system,
                main_character_name = excluded.main_character_name,
                main_character_motivation = excluded.main_character_motivation,
                arc_outlines = excluded.arc_outlines,
                chapter_outlines = excluded.chapter_outlines",
        )
            .bind(&o.project_id)
            .bind(&o.tagline)
            .bind(&o.world_description)
            .bind(&o.power_system)
            .bind(&o.main_character_name)
            .bind(&o.main_character_motivation)
            .bind(arcs)
            .bind(chapters)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Builder corto para tests y seeds.
pub fn new_project(id: &str, novel_id: &str, genre: Genre, total: i64, target_len: i64) -> Project {
    Project {
        id: id.to_string(),
        novel_id: novel_id.to_string(),
        genre,
        main_character: String::new(),
        current_chapter: 0,
        total_planned_chapters: total,
        target_chapter_length: target_len,
        model_preference: String::new(),
        status: ProjectStatus::Active,
        updated_at: now_epoch(),
    }
}
