// ========================================
// schema_guard.rs - Blindaje de schema
// ========================================
// Alinea bases legacy con el modelo actual sin exigir una migración formal:
// columnas añadidas después del release inicial se garantizan aquí.

use sqlx::SqlitePool;

use super::helpers::ensure_column;

pub async fn ensure_minimum_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // write_queue ganó prioridad y ownership del lease después del 0.1.
    ensure_column(pool, "write_queue", "priority", "INTEGER NOT NULL DEFAULT 0").await?;
    ensure_column(pool, "write_queue", "claimed_by", "TEXT").await?;
    ensure_column(pool, "write_queue", "completed_at", "INTEGER").await?;

    // publish_queue: published_at se añadió junto con el re-tick idempotente.
    ensure_column(pool, "publish_queue", "published_at", "INTEGER").await?;

    // projects: routing de modelo por proyecto.
    ensure_column(pool, "projects", "model_preference", "TEXT NOT NULL DEFAULT ''").await?;

    Ok(())
}
