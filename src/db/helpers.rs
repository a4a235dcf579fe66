// ========================================
// helpers.rs - Funciones auxiliares para toda la base de datos
// ========================================
// Utilidades comunes usadas por múltiples módulos de DB:
// - Verificación de existencia de tablas y columnas
// - Agregar columnas dinámicamente
// - Backoff con jitter para reintentos sobre "database is locked"

use sqlx::SqlitePool;
use std::time::Duration;

/// Verifica si una tabla existe en la base de datos
pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool, sqlx::Error> {
    let hit: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=? LIMIT 1"
    )
        .bind(table)
        .fetch_optional(pool)
        .await?;

    Ok(hit.is_some())
}

/// Verifica si una columna existe en una tabla
pub async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool, sqlx::Error> {
    // pragma_table_info('table') es table-valued function; table va literal en SQL
    let sql = format!(
        "SELECT 1 FROM pragma_table_info('{table}') WHERE name = ? LIMIT 1"
    );

    let hit: Option<i64> = sqlx::query_scalar(&sql)
        .bind(column)
        .fetch_optional(pool)
        .await?;

    Ok(hit.is_some())
}

/// Agrega una columna a una tabla si no existe
pub async fn ensure_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    col_def: &str,
) -> Result<(), sqlx::Error> {
    if column_exists(pool, table, column).await? {
        return Ok(());
    }

    let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {col_def}");
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Exponential backoff con jitter. attempt empieza en 1.
/// 250ms, 500ms, 1s, 2s... + hasta 25% de jitter, tope 10s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(6));
    let capped = base_ms.min(10_000);
    let jitter = fastrand::u64(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

/// unixepoch() visto desde Rust; una sola definición para todo el gateway.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
