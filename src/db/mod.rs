// ========================================
// mod.rs - Punto de entrada principal del módulo DB
// ========================================
// Este archivo organiza todos los submódulos y expone la estructura Database

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteJournalMode, SqliteSynchronous};
use std::{sync::OnceLock, time::Duration};
use std::path::PathBuf;
use tracing::{info, warn};

// Submódulos - cada uno maneja una área específica de funcionalidad
pub mod helpers;
mod migrations;
mod schema_guard;
mod settings;
pub(crate) mod projects;
pub(crate) mod chapters;
mod canon;
mod ledger;
mod queue;
mod demo;

pub use chapters::{ChapterCommit, PersistOutcome};

// Re-exportar la estructura principal
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub flags: crate::guards::FlagsCache,
}

static DB_CONNECT_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

impl Database {
    pub async fn connect(db_path: PathBuf) -> Result<Self, sqlx::Error> {
        // ✅ Evita múltiples connects concurrentes (ticks/tests)
        let _guard = DB_CONNECT_LOCK
            .get_or_init(|| tokio::sync::Mutex::new(()))
            .lock()
            .await;

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            // ✅ Espera locks en vez de fallar inmediato
            .busy_timeout(Duration::from_secs(15))
            // ✅ Reduce contención lector/escritor
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        Self::connect_with(options).await
    }

    /// In-memory database. The single pooled connection keeps it alive for
    /// the lifetime of the pool; used by tests and the demo binary.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .busy_timeout(Duration::from_secs(15));

        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, sqlx::Error> {
        // ✅ SQLite: 1 conexión es lo más estable; además serializa los
        // commits del pipeline sin locks de aplicación.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        // PRAGMAs extra por si alguna conexión no heredó settings
        sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 15000;").execute(&pool).await?;

        // ✅ Retry si SQLite está ocupado (code 5)
        for attempt in 1..=5 {
            match migrations::apply(&pool).await {
                Ok(_) => break,
                Err(e) if crate::error::is_sqlite_locked(&e) && attempt < 5 => {
                    warn!(
                        "SQLite locked during migrations (attempt {}/5). Retrying...",
                        attempt
                    );
                    tokio::time::sleep(helpers::backoff_delay(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        // ✅ Blindaje: alinea DB con el modelo real del pipeline
        schema_guard::ensure_minimum_schema(&pool).await?;

        // ✅ Cargar flags al conectar
        let flags_cache = crate::guards::create_empty_cache();

        match crate::guards::fetch_flags_from_db(&pool).await {
            Ok(flags) => {
                let mut cache_lock = flags_cache.write().await;
                *cache_lock = flags;
            }
            Err(e) => {
                warn!(
                    "⚠️ Could not load factory flags: {}. Keeping fail-closed defaults (all disabled).",
                    e
                );
            }
        }

        let db = Self {
            pool,
            flags: flags_cache,
        };

        info!("✅ DB ready (schema v{})", db.get_schema_version().await.unwrap_or(0));
        Ok(db)
    }

    /// Helper para verificar flags antes de operaciones del pipeline
    pub(crate) async fn require_flag(&self, flag: &'static str) -> crate::error::FactoryResult<()> {
        crate::guards::check_flag(&self.flags, flag).await
    }

    pub async fn get_schema_version(&self) -> Result<i64, sqlx::Error> {
        migrations::read_schema_version(&self.pool).await
    }
}
