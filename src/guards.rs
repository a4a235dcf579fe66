//! Factory Flag Gating con Cache en Memoria
//! Valida que las operaciones del pipeline estén permitidas sin re-leer la DB
//! en cada tick.

use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, Row};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{FactoryError, FactoryResult};

/// Operational switches for the factory. `writing` maps to the
/// factory_config.is_running column; the rest live in the config JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FactoryFlags {
    pub writing: bool,
    pub publishing: bool,
    pub indexing: bool,
}

impl FactoryFlags {
    /// Flags with everything enabled (default for fresh installs).
    pub fn all_enabled() -> Self {
        Self {
            writing: true,
            publishing: true,
            indexing: true,
        }
    }

    pub fn is_enabled(&self, flag: &str) -> bool {
        let f = flag.trim().to_ascii_lowercase();
        match f.as_str() {
            "writing" | "write" | "production" => self.writing,
            "publishing" | "publish" => self.publishing,
            "indexing" | "index" | "rag" => self.indexing,
            _ => false,
        }
    }
}

/// Contenedor thread-safe para flags
pub type FlagsCache = Arc<RwLock<FactoryFlags>>;

/// CARGA INICIAL: llena el cache desde factory_config al arrancar.
pub async fn fetch_flags_from_db(pool: &SqlitePool) -> Result<FactoryFlags, sqlx::Error> {
    let row = sqlx::query("SELECT is_running, config_json FROM factory_config WHERE id = 1")
        .fetch_one(pool)
        .await?;

    let is_running: i64 = row.try_get("is_running")?;
    let json: String = row.try_get("config_json")?;

    // ✅ FAIL-CLOSED: payload corrupto => todo deshabilitado excepto lo que
    // diga la columna is_running.
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct FlagsPayload {
        publishing_enabled: Option<bool>,
        indexing_enabled: Option<bool>,
    }

    let payload: FlagsPayload = match serde_json::from_str(&json) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                "⚠️ factory_config.config_json invalid ({e}). Keeping fail-closed flag defaults."
            );
            FlagsPayload::default()
        }
    };

    Ok(FactoryFlags {
        writing: is_running != 0,
        publishing: payload.publishing_enabled.unwrap_or(is_running != 0),
        indexing: payload.indexing_enabled.unwrap_or(is_running != 0),
    })
}

/// VERIFICACIÓN ULTRA-RÁPIDA: usa el cache en memoria.
pub async fn check_flag(cache: &FlagsCache, flag: &'static str) -> FactoryResult<()> {
    let flags = cache.read().await;

    if !flags.is_enabled(flag) {
        return Err(FactoryError::Disabled(flag));
    }

    Ok(())
}

/// Helper: cache inicial vacío (antes de cargar DB).
pub fn create_empty_cache() -> FlagsCache {
    // Fail-closed default: everything disabled until proven enabled by DB
    Arc::new(RwLock::new(FactoryFlags::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fail_closed_until_loaded() {
        let cache = create_empty_cache();
        assert!(check_flag(&cache, "writing").await.is_err());

        {
            let mut w = cache.write().await;
            *w = FactoryFlags::all_enabled();
        }
        assert!(check_flag(&cache, "writing").await.is_ok());
        assert!(check_flag(&cache, "publishing").await.is_ok());
    }

    #[test]
    fn unknown_flag_is_disabled() {
        let flags = FactoryFlags::all_enabled();
        assert!(!flags.is_enabled("metrics"));
        assert!(flags.is_enabled("RAG"));
    }
}
