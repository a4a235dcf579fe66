// ========================================
// settings.rs - factory_config (fila singleton)
// ========================================
// La configuración operativa vive en UNA fila: is_running + config_json.
// El JSON se parsea con defaults para que filas viejas sigan funcionando.

use sqlx::Row;

use crate::config::FactoryConfig;
use crate::db::Database;

impl Database {
    pub async fn load_factory_config(&self) -> Result<FactoryConfig, sqlx::Error> {
        let row = sqlx::query("SELECT config_json FROM factory_config WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        let json: String = row.try_get("config_json")?;
        Ok(FactoryConfig::from_json(&json))
    }

    pub async fn save_factory_config(&self, cfg: &FactoryConfig) -> Result<(), sqlx::Error> {
        let json = serde_json::to_string(cfg)
            .map_err(|e| sqlx::Error::Protocol(format!("config_json serialize: {e}")))?;

        sqlx::query(
            "INSERT INTO factory_config (id, is_running, config_json) VALUES (1, 1, ?)
             ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json",
        )
            .bind(json)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Interruptor maestro. Apagar también recarga el cache de flags para que
    /// los workers lo observen sin reiniciar.
    pub async fn set_factory_running(&self, running: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE factory_config SET is_running = ? WHERE id = 1")
            .bind(running as i64)
            .execute(&self.pool)
            .await?;

        match crate::guards::fetch_flags_from_db(&self.pool).await {
            Ok(flags) => {
                let mut cache = self.flags.write().await;
                *cache = flags;
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not refresh factory flags: {e}");
            }
        }

        Ok(())
    }
}
