// ========================================
// cost.rs - Cost Cache / Budget Gate
// ========================================
// Pre-check antes de CADA llamada al LLM. El total diario sale de
// cost_records persistidos (un restart no re-otorga presupuesto); el total
// de sesión vive en memoria dentro del gate.
//
// El sobre-gasto queda acotado a UN capítulo en vuelo: el pre-check usa lo
// ya commiteado + la estimación de la llamada siguiente.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::model::{CostSnapshot, TaskKind};

#[derive(Debug, Clone)]
pub struct CostDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub estimated_usd: f64,
    pub daily_spent: f64,
    pub daily_remaining: f64,
}

/// Un CostGate por run; el contador de sesión muere con él.
#[derive(Debug, Clone, Default)]
pub struct CostGate {
    session_spent: Arc<Mutex<f64>>,
}

impl CostGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-autorización de una llamada estimada en tokens.
    pub async fn can_proceed(
        &self,
        db: &Database,
        config: &FactoryConfig,
        project_id: &str,
        est_input_tokens: i64,
        est_output_tokens: i64,
        task: TaskKind,
    ) -> Result<CostDecision, sqlx::Error> {
        let estimated = config.estimate_cost(est_input_tokens, est_output_tokens);

        let now = crate::db::helpers::now_epoch();
        let day_start = config.local_day_start(now);
        let daily_spent = db.total_cost_since(project_id, day_start).await?;
        let session_spent = *self.session_spent.lock().await;

        if session_spent + estimated > config.session_budget_usd {
            return Ok(CostDecision {
                allowed: false,
                reason: Some(format!(
                    "session budget exhausted (spent {session_spent:.3} + est {estimated:.3} \
                     > {:.2} USD) for task {}",
                    config.session_budget_usd,
                    task.as_str()
                )),
                estimated_usd: estimated,
                daily_spent,
                daily_remaining: (config.daily_budget_usd - daily_spent).max(0.0),
            });
        }

        if daily_spent + estimated > config.daily_budget_usd {
            return Ok(CostDecision {
                allowed: false,
                reason: Some(format!(
                    "daily budget exhausted (spent {daily_spent:.3} + est {estimated:.3} \
                     > {:.2} USD) for task {}",
                    config.daily_budget_usd,
                    task.as_str()
                )),
                estimated_usd: estimated,
                daily_spent,
                daily_remaining: (config.daily_budget_usd - daily_spent).max(0.0),
            });
        }

        Ok(CostDecision {
            allowed: true,
            reason: None,
            estimated_usd: estimated,
            daily_spent,
            daily_remaining: (config.daily_budget_usd - daily_spent).max(0.0),
        })
    }

    /// Registra gasto real de la sesión (el gasto diario entra por el commit
    /// del capítulo en cost_records).
    pub async fn add_session_cost(&self, usd: f64) {
        let mut spent = self.session_spent.lock().await;
        *spent += usd;
    }

    pub async fn session_spent(&self) -> f64 {
        *self.session_spent.lock().await
    }

    pub async fn snapshot(
        &self,
        db: &Database,
        config: &FactoryConfig,
        project_id: &str,
    ) -> Result<CostSnapshot, sqlx::Error> {
        let now = crate::db::helpers::now_epoch();
        let day_start = config.local_day_start(now);
        let daily_spent = db.total_cost_since(project_id, day_start).await?;

        Ok(CostSnapshot {
            session_cost: self.session_spent().await,
            daily_spent,
            daily_remaining: (config.daily_budget_usd - daily_spent).max(0.0),
        })
    }
}
