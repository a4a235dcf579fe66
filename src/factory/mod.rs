// ========================================
// mod.rs - Punto de entrada del pipeline de producción
// ========================================
// El Factory junta el gateway de store, los colaboradores inyectados y el
// estado en memoria (sesiones, pool de workers, tablas heurísticas). El
// control plane (adapter HTTP delgado) habla con estos métodos.

pub mod session;
pub mod context;
pub mod writer;
pub mod gates;
pub mod rewriter;
pub mod worker;
pub mod scheduler;
pub mod publisher;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info;

use crate::config::FactoryConfig;
use crate::db::Database;
use crate::error::{FactoryError, FactoryResult};
use crate::heuristics::{CompiledLexicon, HeuristicsTable};
use crate::llm::{Generator, SemanticIndex};
use crate::model::{Genre, ProjectStatusView, RunSummary};

pub use scheduler::RunOptions;
pub use session::SessionStatus;

#[derive(Clone)]
pub struct Factory {
    pub db: Database,
    pub generator: Arc<dyn Generator>,
    pub index: Arc<dyn SemanticIndex>,
    pub sessions: session::SessionTable,
    pub heuristics: Arc<HeuristicsTable>,
    pub(crate) fleet_pool: Arc<Semaphore>,
    config: Arc<RwLock<Arc<FactoryConfig>>>,
    lexicons: Arc<Mutex<HashMap<Genre, Arc<CompiledLexicon>>>>,
}

impl Factory {
    /// Carga la config persistida y arma el pipeline. El pool de workers se
    /// dimensiona con max_workers al construir.
    pub async fn new(
        db: Database,
        generator: Arc<dyn Generator>,
        index: Arc<dyn SemanticIndex>,
    ) -> FactoryResult<Self> {
        let config = db.load_factory_config().await?;
        info!(
            "🏭 Factory up: max_workers={} daily_budget=${:.2} qc_threshold={:.1}",
            config.max_workers, config.daily_budget_usd, config.qc_threshold
        );

        let fleet_pool = Arc::new(Semaphore::new(config.max_workers));

        Ok(Self {
            db,
            generator,
            index,
            sessions: session::SessionTable::new(),
            heuristics: Arc::new(HeuristicsTable::default()),
            fleet_pool,
            config: Arc::new(RwLock::new(Arc::new(config))),
            lexicons: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn config(&self) -> Arc<FactoryConfig> {
        self.config.read().await.clone()
    }

    /// Re-lee factory_config (tras cambios del admin). El pool de workers no
    /// se redimensiona en caliente; eso pide un restart.
    pub async fn reload_config(&self) -> FactoryResult<()> {
        let fresh = self.db.load_factory_config().await?;
        let mut slot = self.config.write().await;
        *slot = Arc::new(fresh);
        Ok(())
    }

    /// Lexicón compilado por género, cacheado (la compilación de regex no es
    /// gratis y los géneros activos son pocos).
    pub async fn lexicon_for(&self, genre: Genre) -> Arc<CompiledLexicon> {
        let mut cache = self.lexicons.lock().await;
        if let Some(lex) = cache.get(&genre) {
            return lex.clone();
        }
        let lex = Arc::new(self.heuristics.compile(genre));
        cache.insert(genre, lex.clone());
        lex
    }

    // --- CONTROL PLANE ---

    /// `StartRun(projectID, chaptersToWrite) -> RunSummary`
    pub async fn start_run(
        &self,
        project_id: &str,
        chapters_to_write: i64,
    ) -> FactoryResult<RunSummary> {
        self.start_run_with(project_id, chapters_to_write, RunOptions::default())
            .await
    }

    pub async fn start_run_with(
        &self,
        project_id: &str,
        chapters_to_write: i64,
        opts: RunOptions,
    ) -> FactoryResult<RunSummary> {
        scheduler::run_project(self, project_id, chapters_to_write, opts).await
    }

    pub async fn pause(&self, project_id: &str) -> Option<SessionStatus> {
        self.sessions.pause(project_id).await
    }

    pub async fn resume(&self, project_id: &str) -> Option<SessionStatus> {
        self.sessions.resume(project_id).await
    }

    pub async fn stop(&self, project_id: &str) -> Option<SessionStatus> {
        self.sessions.stop(project_id).await
    }

    /// `GetStatus(projectID)`
    pub async fn get_status(&self, project_id: &str) -> FactoryResult<ProjectStatusView> {
        let project = self
            .db
            .get_project(project_id)
            .await?
            .ok_or_else(|| FactoryError::ProjectNotFound(project_id.to_string()))?;

        let session = self.sessions.get(project_id).await;
        let (session_status, recent_results) = match session {
            Some(s) => (
                Some(s.status().as_str().to_string()),
                s.recent_results().await,
            ),
            None => (None, Vec::new()),
        };

        Ok(ProjectStatusView {
            project_id: project.id,
            current_chapter: project.current_chapter,
            total_chapters: project.total_planned_chapters,
            project_status: project.status,
            session_status,
            recent_results,
        })
    }

    /// `TickScheduler()`: planifica y despacha trabajo de flota.
    pub async fn tick_scheduler(&self) -> FactoryResult<u32> {
        scheduler::tick(self).await
    }

    /// `TickPublisher()`: publica capítulos due.
    pub async fn tick_publisher(&self) -> FactoryResult<u32> {
        publisher::tick(self).await
    }
}
