// ========================================
// session.rs - Sesiones de producción en memoria
// ========================================
// Una sesión por project activo. Los endpoints de control (pause/resume/stop)
// llegan por el mapa global; el run-loop observa los flags leyéndolos, sin
// suscripciones.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;

use crate::error::{FactoryError, FactoryResult};
use crate::model::ChapterResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// Estado compartido de un run. El scheduler es el dueño; el control plane
/// solo flipea flags.
#[derive(Debug)]
pub struct Session {
    pub project_id: String,
    pub start_chapter: i64,
    pub end_chapter: i64,
    paused: AtomicBool,
    should_stop: AtomicBool,
    chapters_written: AtomicI64,
    recent: Mutex<Vec<ChapterResult>>,
}

pub type SessionHandle = Arc<Session>;

impl Session {
    fn new(project_id: &str, start_chapter: i64, end_chapter: i64) -> SessionHandle {
        Arc::new(Self {
            project_id: project_id.to_string(),
            start_chapter,
            end_chapter,
            paused: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            chapters_written: AtomicI64::new(0),
            recent: Mutex::new(Vec::new()),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    pub fn status(&self) -> SessionStatus {
        if self.should_stop() {
            SessionStatus::Stopped
        } else if self.is_paused() {
            SessionStatus::Paused
        } else {
            SessionStatus::Running
        }
    }

    pub fn chapters_written(&self) -> i64 {
        self.chapters_written.load(Ordering::Acquire)
    }

    pub async fn record_result(&self, result: ChapterResult) {
        if result.success {
            self.chapters_written.fetch_add(1, Ordering::AcqRel);
        }
        let mut recent = self.recent.lock().await;
        recent.push(result);
        // Solo los últimos 20 interesan al status endpoint.
        let len = recent.len();
        if len > 20 {
            recent.drain(..len - 20);
        }
    }

    pub async fn recent_results(&self) -> Vec<ChapterResult> {
        self.recent.lock().await.clone()
    }
}

/// Mapa process-wide projectID -> Session, protegido por un único mutex.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra la sesión de un run nuevo. Un project con sesión viva no
    /// acepta otro run (serialización por project).
    pub async fn begin(
        &self,
        project_id: &str,
        start_chapter: i64,
        end_chapter: i64,
    ) -> FactoryResult<SessionHandle> {
        let mut map = self.inner.lock().await;

        if map.contains_key(project_id) {
            return Err(FactoryError::SessionBusy(project_id.to_string()));
        }

        let session = Session::new(project_id, start_chapter, end_chapter);
        map.insert(project_id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, project_id: &str) -> Option<SessionHandle> {
        self.inner.lock().await.get(project_id).cloned()
    }

    /// El run-loop la llama al terminar; la sesión deja de ser visible.
    pub async fn end(&self, project_id: &str) {
        self.inner.lock().await.remove(project_id);
    }

    pub async fn pause(&self, project_id: &str) -> Option<SessionStatus> {
        let session = self.get(project_id).await?;
        session.pause();
        Some(session.status())
    }

    pub async fn resume(&self, project_id: &str) -> Option<SessionStatus> {
        let session = self.get(project_id).await?;
        session.resume();
        Some(session.status())
    }

    pub async fn stop(&self, project_id: &str) -> Option<SessionStatus> {
        let session = self.get(project_id).await?;
        session.stop();
        Some(session.status())
    }
}
