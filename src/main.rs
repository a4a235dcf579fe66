use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fabrica::db::Database;
use fabrica::factory::Factory;
use fabrica::llm::{DemoGenerator, MemoryIndex};

fn default_db_path() -> PathBuf {
    // AppData/Local (Windows) o ~/.local/share; fallback a /tmp.
    let dir = if let Some(p) = ProjectDirs::from("com", "Fabrica", "Fabrica") {
        p.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("Fabrica")
    };
    dir.join("fabrica.db")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

/// Corrida demo: siembra un project, produce 3 capítulos con el generator
/// integrado y publica lo que quedó due. Sirve para ejercitar el pipeline
/// completo sin LLM real ni control plane.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_db_path);

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!("🗄️ DB: {}", db_path.display());

    let db = Database::connect(db_path).await?;
    let project_id = db.inject_demo_project().await?;

    let factory = Factory::new(db, DemoGenerator::new(), MemoryIndex::new()).await?;

    match factory.start_run(&project_id, 3).await {
        Ok(summary) => info!(
            "📚 Run summary: written={} failed={} review={} avg_qc={:.2} session_cost=${:.4}",
            summary.chapters_written,
            summary.chapters_failed,
            summary.chapters_needing_review,
            summary.avg_qc_score,
            summary.cost.session_cost
        ),
        Err(fabrica::FactoryError::AlreadyComplete(_)) => {
            info!("ℹ️ Demo project already has all planned chapters");
        }
        Err(e) => return Err(e.into()),
    }

    let published = factory.tick_publisher().await?;
    info!("📣 Publisher tick: {published} chapter(s) published");

    let status = factory.get_status(&project_id).await?;
    info!(
        "📦 Project {}: chapter {}/{} ({:?})",
        status.project_id, status.current_chapter, status.total_chapters, status.project_status
    );

    Ok(())
}
