// ========================================
// publisher.rs - Publisher
// ========================================
// Corre en timer: promueve capítulos draft -> published cuando su entrada de
// la publish_queue está due. Idempotente y con backoff exponencial en fallo.

use tracing::{info, warn};

use crate::error::FactoryResult;
use crate::factory::Factory;
use crate::model::ChapterStatus;

const CLAIM_LIMIT: i64 = 20;

/// `TickPublisher()`: publica todo lo que esté due. Devuelve cuántos
/// capítulos quedaron published en este tick.
pub async fn tick(factory: &Factory) -> FactoryResult<u32> {
    factory.db.require_flag("publishing").await?;

    let config = factory.config().await;
    let now = crate::db::helpers::now_epoch();
    let due = factory.db.claim_due_publishes(now, CLAIM_LIMIT).await?;

    let mut published = 0u32;
    for item in due {
        match publish_one(factory, &item.chapter_id, now).await {
            Ok(true) => published += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("⚠️ Publish of {} failed: {e}", item.chapter_id);
                factory
                    .db
                    .mark_publish_failed(
                        &item.chapter_id,
                        &e.to_string(),
                        now,
                        config.publish_max_retries,
                    )
                    .await?;
            }
        }
    }

    if published > 0 {
        info!("📣 Published {published} chapter(s)");
    }
    Ok(published)
}

/// Devuelve true si el capítulo pasó a published en ESTE tick (re-publicar
/// algo ya publicado es un no-op estable).
async fn publish_one(factory: &Factory, chapter_id: &str, now: i64) -> Result<bool, sqlx::Error> {
    let Some(chapter) = factory.db.get_chapter_by_id(chapter_id).await? else {
        return Err(sqlx::Error::RowNotFound);
    };

    if chapter.status == ChapterStatus::Published {
        // Cierra el item de la cola sin tocar published_at.
        factory.db.mark_published(chapter_id, now).await?;
        return Ok(false);
    }

    factory.db.mark_published(chapter_id, now).await?;
    info!(
        "📣 Chapter {} of novel {} published",
        chapter.chapter_number, chapter.novel_id
    );
    Ok(true)
}
