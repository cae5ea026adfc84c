//! Background publisher that drains the outbox of scheduled social posts.

use crate::db;
use crate::integrations::SocialPublisher;
use crate::model::{OutboxKind, PostStatus};
use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// A post still failing after this many attempts is marked failed.
pub const MAX_PUBLISH_ATTEMPTS: i32 = 8;

/// Run one due task. Returns false when nothing was due.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    publishers: &[Arc<dyn SocialPublisher>],
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::next_due_outbox(pool).await? else {
        return Ok(false);
    };
    let (id, ref_id, attempt) = (task.id, task.ref_id, task.attempt);

    match task.kind {
        OutboxKind::PublishSocialPost => {
            let Some(post) = db::social_post(pool, ref_id).await? else {
                warn!(id, ref_id, "social post vanished; dropping task");
                db::delete_outbox(pool, id).await?;
                return Ok(true);
            };
            if post.status != PostStatus::Scheduled {
                info!(id, ref_id, status = post.status.as_str(), "post no longer scheduled");
                db::delete_outbox(pool, id).await?;
                return Ok(true);
            }
            let Some(publisher) = publishers.iter().find(|p| p.platform() == post.platform) else {
                warn!(id, platform = post.platform.as_str(), "no publisher configured");
                db::mark_social_post_failed(pool, ref_id, "no publisher configured").await?;
                db::delete_outbox(pool, id).await?;
                return Ok(true);
            };

            match publisher.publish(&post).await {
                Ok(external_id) => {
                    db::mark_social_post_published(pool, ref_id, &external_id).await?;
                    db::delete_outbox(pool, id).await?;
                    info!(id, ref_id, external_id, "social post published");
                }
                Err(err) if attempt + 1 >= MAX_PUBLISH_ATTEMPTS => {
                    error!(?err, id, ref_id, attempt, "social post failed permanently");
                    db::mark_social_post_failed(pool, ref_id, &format!("{err:#}")).await?;
                    db::delete_outbox(pool, id).await?;
                }
                Err(err) => {
                    warn!(?err, id, ref_id, attempt, "outbox task failed; backoff");
                    db::record_social_post_error(pool, ref_id, &format!("{err:#}")).await?;
                    db::backoff_outbox_with_cap(pool, id, attempt, max_backoff_secs).await?;
                }
            }
        }
    }
    Ok(true)
}

/// Poll the outbox until `shutdown` flips to true.
pub async fn run_worker(
    pool: SqlitePool,
    publishers: Vec<Arc<dyn SocialPublisher>>,
    poll_interval: Duration,
    max_backoff_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("outbox worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let sleep_for = match process_next_task(&pool, &publishers, max_backoff_secs).await {
            Ok(true) => continue,
            Ok(false) => poll_interval,
            Err(err) => {
                error!(?err, "outbox worker error");
                Duration::from_secs(1)
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("outbox worker stopped");
}
