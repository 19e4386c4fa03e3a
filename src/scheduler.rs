use crate::db::{self, Admission, Pool};
use crate::error::PipelineError;
use tracing::{error, info, instrument};

/// Admit at most one queued bundle per docset whose docset is free.
///
/// Call after every enqueue and after every terminal transition. Docsets are
/// independent: a refused admission for one does not stop the others.
#[instrument(skip_all)]
pub async fn admit(pool: &Pool) -> Result<Vec<i64>, PipelineError> {
    let mut admitted = Vec::new();
    for docset_id in db::queued_docsets(pool).await? {
        match db::admit_next_for_docset(pool, &docset_id).await? {
            Admission::Admitted(bundle_id) => {
                info!(bundle_id, docset_id = %docset_id, "bundle admitted");
                db::append_bundle_log(pool, bundle_id, "info", "admitted for processing").await?;
                admitted.push(bundle_id);
            }
            Admission::Idle => {}
            Admission::Conflict => {
                let err = PipelineError::SchedulingInvariant {
                    docset_id: docset_id.clone(),
                    message: "another bundle became live concurrently; admission rejected".into(),
                };
                error!(%err, "admission refused");
            }
        }
    }
    Ok(admitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BundleStatus;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn queue(pool: &Pool, docset: &str, export: &str) -> i64 {
        db::get_or_create_docset(pool, docset).await.unwrap();
        db::create_queued_bundle(pool, export, docset).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn docsets_are_scheduled_independently() {
        let pool = setup_pool().await;
        let a1 = queue(&pool, "ds-a", "a1").await;
        let a2 = queue(&pool, "ds-a", "a2").await;
        let b1 = queue(&pool, "ds-b", "b1").await;

        let mut admitted = admit(&pool).await.unwrap();
        admitted.sort();
        assert_eq!(admitted, vec![a1, b1]);
        assert!(admit(&pool).await.unwrap().is_empty());

        let a2_bundle = db::fetch_bundle(&pool, a2).await.unwrap().unwrap();
        assert_eq!(a2_bundle.status, BundleStatus::Queued);
    }

    #[tokio::test]
    async fn draft_holds_the_docset_until_terminal() {
        let pool = setup_pool().await;
        let a1 = queue(&pool, "ds-a", "a1").await;
        let a2 = queue(&pool, "ds-a", "a2").await;
        admit(&pool).await.unwrap();
        assert!(db::transition_bundle(&pool, a1, BundleStatus::Processing, BundleStatus::Draft)
            .await
            .unwrap());
        assert!(admit(&pool).await.unwrap().is_empty());

        assert!(db::transition_bundle(&pool, a1, BundleStatus::Draft, BundleStatus::Rejected)
            .await
            .unwrap());
        assert_eq!(admit(&pool).await.unwrap(), vec![a2]);
    }
}
