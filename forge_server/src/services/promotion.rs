//! Image promotion — make a tested candidate the production image.

use anyhow::{Context, Result};

use crate::cloud::CloudProvider;
use crate::metrics;

/// Replace whatever currently bears `target_name` with the candidate.
///
/// The image store forbids two images sharing one name, so this is
/// delete-then-rename: a brief window exists with zero production
/// images, and a crash between the two steps leaves production absent
/// until the next successful promotion. Callers treat a failure here as
/// a critical, operator-visible event.
pub async fn promote_image(
    cloud: &dyn CloudProvider,
    candidate_id: &str,
    target_name: &str,
) -> Result<()> {
    // Zero existing matches is the normal first-promotion case.
    if let Err(e) = cloud.delete_images_by_name(target_name).await {
        tracing::warn!(
            target = target_name,
            "failed to delete previous production image (continuing): {e:#}"
        );
    }

    cloud
        .rename_image(candidate_id, target_name)
        .await
        .with_context(|| format!("renaming candidate {candidate_id} to '{target_name}'"))?;

    metrics::image_promoted();
    tracing::info!(candidate = candidate_id, name = target_name, "image promoted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockCloud;

    #[tokio::test]
    async fn promotion_replaces_existing_production_image() {
        let cloud = MockCloud::new();
        cloud.seed_image("img-old", "web01");
        cloud.seed_image("img-new", "web01-candidate");

        promote_image(&cloud, "img-new", "web01").await.unwrap();

        let production = cloud.image_named("web01").unwrap();
        assert_eq!(production.id, "img-new");
        assert!(cloud.image_named("web01-candidate").is_none());
        // The stale image is gone entirely, not renamed aside.
        assert!(cloud.images().iter().all(|i| i.id != "img-old"));
    }

    #[tokio::test]
    async fn promotion_tolerates_absent_production_image() {
        let cloud = MockCloud::new();
        cloud.seed_image("img-new", "web01-candidate");

        promote_image(&cloud, "img-new", "web01").await.unwrap();

        assert_eq!(cloud.image_named("web01").unwrap().id, "img-new");
    }

    #[tokio::test]
    async fn rename_failure_is_an_error() {
        let cloud = MockCloud::new();
        // Candidate was never uploaded; rename has nothing to act on.
        let err = promote_image(&cloud, "img-missing", "web01").await.unwrap_err();
        assert!(format!("{err:#}").contains("img-missing"));
    }
}
