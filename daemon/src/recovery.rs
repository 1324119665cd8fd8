use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument};

use crate::error::Result;
use crate::persistence::{BuildOutcome, BuildStore};

pub const STALE_BUILD_ERROR: &str = "daemon restarted: stale build";

/// Default staleness horizon; older orphaned rows are left untouched.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(24 * 3600);

/// Reconcile store-observed live builds with reality, once, at startup and
/// before the RPC listener accepts connections. After a crash the process
/// has no executors, so any build the store still thinks is live is dead.
#[instrument(skip(store))]
pub async fn reconcile(store: &dyn BuildStore, horizon: Duration) -> Result<usize> {
    let stale = store.stale_builds(horizon).await?;
    if stale.is_empty() {
        return Ok(0);
    }

    info!(count = stale.len(), "closing stale builds from a previous run");

    let mut closed = 0;
    for build in stale {
        let since = build.started_at.unwrap_or(build.created_at);
        let duration = (Utc::now() - since)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let outcome = BuildOutcome::failed(1, duration, STALE_BUILD_ERROR);
        match store.complete(&build.id, &outcome).await {
            Ok(()) => {
                info!(build_id = %build.id, "marked stale build as failed");
                closed += 1;
            }
            Err(err) => error!(
                error = &err as &dyn std::error::Error,
                build_id = %build.id,
                "failed to close stale build"
            ),
        }
    }

    Ok(closed)
}

#[cfg(test)]
mod tests {
    use crate::persistence::{tests::fixture, BuildFilter, BuildStatus, Persistence};

    use super::*;

    #[tokio::test]
    async fn stale_builds_are_closed_with_restart_error() {
        let store = Persistence::new_in_memory().await.unwrap();

        let queued = fixture("acme-00000001", "acme");
        store.create(&queued).await.unwrap();

        let running = fixture("acme-00000002", "acme");
        store.create(&running).await.unwrap();
        store.start(&running.id).await.unwrap();

        let done = fixture("acme-00000003", "acme");
        store.create(&done).await.unwrap();
        store.start(&done.id).await.unwrap();
        store
            .complete(&done.id, &BuildOutcome::completed(Duration::from_secs(1)))
            .await
            .unwrap();

        let closed = reconcile(&store, DEFAULT_HORIZON).await.unwrap();
        assert_eq!(closed, 2);

        for id in ["acme-00000001", "acme-00000002"] {
            let build = store.get(id).await.unwrap();
            assert_eq!(build.status, BuildStatus::Failed);
            assert_eq!(build.exit_code, Some(1));
            assert!(build
                .error_message
                .as_deref()
                .unwrap()
                .contains("daemon restarted"));
        }

        // The completed build is untouched.
        assert_eq!(
            store.get("acme-00000003").await.unwrap().status,
            BuildStatus::Completed
        );

        // Recovery converges: a second pass finds nothing.
        assert_eq!(reconcile(&store, DEFAULT_HORIZON).await.unwrap(), 0);
        assert!(store
            .stale_builds(DEFAULT_HORIZON)
            .await
            .unwrap()
            .is_empty());

        // And the closed builds are still listed.
        assert_eq!(store.list(&BuildFilter::default()).await.unwrap().len(), 3);
    }
}
