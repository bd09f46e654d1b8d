use crate::sync::operations::OperationTracker;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Drives `poll_cycle` on a fixed interval. Coordination with other instances happens
/// only through the store, so running this in several processes is safe.
pub fn spawn_poll_loop(tracker: Arc<OperationTracker>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target = "resale.scheduler", interval_ms = interval.as_millis() as u64, "operation poll loop started");
        loop {
            ticker.tick().await;
            match tracker.poll_cycle(Utc::now()).await {
                Ok(summary) => {
                    for warning in &summary.warnings {
                        warn!(target = "resale.scheduler", %warning, "poll cycle warning");
                    }
                }
                Err(err) => warn!(target = "resale.scheduler", error = %err, "poll cycle failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListingStatus, OperationStatus};
    use crate::store::OperationStore;
    use crate::sync::operations::Mutation;
    use crate::sync::testkit::Harness;

    #[tokio::test]
    async fn loop_drives_operations_to_completion() {
        let h = Harness::new().await;
        let mapping = h.mapping(None, ListingStatus::Unlisted).await;
        let tracker = Arc::new(OperationTracker::new(
            h.store.clone(),
            h.mock.clone(),
            h.tokens.clone(),
            &h.config,
        ));
        let receipt = tracker
            .submit(
                h.seller,
                Mutation::Create {
                    local_item_id: mapping.local_item_id,
                    amount: 99.0,
                    currency: None,
                },
            )
            .await
            .unwrap();
        h.mock.complete_operation(&receipt.operation_id, None).await;

        let handle = spawn_poll_loop(tracker, Duration::from_millis(10));
        let mut status = OperationStatus::Queued;
        for _ in 0..100 {
            status = h
                .store
                .get_operation(&receipt.operation_id)
                .await
                .unwrap()
                .unwrap()
                .status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(status, OperationStatus::Completed);
        assert_eq!(h.reload(&mapping).await.listing_status, ListingStatus::Active);
    }
}
