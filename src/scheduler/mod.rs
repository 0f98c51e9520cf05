use crate::pipeline::{Pipeline, RefreshOutcome};
use crate::scraper::ReservationSource;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

/// Runs `pipeline.refresh()` every `period` until ctrl-c. A refresh that
/// outlasts its period delays the next tick instead of overlapping it.
pub async fn run_periodic<S>(pipeline: &Pipeline<S>, period: Duration)
where
    S: ReservationSource + ?Sized,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(?period, "watching for new slots");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }

        match pipeline.refresh().await {
            Ok(RefreshOutcome::Completed(report)) => {
                info!(new_slots = report.new_slots, notified = report.notified_subscribers, "refresh complete");
            }
            Ok(RefreshOutcome::Skipped) => warn!("previous refresh still running"),
            Err(e) => error!(error = %e, "refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, ScraperConfig};
    use crate::notify::recording::RecordingNotifier;
    use crate::scraper::fake::{FakeSource, listing_html};
    use crate::storage::StateStore;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_drive_sequential_refreshes() {
        let source = Arc::new(FakeSource::default().with_page(1, listing_html(&[("1", "테니스장")], None)));
        let pipeline = Pipeline::new(
            Arc::clone(&source),
            StateStore::in_memory(),
            Arc::new(RecordingNotifier::default()),
            &ScraperConfig::default(),
            PipelineConfig::default(),
        );

        // first tick fires immediately, the second after one period
        let _ = tokio::time::timeout(
            Duration::from_secs(90),
            run_periodic(&pipeline, Duration::from_secs(60)),
        )
        .await;

        assert_eq!(source.listing_fetches(), 4);
    }
}
