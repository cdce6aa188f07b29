use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::pipeline::IngestionPipeline;

/// Periodic absence sweep: closes stale presences, evicts silent devices
/// and flags silent anchors offline.
pub struct Reaper {
    pipeline: Arc<IngestionPipeline>,
    interval_ms: u64,
}

impl Reaper {
    pub fn new(pipeline: Arc<IngestionPipeline>, interval_ms: u64) -> Self {
        Reaper {
            pipeline,
            interval_ms,
        }
    }

    pub async fn run(&self, running: Arc<AtomicBool>) -> Result<()> {
        let interval_ms = if self.interval_ms == 0 {
            warn!("Reaper interval of 0ms configured, using 1000ms");
            1000
        } else {
            self.interval_ms
        };

        info!("Starting reaper, interval: {}ms", interval_ms);

        while running.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(interval_ms)).await;

            let summary = self.pipeline.reap(Utc::now());
            if summary.is_empty() {
                debug!("Reaper sweep: nothing to do");
            }
        }

        info!("Reaper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::SiteRegistry;
    use crate::validation::RawObservation;

    #[tokio::test]
    async fn test_reaper_closes_presence_and_stops() {
        let mut config = Config::default();
        config.presence.absence_timeout_secs = 0;

        let registry = Arc::new(SiteRegistry::sample());
        let pipeline = Arc::new(IngestionPipeline::new(config, registry.clone(), registry));

        let old = Utc::now() - chrono::Duration::seconds(5);
        pipeline.ingest_batch_at(
            &[RawObservation {
                anchor_id: Some("B8:27:EB:00:00:01".to_string()),
                device_address: Some("AA:BB:CC:00:00:01".to_string()),
                signal_strength: Some(-60.0),
                timestamp: None,
            }],
            old,
        );
        assert_eq!(pipeline.open_presences().len(), 1);

        let running = Arc::new(AtomicBool::new(true));
        let reaper = Reaper::new(pipeline.clone(), 10);
        let flag = running.clone();
        let handle = tokio::spawn(async move { reaper.run(flag).await });

        sleep(Duration::from_millis(100)).await;
        running.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();

        assert!(pipeline.open_presences().is_empty());
        assert_eq!(pipeline.presence_history(1).len(), 1);
    }
}
