use super::BatchProcessor;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Polling loop around a [`BatchProcessor`].
///
/// Cancellation is observed at the top of each iteration and while sleeping.
/// A batch already in flight always finishes (commit or rollback) first.
pub struct IngestWorker {
    processor: Arc<BatchProcessor>,
    poll_interval: Duration,
}

impl IngestWorker {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        let poll_interval = processor.config().poll_interval;
        Self {
            processor,
            poll_interval,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let component = self.processor.config().checkpoint_name.clone();
        info!(
            %component,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.processor.config().batch_size,
            "ingest worker started"
        );

        while !token.is_cancelled() {
            match self.processor.process_batch().await {
                // Keep draining while there is a backlog.
                Ok(count) if count > 0 => continue,
                Ok(_) => {}
                // Same retry policy for both kinds; a rejected record blocks the
                // checkpoint until it is fixed upstream.
                Err(err) if err.is_validation() => {
                    error!(%component, error = %err, "batch rejected, will retry");
                }
                Err(err) => {
                    warn!(%component, error = %err, "batch failed, will retry");
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(
            %component,
            processed = self.processor.processed_total(),
            "ingest worker stopped"
        );
    }
}
