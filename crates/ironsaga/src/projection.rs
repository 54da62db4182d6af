//! Projection infrastructure.
//!
//! A projection follows the global log and builds a read model from it. The
//! position of each projection is checkpointed in the store after every
//! record, so a restarted worker resumes where it stopped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::store::{MessageStore, ProjectionStore, StreamRecord};

/// Type alias for boxed futures (object-safe async).
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Projection handler trait.
pub trait Projection: Send + Sync + 'static {
    /// Projection identifier used for checkpointing.
    fn name(&self) -> &'static str;

    /// Apply a record of the global log to the projection.
    fn handle<'a>(&'a self, record: &'a StreamRecord) -> BoxFuture<'a, Result<()>>;
}

/// Configuration for projection workers.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// How often to poll for new records.
    pub poll_interval: Duration,
    /// Maximum number of records applied per poll.
    pub batch_size: u32,
    /// Base delay for retry backoff after projection failures.
    pub error_backoff_base: Duration,
    /// Maximum delay for retry backoff after projection failures.
    pub error_backoff_max: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            error_backoff_base: Duration::from_millis(200),
            error_backoff_max: Duration::from_secs(5),
        }
    }
}

impl ProjectionConfig {
    fn error_backoff_duration(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.saturating_sub(1));
        let delay = self.error_backoff_base.saturating_mul(multiplier);
        delay.min(self.error_backoff_max)
    }
}

/// Worker that applies a projection in global order.
pub struct ProjectionWorker<S, P>
where
    S: MessageStore + ProjectionStore,
    P: Projection,
{
    store: S,
    projection: Arc<P>,
    config: ProjectionConfig,
    worker_id: String,
}

impl<S, P> ProjectionWorker<S, P>
where
    S: MessageStore + ProjectionStore,
    P: Projection,
{
    pub fn new(store: S, projection: Arc<P>, config: ProjectionConfig, worker_id: String) -> Self {
        Self {
            store,
            projection,
            config,
            worker_id,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        info!(
            worker_id = %self.worker_id,
            projection = self.projection.name(),
            "Projection worker started"
        );

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.process_batch().await {
                        Ok(_) => {
                            failures = 0;
                        }
                        Err(err) => {
                            failures = failures.saturating_add(1);
                            let backoff = self.config.error_backoff_duration(failures);
                            error!(
                                worker_id = %self.worker_id,
                                projection = self.projection.name(),
                                error = %err,
                                failures,
                                backoff_ms = backoff.as_millis(),
                                "Projection failed, backing off"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            projection = self.projection.name(),
            "Projection worker shutting down"
        );
        Ok(())
    }

    /// Apply up to `batch_size` records past the checkpoint.
    ///
    /// Returns the number of records applied.
    pub async fn process_batch(&self) -> Result<usize> {
        let name = self.projection.name();
        let position = self.store.load_projection_position(name).await?;
        let mut reader = self.store.open_global(position);
        let mut applied = 0;

        while applied < self.config.batch_size as usize && reader.try_next().await? {
            let record = reader.get()?;
            self.projection.handle(record).await?;

            let next_position = record.global_offset + 1;
            self.store
                .store_projection_position(name, next_position)
                .await?;
            applied += 1;
            debug!(
                projection = name,
                global_offset = record.global_offset,
                "Projection advanced"
            );
        }

        reader.close();
        Ok(applied)
    }
}
