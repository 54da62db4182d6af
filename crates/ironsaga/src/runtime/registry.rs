//! Saga registration and the runtime that drives it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::RuntimeConfig;
use super::outbox_relay::{OutboxRelay, Transport};
use super::pipeline::{HandlerEntry, InboundDelivery, InboundPipeline};
use crate::envelope::MessageId;
use crate::error::{Error, Result};
use crate::handler::SagaMessageHandler;
use crate::mapper::InstanceMapper;
use crate::persistence::Persister;
use crate::saga::Saga;
use crate::store::{DeadLetter, DeadLetterQuery, OutboxRepository, Store};

/// Builder for constructing a [`SagaRuntime`].
///
/// # Example
///
/// ```ignore
/// let runtime = SagaRuntime::builder(store)
///     .register::<ShippingSaga, _, _>(KeySetMapper::new(), CrudPersister::new())
///     .register::<BillingSaga, _, _>(DirectMapper::new(), EventSourcedPersister::new())
///     .config(RuntimeConfig {
///         prefetch: 32,
///         ..Default::default()
///     })
///     .build()?;
/// ```
pub struct SagaRuntimeBuilder<S>
where
    S: Store + OutboxRepository,
{
    store: S,
    handlers: Vec<Box<dyn HandlerEntry<S>>>,
    persistence_keys: HashSet<&'static str>,
    duplicate_persistence_key: Option<String>,
    config: RuntimeConfig,
}

impl<S> SagaRuntimeBuilder<S>
where
    S: Store + OutboxRepository,
{
    fn new(store: S) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            persistence_keys: HashSet::new(),
            duplicate_persistence_key: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Register saga `G` with its mapping and persistence strategy.
    ///
    /// Each persistence key can only be registered once. Duplicates are
    /// reported by [`build`](Self::build).
    pub fn register<G, M, P>(mut self, mapper: M, persister: P) -> Self
    where
        G: Saga,
        M: InstanceMapper<G, S>,
        P: Persister<G, S>,
    {
        if !self.persistence_keys.insert(G::PERSISTENCE_KEY) {
            if self.duplicate_persistence_key.is_none() {
                self.duplicate_persistence_key = Some(G::PERSISTENCE_KEY.to_string());
            }
            return self;
        }

        let handler = SagaMessageHandler::<G, S, M, P>::new(self.store.clone(), mapper, persister);
        self.handlers.push(Box::new(handler));
        self
    }

    /// Set the runtime configuration.
    ///
    /// If not called, uses [`RuntimeConfig::default()`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SagaRuntime<S>> {
        if let Some(persistence_key) = self.duplicate_persistence_key {
            return Err(Error::DuplicatePersistenceKey(persistence_key));
        }

        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let pipeline = InboundPipeline::new(
            self.store.clone(),
            self.handlers,
            self.config.inbound_retry.clone(),
            self.config.message_timeout,
            self.config.prefetch,
        );

        Ok(SagaRuntime {
            store: self.store,
            pipeline,
            config: self.config,
            worker_id,
        })
    }
}

/// Saga runtime.
///
/// Consumes inbound deliveries through the [`InboundPipeline`] and publishes
/// the messages sagas produce through outbox relays.
///
/// # Lifecycle
///
/// 1. Create with [`SagaRuntime::builder(store)`](SagaRuntime::builder)
/// 2. Register sagas with [`SagaRuntimeBuilder::register()`]
/// 3. Configure with [`SagaRuntimeBuilder::config()`]
/// 4. Build with [`SagaRuntimeBuilder::build()`]
/// 5. Run with [`SagaRuntime::run()`]
#[derive(Clone)]
pub struct SagaRuntime<S>
where
    S: Store + OutboxRepository,
{
    store: S,
    pipeline: InboundPipeline<S>,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S> SagaRuntime<S>
where
    S: Store + OutboxRepository,
{
    /// Create a new runtime builder.
    pub fn builder(store: S) -> SagaRuntimeBuilder<S> {
        SagaRuntimeBuilder::new(store)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of registered sagas.
    pub fn saga_count(&self) -> usize {
        self.pipeline.saga_count()
    }

    /// The inbound pipeline, for transports that drive processing themselves.
    pub fn pipeline(&self) -> &InboundPipeline<S> {
        &self.pipeline
    }

    /// Process deliveries and relay the outbox until `shutdown` completes.
    ///
    /// # Shutdown Behavior
    ///
    /// When the shutdown future completes:
    /// 1. The pipeline stops taking deliveries and relays stop claiming
    /// 2. In-flight messages and publishes are finished
    /// 3. The call returns, at the latest after `shutdown_timeout`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (deliveries_tx, deliveries_rx) = tokio::sync::mpsc::channel(64);
    /// spawn_consumer(deliveries_tx);
    ///
    /// runtime
    ///     .run(deliveries_rx, Arc::new(transport), async { signal::ctrl_c().await.ok(); })
    ///     .await?;
    /// ```
    pub async fn run<T, F>(
        self,
        deliveries: mpsc::Receiver<InboundDelivery>,
        transport: Arc<T>,
        shutdown: F,
    ) -> Result<()>
    where
        T: Transport,
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let relay_count = self.config.outbox_workers.max(1);

        info!(
            worker_id = %self.worker_id,
            sagas = self.saga_count(),
            outbox_workers = relay_count,
            "Runtime starting"
        );

        let mut handles = Vec::new();

        let pipeline = self.pipeline.clone();
        let pipeline_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            pipeline.run(deliveries, pipeline_cancel).await;
        }));

        for i in 0..relay_count {
            let worker_id = if relay_count == 1 {
                format!("{}-outbox", self.worker_id)
            } else {
                format!("{}-outbox-{}", self.worker_id, i)
            };

            let relay = OutboxRelay::new(
                self.store.clone(),
                Arc::clone(&transport),
                self.config.clone(),
                worker_id,
            );
            let relay_shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                relay.run(relay_shutdown_rx).await;
            }));
        }

        shutdown.await;

        cancel.cancel();
        let _ = shutdown_tx.send(true);

        let shutdown_timeout = self.config.shutdown_timeout;
        let all_workers = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %self.worker_id, "Runtime stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        Ok(())
    }

    /// Fetch outbox messages that exhausted their delivery attempts.
    pub async fn fetch_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        self.store
            .fetch_dead_letters(query, self.config.outbox_retry.attempt_limit())
            .await
    }

    /// Reset a dead letter so relays deliver it again.
    ///
    /// Returns `Ok(false)` if the message was not found.
    pub async fn retry_dead_letter(&self, message_id: MessageId) -> Result<bool> {
        self.store.retry_dead_letter(message_id).await
    }
}
