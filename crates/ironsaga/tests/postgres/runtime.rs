//! SagaRuntime driven end to end over PgStore.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ironsaga::store::PgStore;
use ironsaga::{
    Acknowledgement, CrudPersister, DeadLetterQuery, DirectMapper, Envelope, EventSourcedPersister,
    InboundDelivery, KeySetMapper, Message, MessageKind, RetryPolicy, RuntimeConfig, SagaRuntime,
    Transport,
};
use serde_json::json;
use test_utils::db_test;
use tokio::sync::{mpsc, oneshot};

use crate::support::orders::{self, OrderSaga};
use crate::support::shipments::ShipmentSaga;
use crate::support::{DEFAULT_TEST_TIMEOUT, event, eventually, init_test_tracing, message_types};

/// Records every publish, failing all of them while `failing` is set.
#[derive(Default)]
struct TestTransport {
    failing: bool,
    published: Mutex<Vec<Envelope>>,
}

impl TestTransport {
    fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    fn published(&self) -> Vec<String> {
        message_types(&self.published.lock().unwrap())
    }
}

#[async_trait]
impl Transport for TestTransport {
    type Error = String;

    async fn publish(&self, envelope: &Envelope) -> Result<(), String> {
        if self.failing {
            return Err("broker unavailable".into());
        }
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        outbox_poll_interval: Duration::from_millis(10),
        outbox_retry: RetryPolicy {
            immediate_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: Some(2),
        },
        outbox_workers: 2,
        worker_id: Some("pg-test".into()),
        ..Default::default()
    }
}

fn runtime(store: &PgStore) -> anyhow::Result<SagaRuntime<PgStore>> {
    Ok(SagaRuntime::builder(store.clone())
        .register::<OrderSaga, _, _>(DirectMapper, CrudPersister)
        .register::<ShipmentSaga, _, _>(KeySetMapper, EventSourcedPersister::new())
        .config(test_config())
        .build()?)
}

struct Running {
    deliveries: mpsc::Sender<InboundDelivery>,
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<ironsaga::Result<()>>,
}

impl Running {
    fn start(runtime: SagaRuntime<PgStore>, transport: Arc<TestTransport>) -> Self {
        init_test_tracing();
        let (deliveries, deliveries_rx) = mpsc::channel(16);
        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(runtime.run(deliveries_rx, transport, async {
            let _ = stop_rx.await;
        }));
        Self {
            deliveries,
            stop,
            handle,
        }
    }

    async fn deliver(&self, envelope: Envelope) -> anyhow::Result<Acknowledgement> {
        let (delivery, ack) = InboundDelivery::new(envelope, 1);
        self.deliveries.send(delivery).await?;
        Ok(tokio::time::timeout(DEFAULT_TEST_TIMEOUT, ack).await??)
    }

    async fn stop(self) -> anyhow::Result<()> {
        let _ = self.stop.send(());
        self.handle.await??;
        Ok(())
    }
}

db_test!(deliveries_are_acked_and_commands_published, |pool| {
    let store = PgStore::new(pool.clone());
    let transport = Arc::new(TestTransport::default());
    let running = Running::start(runtime(&store)?, Arc::clone(&transport));

    for message in [
        orders::placed("o-1", 1500),
        orders::paid("o-1"),
        orders::shipped("o-1"),
    ] {
        assert_eq!(running.deliver(event(&message)).await?, Acknowledgement::Ack);
    }

    let published = eventually(DEFAULT_TEST_TIMEOUT, || {
        let transport = Arc::clone(&transport);
        async move { transport.published().len() == 2 }
    })
    .await;
    assert!(published, "outbox not relayed: {:?}", transport.published());
    assert_eq!(transport.published(), ["ChargeCard", "ShipOrder"]);

    running.stop().await
});

db_test!(undecodable_messages_are_rejected, |pool| {
    let store = PgStore::new(pool.clone());
    let running = Running::start(runtime(&store)?, Arc::new(TestTransport::default()));

    let broken = Envelope::new(Message::from_parts(
        MessageKind::Event,
        "OrderPlaced",
        json!({ "type": "OrderPlaced" }),
    ));
    let ack = running.deliver(broken).await?;
    assert!(matches!(ack, Acknowledgement::Reject(_)), "unexpected ack: {ack:?}");

    // Types no saga declares are acknowledged and dropped.
    let unknown = Envelope::new(Message::from_parts(
        MessageKind::Event,
        "InvoiceSent",
        json!({ "type": "InvoiceSent" }),
    ));
    assert_eq!(running.deliver(unknown).await?, Acknowledgement::Ack);

    running.stop().await
});

db_test!(failed_publishes_end_up_as_dead_letters, |pool| {
    let store = PgStore::new(pool.clone());
    let runtime = runtime(&store)?;
    let running = Running::start(runtime.clone(), Arc::new(TestTransport::failing()));

    let placed = event(&orders::placed("o-1", 700));
    assert_eq!(running.deliver(placed.clone()).await?, Acknowledgement::Ack);

    let dead = eventually(DEFAULT_TEST_TIMEOUT, || {
        let runtime = runtime.clone();
        async move {
            runtime
                .fetch_dead_letters(&DeadLetterQuery::new())
                .await
                .is_ok_and(|letters| letters.len() == 1)
        }
    })
    .await;
    assert!(dead, "command never dead-lettered");
    running.stop().await?;

    let letters = runtime
        .fetch_dead_letters(&DeadLetterQuery::new().causation_id(placed.message_id()))
        .await?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].envelope.message().message_type(), "ChargeCard");
    assert_eq!(letters[0].attempts, 2);
    assert_eq!(letters[0].last_error.as_deref(), Some("broker unavailable"));

    // Requeue and relay with a healthy transport.
    assert!(
        runtime
            .retry_dead_letter(letters[0].envelope.message_id())
            .await?
    );
    assert!(
        runtime
            .fetch_dead_letters(&DeadLetterQuery::new())
            .await?
            .is_empty()
    );

    let transport = Arc::new(TestTransport::default());
    let running = Running::start(runtime, Arc::clone(&transport));
    let published = eventually(DEFAULT_TEST_TIMEOUT, || {
        let transport = Arc::clone(&transport);
        async move { !transport.published().is_empty() }
    })
    .await;
    assert!(published, "requeued command not relayed");
    assert_eq!(transport.published(), ["ChargeCard"]);

    running.stop().await
});
