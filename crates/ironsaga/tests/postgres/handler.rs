//! Saga handling on top of PgStore.

use ironsaga::store::{PgStore, instance_stream};
use ironsaga::{
    CrudPersister, DeadLetterQuery, DirectMapper, Error, EventSourcedPersister, HandleOutcome,
    InstanceId, InstanceRepository, KeySetMapper, KeySetRepository, MessageStore,
    OutboxRepository, SagaMessageHandler, SnapshotRepository, Store, Transaction,
};
use test_utils::db_test;

use crate::support::orders::{self, OrderSaga};
use crate::support::shipments::{self, ShipmentSaga};
use crate::support::{event, message_types};

fn orders(store: &PgStore) -> SagaMessageHandler<OrderSaga, PgStore, DirectMapper, CrudPersister> {
    SagaMessageHandler::new(store.clone(), DirectMapper, CrudPersister)
}

fn shipments(
    store: &PgStore,
) -> SagaMessageHandler<ShipmentSaga, PgStore, KeySetMapper, EventSourcedPersister> {
    SagaMessageHandler::new(
        store.clone(),
        KeySetMapper,
        EventSourcedPersister::new().with_snapshot_threshold(1),
    )
}

async fn outbox_types(store: &PgStore) -> anyhow::Result<Vec<String>> {
    let mut claimed = Vec::new();
    while let Some(message) = store
        .claim_outbox_message("test", std::time::Duration::from_secs(60), 5)
        .await?
    {
        store.mark_delivered(message.envelope.message_id()).await?;
        claimed.push(message.envelope);
    }
    Ok(message_types(&claimed))
}

db_test!(crud_order_runs_to_completion, |pool| {
    let store = PgStore::new(pool.clone());
    let handler = orders(&store);
    let id = InstanceId::new("o-1");

    let placed = handler.handle(&event(&orders::placed("o-1", 990))).await?;
    assert_eq!(
        placed,
        HandleOutcome::Saved {
            instance_id: id.clone(),
            revision: 1,
        }
    );

    // A duplicate placement changes nothing.
    let duplicate = handler.handle(&event(&orders::placed("o-1", 990))).await?;
    assert_eq!(
        duplicate,
        HandleOutcome::Unchanged {
            instance_id: id.clone(),
            revision: 1,
        }
    );

    handler.handle(&event(&orders::paid("o-1"))).await?;
    let shipped = handler.handle(&event(&orders::shipped("o-1"))).await?;
    assert!(matches!(shipped, HandleOutcome::Completed { revision: 3, .. }));

    let mut tx = store.begin().await?;
    assert!(store.load_instance(&mut tx, "orders", &id).await?.is_none());
    tx.commit().await?;

    assert_eq!(outbox_types(&store).await?, ["ChargeCard", "ShipOrder"]);
    Ok(())
});

db_test!(non_trigger_without_instance_is_not_found, |pool| {
    let store = PgStore::new(pool.clone());

    let outcome = orders(&store).handle(&event(&orders::paid("nope"))).await?;
    assert!(matches!(outcome, HandleOutcome::NotFound { .. }));
    assert!(outbox_types(&store).await?.is_empty());
    Ok(())
});

db_test!(concurrent_handlers_conflict_on_revision, |pool| {
    let store = PgStore::new(pool.clone());
    let handler = orders(&store);
    handler.handle(&event(&orders::placed("o-1", 10))).await?;

    let mut first = store.begin().await?;
    handler
        .handle_in_tx(&mut first, &event(&orders::paid("o-1")))
        .await?;

    let racing = {
        let store = store.clone();
        tokio::spawn(async move { orders(&store).handle(&event(&orders::paid("o-1"))).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    first.commit().await?;

    let err = racing.await?.unwrap_err();
    assert!(matches!(err, Error::RevisionConflict { .. }), "unexpected error: {err}");
    Ok(())
});

db_test!(event_sourced_shipment_completes_and_keeps_history, |pool| {
    let store = PgStore::new(pool.clone());
    let handler = shipments(&store);
    let id = InstanceId::new("shp-s-1");

    handler.handle(&event(&shipments::requested("s-1"))).await?;
    handler
        .handle(&event(&shipments::label_printed("s-1", "TRK-1")))
        .await?;
    let scanned = handler.handle(&event(&shipments::scanned("TRK-1"))).await?;
    assert!(matches!(scanned, HandleOutcome::Saved { revision: 3, .. }));

    let mut tx = store.begin().await?;
    assert!(
        store
            .load_snapshot(&mut tx, "shipments", &id)
            .await?
            .is_some()
    );
    tx.commit().await?;

    let done = handler.handle(&event(&shipments::delivered("TRK-1"))).await?;
    assert_eq!(
        done,
        HandleOutcome::Completed {
            instance_id: id.clone(),
            revision: 4,
        }
    );

    let mut tx = store.begin().await?;
    assert!(
        store
            .load_snapshot(&mut tx, "shipments", &id)
            .await?
            .is_none()
    );
    assert_eq!(
        store
            .find_instance_by_key(&mut tx, "shipments", &shipments::tracking_key("TRK-1"))
            .await?,
        None
    );
    tx.commit().await?;

    assert_eq!(
        store.stream_length(&instance_stream("shipments", &id)).await?,
        4
    );
    let again = handler.handle(&event(&shipments::requested("s-1"))).await?;
    assert_eq!(again, HandleOutcome::AlreadyComplete { instance_id: id });

    assert!(
        store
            .fetch_dead_letters(&DeadLetterQuery::new(), 1)
            .await?
            .is_empty()
    );
    Ok(())
});

db_test!(colliding_keys_roll_back_the_message, |pool| {
    let store = PgStore::new(pool.clone());
    let handler = shipments(&store);

    handler.handle(&event(&shipments::requested("s-1"))).await?;
    handler.handle(&event(&shipments::requested("s-2"))).await?;
    handler
        .handle(&event(&shipments::label_printed("s-1", "TRK-1")))
        .await?;

    let err = handler
        .handle(&event(&shipments::label_printed("s-2", "TRK-1")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyCollision { .. }), "unexpected error: {err}");

    let s2 = InstanceId::new("shp-s-2");
    assert_eq!(
        store.stream_length(&instance_stream("shipments", &s2)).await?,
        1
    );
    Ok(())
});

db_test!(joined_transaction_replays_its_own_events, |pool| {
    let store = PgStore::new(pool.clone());
    let handler = shipments(&store);
    let id = InstanceId::new("shp-s-9");

    let mut tx = store.begin().await?;
    handler
        .handle_in_tx(&mut tx, &event(&shipments::requested("s-9")))
        .await?;
    let labelled = handler
        .handle_in_tx(&mut tx, &event(&shipments::label_printed("s-9", "TRK-9")))
        .await?;
    assert_eq!(
        labelled,
        HandleOutcome::Saved {
            instance_id: id.clone(),
            revision: 2,
        }
    );
    let scanned = handler
        .handle_in_tx(&mut tx, &event(&shipments::scanned("TRK-9")))
        .await?;
    assert!(matches!(scanned, HandleOutcome::Saved { revision: 3, .. }));
    tx.commit().await?;

    assert_eq!(
        store.stream_length(&instance_stream("shipments", &id)).await?,
        3
    );
    Ok(())
});

db_test!(concurrent_event_sourced_messages_fit_in_a_small_pool, |pool| {
    // Replays run on the handling transaction, so each message needs one
    // connection even when every pooled connection is in use.
    let store = PgStore::new(pool.clone());
    let size = pool.options().get_max_connections() as usize;

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..size * 2 {
        let store = store.clone();
        tasks.spawn(async move {
            shipments(&store)
                .handle(&event(&shipments::requested(&format!("s-{n}"))))
                .await
        });
    }
    while let Some(outcome) = tasks.join_next().await {
        assert!(matches!(outcome??, HandleOutcome::Saved { revision: 1, .. }));
    }
    Ok(())
});

