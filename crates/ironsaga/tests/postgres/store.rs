//! Integration tests for PgStore.

use std::collections::BTreeSet;
use std::time::Duration;

use ironsaga::store::{PgStore, Snapshot, instance_stream};
use ironsaga::{
    DeadLetterQuery, Envelope, Error, InstanceId, InstanceRepository, KeySetRepository, Message,
    MessageKind, MessageStore, NonEmpty, OutboxRepository, ProjectionStore, SnapshotRepository,
    Store, Transaction,
};
use serde_json::json;
use test_utils::db_test;

const TEST_LOCK_DURATION: Duration = Duration::from_secs(60);
const TEST_MAX_ATTEMPTS: u32 = 3;

fn envelopes(types: &[&str]) -> NonEmpty<Envelope> {
    let all: Vec<_> = types
        .iter()
        .map(|t| {
            Envelope::new(Message::from_parts(
                MessageKind::Event,
                *t,
                json!({ "type": t }),
            ))
        })
        .collect();
    NonEmpty::from_vec(all).expect("at least one type")
}

async fn append(
    store: &PgStore,
    stream: &str,
    expected: u64,
    types: &[&str],
) -> ironsaga::Result<()> {
    let mut tx = store.begin().await?;
    match store
        .append_messages(&mut tx, stream, expected, envelopes(types))
        .await
    {
        Ok(()) => tx.commit().await,
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

async fn read_all(
    store: &PgStore,
    stream: Option<&str>,
) -> anyhow::Result<Vec<(String, u64, u64)>> {
    let mut reader = match stream {
        Some(name) => store.open_stream(name, 0).await?.0,
        None => store.open_global(0),
    };
    let mut records = Vec::new();
    while reader.try_next().await? {
        let record = reader.get()?;
        records.push((
            record.envelope.message().message_type().to_owned(),
            record.stream_offset,
            record.global_offset,
        ));
    }
    Ok(records)
}

db_test!(appends_get_contiguous_stream_and_global_offsets, |pool| {
    let store = PgStore::new(pool.clone());

    append(&store, "a", 0, &["A0", "A1"]).await?;
    append(&store, "b", 0, &["B0"]).await?;
    append(&store, "a", 2, &["A2"]).await?;

    assert_eq!(store.stream_length("a").await?, 3);
    assert_eq!(store.stream_length("missing").await?, 0);

    let stream_a = read_all(&store, Some("a")).await?;
    assert_eq!(
        stream_a,
        [
            ("A0".to_owned(), 0, 0),
            ("A1".to_owned(), 1, 1),
            ("A2".to_owned(), 2, 3),
        ]
    );

    let global: Vec<_> = read_all(&store, None)
        .await?
        .into_iter()
        .map(|(t, _, g)| (t, g))
        .collect();
    assert_eq!(
        global,
        [
            ("A0".to_owned(), 0),
            ("A1".to_owned(), 1),
            ("B0".to_owned(), 2),
            ("A2".to_owned(), 3),
        ]
    );
    Ok(())
});

db_test!(stored_envelopes_read_back_unchanged, |pool| {
    let store = PgStore::new(pool.clone());
    let root = Envelope::new(Message::from_parts(
        MessageKind::Event,
        "OrderPlaced",
        json!({ "type": "OrderPlaced", "order_id": "o-1" }),
    ));
    let child = root
        .new_child(Message::from_parts(
            MessageKind::Command,
            "ChargeCard",
            json!({ "type": "ChargeCard" }),
        ))
        .with_delay(Duration::from_millis(1500));

    let mut tx = store.begin().await?;
    store
        .append_messages(
            &mut tx,
            "a",
            0,
            NonEmpty::from_vec(vec![root.clone(), child.clone()]).expect("two envelopes"),
        )
        .await?;
    tx.commit().await?;

    let mut reader = store.open_stream("a", 0).await?.0;
    let mut read = Vec::new();
    while reader.try_next().await? {
        read.push(reader.get()?.envelope.clone());
    }
    assert_eq!(read, [root, child]);
    Ok(())
});

db_test!(stale_append_is_rejected_without_writing, |pool| {
    let store = PgStore::new(pool.clone());
    append(&store, "a", 0, &["A0"]).await?;

    let err = append(&store, "a", 0, &["X"]).await.unwrap_err();
    match err {
        Error::OffsetConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected offset conflict, got {other}"),
    }

    assert_eq!(store.stream_length("a").await?, 1);
    // The failed transaction's global reservation was rolled back too.
    append(&store, "b", 0, &["B0"]).await?;
    let global = read_all(&store, None).await?;
    assert_eq!(global.last().map(|(_, _, g)| *g), Some(1));
    Ok(())
});

db_test!(concurrent_appenders_conflict, |pool| {
    let store = PgStore::new(pool.clone());

    let mut first = store.begin().await?;
    store
        .append_messages(&mut first, "a", 0, envelopes(&["First"]))
        .await?;

    let racing = {
        let store = store.clone();
        tokio::spawn(async move { append(&store, "a", 0, &["Second"]).await })
    };

    // Give the racing append time to block on the reservation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.commit().await?;

    let err = racing.await?.unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err}");
    assert_eq!(read_all(&store, Some("a")).await?.len(), 1);
    Ok(())
});

db_test!(instance_revisions_are_enforced, |pool| {
    let store = PgStore::new(pool.clone());
    let id = InstanceId::new("o-1");

    let mut tx = store.begin().await?;
    assert!(store.load_instance(&mut tx, "orders", &id).await?.is_none());
    store
        .save_instance(&mut tx, "orders", &id, 0, &json!({ "step": 1 }))
        .await?;
    tx.commit().await?;

    let mut tx = store.begin().await?;
    let err = store
        .save_instance(&mut tx, "orders", &id, 0, &json!({ "step": 1 }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RevisionConflict {
            expected: 0,
            actual: Some(1),
            ..
        }
    ));
    tx.rollback().await?;

    let mut tx = store.begin().await?;
    store
        .save_instance(&mut tx, "orders", &id, 1, &json!({ "step": 2 }))
        .await?;
    let stored = store
        .load_instance(&mut tx, "orders", &id)
        .await?
        .expect("saved instance");
    assert_eq!(stored.revision, 2);
    assert_eq!(stored.data, json!({ "step": 2 }));

    let err = store
        .delete_instance(&mut tx, "orders", &id, 1)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    tx.rollback().await?;

    let mut tx = store.begin().await?;
    store.delete_instance(&mut tx, "orders", &id, 1).await?;
    tx.commit().await?;

    let mut tx = store.begin().await?;
    assert!(store.load_instance(&mut tx, "orders", &id).await?.is_none());
    Ok(())
});

db_test!(key_sets_are_disjoint_per_persistence_key, |pool| {
    let store = PgStore::new(pool.clone());
    let a = InstanceId::new("a");
    let b = InstanceId::new("b");
    let keys = |ks: &[&str]| ks.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>();

    let mut tx = store.begin().await?;
    store
        .replace_keys(&mut tx, "ship", &a, &keys(&["k1", "k2"]))
        .await?;
    tx.commit().await?;

    let mut tx = store.begin().await?;
    let err = store
        .replace_keys(&mut tx, "ship", &b, &keys(&["k2", "k3"]))
        .await
        .unwrap_err();
    match err {
        Error::KeyCollision { key, owner, .. } => {
            assert_eq!(key, "k2");
            assert_eq!(owner, Some(a.clone()));
        }
        other => panic!("expected key collision, got {other}"),
    }
    tx.rollback().await?;

    let mut tx = store.begin().await?;
    store
        .replace_keys(&mut tx, "billing", &b, &keys(&["k2"]))
        .await?;
    store.replace_keys(&mut tx, "ship", &a, &keys(&["k2"])).await?;
    assert_eq!(store.find_instance_by_key(&mut tx, "ship", "k1").await?, None);
    assert_eq!(
        store.find_instance_by_key(&mut tx, "ship", "k2").await?,
        Some(a.clone())
    );
    assert_eq!(
        store.find_instance_by_key(&mut tx, "billing", "k2").await?,
        Some(b.clone())
    );

    store.delete_keys(&mut tx, "ship", &a).await?;
    assert_eq!(store.find_instance_by_key(&mut tx, "ship", "k2").await?, None);
    tx.commit().await?;
    Ok(())
});

db_test!(latest_snapshot_wins_until_deleted, |pool| {
    let store = PgStore::new(pool.clone());
    let id = InstanceId::new("s-1");

    let mut tx = store.begin().await?;
    for revision in [2, 5] {
        let snapshot = Snapshot {
            revision,
            data: json!({ "revision": revision }),
        };
        store.save_snapshot(&mut tx, "ship", &id, snapshot).await?;
    }
    let latest = store
        .load_snapshot(&mut tx, "ship", &id)
        .await?
        .expect("snapshot");
    assert_eq!(latest.revision, 5);

    store.delete_snapshots(&mut tx, "ship", &id).await?;
    assert!(store.load_snapshot(&mut tx, "ship", &id).await?.is_none());
    tx.commit().await?;
    Ok(())
});

db_test!(outbox_claims_retries_and_dead_letters, |pool| {
    let store = PgStore::new(pool.clone());
    let batch = envelopes(&["Charge", "Ship"]);
    let cause = batch.head.message_id();

    let mut tx = store.begin().await?;
    store.enqueue_outbox(&mut tx, cause, batch).await?;
    tx.commit().await?;

    let charge = store
        .claim_outbox_message("w1", TEST_LOCK_DURATION, TEST_MAX_ATTEMPTS)
        .await?
        .expect("first message");
    assert_eq!(charge.envelope.message().message_type(), "Charge");
    assert_eq!(charge.causation_id, cause);
    assert_eq!(charge.attempts, 0);

    // The locked message is skipped.
    let ship = store
        .claim_outbox_message("w2", TEST_LOCK_DURATION, TEST_MAX_ATTEMPTS)
        .await?
        .expect("second message");
    assert_eq!(ship.envelope.message().message_type(), "Ship");
    store.mark_delivered(ship.envelope.message_id()).await?;

    store
        .record_delivery_failure(charge.envelope.message_id(), "timeout", Duration::ZERO)
        .await?;
    let again = store
        .claim_outbox_message("w1", TEST_LOCK_DURATION, TEST_MAX_ATTEMPTS)
        .await?
        .expect("retried message");
    assert_eq!(again.attempts, 1);

    store
        .record_permanent_failure(again.envelope.message_id(), "rejected", TEST_MAX_ATTEMPTS)
        .await?;
    assert!(
        store
            .claim_outbox_message("w1", TEST_LOCK_DURATION, TEST_MAX_ATTEMPTS)
            .await?
            .is_none()
    );

    let dead = store
        .fetch_dead_letters(&DeadLetterQuery::new().message_type("Charge"), TEST_MAX_ATTEMPTS)
        .await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("rejected"));
    assert!(
        store
            .fetch_dead_letters(&DeadLetterQuery::new().message_type("Ship"), TEST_MAX_ATTEMPTS)
            .await?
            .is_empty()
    );

    assert!(store.retry_dead_letter(again.envelope.message_id()).await?);
    assert!(!store.retry_dead_letter(ship.envelope.message_id()).await?);
    let revived = store
        .claim_outbox_message("w1", TEST_LOCK_DURATION, TEST_MAX_ATTEMPTS)
        .await?
        .expect("revived message");
    assert_eq!(revived.attempts, 0);
    Ok(())
});

db_test!(delayed_outbox_messages_wait_for_send_at, |pool| {
    let store = PgStore::new(pool.clone());
    let later = Envelope::new(Message::from_parts(MessageKind::Command, "Remind", json!({})))
        .with_delay(Duration::from_secs(3600));

    let mut tx = store.begin().await?;
    store
        .enqueue_outbox(&mut tx, later.message_id(), NonEmpty::new(later))
        .await?;
    tx.commit().await?;

    assert!(
        store
            .claim_outbox_message("w1", TEST_LOCK_DURATION, TEST_MAX_ATTEMPTS)
            .await?
            .is_none()
    );
    Ok(())
});

db_test!(projection_positions_persist, |pool| {
    let store = PgStore::new(pool.clone());

    assert_eq!(store.load_projection_position("orders-view").await?, 0);
    store.store_projection_position("orders-view", 7).await?;
    store.store_projection_position("orders-view", 9).await?;
    assert_eq!(store.load_projection_position("orders-view").await?, 9);
    assert_eq!(store.load_projection_position("other").await?, 0);
    Ok(())
});

db_test!(instance_streams_are_named_by_key_and_id, |pool| {
    let store = PgStore::new(pool.clone());
    let stream = instance_stream("shipments", &InstanceId::new("shp-1"));
    append(&store, &stream, 0, &["ShipmentOpened"]).await?;

    let (_, exists) = store.open_stream("shipments:shp-1", 0).await?;
    assert!(exists);
    Ok(())
});
