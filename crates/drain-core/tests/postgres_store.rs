//! Runs against a real database:
//! `DATABASE_URL=postgres://... cargo test -p drain-core -- --ignored`
//!
//! Every test truncates `incident_outbox`; they share one lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use drain_core::app::{DrainConfig, OutboxDrain, Router};
use drain_core::domain::{EventType, OutboxStatus};
use drain_core::impls::{PgOutboxStore, insert_outbox_event};
use drain_core::ports::{DeliveryHandler, OutboxStore, handler_fn};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{Mutex, MutexGuard};

static DB: Mutex<()> = Mutex::const_new(());

async fn setup() -> (MutexGuard<'static, ()>, PgOutboxStore) {
    let guard = DB.lock().await;
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .unwrap();
    let store = PgOutboxStore::new(pool);
    store.ensure_schema().await.unwrap();
    sqlx::query("TRUNCATE incident_outbox RESTART IDENTITY")
        .execute(store.pool())
        .await
        .unwrap();
    (guard, store)
}

async fn insert(store: &PgOutboxStore, event_type: &str, payload: serde_json::Value) {
    let mut tx = store.pool().begin().await.unwrap();
    insert_outbox_event(&mut tx, &EventType::new(event_type), &payload, None)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn rolled_back_insert_leaves_no_event() {
    let (_guard, store) = setup().await;

    let mut tx = store.pool().begin().await.unwrap();
    insert_outbox_event(&mut tx, &EventType::new("incident.created"), &json!({}), Some(41))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(store.counts().await.unwrap().total(), 0);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_claims_are_disjoint() {
    let (_guard, store) = setup().await;
    for id in 0..30 {
        insert(&store, "incident.created", json!({ "id": id })).await;
    }

    let store = Arc::new(store);
    let claims = (0..3).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.claim_batch(10).await.unwrap() })
    });
    let mut seen = HashSet::new();
    for claim in claims.collect::<Vec<_>>() {
        for row in claim.await.unwrap() {
            assert_eq!(row.status, OutboxStatus::Processing);
            assert!(seen.insert(row.id), "row {} claimed twice", row.id);
        }
    }
    // a claim racing a commit may come back short; sweep the remainder
    loop {
        let rest = store.claim_batch(10).await.unwrap();
        if rest.is_empty() {
            break;
        }
        for row in rest {
            assert!(seen.insert(row.id), "row {} claimed twice", row.id);
        }
    }
    assert_eq!(seen.len(), 30);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn reschedule_and_dead_letter_update_the_row() {
    let (_guard, store) = setup().await;
    insert(&store, "incident.created", json!({})).await;
    insert(&store, "incident.created", json!({})).await;

    let rows = store.claim_batch(2).await.unwrap();
    assert!(rows[0].id < rows[1].id);
    assert!(
        store
            .reschedule(rows[0].claim_token(), Duration::from_secs(60), "timeout")
            .await
            .unwrap()
    );
    assert!(store.mark_dead(rows[1].claim_token(), "bad payload").await.unwrap());

    // rescheduled row is not due yet
    assert!(store.claim_batch(10).await.unwrap().is_empty());

    let counts = store.counts().await.unwrap();
    assert_eq!((counts.pending, counts.processing, counts.dead), (1, 0, 1));

    let dead = store.list_dead(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 0);
    assert_eq!(dead[0].last_error.as_deref(), Some("bad payload"));
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn drain_delivers_and_deletes() {
    let (_guard, store) = setup().await;
    for id in 0..5 {
        insert(&store, "incident.created", json!({ "id": id })).await;
    }
    let handler: Arc<dyn DeliveryHandler> = Arc::new(handler_fn(|_, _| async { Ok(()) }));
    let router = Router::builder().route("incident.created", handler).build().unwrap();

    let store = Arc::new(store);
    let drain = OutboxDrain::new(store.clone(), Arc::new(router), DrainConfig::default()).unwrap();
    let report = drain.run_cycle().await.unwrap();

    assert_eq!(report.delivered, 5);
    assert_eq!(store.counts().await.unwrap().total(), 0);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn stale_processing_rows_are_requeued() {
    let (_guard, store) = setup().await;
    insert(&store, "incident.created", json!({})).await;
    let claimed = store.claim_batch(1).await.unwrap();

    assert!(store.requeue_stale(Duration::from_secs(3600)).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let requeued = store.requeue_stale(Duration::from_millis(10)).await.unwrap();

    assert_eq!(requeued, vec![claimed[0].id]);
    assert_eq!(store.counts().await.unwrap().pending, 1);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn late_update_from_a_requeued_claim_is_ignored() {
    let (_guard, store) = setup().await;
    insert(&store, "incident.created", json!({})).await;

    let first = store.claim_batch(1).await.unwrap().remove(0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store.requeue_stale(Duration::from_millis(10)).await.unwrap(),
        vec![first.id]
    );
    let second = store.claim_batch(1).await.unwrap().remove(0);
    assert_ne!(first.claim_token(), second.claim_token());

    let stale = first.claim_token();
    assert!(!store.reschedule(stale, Duration::from_secs(1), "late").await.unwrap());
    assert!(!store.mark_dead(stale, "late").await.unwrap());
    assert!(!store.delete(stale).await.unwrap());

    let counts = store.counts().await.unwrap();
    assert_eq!((counts.pending, counts.processing, counts.dead), (0, 1, 0));
    assert!(store.claim_batch(10).await.unwrap().is_empty());

    assert!(store.delete(second.claim_token()).await.unwrap());
    assert_eq!(store.counts().await.unwrap().total(), 0);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn producer_records_the_incident_id() {
    let (_guard, store) = setup().await;

    let mut tx = store.pool().begin().await.unwrap();
    let id = insert_outbox_event(
        &mut tx,
        &EventType::new("incident.created"),
        &json!({ "address": "100 Main St" }),
        Some(77),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let incident_id: Option<i64> =
        sqlx::query_scalar("SELECT incident_id FROM incident_outbox WHERE id = $1")
            .bind(id.get())
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(incident_id, Some(77));
}
