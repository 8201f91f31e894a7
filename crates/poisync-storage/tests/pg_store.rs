//! Runs against a real PostgreSQL when `DATABASE_URL` is set; otherwise each
//! test returns early.

use chrono::{DateTime, TimeZone, Utc};
use poisync_core::{Address, DocumentBody, DocumentUpsert, GeoPoint};
use poisync_storage::{DocumentStore, PgDocumentStore};
use uuid::Uuid;

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, day, 9, 0, 0).single().unwrap()
}

fn upsert(key: &str, name: &str, created_at: Option<DateTime<Utc>>, updated_at: DateTime<Utc>) -> DocumentUpsert {
    DocumentUpsert {
        identity_key: key.to_string(),
        body: DocumentBody {
            name: name.to_string(),
            address: Address::default(),
            location: GeoPoint::new(2.35, 48.85),
            categories: ["grocery".to_string()].into_iter().collect(),
            opening_hours: String::new(),
        },
        created_at,
        updated_at,
    }
}

async fn store() -> Option<(PgDocumentStore, sqlx::PgPool)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = sqlx::PgPool::connect(&url).await.expect("connect");
    let store = PgDocumentStore::from_pool(pool.clone());
    store.migrate().await.expect("migrate");
    Some((store, pool))
}

async fn cleanup(pool: &sqlx::PgPool, keys: &[String]) {
    sqlx::query("DELETE FROM stores WHERE identity_key = ANY($1)")
        .bind(keys)
        .execute(pool)
        .await
        .expect("cleanup");
}

#[tokio::test]
async fn pg_upsert_keeps_created_at_and_refuses_older_writes() {
    let Some((store, pool)) = store().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let key = format!("test:{}", Uuid::new_v4());

    store
        .upsert_unordered(&[upsert(&key, "First", Some(ts(1)), ts(1))])
        .await
        .expect("insert");
    store
        .upsert_unordered(&[upsert(&key, "Second", None, ts(5))])
        .await
        .expect("update");
    let doc = store.find_by_key(&key).await.unwrap().expect("stored");
    assert_eq!(doc.body.name, "Second");
    assert_eq!(doc.created_at, ts(1));
    assert_eq!(doc.updated_at, ts(5));

    // an insert-shaped intent for an existing key must not reset created_at
    let report = store
        .upsert_unordered(&[upsert(&key, "Replayed", Some(ts(6)), ts(6))])
        .await
        .expect("replay");
    assert!(!report.is_partial_failure());
    let doc = store.find_by_key(&key).await.unwrap().expect("stored");
    assert_eq!(doc.created_at, ts(1));
    assert_eq!(doc.updated_at, ts(6));

    let report = store
        .upsert_unordered(&[upsert(&key, "Older", None, ts(2))])
        .await
        .expect("stale write");
    assert_eq!(report.applied, 1);
    let doc = store.find_by_key(&key).await.unwrap().expect("stored");
    assert_eq!(doc.body.name, "Replayed");
    assert_eq!(doc.updated_at, ts(6));

    cleanup(&pool, &[key]).await;
}

#[tokio::test]
async fn pg_batched_lookup_returns_only_known_keys() {
    let Some((store, pool)) = store().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let known = format!("test:{}", Uuid::new_v4());
    let unknown = format!("test:{}", Uuid::new_v4());

    store
        .upsert_unordered(&[upsert(&known, "Known", Some(ts(1)), ts(1))])
        .await
        .expect("insert");
    let found = store
        .find_by_keys(&[known.clone(), unknown.clone()])
        .await
        .expect("lookup");
    assert_eq!(found.len(), 1);
    assert_eq!(found[&known].body.categories.len(), 1);

    cleanup(&pool, &[known]).await;
}
