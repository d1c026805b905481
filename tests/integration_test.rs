use image_labeler::{
    config::AppConfig,
    db,
    models::label::{Label, LabelResult},
    services::{
        label_store::{LabelStore, PgLabelStore},
        queue::{QueueSettings, RedisQueue},
    },
};
use std::time::Duration;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn test_queue(visibility: Duration) -> RedisQueue {
    RedisQueue::new(
        &redis_url(),
        QueueSettings {
            prefix: format!("image_labeler_test:{}", Uuid::new_v4()),
            visibility_timeout: visibility,
            max_receive_count: 2,
        },
    )
    .expect("Failed to initialize queue")
}

/// Queue round trip: send, receive, ack, dead-letter.
///
/// Requires a running Redis instance (REDIS_URL).
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_queue_ack_and_dead_letter() {
    let queue = test_queue(Duration::from_secs(30));
    queue.health_check().await.expect("Redis unreachable");

    let first = queue.send("first").await.unwrap();
    let second = queue.send("second").await.unwrap();
    assert_eq!(queue.depth().await.unwrap(), 2);

    let received = queue.receive(10).await.unwrap();
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|m| m.receive_count == 1));
    assert_eq!(queue.depth().await.unwrap(), 0);

    assert!(queue.ack(&first).await.unwrap());
    // second settle of the same message is a no-op
    assert!(!queue.ack(&first).await.unwrap());

    assert!(queue.dead_letter(&second).await.unwrap());
    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, "second");

    assert!(queue.receive(10).await.unwrap().is_empty());
}

/// Unsettled messages reappear after the visibility timeout and are
/// dead-lettered once they exceed the maximum receive count.
#[tokio::test]
#[ignore]
async fn test_queue_redelivery_and_redrive() {
    let queue = test_queue(Duration::from_millis(200));

    queue.send("retry me").await.unwrap();

    let first = queue.receive(1).await.unwrap();
    assert_eq!(first[0].receive_count, 1);
    assert!(queue.receive(1).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = queue.receive(1).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(second[0].receive_count, 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.receive(1).await.unwrap().is_empty());
    assert_eq!(queue.dead_letter_depth().await.unwrap(), 1);
}

/// Postgres label store upsert semantics.
///
/// Requires a running PostgreSQL instance (DATABASE_URL).
#[tokio::test]
#[ignore]
async fn test_pg_label_store_upsert() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let pool = db::init_pool(&config.database_url, 2)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");

    let store = PgLabelStore::new(pool);
    let key = format!("test/{}.jpg", Uuid::new_v4());
    let label = |name: &str, confidence: f64| Label {
        name: name.to_string(),
        confidence,
    };

    store
        .save(&LabelResult::new(key.clone(), vec![label("Cat", 92.0)]))
        .await
        .unwrap();
    store
        .save(&LabelResult::new(
            key.clone(),
            vec![label("Dog", 81.0), label("Ball", 55.5)],
        ))
        .await
        .unwrap();

    let stored = store.get(&key).await.unwrap().expect("labels stored");
    assert_eq!(stored.label_names(), vec!["Dog", "Ball"]);

    assert!(store.delete(&key).await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());
}
