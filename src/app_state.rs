use sqlx::PgPool;
use std::sync::Arc;

use crate::services::queue::RedisQueue;

/// Shared state for the worker's ops endpoints.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<RedisQueue>,
}

impl AppState {
    pub fn new(db: PgPool, queue: Arc<RedisQueue>) -> Self {
        Self { db, queue }
    }
}
