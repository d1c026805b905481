//! Image Labeler
//!
//! Queue-driven image classification ingestion: storage write notifications
//! arrive on a queue, each referenced image is labeled by an external
//! classification service, thumbnailed, and its labels persisted.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
