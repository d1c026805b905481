pub mod classifier;
pub mod decoder;
pub mod label_store;
pub mod queue;
pub mod storage;
pub mod thumbnail;
pub mod workers_ai;
