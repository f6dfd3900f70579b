pub mod add;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod delete;
pub mod error;
pub mod kafka_producer;
pub mod publisher;
pub mod saga;
