pub mod item;
pub mod kafka_messages;
pub mod metrics;
pub mod store;
pub mod utils;
