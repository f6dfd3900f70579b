use envconfig::Envconfig;

use shoplist_common::item::ItemState;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(default = "http://localhost:8100")]
    pub item_store_url: String,

    #[envconfig(default = "5000")]
    pub item_store_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub migration_retry_delay_ms: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub capacity: CapacityConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "kafka:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "list_item_events")]
    pub events_topic: String,

    #[envconfig(default = "list_item_migrations")]
    pub migrations_topic: String,

    #[envconfig(default = "shoplist-worker")]
    pub consumer_group: String,
}

#[derive(Envconfig, Clone, Copy)]
pub struct CapacityConfig {
    #[envconfig(default = "100")]
    pub max_pending_items: usize,

    // With rolling enabled the pending container evicts its oldest items on
    // overflow instead of rejecting the add.
    #[envconfig(default = "false")]
    pub pending_rolling: bool,

    #[envconfig(default = "100")]
    pub max_completed_items: usize,
}

impl CapacityConfig {
    pub fn max_for(&self, state: ItemState) -> usize {
        match state {
            ItemState::Pending => self.max_pending_items,
            ItemState::Completed => self.max_completed_items,
        }
    }

    /// The completed container always rolls; pending only when configured to.
    pub fn rolls_over(&self, state: ItemState) -> bool {
        match state {
            ItemState::Pending => self.pending_rolling,
            ItemState::Completed => true,
        }
    }
}
