use std::time::Duration;

/// Configuration for stream clients and the replication protocol.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Per-RPC deadline for append/seal/commit-length calls (default: 1s)
    pub rpc_timeout: Duration,

    /// How many seal+allocate+retry rounds an append survives before the
    /// stream client gives up (default: 3)
    pub max_append_retries: usize,

    /// Maximum number of blocks pulled per read call (default: 32)
    pub read_max_blocks: u32,

    /// Maximum number of data bytes pulled per read call (default: 4MB)
    pub read_max_bytes: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(1),
            max_append_retries: 3,
            read_max_blocks: 32,
            read_max_bytes: 4 * 1024 * 1024,
        }
    }
}

impl StreamConfig {
    /// Set the per-RPC deadline
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the number of seal+allocate+retry rounds
    pub fn max_append_retries(mut self, retries: usize) -> Self {
        self.max_append_retries = retries;
        self
    }
}

/// Configuration for a range partition.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Values longer than this are kept in the log stream only and referenced
    /// by a value pointer (default: 1KB)
    pub value_threshold: usize,

    /// Arena byte budget per memtable before it is frozen (default: 64MB)
    pub max_memtable_size: usize,

    /// How many frozen memtables may queue for flush before writes block
    /// (default: 4)
    pub max_frozen_memtables: usize,

    /// Maximum number of write requests coalesced into one batch (default: 128)
    pub batch_max: usize,

    /// Maximum number of entry bytes coalesced into one batch (default: 4MB)
    pub batch_max_bytes: usize,

    /// Depth of the incoming-write channel (default: 256)
    pub write_queue_depth: usize,

    /// Overall deadline for one batch's log-stream append (default: 10s)
    pub write_timeout: Duration,

    /// Stream client configuration shared by both streams
    pub stream: StreamConfig,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            value_threshold: 1024,
            max_memtable_size: 64 * 1024 * 1024,
            max_frozen_memtables: 4,
            batch_max: 128,
            batch_max_bytes: 4 * 1024 * 1024,
            write_queue_depth: 256,
            write_timeout: Duration::from_secs(10),
            stream: StreamConfig::default(),
        }
    }
}

impl PartitionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inline-value threshold
    pub fn value_threshold(mut self, bytes: usize) -> Self {
        self.value_threshold = bytes;
        self
    }

    /// Set the memtable arena byte budget
    pub fn max_memtable_size(mut self, bytes: usize) -> Self {
        self.max_memtable_size = bytes;
        self
    }

    /// Set the frozen-memtable queue depth
    pub fn max_frozen_memtables(mut self, count: usize) -> Self {
        self.max_frozen_memtables = count;
        self
    }

    /// Set the per-batch request cap
    pub fn batch_max(mut self, count: usize) -> Self {
        self.batch_max = count;
        self
    }

    /// Set the per-batch byte cap
    pub fn batch_max_bytes(mut self, bytes: usize) -> Self {
        self.batch_max_bytes = bytes;
        self
    }

    /// Configure the stream clients
    pub fn stream(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PartitionConfig::default();
        assert_eq!(config.value_threshold, 1024);
        assert_eq!(config.max_memtable_size, 64 * 1024 * 1024);
        assert_eq!(config.stream.rpc_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder() {
        let config = PartitionConfig::new()
            .value_threshold(512)
            .max_memtable_size(1024 * 1024)
            .batch_max(16)
            .stream(StreamConfig::default().rpc_timeout(Duration::from_millis(250)));

        assert_eq!(config.value_threshold, 512);
        assert_eq!(config.max_memtable_size, 1024 * 1024);
        assert_eq!(config.batch_max, 16);
        assert_eq!(config.stream.rpc_timeout, Duration::from_millis(250));
    }
}
