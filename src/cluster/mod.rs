pub mod allocator;
pub mod replica;
pub mod service;

pub use allocator::{
    ExtentAllocator, ExtentInfo, MemAllocator, MemPartitionManager, PartitionManager, StreamInfo,
    TableInfo,
};
pub use replica::ReplicationGroup;
pub use service::{ExtentService, LocalExtentService};
