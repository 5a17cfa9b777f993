pub mod buffer;
pub mod compression;
pub mod config;
pub mod error;
pub mod ids;
pub mod pool;

pub use buffer::{Buffer, BufferBuilder, BufferConsumer, DataType, EventKind};
pub use compression::Compression;
pub use config::NetworkConfig;
pub use error::{Error, Result};
pub use ids::{InputChannelId, ResultPartitionId, SubpartitionIndexSet};
pub use pool::BufferPool;
