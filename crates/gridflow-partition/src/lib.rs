pub mod bounded;
pub mod compression;
pub mod error;
pub mod partition;
pub mod pipelined;
pub mod view;

pub use bounded::{BoundedBlockingSubpartition, BoundedBlockingSubpartitionView, BoundedStorageKind};
pub use compression::{decompress_buffer, BufferCompressor};
pub use error::{Error, Result};
pub use partition::{PartitionState, ResultPartition, ResultPartitionType, StopMode};
pub use pipelined::{PipelinedSubpartition, PipelinedSubpartitionView};
pub use view::{BufferAndBacklog, BufferAvailabilityListener, SubpartitionSnapshot, SubpartitionView};
