pub mod error;
pub mod message;
pub mod queue;
pub mod reader;
pub mod server;

pub use error::{NetworkError, NetworkResult};
pub use message::{ErrorKind, Message, MessageCodec, MessageTag};
pub use queue::PartitionRequestQueue;
pub use reader::{CreditBasedViewReader, ReaderState};
pub use server::{
    BoundDataServer, DataServer, DataServerConfig, LocalPartitionProvider, ResultPartitionProvider,
};
