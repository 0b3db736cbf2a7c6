pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod operation;
pub mod pipeline;
#[cfg(test)]
mod testing;
pub mod transaction;

pub use command::Command;
pub use connection::{AsyncConnection, AsyncTransport, Connection, Transport};
pub use error::Error;
pub use frame::Frame;
pub use operation::{QueuedOperation, Reply, ReplyKind};
pub use pipeline::{Pipeline, PipelineState};
pub use transaction::{Transaction, TransactionState};

pub type Result<T> = std::result::Result<T, Error>;
