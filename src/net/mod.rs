//! The networking modules handle message framing, the validation handshake
//! and all communication between clients and servers.

pub mod buffer;
pub mod client;
pub mod connection;
pub mod message;
pub mod queue;
pub mod server;
pub mod shared;

mod reactor;

pub use self::client::Client;
pub use self::connection::{Connection, Role};
pub use self::message::{Message, MessageHeader, MessageId, OwnedMessage};
pub use self::queue::BlockingQueue;
pub use self::server::{Server, ServerHandler};
pub use self::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
