//! TCP endpoint for a single peer, plus the block-timestamping observer.

pub mod tcp;
pub mod timestamp;

pub use tcp::{SharedTcpConnection, SocketObserver, TcpConnection, TcpServer};
