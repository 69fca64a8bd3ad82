//! A reverse-tunnel relay server. Remote tunnel clients register a session, open a pool of TCP
//! sockets to a per-session port, and public HTTP requests for that session's subdomain are relayed
//! over those sockets one request per socket.

pub mod args;
pub mod config;
pub mod error;
pub mod pool;
pub mod port_allocator;
pub mod registry;
pub mod router;
pub mod session;
pub mod utils;

pub use error::PoolError;
pub use pool::{ConnectionPool, ConnectionSource, PoolState, PoolStats, PooledStream};
pub use registry::{NewClientInfo, SessionConfig, SessionRegistry};
pub use session::Session;
