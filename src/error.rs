use std::io;

use thiserror::Error;

use crate::port_allocator::PortRange;

/// Errors returned by [`ConnectionPool`](crate::pool::ConnectionPool) and the
/// [`SessionRegistry`](crate::registry::SessionRegistry) operations built on it.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `listen()` was called on a pool that was already started.
    #[error("connection pool already started")]
    AlreadyStarted,

    /// No port in the configured range could be bound.
    #[error("could not bind a listener in port range {range}: {source}")]
    PortAllocation {
        range: PortRange,
        #[source]
        source: io::Error,
    },

    /// The pool was closed, either before the call or while it was waiting.
    #[error("connection pool closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<PoolError> for io::Error {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::Io(error) => error,
            PoolError::PortAllocation { source, .. } => source,
            PoolError::Closed => io::Error::new(io::ErrorKind::NotConnected, value),
            PoolError::AlreadyStarted => io::Error::new(io::ErrorKind::AddrInUse, value),
        }
    }
}
