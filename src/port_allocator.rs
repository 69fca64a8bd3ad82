use std::{
    fmt,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::trace;

/// The default inclusive range of ports handed out to tunnel client listeners.
pub const DEFAULT_PORT_RANGE: PortRange = PortRange { min: 1024, max: 65535 };

/// An inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("port 0 cannot be part of a client port range")]
    ZeroPort,
    #[error("invalid port range: minimum {0} is greater than maximum {1}")]
    Inverted(u16, u16),
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, PortRangeError> {
        if min == 0 {
            Err(PortRangeError::ZeroPort)
        } else if min > max {
            Err(PortRangeError::Inverted(min, max))
        } else {
            Ok(Self { min, max })
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        DEFAULT_PORT_RANGE
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Finds a free port inside a [`PortRange`] and binds a listener to it.
///
/// Finding and binding are one step so no other process can take the port in between.
#[allow(async_fn_in_trait)]
pub trait PortAllocator {
    async fn bind_listener(&self, range: PortRange) -> io::Result<TcpListener>;
}

/// Scans the range upwards from its minimum and binds the first port that is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialPortAllocator {
    ip: IpAddr,
}

impl SequentialPortAllocator {
    pub const fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    pub const fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Default for SequentialPortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl PortAllocator for SequentialPortAllocator {
    async fn bind_listener(&self, range: PortRange) -> io::Result<TcpListener> {
        for port in range.min..=range.max {
            match TcpListener::bind(SocketAddr::new(self.ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(error) if is_port_taken(&error) => trace!(port, "Port unavailable: {error}"),
                Err(error) => return Err(error),
            }
        }

        Err(io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("no free port in range {range} on {}", self.ip),
        ))
    }
}

fn is_port_taken(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied)
}
