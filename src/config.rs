use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
};

use thiserror::Error;

use crate::{
    pool::DEFAULT_MAX_SOCKETS,
    port_allocator::{PortRange, PortRangeError, DEFAULT_PORT_RANGE},
    registry::SessionConfig,
};

/// The default port the public HTTP server listens on.
pub const DEFAULT_PORT: u16 = 80;

/// The default address the public HTTP server and the per-session listeners bind to.
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid client port range: {0}")]
    ClientPortRange(#[from] PortRangeError),
}

/// Everything the relay server needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Base domain sessions get subdomains of. If `None`, the first label of the `Host` header is
    /// used as the session id whenever the host has at least three labels.
    pub domain: Option<String>,

    /// Whether the public endpoint is served over TLS by something in front of us. Only affects
    /// the URLs we report back.
    pub secure: bool,

    /// Address and port for the public HTTP server.
    pub address: IpAddr,
    pub port: u16,

    /// Maximum amount of sockets each tunnel client may open.
    pub max_tcp_sockets: NonZeroUsize,

    /// Ports tunnel client listeners are bound to, and the address they bind on.
    pub client_port_range: PortRange,
    pub client_address: IpAddr,
}

impl RelayConfig {
    pub fn public_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_sockets: self.max_tcp_sockets,
            port_range: self.client_port_range,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            domain: None,
            secure: false,
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            max_tcp_sockets: DEFAULT_MAX_SOCKETS,
            client_port_range: DEFAULT_PORT_RANGE,
            client_address: DEFAULT_ADDRESS,
        }
    }
}
