use std::{net::IpAddr, num::NonZeroUsize};

use clap::Parser;

use crate::{
    config::{ConfigError, RelayConfig, DEFAULT_ADDRESS, DEFAULT_PORT},
    pool::DEFAULT_MAX_SOCKETS,
    port_allocator::{PortRange, DEFAULT_PORT_RANGE},
};

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Startup arguments. Every option can also be given through its `LOCALTUNNEL_*` environment
/// variable.
#[derive(Debug, Parser)]
#[command(author, version, about = "Reverse-tunnel relay server")]
pub struct StartupArguments {
    /// Base domain sessions are served under, e.g. "tunnel.example.com".
    #[arg(long, env = "LOCALTUNNEL_DOMAIN")]
    pub domain: Option<String>,

    /// Report https URLs, for when TLS is terminated in front of this server.
    #[arg(long, env = "LOCALTUNNEL_SECURE")]
    pub secure: bool,

    /// Port for the public HTTP server.
    #[arg(long, env = "LOCALTUNNEL_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address for the public HTTP server.
    #[arg(long, env = "LOCALTUNNEL_ADDRESS", default_value_t = DEFAULT_ADDRESS)]
    pub address: IpAddr,

    /// Maximum amount of sockets each tunnel client may open.
    #[arg(long = "max-sockets", env = "LOCALTUNNEL_MAX_SOCKETS", default_value_t = DEFAULT_MAX_SOCKETS)]
    pub max_sockets: NonZeroUsize,

    /// Lowest port handed out to tunnel clients.
    #[arg(long, env = "LOCALTUNNEL_CLIENT_MIN_PORT_RANGE", default_value_t = DEFAULT_PORT_RANGE.min)]
    pub client_min_port_range: u16,

    /// Highest port handed out to tunnel clients.
    #[arg(long, env = "LOCALTUNNEL_CLIENT_MAX_PORT_RANGE", default_value_t = DEFAULT_PORT_RANGE.max)]
    pub client_max_port_range: u16,

    /// Address the tunnel client listeners bind on.
    #[arg(long, env = "LOCALTUNNEL_CLIENT_ADDRESS", default_value_t = DEFAULT_ADDRESS)]
    pub client_address: IpAddr,

    /// Log filter used when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, env = "LOCALTUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl StartupArguments {
    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let client_port_range = PortRange::new(self.client_min_port_range, self.client_max_port_range)?;

        Ok(RelayConfig {
            domain: self.domain.filter(|domain| !domain.is_empty()),
            secure: self.secure,
            address: self.address,
            port: self.port,
            max_tcp_sockets: self.max_sockets,
            client_port_range,
            client_address: self.client_address,
        })
    }
}
