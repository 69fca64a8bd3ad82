use std::{io::Error, process::exit, rc::Rc};

use clap::Parser;
use tokio::{net::TcpListener, select, task::LocalSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunnel_relay::{
    args::{self, StartupArguments},
    config::RelayConfig,
    port_allocator::SequentialPortAllocator,
    registry::SessionRegistry,
    router::RequestRouter,
    utils::UNSPECIFIED_SOCKADDR_V4,
};

fn main() {
    let startup_args = StartupArguments::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&startup_args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match startup_args.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}\n\nType 'tunnel-relay --help' for a help menu");
            exit(1);
        }
    };

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(config)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(config: RelayConfig) -> Result<(), Error> {
    info!("{}", args::get_version_string());

    let allocator = SequentialPortAllocator::new(config.client_address);
    let registry = SessionRegistry::new(config.session_config(), allocator);
    let router = Rc::new(RequestRouter::new(registry.clone(), config.domain.clone(), config.secure));

    let listener = TcpListener::bind(config.public_addr()).await?;
    let local_addr = listener.local_addr().unwrap_or(UNSPECIFIED_SOCKADDR_V4);
    info!(
        domain = config.domain.as_deref().unwrap_or("<none>"),
        client_ports = %config.client_port_range,
        max_sockets = config.max_tcp_sockets.get(),
        "Server listening on {local_addr}"
    );

    select! {
        _ = router.run(listener) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                warn!("Error waiting for shutdown signal: {error}");
            }
            info!("Shutting down");
        }
    }

    registry.close_all();
    Ok(())
}
