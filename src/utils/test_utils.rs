use std::{
    future::Future,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::LocalSet,
    time::{sleep, Instant},
};

use crate::port_allocator::{PortAllocator, PortRange, SequentialPortAllocator};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Runs a future inside a [`LocalSet`], so it can use `spawn_local`.
pub async fn run_local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}

/// Keeps yielding to the runtime until `condition` holds. Panics after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting until {what}");
        }

        sleep(WAIT_STEP).await;
    }
}

pub fn test_port_range() -> PortRange {
    PortRange::new(20000, 60000).unwrap()
}

pub fn local_allocator() -> SequentialPortAllocator {
    SequentialPortAllocator::new(LOCALHOST)
}

pub async fn connect(port: u16) -> TcpStream {
    TcpStream::connect((LOCALHOST, port)).await.unwrap()
}

/// Fails every bind, as if the whole range were taken.
pub struct FailingAllocator;

impl PortAllocator for FailingAllocator {
    async fn bind_listener(&self, range: PortRange) -> io::Result<TcpListener> {
        Err(io::Error::new(ErrorKind::AddrNotAvailable, format!("no free port in range {range}")))
    }
}

/// Holds every bind until the gate is opened, so tests can act while a bind is in flight.
pub struct GatedAllocator {
    gate: watch::Receiver<bool>,
    inner: SequentialPortAllocator,
}

impl GatedAllocator {
    /// Returns the allocator and the sender that opens its gate with `true`.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (sender, gate) = watch::channel(false);
        let allocator = Self {
            gate,
            inner: local_allocator(),
        };

        (sender, allocator)
    }
}

impl PortAllocator for GatedAllocator {
    async fn bind_listener(&self, range: PortRange) -> io::Result<TcpListener> {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.bind_listener(range).await
    }
}
