use std::{
    cell::RefCell,
    collections::VecDeque,
    mem,
    net::SocketAddr,
    num::NonZeroUsize,
    rc::{Rc, Weak},
};

use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{oneshot, watch},
    task::AbortHandle,
};
use tracing::{debug, warn};

use crate::{
    error::PoolError,
    port_allocator::{PortAllocator, PortRange},
};

mod accept;
mod stream;

pub use stream::PooledStream;
use stream::SocketLease;

/// The default amount of sockets a single tunnel client may keep open against its pool.
pub const DEFAULT_MAX_SOCKETS: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(10) };

/// How many bytes a tunnel client may send on a socket nobody claimed yet before it is dropped.
const MAX_IDLE_PENDING: usize = 64 * 1024;

/// Something that can asynchronously hand out one outbound byte stream per forwarded request.
#[allow(async_fn_in_trait)]
pub trait ConnectionSource {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    async fn create_connection(&self) -> Result<Self::Stream, PoolError>;
}

/// The lifecycle signal published by a [`ConnectionPool`]. Subscribers only ever see the most
/// recent value.
///
/// The first connected socket moves the pool to `Online`, the last one disconnecting moves it back
/// to `Offline`, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Offline,
    Online,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connected_sockets: usize,
    pub available_sockets: usize,
    pub waiting_requests: usize,
}

type Waiter = oneshot::Sender<Result<PooledStream, PoolError>>;

struct IdleSocket {
    id: u64,
    stream: PooledStream,
}

pub(crate) struct PoolInner {
    client_id: Rc<str>,
    max_sockets: NonZeroUsize,
    port_range: PortRange,

    /// Sockets we can hand out via create_connection, oldest first.
    available: VecDeque<IdleSocket>,

    /// Callers of create_connection that found no available socket, oldest first.
    waiting: VecDeque<Waiter>,

    connected: usize,
    started: bool,
    closed: bool,
    port: Option<u16>,
    next_socket_id: u64,
    accept_task: Option<AbortHandle>,
    state: watch::Sender<PoolState>,
}

impl PoolInner {
    fn register_socket(&mut self, stream: TcpStream, peer_addr: SocketAddr, lease_pool: Weak<RefCell<PoolInner>>) -> Option<PooledStream> {
        if self.closed {
            debug!(client_id = %self.client_id, %peer_addr, "Dropping connection accepted after close");
            return None;
        }

        if self.connected >= self.max_sockets.get() {
            warn!(
                client_id = %self.client_id,
                %peer_addr,
                connected = self.connected,
                max_sockets = self.max_sockets.get(),
                "No more sockets allowed"
            );
            return None;
        }

        self.connected += 1;
        if self.connected == 1 {
            self.state.send_replace(PoolState::Online);
        }

        debug!(client_id = %self.client_id, %peer_addr, "New connection");
        debug!(client_id = %self.client_id, "Socket usage: {} of {}", self.connected, self.max_sockets);
        Some(PooledStream::new(stream, peer_addr, SocketLease::new(lease_pool)))
    }

    fn push_idle(&mut self, stream: PooledStream) {
        let id = self.next_socket_id;
        self.next_socket_id += 1;
        self.available.push_back(IdleSocket { id, stream });
    }

    fn take_idle(&mut self, id: u64) -> Option<IdleSocket> {
        let index = self.available.iter().position(|idle| idle.id == id)?;
        self.available.remove(index)
    }

    /// Buffers whatever an idle socket has to read. If the tunnel client closed it, or it failed,
    /// the socket is taken out of the available list and returned.
    fn read_idle(&mut self, id: u64) -> Option<IdleSocket> {
        let index = self.available.iter().position(|idle| idle.id == id)?;
        match self.available[index].stream.buffer_incoming(MAX_IDLE_PENDING) {
            Ok(true) => None,
            Ok(false) => self.available.remove(index),
            Err(error) => {
                debug!(client_id = %self.client_id, "Dropping idle socket: {error}");
                self.available.remove(index)
            }
        }
    }

    fn pop_waiter(&mut self) -> Option<Waiter> {
        self.waiting.pop_front()
    }

    fn release_socket(&mut self) {
        self.connected = self.connected.saturating_sub(1);
        debug!(client_id = %self.client_id, connected = self.connected, "Closed socket");

        if self.connected == 0 && !self.closed {
            debug!(client_id = %self.client_id, "All sockets disconnected");
            self.state.send_replace(PoolState::Offline);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// A pool of TCP sockets opened by one remote tunnel client against a dedicated listener.
///
/// The pool admits at most `max_sockets` concurrent sockets and hands them out one per
/// [`create_connection`](Self::create_connection) call. Callers that find no idle socket are
/// queued and served in arrival order as new sockets come in.
///
/// All state lives on the current thread; this type must be used from within a
/// [`LocalSet`](tokio::task::LocalSet).
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl ConnectionPool {
    pub fn new(client_id: impl Into<Rc<str>>, max_sockets: NonZeroUsize, port_range: PortRange) -> Self {
        let (state, _) = watch::channel(PoolState::Offline);

        let inner = PoolInner {
            client_id: client_id.into(),
            max_sockets,
            port_range,
            available: VecDeque::new(),
            waiting: VecDeque::new(),
            connected: 0,
            started: false,
            closed: false,
            port: None,
            next_socket_id: 0,
            accept_task: None,
            state,
        };

        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub fn client_id(&self) -> Rc<str> {
        Rc::clone(&self.inner.borrow().client_id)
    }

    pub fn max_sockets(&self) -> NonZeroUsize {
        self.inner.borrow().max_sockets
    }

    /// The port this pool's listener is bound to, once `listen()` succeeded.
    pub fn port(&self) -> Option<u16> {
        self.inner.borrow().port
    }

    pub fn is_started(&self) -> bool {
        self.inner.borrow().started
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        PoolStats {
            connected_sockets: inner.connected,
            available_sockets: inner.available.len(),
            waiting_requests: inner.waiting.iter().filter(|waiter| !waiter.is_closed()).count(),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.inner.borrow().state.borrow()
    }

    /// Subscribes to this pool's lifecycle signal. The returned receiver considers the current
    /// state as already seen.
    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.inner.borrow().state.subscribe()
    }

    /// Binds this pool's listener to a free port inside its port range and starts accepting
    /// sockets on it. Returns the bound port.
    ///
    /// A pool can only be started once. If the pool is closed while the bind is in progress, the
    /// freshly bound listener is released and [`PoolError::Closed`] is returned.
    pub async fn listen<A: PortAllocator>(&self, allocator: &A) -> Result<u16, PoolError> {
        let range = {
            let mut inner = self.inner.borrow_mut();
            if inner.started {
                return Err(PoolError::AlreadyStarted);
            }

            if inner.closed {
                return Err(PoolError::Closed);
            }

            inner.started = true;
            inner.port_range
        };

        let listener = allocator
            .bind_listener(range)
            .await
            .map_err(|source| PoolError::PortAllocation { range, source })?;
        let port = listener.local_addr()?.port();

        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            debug!(client_id = %inner.client_id, port, "Pool closed while binding, releasing port");
            return Err(PoolError::Closed);
        }

        let task = tokio::task::spawn_local(accept::run_accept_loop(Rc::downgrade(&self.inner), listener));
        inner.accept_task = Some(task.abort_handle());
        inner.port = Some(port);

        debug!(client_id = %inner.client_id, port, "TCP server listening");
        Ok(port)
    }

    /// Takes the oldest idle socket from the pool, or waits for the next one the tunnel client
    /// opens. Waiting callers are served in the order they called.
    ///
    /// There is no timeout; the wait only ends with a socket or with the pool closing.
    pub async fn create_connection(&self) -> Result<PooledStream, PoolError> {
        let receiver = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(PoolError::Closed);
            }

            if let Some(idle) = inner.available.pop_front() {
                debug!(client_id = %inner.client_id, "Socket given");
                return Ok(idle.stream);
            }

            let (sender, receiver) = oneshot::channel();
            inner.waiting.push_back(sender);
            debug!(
                client_id = %inner.client_id,
                connected = inner.connected,
                waiting = inner.waiting.len(),
                "No available socket, waiting"
            );
            receiver
        };

        receiver.await.unwrap_or(Err(PoolError::Closed))
    }

    /// Admits a socket accepted by the listener. Rejected sockets are dropped on the spot.
    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let lease_pool = Rc::downgrade(&self.inner);
        let maybe_socket = self.inner.borrow_mut().register_socket(stream, peer_addr, lease_pool);
        let mut socket = match maybe_socket {
            Some(s) => s,
            None => return,
        };

        // If there are queued requests, give this socket to the oldest one and don't queue it.
        loop {
            let maybe_waiter = self.inner.borrow_mut().pop_waiter();
            let waiter = match maybe_waiter {
                Some(w) => w,
                None => break,
            };

            if waiter.is_closed() {
                continue;
            }

            match waiter.send(Ok(socket)) {
                Ok(()) => {
                    debug!(client_id = %self.client_id(), "Giving socket to queued connection request");
                    return;
                }
                Err(Ok(returned)) => socket = returned,
                Err(Err(_)) => return,
            }
        }

        self.inner.borrow_mut().push_idle(socket);
    }

    fn remove_idle(&self, id: u64) {
        let removed = self.inner.borrow_mut().take_idle(id);
        if let Some(idle) = removed {
            debug!(client_id = %self.client_id(), peer_addr = %idle.stream.peer_addr(), "Idle socket closed by tunnel client");
            drop(idle);
        }
    }

    fn service_idle(&self, id: u64) {
        let removed = self.inner.borrow_mut().read_idle(id);
        if let Some(idle) = removed {
            debug!(client_id = %self.client_id(), peer_addr = %idle.stream.peer_addr(), "Idle socket closed by tunnel client");
            drop(idle);
        }
    }

    /// Stops the listener, marks the pool as closed, fails every queued request with
    /// [`PoolError::Closed`] and publishes [`PoolState::Closed`]. Does nothing if the pool is
    /// already closed.
    ///
    /// Idle sockets are left in place; [`destroy`](Self::destroy) also drops those.
    pub fn close(&self) {
        let (waiting, accept_task) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }

            inner.closed = true;
            debug!(client_id = %inner.client_id, waiting = inner.waiting.len(), "Closed TCP server");
            (mem::take(&mut inner.waiting), inner.accept_task.take())
        };

        if let Some(task) = accept_task {
            task.abort();
        }

        // Flush any waiting connections
        for waiter in waiting {
            let _ = waiter.send(Err(PoolError::Closed));
        }

        self.inner.borrow().state.send_replace(PoolState::Closed);
    }

    /// Closes the pool and drops all of its idle sockets.
    ///
    /// Sockets already handed out stay open until their holders drop them.
    pub fn destroy(&self) {
        self.close();

        let idle = mem::take(&mut self.inner.borrow_mut().available);
        drop(idle);
    }
}

impl ConnectionSource for ConnectionPool {
    type Stream = PooledStream;

    async fn create_connection(&self) -> Result<PooledStream, PoolError> {
        ConnectionPool::create_connection(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        time::{sleep, timeout},
    };

    use crate::{
        error::PoolError,
        utils::test_utils::{connect, local_allocator, run_local, test_port_range, wait_until, GatedAllocator, LOCALHOST},
    };

    use super::{ConnectionPool, PoolState};

    fn new_pool(max_sockets: usize) -> ConnectionPool {
        ConnectionPool::new("test-client", NonZeroUsize::new(max_sockets).unwrap(), test_port_range())
    }

    async fn listening_pool(max_sockets: usize) -> (ConnectionPool, u16) {
        let pool = new_pool(max_sockets);
        let port = pool.listen(&local_allocator()).await.unwrap();
        (pool, port)
    }

    async fn assert_closed_by_server(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let result = timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
        match result {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => panic!("Expected the socket to be closed, but read {n} bytes"),
            Err(_) => panic!("Timed out waiting for the server to close the socket"),
        }
    }

    #[tokio::test]
    async fn test_listen_is_single_shot() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;
            assert!(test_port_range().contains(port));
            assert!(pool.is_started());

            let second = pool.listen(&local_allocator()).await;
            assert!(matches!(second, Err(PoolError::AlreadyStarted)));
            assert_eq!(pool.port(), Some(port));

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_admission_rejects_over_capacity() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;
            let mut state = pool.subscribe();

            let _first = connect(port).await;
            wait_until("first socket admitted", || pool.stats().connected_sockets == 1).await;
            assert!(state.has_changed().unwrap());
            assert_eq!(*state.borrow_and_update(), PoolState::Online);

            let _second = connect(port).await;
            wait_until("second socket admitted", || pool.stats().connected_sockets == 2).await;

            let mut third = connect(port).await;
            assert_closed_by_server(&mut third).await;

            let stats = pool.stats();
            assert_eq!(stats.connected_sockets, 2);
            assert_eq!(stats.available_sockets, 2);
            assert!(!state.has_changed().unwrap());

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_available_sockets_are_handed_out_oldest_first() {
        run_local(async {
            let (pool, port) = listening_pool(3).await;

            let first = connect(port).await;
            wait_until("first socket admitted", || pool.stats().available_sockets == 1).await;
            let second = connect(port).await;
            wait_until("second socket admitted", || pool.stats().available_sockets == 2).await;

            let given = pool.create_connection().await.unwrap();
            assert_eq!(given.peer_addr(), first.local_addr().unwrap());
            assert_eq!(pool.stats().available_sockets, 1);

            let given = pool.create_connection().await.unwrap();
            assert_eq!(given.peer_addr(), second.local_addr().unwrap());
            assert_eq!(pool.stats().available_sockets, 0);
            assert_eq!(pool.stats().connected_sockets, 2);

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_waiting_request_gets_next_socket_directly() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;

            let waiting_pool = pool.clone();
            let request = tokio::task::spawn_local(async move { waiting_pool.create_connection().await });
            wait_until("request queued", || pool.stats().waiting_requests == 1).await;

            let client = connect(port).await;
            let given = request.await.unwrap().unwrap();
            assert_eq!(given.peer_addr(), client.local_addr().unwrap());

            let stats = pool.stats();
            assert_eq!(stats.available_sockets, 0);
            assert_eq!(stats.waiting_requests, 0);
            assert_eq!(stats.connected_sockets, 1);

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_waiting_requests_are_served_in_order() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;

            let first_pool = pool.clone();
            let first_request = tokio::task::spawn_local(async move { first_pool.create_connection().await });
            wait_until("first request queued", || pool.stats().waiting_requests == 1).await;

            let second_pool = pool.clone();
            let second_request = tokio::task::spawn_local(async move { second_pool.create_connection().await });
            wait_until("second request queued", || pool.stats().waiting_requests == 2).await;

            let first_socket = connect(port).await;
            wait_until("first socket admitted", || pool.stats().connected_sockets == 1).await;
            let second_socket = connect(port).await;

            let first_given = first_request.await.unwrap().unwrap();
            let second_given = second_request.await.unwrap().unwrap();
            assert_eq!(first_given.peer_addr(), first_socket.local_addr().unwrap());
            assert_eq!(second_given.peer_addr(), second_socket.local_addr().unwrap());
            assert_eq!(pool.stats().available_sockets, 0);

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_flushes_waiting_requests() {
        run_local(async {
            let (pool, _port) = listening_pool(2).await;
            let mut state = pool.subscribe();

            let mut requests = Vec::new();
            for expected in 1..=2 {
                let request_pool = pool.clone();
                requests.push(tokio::task::spawn_local(async move { request_pool.create_connection().await }));
                wait_until("request queued", || pool.stats().waiting_requests == expected).await;
            }

            pool.close();

            for request in requests {
                assert!(matches!(request.await.unwrap(), Err(PoolError::Closed)));
            }

            assert_eq!(pool.stats().waiting_requests, 0);
            assert!(pool.is_closed());
            assert!(state.has_changed().unwrap());
            assert_eq!(*state.borrow_and_update(), PoolState::Closed);
            assert!(matches!(pool.create_connection().await, Err(PoolError::Closed)));

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_offline_after_last_socket_closes() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;
            let mut state = pool.subscribe();

            let _given_client = connect(port).await;
            wait_until("first socket admitted", || pool.stats().available_sockets == 1).await;
            let given = pool.create_connection().await.unwrap();

            let idle_client = connect(port).await;
            wait_until("second socket admitted", || pool.stats().available_sockets == 1).await;
            assert_eq!(pool.stats().connected_sockets, 2);
            assert_eq!(*state.borrow_and_update(), PoolState::Online);

            drop(idle_client);
            wait_until("idle socket removed", || pool.stats().connected_sockets == 1).await;
            assert_eq!(pool.stats().available_sockets, 0);
            assert!(!state.has_changed().unwrap());

            drop(given);
            assert_eq!(pool.stats().connected_sockets, 0);
            assert!(state.has_changed().unwrap());
            assert_eq!(*state.borrow_and_update(), PoolState::Offline);

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_idle_socket_closed_after_sending_data() {
        run_local(async {
            let (pool, port) = listening_pool(1).await;

            let mut client = connect(port).await;
            wait_until("socket admitted", || pool.stats().available_sockets == 1).await;
            client.write_all(b"x").await.unwrap();
            drop(client);

            wait_until("closed socket removed", || pool.stats().connected_sockets == 0).await;
            assert_eq!(pool.stats().available_sockets, 0);

            // The freed slot admits the tunnel client's next socket.
            let _reconnected = connect(port).await;
            wait_until("new socket admitted", || pool.stats().available_sockets == 1).await;
            assert_eq!(pool.stats().connected_sockets, 1);

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_bytes_sent_while_idle_are_replayed() {
        run_local(async {
            let (pool, port) = listening_pool(1).await;

            let mut client = connect(port).await;
            wait_until("socket admitted", || pool.stats().available_sockets == 1).await;
            client.write_all(b"early").await.unwrap();
            wait_until("early bytes buffered", || {
                pool.inner.borrow().available.front().is_some_and(|idle| idle.stream.pending_len() == 5)
            })
            .await;

            let mut stream = pool.create_connection().await.unwrap();
            client.write_all(b" late").await.unwrap();

            let mut buf = [0u8; 10];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"early late");

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_idle_socket_flooding_data_is_dropped() {
        run_local(async {
            let (pool, port) = listening_pool(1).await;

            let mut client = connect(port).await;
            wait_until("socket admitted", || pool.stats().available_sockets == 1).await;

            // The server may reset the connection halfway through.
            let _ = client.write_all(&vec![0u8; 2 * super::MAX_IDLE_PENDING]).await;
            wait_until("flooding socket removed", || pool.stats().connected_sockets == 0).await;
            assert_eq!(pool.stats().available_sockets, 0);

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        run_local(async {
            let (pool, port) = listening_pool(1).await;
            pool.close();

            let refused = timeout(Duration::from_secs(5), async {
                while TcpStream::connect((LOCALHOST, port)).await.is_ok() {
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .await;

            assert!(refused.is_ok(), "Listener still accepting after close");
            assert_eq!(pool.stats().connected_sockets, 0);
            assert_eq!(pool.state(), PoolState::Closed);
        })
        .await;
    }

    #[tokio::test]
    async fn test_abandoned_request_is_skipped() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;

            let abandoned = timeout(Duration::from_millis(20), pool.create_connection()).await;
            assert!(abandoned.is_err());
            assert_eq!(pool.stats().waiting_requests, 0);

            let _client = connect(port).await;
            wait_until("socket kept as available", || pool.stats().available_sockets == 1).await;

            pool.destroy();
        })
        .await;
    }

    #[tokio::test]
    async fn test_destroy_releases_idle_sockets() {
        run_local(async {
            let (pool, port) = listening_pool(2).await;
            let mut state = pool.subscribe();

            let mut client = connect(port).await;
            wait_until("socket admitted", || pool.stats().available_sockets == 1).await;
            state.borrow_and_update();

            pool.destroy();
            assert_closed_by_server(&mut client).await;
            assert_eq!(pool.stats().available_sockets, 0);
            assert_eq!(pool.stats().connected_sockets, 0);
            assert_eq!(*state.borrow_and_update(), PoolState::Closed);
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_while_binding_releases_listener() {
        run_local(async {
            let pool = new_pool(1);
            let listen_pool = pool.clone();
            let (gate, allocator) = GatedAllocator::new();
            let listen = tokio::task::spawn_local(async move { listen_pool.listen(&allocator).await });

            wait_until("listen started", || pool.is_started()).await;
            pool.close();
            gate.send_replace(true);

            assert!(matches!(listen.await.unwrap(), Err(PoolError::Closed)));
            assert_eq!(pool.port(), None);
            assert!(matches!(pool.listen(&local_allocator()).await, Err(PoolError::AlreadyStarted)));
        })
        .await;
    }
}
