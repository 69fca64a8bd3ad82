use std::{
    cell::RefCell,
    future::poll_fn,
    io,
    net::SocketAddr,
    rc::Weak,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tracing::{error, trace};

use crate::utils::is_transient_error;

use super::{ConnectionPool, PoolInner};

/// How long the accept task waits after an accept error it can't shrug off, e.g. running out of
/// file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum AcceptEvent {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    IdleReadable(u64),
    IdleFailed(u64),
    PoolDropped,
}

/// Accepts sockets from the tunnel client and watches the pool's idle sockets, so those the
/// remote end closes are dropped right away. Runs until the pool is closed or dropped.
pub(super) async fn run_accept_loop(weak_pool: Weak<RefCell<PoolInner>>, listener: TcpListener) {
    loop {
        let event = poll_fn(|cx| poll_next_event(&weak_pool, &listener, cx)).await;

        let backoff = match weak_pool.upgrade() {
            Some(inner) => handle_event(&ConnectionPool { inner }, event),
            None => break,
        };

        if let Some(delay) = backoff {
            sleep(delay).await;
        }
    }
}

/// Applies one event to the pool. Returns how long to pause before accepting again, if at all.
fn handle_event(pool: &ConnectionPool, event: AcceptEvent) -> Option<Duration> {
    match event {
        AcceptEvent::Accepted(Ok((stream, peer_addr))) => pool.admit(stream, peer_addr),
        AcceptEvent::Accepted(Err(error)) if is_transient_error(&error) => {
            trace!(client_id = %pool.client_id(), "Ignoring transient accept error: {error}");
        }
        AcceptEvent::Accepted(Err(error)) => {
            error!(client_id = %pool.client_id(), "Error accepting tunnel socket: {error}");
            return Some(ACCEPT_ERROR_BACKOFF);
        }
        AcceptEvent::IdleReadable(id) => pool.service_idle(id),
        AcceptEvent::IdleFailed(id) => pool.remove_idle(id),
        AcceptEvent::PoolDropped => {}
    }

    None
}

/// Polls the listener, then every idle socket, returning the first event that is ready.
fn poll_next_event(weak_pool: &Weak<RefCell<PoolInner>>, listener: &TcpListener, cx: &mut Context<'_>) -> Poll<AcceptEvent> {
    let shared = match weak_pool.upgrade() {
        Some(shared) => shared,
        None => return Poll::Ready(AcceptEvent::PoolDropped),
    };

    if let Poll::Ready(result) = listener.poll_accept(cx) {
        return Poll::Ready(AcceptEvent::Accepted(result));
    }

    let state = shared.borrow();
    for idle in state.available.iter() {
        match idle.stream.tcp().poll_read_ready(cx) {
            Poll::Ready(Ok(())) => return Poll::Ready(AcceptEvent::IdleReadable(idle.id)),
            Poll::Ready(Err(error)) => {
                trace!(client_id = %state.client_id, "Idle socket failed: {error}");
                return Poll::Ready(AcceptEvent::IdleFailed(idle.id));
            }
            Poll::Pending => {}
        }
    }

    Poll::Pending
}
