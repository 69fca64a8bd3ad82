use std::future::Future;

use crate::pool::{ConnectionPool, PoolState};

/// A remote tunnel client's registered identity together with the pool of sockets it opened.
pub struct Session {
    id: String,
    pool: ConnectionPool,
}

impl Session {
    pub fn new(id: impl Into<String>, pool: ConnectionPool) -> Self {
        Self { id: id.into(), pool }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn is_online(&self) -> bool {
        self.pool.state() == PoolState::Online
    }

    /// Tears down this session's pool: stops its listener and fails any request still waiting
    /// for a socket.
    pub fn close(&self) {
        self.pool.destroy();
    }

    /// Returns a future that completes once this session's pool has closed, for whatever reason.
    ///
    /// The subscription happens when this is called, not when the future is first polled.
    pub fn on_close(&self) -> impl Future<Output = ()> + 'static {
        let mut state = self.pool.subscribe();
        async move {
            // An error means the pool itself is gone, which also counts as closed.
            let _ = state.wait_for(|state| *state == PoolState::Closed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, num::NonZeroUsize, rc::Rc};

    use crate::{
        pool::ConnectionPool,
        utils::test_utils::{connect, local_allocator, run_local, test_port_range, wait_until},
    };

    use super::Session;

    #[tokio::test]
    async fn test_on_close_follows_pool() {
        run_local(async {
            let pool = ConnectionPool::new("session", NonZeroUsize::new(1).unwrap(), test_port_range());
            let session = Session::new("session", pool);
            let port = session.pool().listen(&local_allocator()).await.unwrap();

            let closed = Rc::new(Cell::new(false));
            let closed_flag = Rc::clone(&closed);
            let on_close = session.on_close();
            tokio::task::spawn_local(async move {
                on_close.await;
                closed_flag.set(true);
            });

            let _client = connect(port).await;
            wait_until("session online", || session.is_online()).await;
            assert!(!closed.get());

            session.close();
            wait_until("close observed", || closed.get()).await;
            assert!(!session.is_online());
        })
        .await;
    }
}
