use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    num::NonZeroUsize,
    rc::Rc,
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::PoolError,
    pool::{ConnectionPool, DEFAULT_MAX_SOCKETS},
    port_allocator::{PortAllocator, PortRange, SequentialPortAllocator},
    session::Session,
};

/// The settings every new session's pool is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_sockets: NonZeroUsize,
    pub port_range: PortRange,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            port_range: PortRange::default(),
        }
    }
}

/// What a tunnel client needs to know to start opening sockets for its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewClientInfo {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub tunnels: usize,
}

struct RegistryInner<A> {
    config: SessionConfig,
    allocator: A,
    clients: RefCell<HashMap<String, Rc<Session>>>,
    tunnels: Cell<usize>,
}

/// Keeps track of which session ids are live, and owns their sessions.
///
/// Cloning a registry yields another handle to the same sessions.
pub struct SessionRegistry<A = SequentialPortAllocator> {
    inner: Rc<RegistryInner<A>>,
}

impl<A> Clone for SessionRegistry<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: PortAllocator + 'static> SessionRegistry<A> {
    pub fn new(config: SessionConfig, allocator: A) -> Self {
        let inner = RegistryInner {
            config,
            allocator,
            clients: RefCell::new(HashMap::new()),
            tunnels: Cell::new(0),
        };

        Self { inner: Rc::new(inner) }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Creates a session for `id` and starts its pool's listener.
    ///
    /// If `id` is already in use, that session is torn down first. The new session is reachable
    /// through [`get_client`](Self::get_client) before the listener is bound, so a concurrent call
    /// for the same id replaces it instead of racing it.
    pub async fn new_client(&self, id: &str) -> Result<NewClientInfo, PoolError> {
        if self.has_client(id) {
            self.remove_client(id);
            debug!(client_id = id, "Removed so new connection can be created");
        }

        let config = self.inner.config;
        let pool = ConnectionPool::new(id, config.max_sockets, config.port_range);
        let session = Rc::new(Session::new(id, pool));
        self.inner.clients.borrow_mut().insert(id.to_owned(), Rc::clone(&session));
        self.watch_session(&session);

        match session.pool().listen(&self.inner.allocator).await {
            Ok(port) => {
                self.inner.tunnels.set(self.inner.tunnels.get() + 1);
                info!(client_id = id, port, tunnels = self.inner.tunnels.get(), "New client");

                Ok(NewClientInfo {
                    id: id.to_owned(),
                    port,
                    max_conn_count: config.max_sockets.get(),
                })
            }
            Err(error) => {
                warn!(client_id = id, "Failed to start client: {error}");
                self.remove_session(&session);
                Err(error)
            }
        }
    }

    /// Removes the session with `id` from the registry and closes its pool. Does nothing if there
    /// is no such session.
    pub fn remove_client(&self, id: &str) {
        let removed = self.inner.clients.borrow_mut().remove(id);
        if let Some(session) = removed {
            self.teardown(session);
        }
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.inner.clients.borrow().contains_key(id)
    }

    pub fn get_client(&self, id: &str) -> Option<Rc<Session>> {
        self.inner.clients.borrow().get(id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.clients.borrow().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.inner.tunnels.get(),
        }
    }

    /// Removes and closes every session.
    pub fn close_all(&self) {
        let sessions: Vec<Rc<Session>> = self.inner.clients.borrow_mut().drain().map(|(_, session)| session).collect();
        for session in sessions {
            self.teardown(session);
        }
    }

    /// Removes a session once its pool closes on its own (e.g. because its listener failed), as
    /// long as the registry still maps its id to that same session.
    fn watch_session(&self, session: &Rc<Session>) {
        let on_close = session.on_close();
        let weak_registry = Rc::downgrade(&self.inner);
        let weak_session = Rc::downgrade(session);

        tokio::task::spawn_local(async move {
            on_close.await;

            if let (Some(inner), Some(session)) = (weak_registry.upgrade(), weak_session.upgrade()) {
                SessionRegistry { inner }.remove_session(&session);
            }
        });
    }

    fn remove_session(&self, session: &Rc<Session>) {
        let removed = self.take_if_current(session);
        if let Some(session) = removed {
            self.teardown(session);
        }
    }

    fn take_if_current(&self, session: &Rc<Session>) -> Option<Rc<Session>> {
        let mut clients = self.inner.clients.borrow_mut();
        let is_current = clients.get(session.id()).is_some_and(|current| Rc::ptr_eq(current, session));
        if is_current {
            clients.remove(session.id())
        } else {
            None
        }
    }

    fn teardown(&self, session: Rc<Session>) {
        // Only sessions whose listener came up were counted.
        if session.pool().port().is_some() {
            self.inner.tunnels.set(self.inner.tunnels.get().saturating_sub(1));
        }

        debug!(client_id = session.id(), tunnels = self.inner.tunnels.get(), "Removing client");
        session.close();
    }
}
