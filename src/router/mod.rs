use std::{io, net::SocketAddr, rc::Rc};

use http::StatusCode;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    pool::ConnectionSource,
    port_allocator::{PortAllocator, SequentialPortAllocator},
    registry::{NewClientInfo, SessionRegistry},
    utils::is_transient_error,
};

pub mod proto;

use proto::{
    client_id_from_host, is_valid_client_id, read_request_head, write_json_response, write_message_response,
    HeadError, RequestHead,
};

const RANDOM_ID_LEN: usize = 10;

#[derive(Serialize)]
struct ClientCreated {
    #[serde(flatten)]
    info: NewClientInfo,
    url: String,
}

#[derive(Serialize)]
struct TunnelStatus {
    connected_sockets: usize,
}

/// Generates a session id for clients that didn't ask for a specific one.
pub fn random_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Serves the public endpoint: requests for a session's subdomain are relayed through that
/// session's pool, anything else goes to the management API.
pub struct RequestRouter<A = SequentialPortAllocator> {
    registry: SessionRegistry<A>,
    domain: Option<String>,
    secure: bool,
}

impl<A: PortAllocator + 'static> RequestRouter<A> {
    pub fn new(registry: SessionRegistry<A>, domain: Option<String>, secure: bool) -> Self {
        Self { registry, domain, secure }
    }

    pub fn registry(&self) -> &SessionRegistry<A> {
        &self.registry
    }

    /// Accepts public connections forever, handling each on its own local task.
    pub async fn run(self: Rc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(t) => t,
                Err(error) => {
                    warn!("Error accepting incoming connection: {error}");
                    continue;
                }
            };

            let router = Rc::clone(&self);
            tokio::task::spawn_local(async move {
                match router.handle_connection(stream, peer_addr).await {
                    Ok(()) => {}
                    Err(error) if is_transient_error(&error) => trace!(%peer_addr, "Connection dropped: {error}"),
                    Err(error) => debug!(%peer_addr, "Connection finished with error: {error}"),
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let mut buf = Vec::with_capacity(1024);
        let head = match read_request_head(&mut stream, &mut buf).await {
            Ok(head) => head,
            Err(HeadError::TooLarge) => {
                return write_message_response(&mut stream, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, "Request head too large").await;
            }
            Err(HeadError::Malformed(error)) => {
                debug!(%peer_addr, "Malformed request: {error}");
                return write_message_response(&mut stream, StatusCode::BAD_REQUEST, "Malformed request").await;
            }
            Err(HeadError::Incomplete) => return Ok(()),
            Err(HeadError::Io(error)) => return Err(error),
        };

        trace!(%peer_addr, method = %head.method, target = %head.target, host = ?head.host, "Request");

        let maybe_client_id = head
            .host
            .as_deref()
            .and_then(|host| client_id_from_host(host, self.domain.as_deref()));

        match maybe_client_id {
            Some(client_id) => self.proxy_to_session(&client_id, stream, &buf).await,
            None => self.handle_api(&head, &mut stream).await,
        }
    }

    async fn proxy_to_session(&self, client_id: &str, mut stream: TcpStream, buffered: &[u8]) -> io::Result<()> {
        // Only the pool is kept, so a replaced or removed session is not held alive by requests.
        let maybe_pool = self.registry.get_client(client_id).map(|session| session.pool().clone());
        let pool = match maybe_pool {
            Some(p) => p,
            None => {
                debug!(client_id, "Request for unknown tunnel");
                return write_message_response(&mut stream, StatusCode::NOT_FOUND, "Tunnel not found").await;
            }
        };

        forward(&pool, stream, buffered).await
    }

    async fn handle_api<W: AsyncWrite + Unpin>(&self, head: &RequestHead, stream: &mut W) -> io::Result<()> {
        if head.method != "GET" {
            return write_message_response(stream, StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").await;
        }

        let path = head.path();
        if path == "/api/status" {
            return write_json_response(stream, StatusCode::OK, &self.registry.stats()).await;
        }

        if let Some(client_id) = path.strip_prefix("/api/tunnels/").and_then(|rest| rest.strip_suffix("/status")) {
            return match self.registry.get_client(client_id) {
                Some(session) => {
                    let status = TunnelStatus {
                        connected_sockets: session.pool().stats().connected_sockets,
                    };
                    write_json_response(stream, StatusCode::OK, &status).await
                }
                None => write_message_response(stream, StatusCode::NOT_FOUND, "Tunnel not found").await,
            };
        }

        if path == "/" {
            return match head.has_query_param("new") {
                true => self.create_client(&random_client_id(), head, stream).await,
                false => write_message_response(stream, StatusCode::NOT_FOUND, "Not found").await,
            };
        }

        match path.strip_prefix('/') {
            Some(requested) if !requested.contains('/') => {
                if !is_valid_client_id(requested) {
                    let message = "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";
                    return write_message_response(stream, StatusCode::FORBIDDEN, message).await;
                }

                self.create_client(requested, head, stream).await
            }
            _ => write_message_response(stream, StatusCode::NOT_FOUND, "Not found").await,
        }
    }

    async fn create_client<W: AsyncWrite + Unpin>(&self, client_id: &str, head: &RequestHead, stream: &mut W) -> io::Result<()> {
        info!(client_id, "Making new client");

        let info = match self.registry.new_client(client_id).await {
            Ok(info) => info,
            Err(error) => {
                error!(client_id, "Failed to create client: {error}");
                return write_message_response(stream, StatusCode::INTERNAL_SERVER_ERROR, "Could not create tunnel").await;
            }
        };

        let url = self.client_url(&info.id, head.host.as_deref());
        write_json_response(stream, StatusCode::OK, &ClientCreated { info, url }).await
    }

    fn client_url(&self, client_id: &str, host: Option<&str>) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let base = self.domain.as_deref().or(host).unwrap_or("localhost");
        format!("{scheme}://{client_id}.{base}")
    }
}

/// Relays one public connection through a socket from `source`.
///
/// `buffered` holds whatever was already read from `client` and is sent upstream first. If no
/// socket can be had, the client gets a 502 instead.
pub async fn forward<S, C>(source: &S, mut client: C, buffered: &[u8]) -> io::Result<()>
where
    S: ConnectionSource,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match source.create_connection().await {
        Ok(stream) => stream,
        Err(error) => {
            debug!("No tunnel socket for request: {error}");
            return write_message_response(&mut client, StatusCode::BAD_GATEWAY, "Tunnel unavailable").await;
        }
    };

    upstream.write_all(buffered).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    trace!(sent = sent + buffered.len() as u64, received, "Request relayed");
    Ok(())
}
