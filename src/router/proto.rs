use std::{
    fmt::Write as _,
    io,
    net::IpAddr,
};

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request heads longer than this are refused.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// The parts of an HTTP request head the router cares about.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub host: Option<String>,
}

impl RequestHead {
    /// The request target without its query string.
    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Whether the query string contains `name`, either bare or as `name=value`.
    pub fn has_query_param(&self, name: &str) -> bool {
        self.target.split_once('?').is_some_and(|(_, query)| {
            query
                .split('&')
                .any(|param| param.split_once('=').map_or(param, |(key, _)| key) == name)
        })
    }
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request head is larger than {MAX_HEAD_LEN} bytes")]
    TooLarge,
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("connection closed before the request head was complete")]
    Incomplete,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parses the request head at the start of `buf`. Returns `None` if more bytes are needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooLarge),
        Err(error) => return Err(HeadError::Malformed(error)),
    }

    let host = request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("host"))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(|value| value.trim().to_owned());

    Ok(Some(RequestHead {
        method: request.method.unwrap_or_default().to_owned(),
        target: request.path.unwrap_or_default().to_owned(),
        host,
    }))
}

/// Reads from `reader` into `buf` until a full request head has arrived, then parses it.
///
/// Bytes past the head (the start of a body, or pipelined requests) are left in `buf` too, so the
/// caller can forward everything it read.
pub async fn read_request_head<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<RequestHead, HeadError> {
    let mut chunk = [0u8; 2048];
    loop {
        if let Some(head) = parse_request_head(buf)? {
            return Ok(head);
        }

        if buf.len() >= MAX_HEAD_LEN {
            return Err(HeadError::TooLarge);
        }

        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Err(HeadError::Incomplete);
        }

        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Extracts the session id from a `Host` header value.
///
/// With a configured `domain`, the id is whatever comes before `.{domain}`. Without one, it's the
/// first label of any host name with at least three labels. IP addresses never carry an id.
pub fn client_id_from_host(host: &str, domain: Option<&str>) -> Option<String> {
    let hostname = strip_port(host).to_ascii_lowercase();
    if hostname.parse::<IpAddr>().is_ok() {
        return None;
    }

    let subdomain = match domain {
        Some(domain) => hostname
            .strip_suffix(domain.to_ascii_lowercase().as_str())?
            .strip_suffix('.')?
            .to_owned(),
        None => {
            let mut labels = hostname.split('.');
            let first = labels.next()?;
            if labels.count() < 2 {
                return None;
            }
            first.to_owned()
        }
    };

    match subdomain.is_empty() {
        true => None,
        false => Some(subdomain),
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(address, _)| address);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Whether `id` is acceptable as a requested session id: 4 to 63 lowercase alphanumeric
/// characters, or lowercase alphanumerics and dashes that neither start nor end with a dash, with
/// 4 to 63 characters between the first and the last.
pub fn is_valid_client_id(id: &str) -> bool {
    let is_alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = id.as_bytes();

    if (4..=63).contains(&bytes.len()) && bytes.iter().all(is_alnum) {
        return true;
    }

    match bytes {
        [first, middle @ .., last] => {
            is_alnum(first) && is_alnum(last) && (4..=63).contains(&middle.len()) && middle.iter().all(|b| is_alnum(b) || *b == b'-')
        }
        _ => false,
    }
}

#[derive(Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

/// Writes a complete `Connection: close` response with a JSON body.
pub async fn write_json_response<W, T>(writer: &mut W, status: StatusCode, body: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(body).map_err(io::Error::from)?;

    let mut head = String::with_capacity(128);
    let _ = write!(
        head,
        "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        body.len()
    );

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Writes a response whose JSON body is `{"message": message}`.
pub async fn write_message_response<W: AsyncWrite + Unpin>(writer: &mut W, status: StatusCode, message: &str) -> io::Result<()> {
    write_json_response(writer, status, &MessageBody { message }).await
}
