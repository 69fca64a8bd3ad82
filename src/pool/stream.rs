use std::{
    cell::RefCell,
    cmp,
    io::{self, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    rc::Weak,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::PoolInner;

/// A socket opened by a remote tunnel client and handed out by a
/// [`ConnectionPool`](super::ConnectionPool).
///
/// The pool counts the socket as connected for as long as this value lives. Dropping it closes
/// the socket and releases its slot, which may emit the pool's offline signal.
///
/// Bytes the tunnel client sent while the socket sat idle in the pool are returned by the first
/// reads, before anything else read from the socket.
#[derive(Debug)]
pub struct PooledStream {
    stream: TcpStream,
    peer_addr: SocketAddr,
    pending: Vec<u8>,
    _lease: SocketLease,
}

impl PooledStream {
    pub(super) fn new(stream: TcpStream, peer_addr: SocketAddr, lease: SocketLease) -> Self {
        Self {
            stream,
            peer_addr,
            pending: Vec::new(),
            _lease: lease,
        }
    }

    /// Moves whatever the socket has ready to read into the pending buffer, without waiting.
    ///
    /// Returns `false` once the remote end closed its side.
    pub(super) fn buffer_incoming(&mut self, max_pending: usize) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        match self.stream.try_read(&mut chunk) {
            Ok(0) => Ok(false),
            Ok(read) if self.pending.len() + read > max_pending => Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("more than {max_pending} bytes sent on an unclaimed socket"),
            )),
            Ok(read) => {
                self.pending.extend_from_slice(&chunk[..read]);
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(true),
            Err(error) => Err(error),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(super) fn tcp(&self) -> &TcpStream {
        &self.stream
    }

    #[cfg(test)]
    pub(super) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl AsyncRead for PooledStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            let len = cmp::min(buf.remaining(), self.pending.len());
            buf.put_slice(&self.pending[..len]);
            self.pending.drain(..len);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(mut self: Pin<&mut Self>, cx: &mut Context<'_>, bufs: &[io::IoSlice<'_>]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

/// Holds one of the pool's connected-socket slots and gives it back on drop.
///
/// Must never be dropped while the pool's state is borrowed.
#[derive(Debug)]
pub(super) struct SocketLease {
    pool: Weak<RefCell<PoolInner>>,
}

impl SocketLease {
    pub(super) fn new(pool: Weak<RefCell<PoolInner>>) -> Self {
        Self { pool }
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.borrow_mut().release_socket();
        }
    }
}
