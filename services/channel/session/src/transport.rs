//! TCP transport for channel sessions.
//!
//! [`IoStream`] is the byte stream a session runs over. Besides plain TCP it
//! has an in-memory variant with synthetic addresses, used to drive sessions
//! without sockets.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Unified stream type for plain TCP and in-memory pipes
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// In-memory pipe with synthetic endpoints
    Memory {
        /// Pipe end
        stream: DuplexStream,
        /// Address reported as local
        local: SocketAddr,
        /// Address reported as peer
        peer: SocketAddr,
    },
}

impl IoStream {
    /// Create two connected in-memory streams, `a` at `a_addr` and `b` at `b_addr`
    pub fn memory_pair(a_addr: SocketAddr, b_addr: SocketAddr, capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            IoStream::Memory {
                stream: a,
                local: a_addr,
                peer: b_addr,
            },
            IoStream::Memory {
                stream: b,
                local: b_addr,
                peer: a_addr,
            },
        )
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Memory { peer, .. } => Ok(*peer),
        }
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.local_addr(),
            IoStream::Memory { local, .. } => Ok(*local),
        }
    }
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStream::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            IoStream::Memory { local, peer, .. } => f
                .debug_struct("Memory")
                .field("local", local)
                .field("peer", peer)
                .finish(),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Produces client streams for outbound connections
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a stream to `endpoint`
    async fn connect(&self, endpoint: SocketAddr) -> std::io::Result<IoStream>;
}

/// Connector that dials plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr) -> std::io::Result<IoStream> {
        let stream = connect_tcp(endpoint).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", endpoint);
        Ok(IoStream::Plain(stream))
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let io_stream = TcpConnector.connect(bound_addr).await.unwrap();
        assert_eq!(io_stream.peer_addr().unwrap(), bound_addr);

        let (accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, io_stream.local_addr().unwrap());
        drop(accepted);
    }

    #[tokio::test]
    async fn test_memory_pair_addresses_and_bytes() {
        let a_addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let (mut a, mut b) = IoStream::memory_pair(a_addr, b_addr, 64);

        assert_eq!(a.local_addr().unwrap(), a_addr);
        assert_eq!(a.peer_addr().unwrap(), b_addr);
        assert_eq!(b.peer_addr().unwrap(), a_addr);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
