//! Byte-stream transports.
//!
//! [`Transport`] abstracts the byte stream under a
//! [`Connection`](crate::Connection): non-blocking reads and writes plus
//! readiness registration. Implementations:
//!
//! - [`TcpTransport`] and [`UnixTransport`] over tokio sockets
//! - [`MemoryTransport`](crate::mem::MemoryTransport) for in-process pairs
//!
//! [`open`] resolves the textual names sessions are configured with.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Readiness future returned by [`Transport::ready`].
pub type ReadyFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Ready>> + Send + 'a>>;

/// A reliable byte stream with non-blocking operations and readiness
/// registration.
///
/// Object-safe so connections opened by name can be handled uniformly,
/// which is why [`ready`](Transport::ready) returns a boxed future.
pub trait Transport: Send {
    /// The name the transport was opened with, or one derived from the
    /// peer address.
    fn name(&self) -> &str;

    /// Read into `buf` without blocking. `Ok(0)` means the peer closed
    /// the stream; `WouldBlock` means no bytes are available yet.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf` without blocking, returning how many bytes were
    /// accepted. `WouldBlock` means the stream cannot take any right now.
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait until the stream is ready for any of `interest`.
    fn ready(&self, interest: Interest) -> ReadyFuture<'_>;
}

impl Transport for Box<dyn Transport> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_recv(buf)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_send(buf)
    }

    fn ready(&self, interest: Interest) -> ReadyFuture<'_> {
        (**self).ready(interest)
    }
}

/// Open a transport by name.
///
/// Understood schemes: `tcp:HOST:PORT` and `unix:PATH` (Unix platforms
/// only). The name is kept verbatim as the transport's name. Unknown
/// schemes fail with `InvalidInput`.
pub async fn open(name: &str) -> io::Result<Box<dyn Transport>> {
    if let Some(addr) = name.strip_prefix("tcp:") {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransport {
            name: name.to_string(),
            stream,
        }))
    } else if let Some(path) = name.strip_prefix("unix:") {
        open_unix(path, name).await
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown stream name \"{name}\""),
        ))
    }
}

#[cfg(unix)]
async fn open_unix(path: &str, name: &str) -> io::Result<Box<dyn Transport>> {
    let stream = UnixStream::connect(path).await?;
    Ok(Box::new(UnixTransport {
        name: name.to_string(),
        stream,
    }))
}

#[cfg(not(unix))]
async fn open_unix(_path: &str, _name: &str) -> io::Result<Box<dyn Transport>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    ))
}

/// A TCP byte stream.
pub struct TcpTransport {
    name: String,
    stream: TcpStream,
}

impl TcpTransport {
    /// Wrap an already-connected socket (typically one returned by a
    /// listener's `accept`), deriving the name from the peer address.
    pub fn new(stream: TcpStream) -> TcpTransport {
        let name = match stream.peer_addr() {
            Ok(addr) => format!("tcp:{addr}"),
            Err(_) => "tcp:unknown".to_string(),
        };
        TcpTransport { name, stream }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn ready(&self, interest: Interest) -> ReadyFuture<'_> {
        Box::pin(self.stream.ready(interest))
    }
}

/// A Unix-domain byte stream.
#[cfg(unix)]
pub struct UnixTransport {
    name: String,
    stream: UnixStream,
}

#[cfg(unix)]
impl UnixTransport {
    /// Wrap an already-connected socket, deriving the name from the peer
    /// address when it has one.
    pub fn new(stream: UnixStream) -> UnixTransport {
        let name = stream
            .peer_addr()
            .ok()
            .and_then(|addr| {
                addr.as_pathname()
                    .map(|path| format!("unix:{}", path.display()))
            })
            .unwrap_or_else(|| "unix:unnamed".to_string());
        UnixTransport { name, stream }
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn ready(&self, interest: Interest) -> ReadyFuture<'_> {
        Box::pin(self.stream.ready(interest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_rejects_unknown_scheme() {
        let err = match open("carrier-pigeon:coop").await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = open(&format!("tcp:{addr}")).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let mut server = TcpTransport::new(accepted);

        assert!(client.name().starts_with("tcp:"));
        assert!(server.name().starts_with("tcp:"));

        client.ready(Interest::WRITABLE).await.unwrap();
        let sent = client.try_send(b"hello").unwrap();
        assert!(sent > 0);

        server.ready(Interest::READABLE).await.unwrap();
        let mut buf = [0u8; 16];
        let received = server.try_recv(&mut buf).unwrap();
        assert_eq!(&buf[..received], &b"hello"[..received]);
    }

    #[tokio::test]
    async fn recv_reports_eof_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = open(&format!("tcp:{addr}")).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        drop(accepted);

        client.ready(Interest::READABLE).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.try_recv(&mut buf).unwrap(), 0);
    }
}
