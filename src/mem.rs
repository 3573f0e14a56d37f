//! In-process transport pairs.
//!
//! [`pair`] returns two connected [`MemoryTransport`]s backed by bounded
//! byte pipes. Useful for exercising connections and sessions without
//! real networking; the bounded capacity makes partial writes and
//! backpressure easy to provoke.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{Interest, Ready};
use tokio::sync::Notify;

use crate::transport::{ReadyFuture, Transport};

static NEXT_PAIR: AtomicU64 = AtomicU64::new(0);

/// One direction of the pipe pair.
struct Pipe {
    state: Mutex<PipeState>,
    /// Signaled when bytes (or EOF) become available to the reader.
    readable: Notify,
    /// Signaled when space becomes available to the writer.
    writable: Notify,
}

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Pipe> {
        Arc::new(Pipe {
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                capacity,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

/// One end of an in-process byte-pipe pair.
///
/// Dropping an end closes both directions: the peer reads EOF once it has
/// drained the pipe, and its writes fail with `BrokenPipe`.
pub struct MemoryTransport {
    name: String,
    /// Pipe this end writes into (the peer reads it).
    tx: Arc<Pipe>,
    /// Pipe this end reads from (the peer writes it).
    rx: Arc<Pipe>,
}

/// Create a connected transport pair. Each direction buffers at most
/// `capacity` bytes before writes report `WouldBlock`.
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let n = NEXT_PAIR.fetch_add(1, Ordering::Relaxed);
    let ab = Pipe::new(capacity);
    let ba = Pipe::new(capacity);
    let a = MemoryTransport {
        name: format!("mem:{n}.a"),
        tx: ab.clone(),
        rx: ba.clone(),
    };
    let b = MemoryTransport {
        name: format!("mem:{n}.b"),
        tx: ba,
        rx: ab,
    };
    (a, b)
}

impl MemoryTransport {
    fn read_ready(&self) -> bool {
        let rx = self.rx.lock();
        !rx.buf.is_empty() || rx.closed
    }

    fn write_ready(&self) -> bool {
        let tx = self.tx.lock();
        tx.buf.len() < tx.capacity || tx.closed
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock();
        if rx.buf.is_empty() {
            return if rx.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = rx.buf.len().min(buf.len());
        let (front, back) = rx.buf.as_slices();
        let from_front = front.len().min(n);
        buf[..from_front].copy_from_slice(&front[..from_front]);
        if from_front < n {
            buf[from_front..n].copy_from_slice(&back[..n - from_front]);
        }
        rx.buf.drain(..n);
        drop(rx);
        self.rx.writable.notify_one();
        Ok(n)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut tx = self.tx.lock();
        if tx.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = tx.capacity.saturating_sub(tx.buf.len());
        if room == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = room.min(buf.len());
        tx.buf.extend(&buf[..n]);
        drop(tx);
        self.tx.readable.notify_one();
        Ok(n)
    }

    fn ready(&self, interest: Interest) -> ReadyFuture<'_> {
        Box::pin(async move {
            loop {
                let mut ready = Ready::EMPTY;
                if interest.is_readable() && self.read_ready() {
                    ready |= Ready::READABLE;
                }
                if interest.is_writable() && self.write_ready() {
                    ready |= Ready::WRITABLE;
                }
                if !ready.is_empty() {
                    return Ok(ready);
                }
                match (interest.is_readable(), interest.is_writable()) {
                    (true, true) => {
                        tokio::select! {
                            _ = self.rx.readable.notified() => {}
                            _ = self.tx.writable.notified() => {}
                        }
                    }
                    (true, false) => self.rx.readable.notified().await,
                    _ => self.tx.writable.notified().await,
                }
            }
        })
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let (mut a, mut b) = pair(1024);
        assert_eq!(a.try_send(b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(b.try_recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn empty_pipe_would_block() {
        let (mut a, _b) = pair(1024);
        let mut buf = [0u8; 16];
        let err = a.try_recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn writes_are_bounded_by_capacity() {
        let (mut a, mut b) = pair(4);
        assert_eq!(a.try_send(b"abcdef").unwrap(), 4);
        let err = a.try_send(b"ef").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let mut buf = [0u8; 2];
        assert_eq!(b.try_recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(a.try_send(b"ef").unwrap(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(b.try_recv(&mut rest).unwrap(), 4);
        assert_eq!(&rest[..4], b"cdef");
    }

    #[test]
    fn drop_gives_the_peer_eof_then_broken_pipe() {
        let (mut a, b) = pair(1024);
        drop(b);
        let mut buf = [0u8; 4];
        assert_eq!(a.try_recv(&mut buf).unwrap(), 0);
        let err = a.try_send(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn buffered_bytes_survive_peer_drop() {
        let (mut a, mut b) = pair(1024);
        a.try_send(b"bye").unwrap();
        drop(a);
        let mut buf = [0u8; 8];
        assert_eq!(b.try_recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"bye");
        assert_eq!(b.try_recv(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn readiness_wakes_a_blocked_reader() {
        let (mut a, mut b) = pair(1024);
        let reader = tokio::spawn(async move {
            b.ready(Interest::READABLE).await.unwrap();
            let mut buf = [0u8; 4];
            let n = b.try_recv(&mut buf).unwrap();
            buf[..n].to_vec()
        });
        tokio::task::yield_now().await;
        a.try_send(b"ping").unwrap();
        assert_eq!(reader.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn readiness_wakes_a_blocked_writer() {
        let (mut a, mut b) = pair(2);
        a.try_send(b"xy").unwrap();
        let writer = tokio::spawn(async move {
            a.ready(Interest::WRITABLE).await.unwrap();
            a.try_send(b"z").unwrap()
        });
        tokio::task::yield_now().await;
        let mut buf = [0u8; 2];
        b.try_recv(&mut buf).unwrap();
        assert_eq!(writer.await.unwrap(), 1);
    }
}
