//! The per-connection I/O engine.
//!
//! A [`Connection`] couples one [`Transport`] with a FIFO queue of
//! encoded outbound messages and an incremental decode of the inbound
//! byte stream. The core operations ([`send`](Connection::send),
//! [`try_recv`](Connection::try_recv), [`flush`](Connection::flush))
//! never block; the async wrappers ([`send_all`](Connection::send_all),
//! [`recv`](Connection::recv), [`transact`](Connection::transact)) loop
//! them over readiness.
//!
//! Messages travel as concatenated JSON texts with no framing delimiter;
//! the decoder finds the end of each top-level value itself, so inbound
//! bytes are buffered only until a value completes.
//!
//! Failures latch: the first terminal condition releases the transport
//! and all buffered state, and every later operation reports the same
//! [`Fault`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Duration;

use serde_json::{Deserializer, Value};
use tokio::io::Interest;
use tracing::{debug, trace, warn};

use crate::msg::Message;
use crate::throttle::Throttle;
use crate::transport::Transport;

/// Inbound read chunk size.
const READ_CHUNK: usize = 4096;

/// Compact the receive buffer once this many consumed bytes accumulate.
const COMPACT_THRESHOLD: usize = 4096;

/// A terminal failure latched on a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The peer closed the stream.
    Eof,
    /// Malformed JSON, or a message violating the JSON-RPC shape rules.
    Protocol,
    /// A transport-level error.
    Io(io::ErrorKind),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Eof => write!(f, "connection closed by peer"),
            Fault::Protocol => write!(f, "protocol error"),
            Fault::Io(kind) => write!(f, "i/o error: {kind}"),
        }
    }
}

impl std::error::Error for Fault {}

/// An outbound buffer, possibly partially written.
struct OutBuf {
    data: Vec<u8>,
    /// Bytes already accepted by the transport.
    sent: usize,
}

impl OutBuf {
    fn unsent(&self) -> &[u8] {
        &self.data[self.sent..]
    }
}

/// Live I/O state; dropped wholesale when a fault latches.
struct Io<T> {
    transport: T,
    /// Raw inbound bytes; `[parsed..]` has not been consumed yet.
    inbuf: Vec<u8>,
    parsed: usize,
    /// The decoder saw everything buffered and needs more transport
    /// bytes to make progress.
    starved: bool,
    /// At most one decoded message awaiting `try_recv`.
    staged: Option<Message>,
    /// FIFO of encoded outbound messages; front is oldest.
    output: VecDeque<OutBuf>,
    /// Unsent bytes across `output` (not the queue depth).
    backlog: usize,
}

enum State<T> {
    Open(Io<T>),
    Dead(Fault),
}

/// A JSON-RPC connection over one byte-stream transport.
///
/// Owned by a single task; none of the operations are re-entrant.
pub struct Connection<T> {
    name: String,
    state: State<T>,
    warn_budget: Throttle,
}

impl<T: Transport> Connection<T> {
    /// Take ownership of a connected transport.
    pub fn new(transport: T) -> Connection<T> {
        Connection {
            name: transport.name().to_string(),
            state: State::Open(Io {
                transport,
                inbuf: Vec::new(),
                parsed: 0,
                starved: false,
                staged: None,
                output: VecDeque::new(),
                backlog: 0,
            }),
            warn_budget: Throttle::new(5, Duration::from_secs(5)),
        }
    }

    /// The name of the underlying transport.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Ok` while healthy, the latched fault otherwise.
    pub fn status(&self) -> Result<(), Fault> {
        match &self.state {
            State::Open(_) => Ok(()),
            State::Dead(fault) => Err(*fault),
        }
    }

    /// Bytes queued for transmission but not yet written. Zero once a
    /// fault is latched.
    pub fn backlog(&self) -> usize {
        match &self.state {
            State::Open(io) => io.backlog,
            State::Dead(_) => 0,
        }
    }

    /// Latch a terminal fault. No-op if one is already latched.
    ///
    /// The transport and all buffered state are released immediately;
    /// only the fault remains queryable.
    pub fn fail(&mut self, fault: Fault) {
        if let State::Open(_) = self.state {
            self.state = State::Dead(fault);
        }
    }

    /// Queue `msg` for transmission and opportunistically flush.
    ///
    /// Consumes the message either way. The flush attempt is made only
    /// when this message is the only queued one; with older buffers still
    /// pending the transport already refused to take more.
    pub fn send(&mut self, msg: Message) -> Result<(), Fault> {
        let io = match &mut self.state {
            State::Open(io) => io,
            State::Dead(fault) => return Err(*fault),
        };
        trace!(conn = %self.name, kind = msg.kind(), "send");
        let text = msg.into_value().to_string();
        let first = io.output.is_empty();
        io.backlog += text.len();
        io.output.push_back(OutBuf {
            data: text.into_bytes(),
            sent: 0,
        });
        if first {
            self.flush();
        }
        self.status()
    }

    /// Write as much queued output as the transport will take without
    /// blocking. Any error other than `WouldBlock` latches.
    pub fn flush(&mut self) {
        let io = match &mut self.state {
            State::Open(io) => io,
            State::Dead(_) => return,
        };
        let fault = loop {
            let Some(front) = io.output.front_mut() else {
                break None;
            };
            match io.transport.try_send(front.unsent()) {
                Ok(0) => break Some(Fault::Io(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    io.backlog -= n;
                    front.sent += n;
                    if front.sent == front.data.len() {
                        io.output.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) => {
                    if self.warn_budget.admit() {
                        warn!(conn = %self.name, error = %e, "send error");
                    }
                    break Some(Fault::Io(e.kind()));
                }
            }
        };
        if let Some(fault) = fault {
            self.fail(fault);
        }
    }

    /// Pull the next fully decoded message, if one is available.
    ///
    /// `Ok(None)` means no complete message has arrived yet. EOF, I/O
    /// errors, and undecodable input latch and return the fault.
    pub fn try_recv(&mut self) -> Result<Option<Message>, Fault> {
        loop {
            let io = match &mut self.state {
                State::Open(io) => io,
                State::Dead(fault) => return Err(*fault),
            };
            if let Some(msg) = io.staged.take() {
                return Ok(Some(msg));
            }

            // Decode from already-buffered bytes before reading more.
            match next_value(&io.inbuf[io.parsed..]) {
                Ok(Some((value, used))) => {
                    io.parsed += used;
                    match Message::from_value(value) {
                        Ok(msg) => {
                            trace!(conn = %self.name, kind = msg.kind(), "received");
                            io.staged = Some(msg);
                        }
                        Err(reason) => {
                            if self.warn_budget.admit() {
                                warn!(conn = %self.name, %reason, "received bad JSON-RPC message");
                            }
                            self.fail(Fault::Protocol);
                            return Err(Fault::Protocol);
                        }
                    }
                }
                Ok(None) => {
                    compact(&mut io.inbuf, &mut io.parsed);
                    let start = io.inbuf.len();
                    io.inbuf.resize(start + READ_CHUNK, 0);
                    match io.transport.try_recv(&mut io.inbuf[start..]) {
                        Ok(0) => {
                            debug!(conn = %self.name, "connection closed by peer");
                            self.fail(Fault::Eof);
                            return Err(Fault::Eof);
                        }
                        Ok(n) => {
                            io.inbuf.truncate(start + n);
                            io.starved = false;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            io.inbuf.truncate(start);
                            io.starved = true;
                            return Ok(None);
                        }
                        Err(e) => {
                            if self.warn_budget.admit() {
                                warn!(conn = %self.name, error = %e, "receive error");
                            }
                            let fault = Fault::Io(e.kind());
                            self.fail(fault);
                            return Err(fault);
                        }
                    }
                }
                Err(reason) => {
                    if self.warn_budget.admit() {
                        warn!(conn = %self.name, %reason, "error parsing stream");
                    }
                    self.fail(Fault::Protocol);
                    return Err(Fault::Protocol);
                }
            }
        }
    }

    /// Completes when [`flush`](Connection::flush) could make progress.
    ///
    /// Immediate once a fault is latched; pending forever while nothing
    /// is queued (so it composes in a `select!` without spinning).
    pub async fn send_ready(&self) {
        match &self.state {
            State::Dead(_) => {}
            State::Open(io) => {
                if io.output.is_empty() {
                    std::future::pending::<()>().await;
                } else {
                    let _ = io.transport.ready(Interest::WRITABLE).await;
                }
            }
        }
    }

    /// Completes when [`try_recv`](Connection::try_recv) could make
    /// progress: a message is staged, buffered bytes remain that the
    /// decoder has not seen, a fault is latched, or the transport becomes
    /// readable.
    pub async fn recv_ready(&self) {
        match &self.state {
            State::Dead(_) => {}
            State::Open(io) => {
                if io.staged.is_some() || (!io.starved && io.parsed < io.inbuf.len()) {
                    return;
                }
                let _ = io.transport.ready(Interest::READABLE).await;
            }
        }
    }

    /// Send `msg` and wait until it is fully written to the transport.
    pub async fn send_all(&mut self, msg: Message) -> Result<(), Fault> {
        self.send(msg)?;
        loop {
            self.status()?;
            if self.backlog() == 0 {
                return Ok(());
            }
            self.send_ready().await;
            self.flush();
        }
    }

    /// Wait for the next message.
    ///
    /// Keeps the output queue draining while blocked on input.
    pub async fn recv(&mut self) -> Result<Message, Fault> {
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }
            self.flush();
            tokio::select! {
                _ = self.recv_ready() => {}
                _ = self.send_ready() => {}
            }
        }
    }

    /// Send a request and wait for the response carrying its id.
    ///
    /// Any other traffic arriving meanwhile — notifications, responses to
    /// other requests — is discarded, so this is only appropriate on a
    /// connection the caller is not otherwise multiplexing.
    pub async fn transact(&mut self, request: Message) -> Result<Message, Fault> {
        let id = request.id().cloned();
        self.send_all(request).await?;
        loop {
            let msg = self.recv().await?;
            match &msg {
                Message::Reply { id: got, .. } | Message::Error { id: got, .. }
                    if Some(got) == id.as_ref() =>
                {
                    return Ok(msg);
                }
                _ => {
                    trace!(conn = %self.name, kind = msg.kind(), "transact: discarding unrelated message");
                }
            }
        }
    }
}

/// Try to decode one top-level JSON value from the front of `bytes`.
///
/// Returns the value and how many input bytes it consumed, including any
/// leading whitespace. `Ok(None)` means the buffered data is a valid
/// prefix and more bytes are needed.
fn next_value(bytes: &[u8]) -> Result<Option<(Value, usize)>, String> {
    let mut values = Deserializer::from_slice(bytes).into_iter::<Value>();
    match values.next() {
        Some(Ok(value)) => {
            let used = values.byte_offset();
            Ok(Some((value, used)))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e.to_string()),
        None => Ok(None),
    }
}

/// Drop the consumed prefix of the receive buffer once it grows large.
fn compact(inbuf: &mut Vec<u8>, parsed: &mut usize) {
    if *parsed == inbuf.len() {
        inbuf.clear();
        *parsed = 0;
    } else if *parsed >= COMPACT_THRESHOLD {
        inbuf.drain(..*parsed);
        *parsed = 0;
    }
}
