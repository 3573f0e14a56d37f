//! The reconnecting session.
//!
//! [`Session`] hides connect/disconnect churn behind a steady
//! `send`/`recv`/`run` surface. It owns at most one of an active
//! [`Connection`] or an in-flight connect attempt, consults a
//! [`Reconnect`] controller on every [`run`](Session::run), answers the
//! peer's `echo` probes, and absorbs the replies to its own.
//!
//! Connectivity changes are observable only through
//! [`seqno`](Session::seqno): it increments on every transition, so a
//! caller that cached state about the peer compares seqnos to learn that
//! the stream underneath it was replaced.
//!
//! The probe id — the JSON string `"echo"` — is reserved. A caller that
//! uses that id for its own request will have the reply absorbed here.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Connection, Fault};
use crate::msg::Message;
use crate::reconnect::{Command, Policy, Reconnect};
use crate::throttle::Throttle;
use crate::transport::{self, Transport};

/// Error from [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// No connection is established right now.
    NotConnected,
    /// The active connection has latched a fault.
    Fault(Fault),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "not connected"),
            SessionError::Fault(fault) => fault.fmt(f),
        }
    }
}

impl std::error::Error for SessionError {}

/// Result slot shared with the spawned connect task.
struct Pending {
    slot: Mutex<Option<io::Result<Box<dyn Transport>>>>,
    done: Notify,
}

/// An in-flight connect attempt.
struct Connecting {
    outcome: Arc<Pending>,
    task: JoinHandle<()>,
}

/// An always-available logical JSON-RPC connection.
///
/// Owned by a single task and driven from within a tokio runtime:
/// `run` / `recv` / `send` between awaits of [`wait`](Session::wait).
pub struct Session {
    reconnect: Reconnect,
    conn: Option<Connection<Box<dyn Transport>>>,
    connecting: Option<Connecting>,
    seqno: u64,
    warn_budget: Throttle,
}

impl Session {
    /// Open a session that connects, and reconnects with backoff, to
    /// `name` — any name [`transport::open`] accepts.
    pub fn open(name: impl Into<String>) -> Session {
        Session::open_with_policy(name, Policy::default())
    }

    /// Like [`open`](Session::open), with explicit backoff and probe
    /// timing.
    pub fn open_with_policy(name: impl Into<String>, policy: Policy) -> Session {
        let mut reconnect = Reconnect::with_policy(name, policy);
        reconnect.enable(Instant::now());
        Session {
            reconnect,
            conn: None,
            connecting: None,
            seqno: 0,
            warn_budget: Throttle::new(5, Duration::from_secs(5)),
        }
    }

    /// Wrap an existing connection. If it drops, the session stays down.
    pub fn open_unreliably(conn: Connection<Box<dyn Transport>>) -> Session {
        let mut reconnect = Reconnect::new(conn.name());
        reconnect.set_max_tries(Some(0));
        reconnect.connected(Instant::now());
        Session {
            reconnect,
            conn: Some(conn),
            connecting: None,
            seqno: 0,
            warn_budget: Throttle::new(5, Duration::from_secs(5)),
        }
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        self.reconnect.name()
    }

    /// Bumped on every connectivity transition; never decreases.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// True while a connection is established.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// False only when the session is down for good: retries exhausted,
    /// or an unreliable session that lost its connection.
    pub fn is_alive(&self) -> bool {
        self.conn.is_some() || self.connecting.is_some() || self.reconnect.max_tries() != Some(0)
    }

    /// Unsent bytes on the active connection.
    pub fn backlog(&self) -> usize {
        self.conn.as_ref().map_or(0, Connection::backlog)
    }

    /// Tear down and reconnect as soon as the controller allows.
    pub fn force_reconnect(&mut self) {
        self.reconnect.force_reconnect(Instant::now());
    }

    /// Drop whichever of the connection or connect attempt exists.
    fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            self.seqno += 1;
        } else if let Some(connecting) = self.connecting.take() {
            connecting.task.abort();
            self.seqno += 1;
        }
    }

    /// Replace any current state with a fresh connect attempt.
    fn start_connect(&mut self, now: Instant) {
        self.teardown();
        let name = self.reconnect.name().to_string();
        let outcome = Arc::new(Pending {
            slot: Mutex::new(None),
            done: Notify::new(),
        });
        let shared = outcome.clone();
        let task = tokio::spawn(async move {
            let result = transport::open(&name).await;
            *shared.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
            shared.done.notify_one();
        });
        self.reconnect.connecting(now);
        self.connecting = Some(Connecting { outcome, task });
        self.seqno += 1;
    }

    /// Advance the state machine.
    ///
    /// Flushes the active connection and tears it down once a fault has
    /// latched, promotes a finished connect attempt, then obeys the
    /// controller. Never blocks; callers sleep in [`wait`](Session::wait).
    pub fn run(&mut self) {
        let now = Instant::now();

        if let Some(conn) = &mut self.conn {
            conn.flush();
            if let Err(fault) = conn.status() {
                self.reconnect.disconnected(now, Some(fault));
                self.teardown();
            }
        } else if let Some(connecting) = &self.connecting {
            let finished = connecting
                .outcome
                .slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(result) = finished {
                self.connecting = None;
                match result {
                    Ok(stream) => {
                        self.reconnect.connected(now);
                        self.conn = Some(Connection::new(stream));
                    }
                    Err(error) => {
                        self.reconnect.connect_failed(now, &error);
                    }
                }
            }
        }

        match self.reconnect.run(now) {
            Some(Command::Connect) => self.start_connect(now),
            Some(Command::Disconnect) => {
                self.reconnect.disconnected(now, None);
                self.teardown();
            }
            Some(Command::Probe) => self.probe(),
            None => {}
        }
    }

    /// Send a liveness probe, fire and forget; the reply comes back
    /// through `recv` and is absorbed there.
    fn probe(&mut self) {
        if let Some(conn) = &mut self.conn {
            // The reserved string id lets recv spot the reply without
            // tracking outstanding probes.
            let request = Message::Request {
                method: "echo".to_string(),
                params: Vec::new(),
                id: Value::String("echo".to_string()),
            };
            debug!(session = %self.reconnect.name(), "sending liveness probe");
            let _ = conn.send(request);
        }
    }

    /// Wait until [`run`](Session::run) or [`recv`](Session::recv) could
    /// make progress.
    pub async fn wait(&mut self) {
        let deadline = self.reconnect.deadline();
        let timer = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending().await,
            }
        };
        if let Some(conn) = &self.conn {
            tokio::select! {
                _ = conn.recv_ready() => {}
                _ = conn.send_ready() => {}
                _ = timer => {}
            }
        } else if let Some(connecting) = &self.connecting {
            let finished = connecting
                .outcome
                .slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some();
            if finished {
                return;
            }
            tokio::select! {
                _ = connecting.outcome.done.notified() => {}
                _ = timer => {}
            }
        } else {
            timer.await;
        }
    }

    /// Pull the next application message, if one has arrived.
    ///
    /// Probe plumbing is invisible here: incoming `echo` requests are
    /// answered in place, and replies carrying the reserved `"echo"` id
    /// are dropped. Everything else is handed to the caller.
    pub fn recv(&mut self) -> Option<Message> {
        let conn = self.conn.as_mut()?;
        match conn.try_recv() {
            Ok(Some(msg)) => {
                self.reconnect.received(Instant::now());
                match msg {
                    Message::Request { method, params, id } if method == "echo" => {
                        let _ = conn.send(Message::Reply {
                            result: Value::Array(params),
                            id,
                        });
                        None
                    }
                    Message::Reply { ref id, .. } if id.as_str() == Some("echo") => {
                        debug!(session = %self.reconnect.name(), "probe reply");
                        None
                    }
                    msg => Some(msg),
                }
            }
            Ok(None) => None,
            Err(fault) => {
                // Latched; the next run observes it and schedules a
                // reconnect.
                if self.warn_budget.admit() {
                    warn!(session = %self.reconnect.name(), %fault, "receive failed");
                }
                None
            }
        }
    }

    /// Send on the active connection.
    ///
    /// The message is consumed even on error, like `Connection::send`.
    pub fn send(&mut self, msg: Message) -> Result<(), SessionError> {
        match &mut self.conn {
            Some(conn) => conn.send(msg).map_err(SessionError::Fault),
            None => Err(SessionError::NotConnected),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connecting) = &self.connecting {
            connecting.task.abort();
        }
    }
}
