//! Connection scheduling: when to connect, give up, and probe.
//!
//! [`Reconnect`] is a passive state machine. The owner feeds it
//! connectivity events with explicit timestamps and polls
//! [`run`](Reconnect::run) for the next [`Command`]; it performs no I/O
//! of its own, which keeps the timing behavior fully deterministic under
//! test.
//!
//! Backoff starts at zero (the first connect is immediate), then doubles
//! per failure from `backoff_min` up to `backoff_max`, and resets on a
//! successful connect. Liveness uses a two-phase timer: after
//! `probe_interval` of silence a probe is commanded; after another
//! interval with still no traffic, a disconnect is.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::connection::Fault;

/// What the owner should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a fresh transport, replacing any current state.
    Connect,
    /// Tear down the current connection or attempt.
    Disconnect,
    /// Send a liveness probe on the active connection.
    Probe,
}

/// Backoff and probe timing.
#[derive(Debug, Clone)]
pub struct Policy {
    /// First retry delay after a failure; doubles per failure.
    pub backoff_min: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
    /// Idle time before a probe, and after a probe before giving up.
    pub probe_interval: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            probe_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Created but not yet enabled; never issues commands.
    Void,
    /// Waiting out the retry delay before the next attempt.
    Backoff { until: Instant },
    /// A connect attempt is in flight.
    Connecting { deadline: Instant },
    /// Connected and recently heard from.
    Active { probe_at: Instant },
    /// Probe commanded; waiting for any traffic to prove liveness.
    Probing { deadline: Instant },
    /// Forced reconnect requested.
    Reconnect { at: Instant },
}

/// The reconnect controller.
pub struct Reconnect {
    name: String,
    policy: Policy,
    state: State,
    /// Current retry delay; zero until the first failure.
    backoff: Duration,
    /// Remaining connect attempts; `None` is unlimited.
    max_tries: Option<u32>,
}

impl Reconnect {
    /// Create a disabled controller for `name`.
    pub fn new(name: impl Into<String>) -> Reconnect {
        Reconnect::with_policy(name, Policy::default())
    }

    /// Create a disabled controller with explicit timing.
    pub fn with_policy(name: impl Into<String>, policy: Policy) -> Reconnect {
        Reconnect {
            name: name.into(),
            policy,
            state: State::Void,
            backoff: Duration::ZERO,
            max_tries: None,
        }
    }

    /// The name connect attempts should be made to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cap the number of connect attempts. `Some(0)` means never connect
    /// (again); `None` is unlimited.
    pub fn set_max_tries(&mut self, max_tries: Option<u32>) {
        self.max_tries = max_tries;
    }

    /// Remaining connect attempts.
    pub fn max_tries(&self) -> Option<u32> {
        self.max_tries
    }

    /// Permit the controller to issue `Connect` commands. The first one
    /// is due immediately.
    pub fn enable(&mut self, now: Instant) {
        if let State::Void = self.state {
            self.state = State::Backoff { until: now };
        }
    }

    /// A connect attempt has started.
    pub fn connecting(&mut self, now: Instant) {
        if let Some(tries) = &mut self.max_tries {
            *tries = tries.saturating_sub(1);
        }
        let timeout = self.backoff.max(self.policy.backoff_min);
        debug!(name = %self.name, "connecting");
        self.state = State::Connecting {
            deadline: now + timeout,
        };
    }

    /// The attempt succeeded.
    pub fn connected(&mut self, now: Instant) {
        info!(name = %self.name, "connected");
        self.backoff = Duration::ZERO;
        self.state = State::Active {
            probe_at: now + self.policy.probe_interval,
        };
    }

    /// The attempt failed; schedule the next one with doubled backoff.
    pub fn connect_failed(&mut self, now: Instant, error: &std::io::Error) {
        info!(name = %self.name, %error, "connection attempt failed");
        self.back_off(now);
    }

    /// An established connection was lost.
    pub fn disconnected(&mut self, now: Instant, fault: Option<Fault>) {
        match fault {
            Some(fault) => info!(name = %self.name, %fault, "connection dropped"),
            None => info!(name = %self.name, "disconnected"),
        }
        self.back_off(now);
    }

    fn back_off(&mut self, now: Instant) {
        self.backoff = if self.backoff.is_zero() {
            self.policy.backoff_min
        } else {
            (self.backoff * 2).min(self.policy.backoff_max)
        };
        if self.max_tries == Some(0) {
            debug!(name = %self.name, "retries exhausted, staying down");
            self.state = State::Void;
        } else {
            debug!(name = %self.name, backoff_ms = self.backoff.as_millis() as u64, "backing off");
            self.state = State::Backoff {
                until: now + self.backoff,
            };
        }
    }

    /// Traffic arrived: the peer is alive.
    pub fn received(&mut self, now: Instant) {
        match self.state {
            State::Active { .. } | State::Probing { .. } => {
                self.state = State::Active {
                    probe_at: now + self.policy.probe_interval,
                };
            }
            _ => {}
        }
    }

    /// Ask for the connection to be torn down and reopened.
    pub fn force_reconnect(&mut self, now: Instant) {
        match self.state {
            State::Connecting { .. } | State::Active { .. } | State::Probing { .. } => {
                self.state = State::Reconnect { at: now };
            }
            _ => {}
        }
    }

    /// The next command the owner should act on, if any.
    pub fn run(&mut self, now: Instant) -> Option<Command> {
        match self.state {
            State::Void => None,
            State::Backoff { until } => {
                (now >= until && self.max_tries != Some(0)).then_some(Command::Connect)
            }
            State::Connecting { deadline } => (now >= deadline).then_some(Command::Disconnect),
            State::Active { probe_at } => {
                if now >= probe_at {
                    debug!(name = %self.name, "idle, probing");
                    self.state = State::Probing {
                        deadline: now + self.policy.probe_interval,
                    };
                    Some(Command::Probe)
                } else {
                    None
                }
            }
            State::Probing { deadline } => (now >= deadline).then_some(Command::Disconnect),
            State::Reconnect { .. } => Some(Command::Disconnect),
        }
    }

    /// When [`run`](Reconnect::run) next wants to be consulted. `None`
    /// means no timer is pending (disabled or out of retries).
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Void => None,
            State::Backoff { until } => (self.max_tries != Some(0)).then_some(until),
            State::Connecting { deadline } | State::Probing { deadline } => Some(deadline),
            State::Active { probe_at } => Some(probe_at),
            State::Reconnect { at } => Some(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> Policy {
        Policy {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            probe_interval: Duration::from_secs(5),
        }
    }

    fn io_err() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
    }

    #[test]
    fn disabled_controller_stays_quiet() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        assert_eq!(rc.run(t0), None);
        assert_eq!(rc.deadline(), None);
    }

    #[test]
    fn first_connect_is_immediate() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);
        assert_eq!(rc.run(t0), Some(Command::Connect));
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);

        let mut now = t0;
        let mut expected = vec![];
        for _ in 0..6 {
            assert_eq!(rc.run(now), Some(Command::Connect));
            rc.connecting(now);
            rc.connect_failed(now, &io_err());
            let until = rc.deadline().expect("backoff deadline");
            expected.push(until - now);
            // Not due yet, due exactly at the deadline.
            assert_eq!(rc.run(now), None);
            now = until;
        }
        assert_eq!(
            expected,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn backoff_resets_after_a_successful_connect() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);
        rc.connecting(t0);
        rc.connect_failed(t0, &io_err());
        rc.connecting(t0 + Duration::from_secs(1));
        rc.connected(t0 + Duration::from_secs(1));

        rc.disconnected(t0 + Duration::from_secs(2), None);
        let until = rc.deadline().expect("backoff deadline");
        assert_eq!(until - (t0 + Duration::from_secs(2)), Duration::from_secs(1));
    }

    #[test]
    fn idle_connection_probes_then_disconnects() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);
        rc.connecting(t0);
        rc.connected(t0);

        assert_eq!(rc.run(t0 + Duration::from_secs(4)), None);
        assert_eq!(
            rc.run(t0 + Duration::from_secs(5)),
            Some(Command::Probe)
        );
        // Still waiting for evidence of life.
        assert_eq!(rc.run(t0 + Duration::from_secs(9)), None);
        assert_eq!(
            rc.run(t0 + Duration::from_secs(10)),
            Some(Command::Disconnect)
        );
    }

    #[test]
    fn received_traffic_cancels_the_probe() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);
        rc.connecting(t0);
        rc.connected(t0);

        assert_eq!(rc.run(t0 + Duration::from_secs(5)), Some(Command::Probe));
        rc.received(t0 + Duration::from_secs(6));
        // Back to Active; no disconnect, and the next probe is rescheduled.
        assert_eq!(rc.run(t0 + Duration::from_secs(10)), None);
        assert_eq!(rc.run(t0 + Duration::from_secs(11)), Some(Command::Probe));
    }

    #[test]
    fn connect_attempt_times_out() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);
        rc.connecting(t0);
        assert_eq!(rc.run(t0), None);
        assert_eq!(rc.run(t0 + Duration::from_secs(1)), Some(Command::Disconnect));
    }

    #[test]
    fn exhausted_tries_stay_down() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.set_max_tries(Some(1));
        rc.enable(t0);
        assert_eq!(rc.run(t0), Some(Command::Connect));
        rc.connecting(t0);
        assert_eq!(rc.max_tries(), Some(0));
        rc.connect_failed(t0, &io_err());
        assert_eq!(rc.run(t0 + Duration::from_secs(60)), None);
        assert_eq!(rc.deadline(), None);
    }

    #[test]
    fn force_reconnect_commands_a_disconnect() {
        let t0 = Instant::now();
        let mut rc = Reconnect::with_policy("tcp:x", fast_policy());
        rc.enable(t0);
        rc.connecting(t0);
        rc.connected(t0);
        rc.force_reconnect(t0);
        assert_eq!(rc.run(t0), Some(Command::Disconnect));
        rc.disconnected(t0, None);
        assert_eq!(rc.run(t0 + Duration::from_secs(1)), Some(Command::Connect));
    }
}
