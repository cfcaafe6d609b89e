//! Retry and redirect decisions.
//!
//! [`RetryPolicy::decide`] is a pure function of a failure and the retry
//! counters of one logical request. The multiplexer carries out whatever
//! it returns: waiting, re-routing, updating the slot table or giving up.

use std::time::Duration;

use crate::routing::{Endpoint, SLOT_COUNT};

/// Error prefixes meaning "the same request may succeed on the same node
/// a little later".
const TRANSIENT_PREFIXES: &[&str] = &["TRYAGAIN", "CLUSTERDOWN", "LOADING", "MASTERDOWN"];

/// A parsed `MOVED` or `ASK` error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot now lives elsewhere for good.
    Moved { slot: u16, endpoint: Endpoint },
    /// The slot is migrating; only this one request goes elsewhere.
    Ask { slot: u16, endpoint: Endpoint },
}

impl Redirect {
    /// Parses `MOVED <slot> <host:port>` or `ASK <slot> <host:port>`.
    ///
    /// An address of the form `:port` refers to the host of `origin`, the
    /// endpoint that sent the reply. Returns `None` for anything else,
    /// including slots out of range.
    pub fn parse(message: &str, origin: &Endpoint) -> Option<Redirect> {
        let mut parts = message.split_ascii_whitespace();
        let kind = parts.next()?;
        let slot: u16 = parts.next()?.parse().ok()?;
        let addr = parts.next()?;
        if slot >= SLOT_COUNT || parts.next().is_some() {
            return None;
        }

        let endpoint = match addr.strip_prefix(':') {
            Some(port) => origin.with_port(port.parse().ok()?),
            None => addr.parse().ok()?,
        };

        match kind {
            "MOVED" => Some(Redirect::Moved { slot, endpoint }),
            "ASK" => Some(Redirect::Ask { slot, endpoint }),
            _ => None,
        }
    }
}

/// Why a request did not complete on its last attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The server answered with an error reply.
    Reply { message: String, origin: Endpoint },
    /// The connection failed while the request was outstanding.
    ConnectionLost { sent: bool },
}

/// Why a request is being retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitReason {
    Moved,
    Ask,
    Transient,
    ConnectionLost,
}

/// What to do with a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Resend to the same route after `delay`.
    RetrySame {
        delay: Duration,
        reason: RetransmitReason,
    },
    /// Resend once to `endpoint`, preceded by `ASKING`.
    RetryElsewhereOnce { endpoint: Endpoint },
    /// Record `endpoint` as the owner of `slot`, then resend there.
    RetryElsewherePermanent { slot: u16, endpoint: Endpoint },
    /// Deliver the failure to the caller.
    GiveUp,
}

impl Decision {
    pub fn reason(&self) -> Option<RetransmitReason> {
        match self {
            Decision::RetrySame { reason, .. } => Some(*reason),
            Decision::RetryElsewhereOnce { .. } => Some(RetransmitReason::Ask),
            Decision::RetryElsewherePermanent { .. } => Some(RetransmitReason::Moved),
            Decision::GiveUp => None,
        }
    }
}

/// Per-request counters consulted by [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attempts {
    /// MOVED and ASK redirects followed so far.
    pub redirects: u32,
    /// Same-route retries (transient errors, lost connections) so far.
    pub retries: u32,
}

/// Tunable limits for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Redirects a single request may follow before the redirect error is
    /// returned to the caller verbatim.
    pub max_redirects: u32,
    /// Same-route retries a single request may make.
    pub max_retries: u32,
    /// Delay before the first same-route retry. Doubles on every retry.
    pub backoff_base: Duration,
    /// Upper bound for the retry delay.
    pub backoff_max: Duration,
    /// Retransmit requests whose bytes were already sent when the
    /// connection failed. The server may then execute them twice.
    pub retry_after_send: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            retry_after_send: false,
        }
    }
}

impl RetryPolicy {
    /// Decides what to do after `failure`, given the request's counters.
    pub fn decide(&self, failure: &Failure, attempts: Attempts) -> Decision {
        match failure {
            Failure::Reply { message, origin } => {
                if let Some(redirect) = Redirect::parse(message, origin) {
                    if attempts.redirects >= self.max_redirects {
                        return Decision::GiveUp;
                    }
                    return match redirect {
                        Redirect::Moved { slot, endpoint } => {
                            Decision::RetryElsewherePermanent { slot, endpoint }
                        }
                        Redirect::Ask { endpoint, .. } => Decision::RetryElsewhereOnce { endpoint },
                    };
                }
                if is_transient(message) {
                    return self.retry_same(attempts, RetransmitReason::Transient);
                }
                Decision::GiveUp
            }
            Failure::ConnectionLost { sent: false } => {
                self.retry_same(attempts, RetransmitReason::ConnectionLost)
            }
            Failure::ConnectionLost { sent: true } if self.retry_after_send => {
                self.retry_same(attempts, RetransmitReason::ConnectionLost)
            }
            Failure::ConnectionLost { sent: true } => Decision::GiveUp,
        }
    }

    /// Delay before retry number `retries + 1`: `base * 2^retries`, capped.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    fn retry_same(&self, attempts: Attempts, reason: RetransmitReason) -> Decision {
        if attempts.retries >= self.max_retries {
            return Decision::GiveUp;
        }
        Decision::RetrySame {
            delay: self.backoff(attempts.retries),
            reason,
        }
    }
}

fn is_transient(message: &str) -> bool {
    let code = message.split_ascii_whitespace().next().unwrap_or_default();
    TRANSIENT_PREFIXES.contains(&code)
}
