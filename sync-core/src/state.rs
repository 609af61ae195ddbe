//! Connection state machine for poster-sync.
//!
//! This module provides a pure, side-effect-free state machine for the link
//! lifecycle `Idle -> Discovering -> Negotiating -> Ready -> Lost`. The
//! machine takes events as input and produces a new state plus a list of
//! actions to execute.
//!
//! The actual I/O (scanning, negotiating, subscribing, timers) is performed
//! by sync-client, not by this module.

use std::fmt;
use std::time::Duration;
use poster_sync_types::PeerId;

/// Which side of the protocol this device plays. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates requests; scans for and connects to the authority.
    Originator,
    /// Holds the definitive queue; advertises and waits for originators.
    Authority,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Originator => "originator",
            Role::Authority => "authority",
        })
    }
}

/// Link status as reported to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No link activity.
    Idle,
    /// Scanning (originator) or advertising (authority).
    Discovering,
    /// Peer found; negotiating capabilities and subscribing.
    Negotiating,
    /// Link usable.
    Ready,
    /// Link dropped; recovery pending.
    Lost,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Discovering => "discovering",
            ConnectionStatus::Negotiating => "negotiating",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Lost => "lost",
        })
    }
}

/// Tunables for the link lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPolicy {
    /// Unit size requested during capability negotiation.
    pub preferred_unit_size: usize,
    /// Smallest negotiated unit size the protocol can work with.
    pub min_unit_size: usize,
    /// Minimum time spent in `Negotiating` before subscribing.
    pub settle_delay: Duration,
    /// Fixed wait before retrying after a discovery or negotiation failure.
    pub reconnect_backoff: Duration,
    /// Wait between entering `Lost` and starting recovery.
    pub recover_delay: Duration,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            preferred_unit_size: 512,
            min_unit_size: 128,
            settle_delay: Duration::from_millis(600),
            reconnect_backoff: Duration::from_secs(5),
            recover_delay: Duration::from_millis(250),
        }
    }
}

/// Where the link currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, not looking.
    Idle,
    /// Scanning or advertising.
    Discovering,
    /// Connected to `peer`, not yet usable.
    Negotiating {
        /// The selected peer.
        peer: PeerId,
        /// Negotiated unit size, once known.
        unit_size: Option<usize>,
    },
    /// Fully usable link.
    Ready {
        /// The connected peer.
        peer: PeerId,
        /// Negotiated unit size.
        unit_size: usize,
    },
    /// Link dropped, waiting to recover.
    Lost {
        /// Why the link went away.
        reason: String,
    },
}

impl ConnectionState {
    /// The presentation-level status for this state.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Idle => ConnectionStatus::Idle,
            ConnectionState::Discovering => ConnectionStatus::Discovering,
            ConnectionState::Negotiating { .. } => ConnectionStatus::Negotiating,
            ConnectionState::Ready { .. } => ConnectionStatus::Ready,
            ConnectionState::Lost { .. } => ConnectionStatus::Lost,
        }
    }
}

/// Events that can occur in the link lifecycle.
///
/// Results of asynchronous link work carry the `epoch` they were started
/// in; results from an earlier connection are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Begin scanning / advertising.
    Start,
    /// A peer was found and connected.
    PeerFound {
        /// The peer.
        peer: PeerId,
    },
    /// Scanning / advertising failed.
    DiscoveryFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Capability negotiation finished.
    Negotiated {
        /// Connection epoch.
        epoch: u64,
        /// Usable unit size returned by the transport.
        unit_size: usize,
    },
    /// Capability negotiation failed.
    NegotiationFailed {
        /// Connection epoch.
        epoch: u64,
        /// Error message describing the failure.
        error: String,
    },
    /// The settling delay in `Negotiating` elapsed.
    SettleElapsed {
        /// Connection epoch.
        epoch: u64,
    },
    /// Subscription to the inbound channel confirmed.
    Subscribed {
        /// Connection epoch.
        epoch: u64,
    },
    /// Subscription failed.
    SubscribeFailed {
        /// Connection epoch.
        epoch: u64,
        /// Error message describing the failure.
        error: String,
    },
    /// The transport reported a disconnect.
    ///
    /// The peer unsubscribing from our channel, or our own subscription
    /// being cancelled, is reported as this event too.
    LinkDropped {
        /// Reason for disconnection.
        reason: String,
    },
    /// A transmission found the link dead (retries exhausted or link lost).
    TransmissionFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Recovery timer after `Lost` fired.
    Recover,
    /// Shut the link down.
    Stop,
}

/// A user-visible connection problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer cannot negotiate a usable unit size.
    CapabilityMismatch {
        /// Unit size the peer offered.
        offered: usize,
        /// Smallest usable unit size.
        required: usize,
    },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::CapabilityMismatch { offered, required } => write!(
                f,
                "peer offered unit size {} (need at least {})",
                offered, required
            ),
        }
    }
}

/// Actions to be executed by sync-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Scan and connect (originator) or advertise and accept (authority).
    Discover,
    /// Ask the transport for the largest usable unit size.
    Negotiate {
        /// Connection epoch.
        epoch: u64,
        /// Unit size to request.
        requested: usize,
    },
    /// Fire `SettleElapsed` after `delay`.
    StartSettleTimer {
        /// Connection epoch.
        epoch: u64,
        /// Delay before subscribing is allowed.
        delay: Duration,
    },
    /// Subscribe to the role's inbound channel.
    Subscribe {
        /// Connection epoch.
        epoch: u64,
    },
    /// Run the reconnection handshake. Emitted once per `Ready` entry.
    RunHandshake {
        /// The connected peer.
        peer: PeerId,
        /// Negotiated unit size.
        unit_size: usize,
    },
    /// Abort in-flight handshake / relay work.
    CancelInFlight,
    /// Tear the transport link down.
    Disconnect,
    /// Fire `Start` after `delay`.
    ScheduleStart {
        /// Delay before starting again.
        delay: Duration,
    },
    /// Fire `Recover` after `delay`.
    ScheduleRecover {
        /// Delay before recovering.
        delay: Duration,
    },
    /// Tell the presentation layer about a status change.
    NotifyStatus(ConnectionStatus),
    /// Tell the presentation layer about a connection error.
    ReportError(ConnectionError),
}

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    role: Role,
    policy: LinkPolicy,
    state: ConnectionState,
    epoch: u64,
    mismatch_reported: bool,
}

impl ConnectionMachine {
    /// Create a new state machine in the Idle state.
    pub fn new(role: Role, policy: LinkPolicy) -> Self {
        Self {
            role,
            policy,
            state: ConnectionState::Idle,
            epoch: 0,
            mismatch_reported: false,
        }
    }

    /// The role this machine was created for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Current presentation-level status.
    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Check if the link is usable.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Ready { .. })
    }

    /// Process an event and return the new machine plus actions to execute.
    ///
    /// This is a pure function - no side effects.
    pub fn on_event(mut self, event: Event) -> (Self, Vec<Action>) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Idle);
        let (state, actions) = self.transition(state, event);
        self.state = state;
        (self, actions)
    }

    fn transition(&mut self, state: ConnectionState, event: Event) -> (ConnectionState, Vec<Action>) {
        use ConnectionState::*;

        match (state, event) {
            // Any state can be stopped.
            (Idle, Event::Stop) => (Idle, vec![]),
            (_, Event::Stop) => (
                Idle,
                vec![
                    Action::CancelInFlight,
                    Action::Disconnect,
                    Action::NotifyStatus(ConnectionStatus::Idle),
                ],
            ),

            // From Idle
            (Idle, Event::Start) => (
                Discovering,
                vec![
                    Action::NotifyStatus(ConnectionStatus::Discovering),
                    Action::Discover,
                ],
            ),

            // From Discovering
            (Discovering, Event::PeerFound { peer }) => {
                self.epoch += 1;
                (
                    Negotiating {
                        peer,
                        unit_size: None,
                    },
                    vec![
                        Action::NotifyStatus(ConnectionStatus::Negotiating),
                        Action::Negotiate {
                            epoch: self.epoch,
                            requested: self.policy.preferred_unit_size,
                        },
                    ],
                )
            }
            (Discovering, Event::DiscoveryFailed { .. }) => self.back_off(vec![]),

            // From Negotiating
            (Negotiating { peer, unit_size: None }, Event::Negotiated { epoch, unit_size })
                if epoch == self.epoch =>
            {
                if unit_size < self.policy.min_unit_size {
                    let mut actions = vec![Action::Disconnect];
                    if !self.mismatch_reported {
                        self.mismatch_reported = true;
                        actions.push(Action::ReportError(ConnectionError::CapabilityMismatch {
                            offered: unit_size,
                            required: self.policy.min_unit_size,
                        }));
                    }
                    return self.back_off(actions);
                }
                (
                    Negotiating {
                        peer,
                        unit_size: Some(unit_size),
                    },
                    vec![Action::StartSettleTimer {
                        epoch,
                        delay: self.policy.settle_delay,
                    }],
                )
            }
            (Negotiating { .. }, Event::NegotiationFailed { epoch, .. })
            | (Negotiating { .. }, Event::SubscribeFailed { epoch, .. })
                if epoch == self.epoch =>
            {
                self.back_off(vec![Action::Disconnect])
            }
            (Negotiating { peer, unit_size: Some(unit_size) }, Event::SettleElapsed { epoch })
                if epoch == self.epoch =>
            {
                (
                    Negotiating {
                        peer,
                        unit_size: Some(unit_size),
                    },
                    vec![Action::Subscribe { epoch }],
                )
            }
            (Negotiating { peer, unit_size: Some(unit_size) }, Event::Subscribed { epoch })
                if epoch == self.epoch =>
            {
                self.mismatch_reported = false;
                (
                    Ready {
                        peer: peer.clone(),
                        unit_size,
                    },
                    vec![
                        Action::NotifyStatus(ConnectionStatus::Ready),
                        Action::RunHandshake { peer, unit_size },
                    ],
                )
            }

            // Link loss while connected or connecting
            (Negotiating { .. } | Ready { .. }, Event::LinkDropped { reason }) => (
                Lost { reason },
                vec![
                    Action::CancelInFlight,
                    Action::NotifyStatus(ConnectionStatus::Lost),
                    Action::ScheduleRecover {
                        delay: self.policy.recover_delay,
                    },
                ],
            ),
            (Ready { .. }, Event::TransmissionFailed { error }) => (
                Lost { reason: error },
                vec![
                    Action::CancelInFlight,
                    Action::Disconnect,
                    Action::NotifyStatus(ConnectionStatus::Lost),
                    Action::ScheduleRecover {
                        delay: self.policy.recover_delay,
                    },
                ],
            ),

            // From Lost
            (Lost { .. }, Event::Recover) => match self.role {
                Role::Originator => (
                    Discovering,
                    vec![
                        Action::NotifyStatus(ConnectionStatus::Discovering),
                        Action::Discover,
                    ],
                ),
                Role::Authority => (
                    Idle,
                    vec![
                        Action::NotifyStatus(ConnectionStatus::Idle),
                        Action::ScheduleStart {
                            delay: Duration::ZERO,
                        },
                    ],
                ),
            },

            // Invalid or stale transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn back_off(&self, mut actions: Vec<Action>) -> (ConnectionState, Vec<Action>) {
        actions.push(Action::NotifyStatus(ConnectionStatus::Idle));
        actions.push(Action::ScheduleStart {
            delay: self.policy.reconnect_backoff,
        });
        (ConnectionState::Idle, actions)
    }
}
