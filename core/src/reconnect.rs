//! Reconnection policy as a pure state machine
//!
//! The peer manager feeds transport state changes and timer expiries in and
//! carries out the returned actions. Keeping the policy free of I/O makes the
//! retry accounting deterministic and testable without a network.

use std::time::Duration;

use crate::error::Error;
use crate::models::{ConnectionState, EndReason};

/// ICE restarts allowed before the connection is declared failed.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// How long one ICE restart may take before the next attempt.
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the initial offer/answer exchange.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Transport(TransportState),
    /// A recovery timer armed for `generation` expired.
    RecoveryTimeout { generation: u64 },
    NegotiationTimeout,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Established,
    /// Restart ICE and arm a recovery timer tagged with `generation`.
    IceRestart { attempt: u32, generation: u64 },
    Fail { reason: EndReason, message: String },
    Release,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    max_attempts: u32,
    ever_connected: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS)
    }
}

impl ConnectionMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::New,
            attempts: 0,
            generation: 0,
            max_attempts,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Negotiation has started.
    pub fn start(&mut self) {
        self.transition(ConnectionState::Connecting);
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }

        match input {
            Input::Close | Input::Transport(TransportState::Closed) => {
                self.transition(ConnectionState::Closed);
                // Invalidate any armed timer
                self.generation += 1;
                vec![Action::Release]
            }
            _ if self.state.is_terminal() => Vec::new(),

            Input::Transport(TransportState::New) => Vec::new(),
            Input::Transport(TransportState::Connecting) => {
                if self.state == ConnectionState::New {
                    self.transition(ConnectionState::Connecting);
                }
                Vec::new()
            }
            Input::Transport(TransportState::Connected) => {
                let was_connected = self.state == ConnectionState::Connected;
                if !self.transition(ConnectionState::Connected) && !was_connected {
                    return Vec::new();
                }
                self.attempts = 0;
                self.generation += 1;
                self.ever_connected = true;
                if was_connected {
                    Vec::new()
                } else {
                    vec![Action::Established]
                }
            }
            Input::Transport(TransportState::Disconnected) => self.escalate(EndReason::PeerDisconnected),
            Input::Transport(TransportState::Failed) => {
                self.transition(ConnectionState::Failed);
                self.generation += 1;
                vec![
                    Action::Fail {
                        reason: EndReason::Error,
                        message: "The connection to your partner failed.".to_string(),
                    },
                    Action::Release,
                ]
            }
            Input::RecoveryTimeout { generation } => {
                if generation != self.generation || self.state != ConnectionState::Disconnected {
                    log::debug!("Ignoring stale recovery timer (generation {})", generation);
                    return Vec::new();
                }
                self.escalate(EndReason::Timeout)
            }
            Input::NegotiationTimeout => match self.state {
                ConnectionState::New | ConnectionState::Connecting => self.escalate(EndReason::Timeout),
                _ => Vec::new(),
            },
        }
    }

    /// Count one failed attempt; restart ICE under the cap, fail above it.
    fn escalate(&mut self, reason: EndReason) -> Vec<Action> {
        self.attempts += 1;
        self.generation += 1;

        if self.attempts > self.max_attempts {
            self.transition(ConnectionState::Failed);
            let message = match reason {
                EndReason::Timeout if !self.ever_connected => Error::NegotiationTimeout.user_message(),
                EndReason::Timeout => "Reconnecting to your partner timed out.".to_string(),
                _ => "Your partner disconnected.".to_string(),
            };
            log::warn!("Reconnection budget exhausted after {} attempts", self.max_attempts);
            return vec![
                Action::Fail { reason, message },
                Action::Release,
            ];
        }

        self.transition(ConnectionState::Disconnected);
        log::info!("Connection lost; ICE restart attempt {}/{}", self.attempts, self.max_attempts);
        vec![Action::IceRestart {
            attempt: self.attempts,
            generation: self.generation,
        }]
    }

    fn transition(&mut self, to: ConnectionState) -> bool {
        match self.state.transition_to(to) {
            Ok(next) => {
                self.state = next;
                true
            }
            Err(e) => {
                log::debug!("Ignoring {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionMachine {
        let mut machine = ConnectionMachine::default();
        machine.start();
        assert_eq!(
            machine.handle(Input::Transport(TransportState::Connected)),
            vec![Action::Established]
        );
        machine
    }

    fn restart_attempt(actions: &[Action]) -> Option<u32> {
        match actions {
            [Action::IceRestart { attempt, .. }] => Some(*attempt),
            _ => None,
        }
    }

    #[test]
    fn test_up_to_three_restarts_then_failure() {
        let mut machine = connected();

        for k in 1..=MAX_RECONNECT_ATTEMPTS {
            let actions = machine.handle(Input::Transport(TransportState::Disconnected));
            assert_eq!(restart_attempt(&actions), Some(k));
            assert_eq!(machine.state(), ConnectionState::Disconnected);
        }

        let actions = machine.handle(Input::Transport(TransportState::Disconnected));
        assert_eq!(
            actions[0],
            Action::Fail {
                reason: EndReason::PeerDisconnected,
                message: "Your partner disconnected.".to_string()
            }
        );
        assert_eq!(actions[1], Action::Release);
        assert_eq!(machine.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_recovery_resets_attempts() {
        let mut machine = connected();
        machine.handle(Input::Transport(TransportState::Disconnected));
        machine.handle(Input::Transport(TransportState::Disconnected));
        assert_eq!(machine.attempts(), 2);

        assert_eq!(
            machine.handle(Input::Transport(TransportState::Connected)),
            vec![Action::Established]
        );
        assert_eq!(machine.attempts(), 0);

        let actions = machine.handle(Input::Transport(TransportState::Disconnected));
        assert_eq!(restart_attempt(&actions), Some(1));
    }

    #[test]
    fn test_timer_escalation_fails_with_timeout() {
        let mut machine = connected();
        let mut actions = machine.handle(Input::Transport(TransportState::Disconnected));

        for _ in 0..MAX_RECONNECT_ATTEMPTS - 1 {
            let Some(Action::IceRestart { generation, .. }) = actions.first().cloned() else {
                panic!("expected restart, got {:?}", actions);
            };
            actions = machine.handle(Input::RecoveryTimeout { generation });
        }

        let Some(Action::IceRestart { generation, attempt }) = actions.first().cloned() else {
            panic!("expected restart, got {:?}", actions);
        };
        assert_eq!(attempt, MAX_RECONNECT_ATTEMPTS);

        let actions = machine.handle(Input::RecoveryTimeout { generation });
        assert!(matches!(
            actions.first(),
            Some(Action::Fail {
                reason: EndReason::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let mut machine = connected();
        let actions = machine.handle(Input::Transport(TransportState::Disconnected));
        let Some(Action::IceRestart { generation, .. }) = actions.first().cloned() else {
            panic!("expected restart");
        };

        machine.handle(Input::Transport(TransportState::Connected));
        assert!(machine.handle(Input::RecoveryTimeout { generation }).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_negotiation_timeout_restarts_before_connect() {
        let mut machine = ConnectionMachine::default();
        machine.start();
        let actions = machine.handle(Input::NegotiationTimeout);
        assert_eq!(restart_attempt(&actions), Some(1));

        let mut connected = connected();
        assert!(connected.handle(Input::NegotiationTimeout).is_empty());
    }

    #[test]
    fn test_never_connecting_fails_as_negotiation_timeout() {
        let mut machine = ConnectionMachine::default();
        machine.start();

        let mut actions = machine.handle(Input::NegotiationTimeout);
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            let Some(Action::IceRestart { generation, .. }) = actions.first().cloned() else {
                panic!("expected restart, got {:?}", actions);
            };
            actions = machine.handle(Input::RecoveryTimeout { generation });
        }

        assert_eq!(
            actions[0],
            Action::Fail {
                reason: EndReason::Timeout,
                message: Error::NegotiationTimeout.user_message(),
            }
        );
        assert_eq!(machine.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_transport_failure_is_terminal() {
        let mut machine = connected();
        let actions = machine.handle(Input::Transport(TransportState::Failed));
        assert!(matches!(actions[0], Action::Fail { reason: EndReason::Error, .. }));
        assert_eq!(machine.state(), ConnectionState::Failed);

        assert!(machine.handle(Input::Transport(TransportState::Connected)).is_empty());
        assert_eq!(machine.handle(Input::Close), vec![Action::Release]);
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert!(machine.handle(Input::Close).is_empty());
    }
}
