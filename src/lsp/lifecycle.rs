//! Session lifecycle gate.
//!
//! The same machine checks traffic in both directions: a client moves to
//! `Initializing` when it sends `initialize`, a server when it receives it.
//!
//! ```text
//! Uninitialized --initialize request--> Initializing
//! Initializing  --initialize response--> Running       (error response: stays Initializing)
//! Running       --shutdown request-----> ShuttingDown
//! any           --exit notification----> Exited
//! ```
//!
//! Only one `initialize` is ever legal. After a failed handshake the session
//! stays in `Initializing`, where nothing but `exit` is accepted.

use std::fmt;
use thiserror::Error;
use tracing::debug;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Exited,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Running => "running",
            SessionPhase::ShuttingDown => "shutting down",
            SessionPhase::Exited => "exited",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// A message as seen by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic<'a> {
    Request(&'a str),
    Notification(&'a str),
    /// Response to a request for `method`.
    Response { method: &'a str, success: bool },
}

impl Traffic<'_> {
    fn describe(&self) -> String {
        match self {
            Traffic::Request(method) => format!("request '{}'", method),
            Traffic::Notification(method) => format!("notification '{}'", method),
            Traffic::Response { method, .. } => format!("response to '{}'", method),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Only `initialize` (and `exit`) may be exchanged before the handshake completes.
    NotInitialized,
    /// `initialize` was already exchanged.
    AlreadyInitialized,
    /// `shutdown` was exchanged; only responses and `exit` remain legal.
    ShuttingDown,
    /// The session is over.
    Exited,
}

/// A message that is not legal in the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{direction} {traffic} not allowed while {phase}: {kind}")]
pub struct PhaseViolation {
    pub direction: Direction,
    pub phase: SessionPhase,
    pub traffic: String,
    pub kind: ViolationKind,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ViolationKind::NotInitialized => "session is not initialized",
            ViolationKind::AlreadyInitialized => "initialize may only be sent once",
            ViolationKind::ShuttingDown => "connection is shutting down",
            ViolationKind::Exited => "session has exited",
        };
        f.write_str(reason)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: SessionPhase,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            phase: SessionPhase::Uninitialized,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Check `traffic` against the current phase and apply its transition.
    ///
    /// On success returns the phase after the transition. A violation leaves
    /// the phase unchanged.
    pub fn admit(
        &mut self,
        direction: Direction,
        traffic: Traffic<'_>,
    ) -> Result<SessionPhase, PhaseViolation> {
        let next = self.next_phase(traffic).map_err(|kind| PhaseViolation {
            direction,
            phase: self.phase,
            traffic: traffic.describe(),
            kind,
        })?;

        if next != self.phase {
            debug!(
                %direction,
                from = %self.phase,
                to = %next,
                traffic = %traffic.describe(),
                "lifecycle transition"
            );
            self.phase = next;
        }
        Ok(next)
    }

    /// Force the terminal phase, e.g. when the transport is lost.
    pub fn terminate(&mut self) {
        self.phase = SessionPhase::Exited;
    }

    fn next_phase(&self, traffic: Traffic<'_>) -> Result<SessionPhase, ViolationKind> {
        use SessionPhase::*;

        if self.phase == Exited {
            return Err(ViolationKind::Exited);
        }

        match traffic {
            Traffic::Notification(EXIT) => Ok(Exited),

            Traffic::Request(INITIALIZE) => match self.phase {
                Uninitialized => Ok(Initializing),
                _ => Err(ViolationKind::AlreadyInitialized),
            },

            Traffic::Response {
                method: INITIALIZE,
                success,
            } => match self.phase {
                Initializing if success => Ok(Running),
                phase => Ok(phase),
            },

            Traffic::Response { .. } => Ok(self.phase),

            Traffic::Request(method) => match self.phase {
                Uninitialized | Initializing => Err(ViolationKind::NotInitialized),
                Running if method == SHUTDOWN => Ok(ShuttingDown),
                Running => Ok(Running),
                ShuttingDown => Err(ViolationKind::ShuttingDown),
                Exited => Err(ViolationKind::Exited),
            },

            Traffic::Notification(_) => match self.phase {
                Uninitialized | Initializing => Err(ViolationKind::NotInitialized),
                Running => Ok(Running),
                ShuttingDown => Err(ViolationKind::ShuttingDown),
                Exited => Err(ViolationKind::Exited),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use SessionPhase::*;

    fn at(phase: SessionPhase) -> Lifecycle {
        Lifecycle { phase }
    }

    #[test]
    fn test_client_happy_path() {
        let mut lifecycle = Lifecycle::new();
        let out = Direction::Outgoing;
        let inc = Direction::Incoming;

        assert_eq!(lifecycle.admit(out, Traffic::Request("initialize")), Ok(Initializing));
        assert_eq!(
            lifecycle.admit(inc, Traffic::Response { method: "initialize", success: true }),
            Ok(Running)
        );
        assert_eq!(lifecycle.admit(out, Traffic::Notification("initialized")), Ok(Running));
        assert_eq!(lifecycle.admit(out, Traffic::Request("add")), Ok(Running));
        assert_eq!(lifecycle.admit(out, Traffic::Request("shutdown")), Ok(ShuttingDown));
        assert_eq!(
            lifecycle.admit(inc, Traffic::Response { method: "shutdown", success: true }),
            Ok(ShuttingDown)
        );
        assert_eq!(lifecycle.admit(out, Traffic::Notification("exit")), Ok(Exited));
    }

    #[test]
    fn test_server_reaches_running_after_answering_initialize() {
        let mut lifecycle = Lifecycle::new();
        lifecycle
            .admit(Direction::Incoming, Traffic::Request("initialize"))
            .unwrap();
        let phase = lifecycle
            .admit(
                Direction::Outgoing,
                Traffic::Response { method: "initialize", success: true },
            )
            .unwrap();
        assert_eq!(phase, Running);
    }

    #[test]
    fn test_failed_initialize_allows_only_exit() {
        let mut lifecycle = Lifecycle::new();
        lifecycle
            .admit(Direction::Outgoing, Traffic::Request("initialize"))
            .unwrap();
        let phase = lifecycle
            .admit(
                Direction::Incoming,
                Traffic::Response { method: "initialize", success: false },
            )
            .unwrap();
        assert_eq!(phase, Initializing);

        let violation = lifecycle
            .admit(Direction::Outgoing, Traffic::Request("initialize"))
            .unwrap_err();
        assert_eq!(violation.kind, ViolationKind::AlreadyInitialized);
        let violation = lifecycle
            .admit(Direction::Outgoing, Traffic::Request("shutdown"))
            .unwrap_err();
        assert_eq!(violation.kind, ViolationKind::NotInitialized);
        assert_eq!(
            lifecycle.admit(Direction::Outgoing, Traffic::Notification("exit")),
            Ok(Exited)
        );
    }

    #[rstest]
    #[case(Uninitialized, Traffic::Request("add"), ViolationKind::NotInitialized)]
    #[case(Initializing, Traffic::Request("add"), ViolationKind::NotInitialized)]
    #[case(Initializing, Traffic::Request("shutdown"), ViolationKind::NotInitialized)]
    #[case(Uninitialized, Traffic::Notification("initialized"), ViolationKind::NotInitialized)]
    #[case(Initializing, Traffic::Request("initialize"), ViolationKind::AlreadyInitialized)]
    #[case(Running, Traffic::Request("initialize"), ViolationKind::AlreadyInitialized)]
    #[case(ShuttingDown, Traffic::Request("add"), ViolationKind::ShuttingDown)]
    #[case(ShuttingDown, Traffic::Request("shutdown"), ViolationKind::ShuttingDown)]
    #[case(ShuttingDown, Traffic::Notification("didChange"), ViolationKind::ShuttingDown)]
    #[case(Exited, Traffic::Notification("exit"), ViolationKind::Exited)]
    #[case(Exited, Traffic::Response { method: "add", success: true }, ViolationKind::Exited)]
    fn test_rejections_leave_phase_unchanged(
        #[case] phase: SessionPhase,
        #[case] traffic: Traffic<'static>,
        #[case] kind: ViolationKind,
    ) {
        for direction in [Direction::Incoming, Direction::Outgoing] {
            let mut lifecycle = at(phase);
            let violation = lifecycle.admit(direction, traffic).unwrap_err();
            assert_eq!(violation.kind, kind);
            assert_eq!(violation.phase, phase);
            assert_eq!(lifecycle.phase(), phase);
        }
    }

    #[rstest]
    #[case(Uninitialized)]
    #[case(Initializing)]
    #[case(Running)]
    #[case(ShuttingDown)]
    fn test_exit_is_always_legal(#[case] phase: SessionPhase) {
        let mut lifecycle = at(phase);
        assert_eq!(
            lifecycle.admit(Direction::Incoming, Traffic::Notification("exit")),
            Ok(Exited)
        );
    }

    #[test]
    fn test_responses_allowed_while_shutting_down() {
        let mut lifecycle = at(ShuttingDown);
        assert_eq!(
            lifecycle.admit(
                Direction::Incoming,
                Traffic::Response { method: "add", success: true }
            ),
            Ok(ShuttingDown)
        );
    }

    #[test]
    fn test_violation_message() {
        let violation = at(ShuttingDown)
            .admit(Direction::Incoming, Traffic::Request("hover"))
            .unwrap_err();
        assert_eq!(
            violation.to_string(),
            "incoming request 'hover' not allowed while shutting down: connection is shutting down"
        );
    }
}
