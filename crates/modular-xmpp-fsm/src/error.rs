//! Connection, state machine and configuration errors.

use thiserror::Error;

use crate::descriptor::StateId;
use crate::state::StateTransitionResult;
use crate::transport::LookupFailure;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("not connected")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("client is already logged in")]
    AlreadyLoggedIn,

    #[error("TLS is required by the client but the connection is not secured")]
    SecurityRequiredByClient,

    #[error("outgoing element queue is full")]
    OutgoingQueueFull,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("no response received within {timeout_ms}ms while waiting for {waiting_for}")]
    NoResponse { timeout_ms: u128, waiting_for: String },

    #[error("no endpoints discovered ({})", display_lookup_failures(.0))]
    NoEndpointsDiscovered(Vec<LookupFailure>),

    #[error("connection unexpectedly terminated while waiting for {waiting_for}: {cause}")]
    UnexpectedlyTerminated { waiting_for: String, cause: String },

    #[error("interrupted while waiting for {0}")]
    Interrupted(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of a walk through the state graph.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error(
        "state graph dead end at {state} (walked: {}; failed: {})",
        display_walk(.walk),
        display_failed_states(.failed_states)
    )]
    DeadEnd {
        state: StateId,
        walk: Vec<StateId>,
        failed_states: Vec<FailedState>,
    },

    #[error("mandatory intermediate state {state} could not be entered: {reason}")]
    MandatoryStateFailed { state: StateId, reason: String },

    #[error("{state} must not be entered on the way to the authenticated and resource bound state")]
    OnWayToAuthenticated { state: StateId },

    #[error("walk to the disconnected state failed: {0}")]
    WalkToDisconnectedFailed(#[source] Box<ConnectionError>),
}

/// A state the walk tried to enter but could not.
#[derive(Debug, Clone)]
pub struct FailedState {
    pub state: StateId,
    pub result: StateTransitionResult,
}

impl std::fmt::Display for FailedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.state, self.result)
    }
}

/// Errors detected while assembling the state descriptor graph or binding
/// it to a connection.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("state {0} is registered more than once")]
    DuplicateState(StateId),

    #[error("module {0} is registered more than once")]
    DuplicateModule(String),

    #[error("root state {0} is not registered")]
    MissingRoot(StateId),

    #[error("state {from} references unknown state {to}")]
    UnknownState { from: StateId, to: StateId },

    #[error("state {0} is reachable but has no successor")]
    NoSuccessor(StateId),

    #[error("state {0} could not be constructed: {1}")]
    StateConstruction(StateId, String),

    #[error("module {0} could not be constructed: {1}")]
    ModuleConstruction(String, String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    Shutdown,

    #[error("queue is full")]
    Full,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter {filter} failed: {reason}")]
    Transform { filter: String, reason: String },

    #[error("filter {0} did not close within the deadline")]
    CloseTimeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn display_walk(walk: &[StateId]) -> String {
    walk.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn display_failed_states(failed: &[FailedState]) -> String {
    if failed.is_empty() {
        return "none".to_string();
    }
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_lookup_failures(failures: &[LookupFailure]) -> String {
    if failures.is_empty() {
        return "no lookup produced a result".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
