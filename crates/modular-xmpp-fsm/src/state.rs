//! Runtime states and transition results.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateDescriptor, StateId};
use crate::error::ConnectionError;

/// A state bound to a connection.
///
/// `transition_into` performs the work of entering the state. Returning an
/// error aborts the whole walk and reverts the connection; returning a
/// [`TransitionFailure`] lets the walk try the next successor.
/// `reset_state` undoes whatever the state did while being entered. It is
/// called when a walk is reverted and when the connection returns to the
/// disconnected state, and must be idempotent.
#[async_trait]
pub trait State: Send + Sync + 'static {
    fn descriptor(&self) -> &Arc<StateDescriptor>;

    fn id(&self) -> StateId {
        self.descriptor().id()
    }

    /// Precondition check. `Ok(Some(..))` makes the transition impossible.
    async fn is_transition_to_possible(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<Option<TransitionImpossible>, ConnectionError> {
        Ok(None)
    }

    async fn transition_into(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError>;

    fn reset_state(&self) {}
}

/// Outcome of [`State::transition_into`].
#[derive(Debug, Clone)]
pub enum AttemptResult {
    Success(TransitionSuccess),
    Failure(TransitionFailure),
}

impl From<TransitionSuccess> for AttemptResult {
    fn from(success: TransitionSuccess) -> Self {
        Self::Success(success)
    }
}

impl From<TransitionFailure> for AttemptResult {
    fn from(failure: TransitionFailure) -> Self {
        Self::Failure(failure)
    }
}

/// Outcome of one attempt to enter a successor state.
#[derive(Debug, Clone)]
pub enum StateTransitionResult {
    Success(TransitionSuccess),
    Failure(TransitionFailure),
    Impossible(TransitionImpossible),
}

impl StateTransitionResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl std::fmt::Display for StateTransitionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(success) => success.fmt(f),
            Self::Failure(failure) => failure.fmt(f),
            Self::Impossible(impossible) => impossible.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransitionSuccess {
    message: Option<String>,
}

impl TransitionSuccess {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl std::fmt::Display for TransitionSuccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("success"))
    }
}

/// The state was attempted but could not be entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionFailure {
    reason: String,
}

impl TransitionFailure {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// The state cannot be entered at all, e.g. because the server does not
/// offer the required feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionImpossible {
    reason: String,
    not_implemented: bool,
}

impl TransitionImpossible {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            not_implemented: false,
        }
    }

    #[must_use]
    pub fn not_implemented(descriptor: &StateDescriptor) -> Self {
        Self {
            reason: format!("{} is not implemented", descriptor.full_state_name(false)),
            not_implemented: true,
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use]
    pub fn is_not_implemented(&self) -> bool {
        self.not_implemented
    }
}

impl std::fmt::Display for TransitionImpossible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// State for descriptors without a factory. Entering it always succeeds.
pub struct NoOpState {
    descriptor: Arc<StateDescriptor>,
}

impl NoOpState {
    #[must_use]
    pub fn new(descriptor: Arc<StateDescriptor>) -> Self {
        Self { descriptor }
    }
}

#[async_trait]
impl State for NoOpState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        Ok(TransitionSuccess::empty().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_display_their_reason() {
        let failure = StateTransitionResult::Failure(TransitionFailure::new("not-authorized"));
        assert_eq!(failure.to_string(), "not-authorized");
        assert!(!failure.is_success());

        let success = StateTransitionResult::Success(TransitionSuccess::empty());
        assert_eq!(success.to_string(), "success");
        assert!(success.is_success());
    }

    #[test]
    fn not_implemented_names_the_state() {
        let descriptor = StateDescriptor::builder(StateId::new("Bind2"))
            .reference("XEP-0386")
            .not_implemented()
            .build();
        let impossible = TransitionImpossible::not_implemented(&descriptor);
        assert!(impossible.is_not_implemented());
        assert_eq!(impossible.reason(), "Bind2 (XEP-0386) is not implemented");
    }
}
