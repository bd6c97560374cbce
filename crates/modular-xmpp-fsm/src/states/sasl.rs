use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor};
use crate::error::ConnectionError;
use crate::internal::ConnectionInternal;
use crate::session::SaslOutcome;
use crate::state::{AttemptResult, State, TransitionFailure, TransitionImpossible, TransitionSuccess};

/// Runs the SASL exchange through the session handler, then waits for the
/// features of the restarted stream.
pub struct SaslAuthenticationState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
}

impl SaslAuthenticationState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
        }
    }
}

#[async_trait]
impl State for SaslAuthenticationState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn is_transition_to_possible(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<Option<TransitionImpossible>, ConnectionError> {
        if ctx.login().is_none() {
            return Ok(Some(TransitionImpossible::new("no login credentials supplied")));
        }
        Ok(None)
    }

    async fn transition_into(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        let Some(login) = ctx.login() else {
            return Ok(TransitionFailure::new("no login credentials supplied").into());
        };

        self.internal.prepare_to_wait_for_features_received();
        let outcome = self
            .internal
            .session()
            .authenticate(&self.internal, login)
            .await?;

        match outcome {
            SaslOutcome::Success { mechanism } => {
                debug!(%mechanism, username = %login.username, "SASL authentication successful");
                self.internal
                    .wait_for_features_received("server stream features after SASL authentication")
                    .await?;
                Ok(TransitionSuccess::new(format!(
                    "SASL authentication successful using {mechanism}"
                ))
                .into())
            }
            SaslOutcome::Failure { condition } => Ok(TransitionFailure::new(format!(
                "SASL authentication failed: {condition}"
            ))
            .into()),
        }
    }
}
