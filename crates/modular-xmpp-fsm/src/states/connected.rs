use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SecurityMode;
use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor};
use crate::error::ConnectionError;
use crate::internal::ConnectionInternal;
use crate::state::{AttemptResult, State, TransitionSuccess};

pub struct ConnectedButUnauthenticatedState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
}

impl ConnectedButUnauthenticatedState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
        }
    }
}

#[async_trait]
impl State for ConnectedButUnauthenticatedState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        if self.internal.config().connection.security_mode == SecurityMode::Required
            && !self.internal.is_transport_secured()
        {
            return Err(ConnectionError::SecurityRequiredByClient);
        }
        // A connect walk ends here; remember it so disconnecting can undo it.
        if ctx.is_walks_final_state(self.id()) {
            self.internal.record_connect_walk(ctx.walk());
        }
        self.internal.set_connected(true);
        Ok(TransitionSuccess::empty().into())
    }

    fn reset_state(&self) {
        self.internal.set_connected(false);
    }
}
