use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor};
use crate::error::ConnectionError;
use crate::internal::ConnectionInternal;
use crate::state::{AttemptResult, State, TransitionSuccess};

/// Entering the disconnected state undoes the previous connection: the
/// filter chain is cleared (its statistics are kept) and every state of
/// the remembered connect and login walks is reset, newest first.
pub struct DisconnectedState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
}

impl DisconnectedState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
        }
    }
}

#[async_trait]
impl State for DisconnectedState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        self.internal.filters().snapshot_and_clear();

        let walk = self.internal.take_walk_from_disconnect_to_authenticated();
        debug!(states = walk.len(), "resetting states of the previous connection");
        for vertex in walk.iter().rev() {
            ctx.graph().state(*vertex).reset_state();
        }
        self.internal.set_bound_resource(None);

        Ok(TransitionSuccess::empty().into())
    }
}
