use std::sync::Arc;

use async_trait::async_trait;

use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor};
use crate::error::ConnectionError;
use crate::graph::VertexIndex;
use crate::internal::ConnectionInternal;
use crate::state::{AttemptResult, State, TransitionSuccess};

/// Binds a resource through the session handler.
pub struct ResourceBindingState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
}

impl ResourceBindingState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
        }
    }
}

#[async_trait]
impl State for ResourceBindingState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        self.internal.signal_last_features_received();

        let requested = ctx.login().and_then(|login| login.resource.as_ref());
        let bound = self
            .internal
            .session()
            .bind_resource(&self.internal, requested)
            .await?;
        self.internal.set_stream_resumed(false);

        let message = match requested {
            Some(requested) if *requested != bound => {
                format!("resource '{bound}' bound (requested: '{requested}')")
            }
            _ => format!("resource '{bound}' bound"),
        };
        self.internal.set_bound_resource(Some(bound));
        Ok(TransitionSuccess::new(message).into())
    }

    fn reset_state(&self) {
        self.internal.set_bound_resource(None);
    }
}

/// Final state of a login walk.
pub struct AuthenticatedAndResourceBoundState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
    vertex: VertexIndex,
}

impl AuthenticatedAndResourceBoundState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
            vertex: binding.index(),
        }
    }
}

#[async_trait]
impl State for AuthenticatedAndResourceBoundState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        self.internal.record_login_walk(ctx.walk(), self.vertex);
        self.internal.set_authenticated(true);

        let resumed = self.internal.is_stream_resumed();
        self.internal
            .session()
            .after_successful_login(&self.internal, resumed)
            .await?;
        Ok(TransitionSuccess::empty().into())
    }

    fn reset_state(&self) {
        self.internal.set_authenticated(false);
    }
}
