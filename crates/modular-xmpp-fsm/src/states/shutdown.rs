use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::ensure_not_on_way_to_authenticated;
use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor};
use crate::error::ConnectionError;
use crate::internal::ConnectionInternal;
use crate::state::{AttemptResult, State, TransitionImpossible, TransitionSuccess};

/// Orderly shutdown: queue the closing stream tag behind everything still
/// pending, wait for the server's closing tag, then close the filters in
/// two phases.
pub struct ShutdownState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
}

impl ShutdownState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
        }
    }

    async fn close_filters(&self) {
        let filters = self.internal.filters().head_to_tail();
        for filter in &filters {
            filter.close_input_output();
        }

        if let Some(transport) = self.internal.active_transport() {
            transport.after_filters_closed();
        }

        let timeout = self.internal.reply_timeout();
        for filter in &filters {
            match tokio::time::timeout(timeout, filter.wait_until_input_output_closed()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(filter = filter.filter_name(), error = %e, "filter failed to close");
                }
                Err(_) => {
                    warn!(filter = filter.filter_name(), "filter did not close in time");
                }
            }
        }
    }
}

#[async_trait]
impl State for ShutdownState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn is_transition_to_possible(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<Option<TransitionImpossible>, ConnectionError> {
        ensure_not_on_way_to_authenticated(ctx, self)?;
        Ok(None)
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        if let Some(transport) = self.internal.active_transport() {
            self.internal.prepare_to_wait_for_closing_stream();
            let close = transport.stream_factory().create_stream_close();
            match self.internal.outgoing_queue().offer_and_shutdown(close) {
                Ok(()) => {
                    transport.notify_about_new_outgoing_elements();
                    if self.internal.wait_for_closing_stream_tag_from_server().await {
                        self.close_filters().await;
                    }
                }
                Err(e) => debug!(error = %e, "could not queue closing stream tag"),
            }
        }

        self.internal.set_authenticated(false);
        Ok(TransitionSuccess::empty().into())
    }
}

/// Shutdown without closing the stream.
pub struct InstantShutdownState {
    descriptor: Arc<StateDescriptor>,
}

impl InstantShutdownState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
        }
    }
}

#[async_trait]
impl State for InstantShutdownState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn is_transition_to_possible(
        &self,
        ctx: &WalkStateGraphContext,
    ) -> Result<Option<TransitionImpossible>, ConnectionError> {
        ensure_not_on_way_to_authenticated(ctx, self)?;
        Ok(None)
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        Ok(TransitionSuccess::empty().into())
    }
}

/// Disconnects the active transport.
pub struct CloseConnectionState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
}

impl CloseConnectionState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
        }
    }
}

#[async_trait]
impl State for CloseConnectionState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        self.internal.disconnect_active_transport();
        self.internal.set_authenticated(false);
        self.internal.set_connected(false);
        Ok(TransitionSuccess::empty().into())
    }
}
