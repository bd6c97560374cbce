use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor};
use crate::error::ConnectionError;
use crate::event::ConnectionStateEvent;
use crate::internal::ConnectionInternal;
use crate::state::{AttemptResult, State, TransitionSuccess};
use crate::transport::{LookupFailure, LookupResult};

/// Discovers endpoints through every transport and starts the outgoing
/// queue.
///
/// All lookups share one deadline of the reply timeout. The state succeeds
/// when at least one lookup produced endpoints; the remaining failures are
/// reported as [`ConnectionStateEvent::EndpointLookupFailed`].
pub struct LookupRemoteConnectionEndpointsState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
    started_queue: AtomicBool,
}

impl LookupRemoteConnectionEndpointsState {
    #[must_use]
    pub fn new(binding: &StateBinding<'_>) -> Self {
        Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
            started_queue: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl State for LookupRemoteConnectionEndpointsState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        self.internal.clear_connection_error();

        let mut lookups = Vec::new();
        for transport in self.internal.transports() {
            transport.reset_discovered_endpoints();
            for lookup in transport.lookup_endpoints() {
                lookups.push((Arc::clone(&transport), lookup));
            }
        }

        let deadline = Instant::now() + self.internal.reply_timeout();
        let mut discovered = 0;
        let mut failures = Vec::new();
        for (transport, lookup) in lookups {
            let result = self
                .internal
                .interruptible(
                    "remote connection endpoint lookups",
                    tokio::time::timeout_at(deadline, lookup),
                )
                .await?;
            match result {
                Ok(Ok(LookupResult::Success(success))) if !success.endpoints.is_empty() => {
                    debug!(
                        transport = transport.name(),
                        endpoints = success.endpoints.len(),
                        "endpoints discovered"
                    );
                    discovered += success.endpoints.len();
                    transport.load_endpoints(success);
                }
                Ok(Ok(LookupResult::Success(_))) => failures.push(LookupFailure::new(
                    transport.name(),
                    "lookup returned no endpoints",
                )),
                Ok(Ok(LookupResult::Failed(failure))) => failures.push(failure),
                Ok(Err(_)) => {
                    failures.push(LookupFailure::new(transport.name(), "lookup abandoned"));
                }
                Err(_) => failures.push(LookupFailure::new(
                    transport.name(),
                    "lookup did not finish before the deadline",
                )),
            }
        }

        if discovered == 0 {
            return Err(ConnectionError::NoEndpointsDiscovered(failures));
        }
        for failure in failures {
            warn!(%failure, "endpoint lookup failed");
            self.internal
                .emit(ConnectionStateEvent::EndpointLookupFailed { failure });
        }

        let was_shutdown = self.internal.outgoing_queue().start();
        self.started_queue.store(was_shutdown, Ordering::SeqCst);

        Ok(TransitionSuccess::new(format!("{discovered} remote connection endpoints discovered")).into())
    }

    fn reset_state(&self) {
        for transport in self.internal.transports() {
            transport.reset_discovered_endpoints();
        }
        if self.started_queue.swap(false, Ordering::SeqCst) {
            self.internal.outgoing_queue().shutdown();
        }
    }
}
