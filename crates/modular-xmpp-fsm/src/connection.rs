//! The modular client-to-server connection and its state graph walk.
//!
//! Every public operation that changes the connection's lifecycle builds a
//! [`WalkStateGraphContext`] towards a target state and walks the bound
//! [`StateGraph`] from the current state. Walks are serialized. If a walk
//! fails, every state it entered is reset, newest first, and the current
//! state returns to where the walk started.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use modular_xmpp_types::{LoginContext, Resource, TopLevelElement};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

use crate::config::ConnectionConfiguration;
use crate::context::{WalkStateGraphContext, WalkStateGraphContextBuilder};
use crate::descriptor::StateId;
use crate::error::{ConnectionError, StateMachineError};
use crate::event::{ConnectionStateEvent, ConnectionStateMachineListener, ListenerId};
use crate::graph::{StateGraph, VertexIndex};
use crate::internal::ConnectionInternal;
use crate::module::ModuleSet;
use crate::session::SessionHandler;
use crate::state::{AttemptResult, State, StateTransitionResult, TransitionImpossible};
use crate::states::{
    AUTHENTICATED_AND_RESOURCE_BOUND, CONNECTED_BUT_UNAUTHENTICATED, DISCONNECTED,
    INSTANT_SHUTDOWN, SHUTDOWN,
};
use crate::stats::ConnectionStats;
use crate::tls::TlsContext;

pub struct ModularConnection {
    configuration: Arc<ConnectionConfiguration>,
    internal: Arc<ConnectionInternal>,
    graph: Arc<StateGraph>,
    current: Mutex<VertexIndex>,
    walk_lock: tokio::sync::Mutex<()>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<TopLevelElement>>>,
}

impl ModularConnection {
    /// Create a connection in the disconnected state: construct every
    /// module and bind the configuration's state graph.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        configuration: Arc<ConnectionConfiguration>,
        session: Arc<dyn SessionHandler>,
    ) -> Result<Self, ConnectionError> {
        let config = configuration.config().clone();
        let tls = TlsContext::from_config(&config.tls)?;
        let (internal, incoming) = ConnectionInternal::new(config, session, tls);
        let internal = Arc::new(internal);

        let mut modules = Vec::with_capacity(configuration.modules().len());
        for descriptor in configuration.modules() {
            modules.push(descriptor.construct(&internal)?);
        }
        internal.install_modules(ModuleSet::new(modules));

        let graph = Arc::new(StateGraph::bind(
            configuration.state_descriptor_graph(),
            &internal,
        )?);
        debug!(connection = %internal.id(), states = graph.len(), "connection created");

        Ok(Self {
            configuration,
            current: Mutex::new(graph.root()),
            internal,
            graph,
            walk_lock: tokio::sync::Mutex::new(()),
            incoming: Mutex::new(Some(incoming)),
        })
    }

    /// Look up endpoints and establish a stream. On success the connection
    /// is in [`CONNECTED_BUT_UNAUTHENTICATED`]. Fails with
    /// [`ConnectionError::AlreadyConnected`] on a connected connection.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.walk(CONNECTED_BUT_UNAUTHENTICATED, |walk| walk).await
    }

    /// Authenticate and bind a resource, connecting first if necessary.
    /// Fails with [`ConnectionError::AlreadyLoggedIn`] once authenticated.
    pub async fn login(&self, login: LoginContext) -> Result<(), ConnectionError> {
        self.walk(AUTHENTICATED_AND_RESOURCE_BOUND, |walk| walk.with_login(login))
            .await
    }

    /// Close the stream orderly and disconnect.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.walk_to_disconnected(SHUTDOWN).await
    }

    /// Disconnect without closing the stream.
    pub async fn instant_shutdown(&self) -> Result<(), ConnectionError> {
        self.walk_to_disconnected(INSTANT_SHUTDOWN).await
    }

    async fn walk_to_disconnected(&self, via: StateId) -> Result<(), ConnectionError> {
        self.walk(DISCONNECTED, |walk| walk.with_mandatory_intermediate_state(via))
            .await
            .map_err(|e| StateMachineError::WalkToDisconnectedFailed(Box::new(e)).into())
    }

    /// Walk from the current state to `final_state`. The context is built
    /// once the walk lock is held, so it starts from the state the previous
    /// walk ended in.
    async fn walk(
        &self,
        final_state: StateId,
        configure: impl FnOnce(WalkStateGraphContextBuilder) -> WalkStateGraphContextBuilder,
    ) -> Result<(), ConnectionError> {
        let _scope = self.internal.enter_walk();
        let _guard = self.walk_lock.lock().await;
        self.ensure_walk_allowed(final_state)?;
        let initial_state = self.graph.id(self.current_vertex());
        let builder =
            WalkStateGraphContext::builder(Arc::clone(&self.graph), initial_state, final_state);
        let mut ctx = configure(builder).build();
        self.walk_state_graph(&mut ctx).await
    }

    fn ensure_walk_allowed(&self, final_state: StateId) -> Result<(), ConnectionError> {
        if final_state == CONNECTED_BUT_UNAUTHENTICATED && self.internal.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }
        if final_state == AUTHENTICATED_AND_RESOURCE_BOUND && self.internal.is_authenticated() {
            return Err(ConnectionError::AlreadyLoggedIn);
        }
        Ok(())
    }

    #[instrument(
        skip_all,
        fields(connection = %self.internal.id(), to = %ctx.final_state())
    )]
    async fn walk_state_graph(&self, ctx: &mut WalkStateGraphContext) -> Result<(), ConnectionError> {
        let initial = self.current_vertex();
        let result = self.walk_state_graph_internal(ctx).await;
        if let Err(e) = &result {
            debug!(error = %e, "walk failed, reverting");
            self.set_current_vertex(initial);
            for vertex in ctx.walk().iter().rev() {
                self.unwind_state(self.graph.state(*vertex).as_ref());
            }
        }
        result
    }

    async fn walk_state_graph_internal(
        &self,
        ctx: &mut WalkStateGraphContext,
    ) -> Result<(), ConnectionError> {
        loop {
            let current = self.current_vertex();
            let current_id = self.graph.id(current);
            ctx.record_walk_to(current);

            if ctx.is_walks_final_state(current_id) {
                debug_assert!(
                    self.graph.descriptor(current).is_final(),
                    "walk target {current_id} is not a final state"
                );
                self.internal
                    .emit(ConnectionStateEvent::FinalStateReached { state: current_id });
                return Ok(());
            }

            let outgoing = self.graph.outgoing(current);

            if let Some(mandatory) = ctx.maybe_take_mandatory_intermediate_state(outgoing) {
                match self.attempt_enter_state(mandatory, ctx).await? {
                    Some(StateTransitionResult::Success(_)) => continue,
                    result => {
                        return Err(StateMachineError::MandatoryStateFailed {
                            state: self.graph.id(mandatory),
                            reason: result.map_or_else(
                                || "state already visited".to_string(),
                                |r| r.to_string(),
                            ),
                        }
                        .into());
                    }
                }
            }

            let mut entered = false;
            for &successor in outgoing {
                if ctx.would_cause_cycle(successor) {
                    self.internal.emit(ConnectionStateEvent::TransitionIgnoredDueCycle {
                        from: current_id,
                        to: self.graph.id(successor),
                    });
                    continue;
                }
                match self.attempt_enter_state(successor, ctx).await? {
                    Some(StateTransitionResult::Success(_)) => {
                        entered = true;
                        break;
                    }
                    Some(result) => ctx.record_failed_state(self.graph.id(successor), result),
                    None => {}
                }
            }

            if !entered {
                return Err(StateMachineError::DeadEnd {
                    state: current_id,
                    walk: ctx.walk_ids(),
                    failed_states: ctx.failed_states().to_vec(),
                }
                .into());
            }
        }
    }

    /// Try to enter `successor`. `None` means the state was already walked
    /// and may be skipped.
    async fn attempt_enter_state(
        &self,
        successor: VertexIndex,
        ctx: &WalkStateGraphContext,
    ) -> Result<Option<StateTransitionResult>, ConnectionError> {
        let from = self.graph.id(self.current_vertex());
        let state = Arc::clone(self.graph.state(successor));
        let descriptor = Arc::clone(state.descriptor());
        let to = descriptor.id();

        if !descriptor.is_multi_visit() && ctx.state_already_visited(successor) {
            trace!(state = %to, "already visited");
            return Ok(None);
        }

        if descriptor.is_not_implemented() {
            let reason = TransitionImpossible::not_implemented(&descriptor);
            self.internal.emit(ConnectionStateEvent::TransitionNotPossible {
                from,
                to,
                reason: reason.clone(),
            });
            return Ok(Some(StateTransitionResult::Impossible(reason)));
        }

        let attempt = match self.try_transition(state.as_ref(), from, ctx).await {
            Ok(attempt) => attempt,
            Err(e) => {
                // The successor never became part of the walk, so the walk
                // revert would not reach it.
                self.unwind_state(state.as_ref());
                return Err(e);
            }
        };

        match attempt {
            Err(reason) => {
                self.internal.emit(ConnectionStateEvent::TransitionNotPossible {
                    from,
                    to,
                    reason: reason.clone(),
                });
                Ok(Some(StateTransitionResult::Impossible(reason)))
            }
            Ok(AttemptResult::Failure(failure)) => {
                self.internal.emit(ConnectionStateEvent::TransitionFailed {
                    from,
                    to,
                    failure: failure.clone(),
                });
                Ok(Some(StateTransitionResult::Failure(failure)))
            }
            Ok(AttemptResult::Success(success)) => {
                self.set_current_vertex(successor);
                self.internal
                    .emit(ConnectionStateEvent::SuccessfullyTransitionedInto {
                        state: to,
                        result: success.clone(),
                    });
                Ok(Some(StateTransitionResult::Success(success)))
            }
        }
    }

    async fn try_transition(
        &self,
        state: &dyn State,
        from: StateId,
        ctx: &WalkStateGraphContext,
    ) -> Result<Result<AttemptResult, TransitionImpossible>, ConnectionError> {
        if let Some(impossible) = state.is_transition_to_possible(ctx).await? {
            return Ok(Err(impossible));
        }
        self.internal.emit(ConnectionStateEvent::AboutToTransitionInto {
            from,
            to: state.id(),
        });
        Ok(Ok(state.transition_into(ctx).await?))
    }

    fn unwind_state(&self, state: &dyn State) {
        self.internal
            .emit(ConnectionStateEvent::StateRevertBackwardsWalk { state: state.id() });
        state.reset_state();
    }

    fn lock_current(&self) -> MutexGuard<'_, VertexIndex> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_vertex(&self) -> VertexIndex {
        *self.lock_current()
    }

    fn set_current_vertex(&self, vertex: VertexIndex) {
        *self.lock_current() = vertex;
    }

    /// Queue an element, waiting for free capacity.
    pub async fn send(&self, element: TopLevelElement) -> Result<(), ConnectionError> {
        self.internal.send_element(element).await
    }

    /// Queue an element, failing with
    /// [`ConnectionError::OutgoingQueueFull`] instead of waiting.
    pub fn send_nonblocking(&self, element: TopLevelElement) -> Result<(), ConnectionError> {
        self.internal.offer_element(element)
    }

    #[must_use]
    pub fn current_state(&self) -> StateId {
        self.graph.id(self.current_vertex())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.internal.is_connected()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.internal.is_authenticated()
    }

    #[must_use]
    pub fn is_secure_connection(&self) -> bool {
        self.internal.is_transport_secured()
    }

    #[must_use]
    pub fn is_using_compression(&self) -> bool {
        self.internal.is_compression_enabled()
    }

    #[must_use]
    pub fn bound_resource(&self) -> Option<Resource> {
        self.internal.bound_resource()
    }

    #[must_use]
    pub fn stream_id(&self) -> Option<String> {
        self.internal.stream_id()
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.internal.stats()
    }

    pub fn add_state_machine_listener(
        &self,
        listener: Arc<dyn ConnectionStateMachineListener>,
    ) -> ListenerId {
        self.internal.add_listener(listener)
    }

    pub fn remove_state_machine_listener(&self, id: ListenerId) {
        self.internal.remove_listener(id);
    }

    /// Abort whatever a state is currently waiting for. The running walk
    /// and walks waiting for their turn fail with
    /// [`ConnectionError::Interrupted`] and are reverted. Without a walk
    /// this does nothing.
    pub fn interrupt(&self) {
        self.internal.interrupt();
    }

    /// Inbound stanzas and unsolicited nonzas. Can be taken once.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<TopLevelElement>> {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The constructed instance of a module.
    #[must_use]
    pub fn module<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.internal.module::<T>()
    }

    #[must_use]
    pub fn internal(&self) -> &Arc<ConnectionInternal> {
        &self.internal
    }

    #[must_use]
    pub fn state_graph(&self) -> &Arc<StateGraph> {
        &self.graph
    }

    #[must_use]
    pub fn configuration(&self) -> &Arc<ConnectionConfiguration> {
        &self.configuration
    }
}

impl Drop for ModularConnection {
    fn drop(&mut self) {
        if self.internal.active_transport().is_some() {
            info!(connection = %self.internal.id(), "dropping connection with open transport");
            self.internal.outgoing_queue().shutdown();
            self.internal.disconnect_active_transport();
        }
    }
}

impl std::fmt::Debug for ModularConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModularConnection")
            .field("id", &self.internal.id())
            .field("state", &self.current_state())
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}
