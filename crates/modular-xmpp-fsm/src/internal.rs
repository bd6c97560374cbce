//! Connection-internal handle shared by states, modules and transports.
//!
//! Transports hold it weakly; states and the connection hold it strongly.
//! Blocking waits go through [`ConnectionInternal::wait_for_condition`],
//! which is woken by incoming elements, connection errors and
//! [`ConnectionInternal::interrupt`].

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use modular_xmpp_types::{
    ElementName, Nonza, Resource, StreamFeature, StreamFeatures, TopLevelElement,
};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, QueueError};
use crate::event::{ConnectionStateEvent, ConnectionStateMachineListener, EventDispatcher, ListenerId};
use crate::filter::{FilterChain, InputOutputFilter};
use crate::graph::VertexIndex;
use crate::module::ModuleSet;
use crate::queue::OutgoingQueue;
use crate::session::SessionHandler;
use crate::stats::ConnectionStats;
use crate::tls::TlsContext;
use crate::transport::Transport;

/// Answer to a request sent with
/// [`ConnectionInternal::send_and_wait_for_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonzaResponse {
    Success(Nonza),
    Failure(Nonza),
}

struct PendingResponse {
    success: ElementName,
    failure: ElementName,
    tx: oneshot::Sender<NonzaResponse>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionInternal {
    id: Uuid,
    config: ConnectionConfig,
    session: Arc<dyn SessionHandler>,
    tls: Option<TlsContext>,
    queue: OutgoingQueue<TopLevelElement>,
    filters: FilterChain,
    modules: OnceLock<ModuleSet>,
    active_transport: RwLock<Option<Arc<dyn Transport>>>,

    connected: AtomicBool,
    authenticated: AtomicBool,
    compression_enabled: AtomicBool,
    stream_resumed: AtomicBool,
    features_received: AtomicBool,
    last_features_received: AtomicBool,
    closing_stream_received: AtomicBool,
    interrupted: AtomicBool,
    /// Walks running or waiting for their turn.
    walks: Mutex<usize>,

    features: RwLock<StreamFeatures>,
    stream_id: Mutex<Option<String>>,
    bound_resource: Mutex<Option<Resource>>,
    connection_error: Mutex<Option<String>>,
    condition: Notify,
    pending_responses: Mutex<Vec<PendingResponse>>,
    incoming: mpsc::UnboundedSender<TopLevelElement>,
    events: EventDispatcher,
    walk_from_disconnect_to_authenticated: Mutex<Option<Vec<VertexIndex>>>,
}

impl ConnectionInternal {
    pub(crate) fn new(
        config: ConnectionConfig,
        session: Arc<dyn SessionHandler>,
        tls: Option<TlsContext>,
    ) -> (Self, mpsc::UnboundedReceiver<TopLevelElement>) {
        let (incoming, incoming_rx) = mpsc::unbounded_channel();
        let queue = OutgoingQueue::new(config.connection.outgoing_queue_capacity);
        let internal = Self {
            id: Uuid::new_v4(),
            config,
            session,
            tls,
            queue,
            filters: FilterChain::new(),
            modules: OnceLock::new(),
            active_transport: RwLock::new(None),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            compression_enabled: AtomicBool::new(false),
            stream_resumed: AtomicBool::new(false),
            features_received: AtomicBool::new(false),
            last_features_received: AtomicBool::new(false),
            closing_stream_received: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            walks: Mutex::new(0),
            features: RwLock::new(StreamFeatures::new()),
            stream_id: Mutex::new(None),
            bound_resource: Mutex::new(None),
            connection_error: Mutex::new(None),
            condition: Notify::new(),
            pending_responses: Mutex::new(Vec::new()),
            incoming,
            events: EventDispatcher::spawn(),
            walk_from_disconnect_to_authenticated: Mutex::new(None),
        };
        (internal, incoming_rx)
    }

    /// Identifier of this connection, for logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        self.config.connection.reply_timeout()
    }

    #[must_use]
    pub fn session(&self) -> &Arc<dyn SessionHandler> {
        &self.session
    }

    #[must_use]
    pub fn tls_context(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    #[must_use]
    pub fn outgoing_queue(&self) -> &OutgoingQueue<TopLevelElement> {
        &self.queue
    }

    #[must_use]
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn add_filter(&self, filter: Arc<dyn InputOutputFilter>) {
        self.filters.add_first(filter);
    }

    /// Submit a task to the runtime the connection lives on.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(task)
    }

    // Modules and transports

    pub(crate) fn install_modules(&self, modules: ModuleSet) {
        if self.modules.set(modules).is_err() {
            warn!(connection = %self.id, "modules already installed");
        }
    }

    #[must_use]
    pub fn module<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.modules.get()?.get::<T>()
    }

    #[must_use]
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.get().map(ModuleSet::names).unwrap_or_default()
    }

    #[must_use]
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.modules
            .get()
            .map(ModuleSet::transports)
            .unwrap_or_default()
    }

    /// Make `transport` the one outgoing elements are delivered through.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        debug!(connection = %self.id, transport = transport.name(), "transport active");
        *self
            .active_transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    #[must_use]
    pub fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active_transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Disconnect and forget the active transport.
    pub fn disconnect_active_transport(&self) {
        let transport = self
            .active_transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = transport {
            debug!(connection = %self.id, transport = transport.name(), "disconnecting transport");
            transport.disconnect();
        }
    }

    #[must_use]
    pub fn is_transport_secured(&self) -> bool {
        self.active_transport()
            .is_some_and(|transport| transport.is_transport_secured())
    }

    // Flags

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::SeqCst)
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stream_resumed(&self) -> bool {
        self.stream_resumed.load(Ordering::SeqCst)
    }

    pub fn set_stream_resumed(&self, resumed: bool) {
        self.stream_resumed.store(resumed, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.stream_id).clone()
    }

    #[must_use]
    pub fn bound_resource(&self) -> Option<Resource> {
        lock(&self.bound_resource).clone()
    }

    pub fn set_bound_resource(&self, resource: Option<Resource>) {
        *lock(&self.bound_resource) = resource;
    }

    // Stream features

    #[must_use]
    pub fn features(&self) -> StreamFeatures {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn feature(&self, name: &str, namespace: &str) -> Option<StreamFeature> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name, namespace)
            .cloned()
    }

    pub fn prepare_to_wait_for_features_received(&self) {
        self.features_received.store(false, Ordering::SeqCst);
    }

    pub async fn wait_for_features_received(&self, waiting_for: &str) -> Result<(), ConnectionError> {
        self.wait_for_condition(|| self.features_received.load(Ordering::SeqCst), waiting_for)
            .await
    }

    /// The features of the current stream are the last ones before the
    /// session is established.
    pub fn signal_last_features_received(&self) {
        self.last_features_received.store(true, Ordering::SeqCst);
        self.condition.notify_waiters();
    }

    #[must_use]
    pub fn last_features_received(&self) -> bool {
        self.last_features_received.load(Ordering::SeqCst)
    }

    // Waiting

    /// Wait until `condition` holds, the reply timeout elapses, a
    /// connection error is reported or the connection is interrupted.
    pub async fn wait_for_condition(
        &self,
        condition: impl Fn() -> bool,
        waiting_for: &str,
    ) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + self.reply_timeout();
        loop {
            let notified = self.condition.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if condition() {
                return Ok(());
            }
            if let Some(cause) = self.connection_error() {
                return Err(ConnectionError::UnexpectedlyTerminated {
                    waiting_for: waiting_for.to_owned(),
                    cause,
                });
            }
            if self.is_interrupted() {
                return Err(ConnectionError::Interrupted(waiting_for.to_owned()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ConnectionError::NoResponse {
                    timeout_ms: self.reply_timeout().as_millis(),
                    waiting_for: waiting_for.to_owned(),
                });
            }
        }
    }

    /// Run `task` until it completes or the connection is interrupted.
    pub async fn interruptible<F: Future>(
        &self,
        waiting_for: &str,
        task: F,
    ) -> Result<F::Output, ConnectionError> {
        tokio::pin!(task);
        loop {
            let notified = self.condition.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_interrupted() {
                return Err(ConnectionError::Interrupted(waiting_for.to_owned()));
            }
            tokio::select! {
                output = &mut task => return Ok(output),
                () = &mut notified => {}
            }
        }
    }

    /// Cancel every wait of the walks running or waiting for their turn
    /// with [`ConnectionError::Interrupted`]. Without a walk this does
    /// nothing.
    pub fn interrupt(&self) {
        let walks = lock(&self.walks);
        if *walks == 0 {
            debug!(connection = %self.id, "no walk to interrupt");
            return;
        }
        info!(connection = %self.id, walks = *walks, "interrupting connection");
        self.interrupted.store(true, Ordering::SeqCst);
        drop(walks);
        self.condition.notify_waiters();
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Count a walk in until the returned scope is dropped. The interrupt
    /// flag clears once the last walk has left.
    pub(crate) fn enter_walk(&self) -> WalkScope<'_> {
        *lock(&self.walks) += 1;
        WalkScope { internal: self }
    }

    /// Record a fatal connection error and wake every waiter.
    pub fn notify_connection_error(&self, error: &ConnectionError) {
        warn!(connection = %self.id, %error, "connection error");
        *lock(&self.connection_error) = Some(error.to_string());
        // Dropping the senders fails every pending request.
        lock(&self.pending_responses).clear();
        self.condition.notify_waiters();
    }

    #[must_use]
    pub fn connection_error(&self) -> Option<String> {
        lock(&self.connection_error).clone()
    }

    pub(crate) fn clear_connection_error(&self) {
        *lock(&self.connection_error) = None;
    }

    // Elements

    /// Handle an element decoded from the stream.
    pub fn process_element(&self, element: TopLevelElement) {
        trace!(connection = %self.id, kind = element.kind(), "incoming element");
        match element {
            TopLevelElement::StreamOpen(open) => {
                *lock(&self.stream_id) = open.id;
            }
            TopLevelElement::StreamClose => {
                self.closing_stream_received.store(true, Ordering::SeqCst);
                self.condition.notify_waiters();
            }
            TopLevelElement::Features(features) => {
                *self
                    .features
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = features;
                self.features_received.store(true, Ordering::SeqCst);
                self.condition.notify_waiters();
            }
            TopLevelElement::StreamError(condition) => {
                self.notify_connection_error(&ConnectionError::Stream(condition));
            }
            TopLevelElement::Nonza(nonza) => {
                if let Some(nonza) = self.complete_pending_response(nonza) {
                    let _ = self.incoming.send(TopLevelElement::Nonza(nonza));
                }
            }
            stanza @ TopLevelElement::Stanza(_) => {
                let _ = self.incoming.send(stanza);
            }
        }
    }

    /// Hand `nonza` to the request waiting for it. Returns it back if
    /// nobody was waiting.
    fn complete_pending_response(&self, nonza: Nonza) -> Option<Nonza> {
        let mut pending = lock(&self.pending_responses);
        pending.retain(|p| !p.tx.is_closed());
        let Some(position) = pending
            .iter()
            .position(|p| nonza.is(&p.success) || nonza.is(&p.failure))
        else {
            return Some(nonza);
        };
        let waiter = pending.remove(position);
        let response = if nonza.is(&waiter.success) {
            NonzaResponse::Success(nonza)
        } else {
            NonzaResponse::Failure(nonza)
        };
        if let Err(NonzaResponse::Success(n) | NonzaResponse::Failure(n)) = waiter.tx.send(response) {
            return Some(n);
        }
        None
    }

    /// Queue `element`, waiting for free capacity.
    pub async fn send_element(&self, element: TopLevelElement) -> Result<(), ConnectionError> {
        let transport = self.active_transport().ok_or(ConnectionError::NotConnected)?;
        trace!(connection = %self.id, kind = element.kind(), "queueing outgoing element");
        self.interruptible("free space in the outgoing queue", self.queue.put(element))
            .await??;
        transport.notify_about_new_outgoing_elements();
        Ok(())
    }

    /// Queue `element` without waiting.
    pub fn offer_element(&self, element: TopLevelElement) -> Result<(), ConnectionError> {
        let transport = self.active_transport().ok_or(ConnectionError::NotConnected)?;
        self.queue.offer(element).map_err(|e| match e {
            QueueError::Full => ConnectionError::OutgoingQueueFull,
            QueueError::Shutdown => ConnectionError::Queue(e),
        })?;
        transport.notify_about_new_outgoing_elements();
        Ok(())
    }

    /// Send a new stream open towards the configured domain.
    pub async fn send_stream_open(&self) -> Result<(), ConnectionError> {
        let transport = self.active_transport().ok_or(ConnectionError::NotConnected)?;
        let settings = &self.config.connection;
        let from = self
            .config
            .login
            .username
            .as_ref()
            .map(|username| format!("{username}@{}", settings.xmpp_domain));
        let open = transport.stream_factory().create_stream_open(
            &settings.xmpp_domain,
            from.as_deref(),
            None,
            settings.language.as_deref(),
        );
        self.send_element(open).await
    }

    /// Open a new stream and wait for the server's stream features.
    pub async fn new_stream_open_wait_for_features_sequence(
        &self,
        waiting_for: &str,
    ) -> Result<(), ConnectionError> {
        self.prepare_to_wait_for_features_received();
        self.send_stream_open().await?;
        self.wait_for_features_received(waiting_for).await
    }

    /// Send `request` and wait for a nonza named `success` or `failure`.
    pub async fn send_and_wait_for_response(
        &self,
        request: Nonza,
        success: ElementName,
        failure: ElementName,
    ) -> Result<NonzaResponse, ConnectionError> {
        let waiting_for = format!("{success} or {failure}");
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_responses).push(PendingResponse {
            success,
            failure,
            tx,
        });

        self.send_element(TopLevelElement::Nonza(request)).await?;

        let response = self
            .interruptible(&waiting_for, tokio::time::timeout(self.reply_timeout(), rx))
            .await?;
        match response {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectionError::UnexpectedlyTerminated {
                cause: self
                    .connection_error()
                    .unwrap_or_else(|| "response channel closed".to_string()),
                waiting_for,
            }),
            Err(_) => Err(ConnectionError::NoResponse {
                timeout_ms: self.reply_timeout().as_millis(),
                waiting_for,
            }),
        }
    }

    pub fn prepare_to_wait_for_closing_stream(&self) {
        self.closing_stream_received.store(false, Ordering::SeqCst);
    }

    /// Wait for the server's closing stream tag. Returns whether it arrived.
    pub async fn wait_for_closing_stream_tag_from_server(&self) -> bool {
        match self
            .wait_for_condition(
                || self.closing_stream_received.load(Ordering::SeqCst),
                "closing stream tag from server",
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                info!(connection = %self.id, error = %e, "no closing stream tag received");
                false
            }
        }
    }

    // Events

    pub fn emit(&self, event: ConnectionStateEvent) {
        self.events.emit(event);
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn ConnectionStateMachineListener>) -> ListenerId {
        self.events.add(listener)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.events.remove(id);
    }

    // Walk bookkeeping

    /// Remember the walk that connected the stream.
    pub(crate) fn record_connect_walk(&self, walk: &[VertexIndex]) {
        *lock(&self.walk_from_disconnect_to_authenticated) = Some(walk.to_vec());
    }

    /// Extend the remembered walk with the login walk and the authenticated
    /// state itself.
    pub(crate) fn record_login_walk(&self, walk: &[VertexIndex], authenticated: VertexIndex) {
        let mut recorded = lock(&self.walk_from_disconnect_to_authenticated);
        let recorded = recorded.get_or_insert_with(Vec::new);
        for vertex in walk.iter().copied().chain(std::iter::once(authenticated)) {
            if recorded.last() != Some(&vertex) {
                recorded.push(vertex);
            }
        }
    }

    pub(crate) fn take_walk_from_disconnect_to_authenticated(&self) -> Vec<VertexIndex> {
        lock(&self.walk_from_disconnect_to_authenticated)
            .take()
            .unwrap_or_default()
    }

    // Stats

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        for transport in self.transports() {
            stats
                .transports
                .insert(transport.name().to_owned(), transport.stats());
        }
        for (name, report) in self.filters.stats() {
            stats.filters.insert(name, report);
        }
        stats
    }
}

pub(crate) struct WalkScope<'a> {
    internal: &'a ConnectionInternal,
}

impl Drop for WalkScope<'_> {
    fn drop(&mut self) {
        let mut walks = lock(&self.internal.walks);
        *walks = walks.saturating_sub(1);
        if *walks == 0 {
            self.internal.interrupted.store(false, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for ConnectionInternal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInternal")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .field("queue", &self.queue)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}
