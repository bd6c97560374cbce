//! Scripted in-memory transport and session handler for testing.
//!
//! [`MockTransportModuleDescriptor`] adds an `EstablishingMockConnection`
//! state behind the lookup state. Its transport answers outgoing elements
//! synchronously, the way a [`MockServerScript`] tells it to.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use modular_xmpp_types::{
    LoginContext, Nonza, Resource, StreamFeature, StreamFeatures, StreamOpen, TopLevelElement,
};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::SecurityMode;
use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateBinding, StateDescriptor, StateId};
use crate::error::{ConfigurationError, ConnectionError};
use crate::internal::ConnectionInternal;
use crate::module::{ConnectionModule, ModuleDescriptor};
use crate::session::{SaslOutcome, SessionHandler};
use crate::state::{AttemptResult, State, TransitionFailure, TransitionSuccess};
use crate::states::{CONNECTED_BUT_UNAUTHENTICATED, LOOKUP_REMOTE_CONNECTION_ENDPOINTS};
use crate::stats::StatsReport;
use crate::transport::{
    LookupFailure, LookupResult, LookupSuccess, PendingLookup, RemoteEndpoint, Transport,
};

pub const ESTABLISHING_MOCK_CONNECTION: StateId = StateId::new("EstablishingMockConnection");

pub const SASL_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-bind";

const TRANSPORT_NAME: &str = "mock";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MockServerScript
// ---------------------------------------------------------------------------

/// Outcome of one endpoint lookup.
#[derive(Debug, Clone)]
pub enum MockLookup {
    Endpoints(Vec<RemoteEndpoint>),
    Fail(String),
    /// Never resolves.
    Hang,
    /// Resolves with the endpoints after the delay.
    Delayed(Duration, Vec<RemoteEndpoint>),
}

/// How the mock server behaves.
#[derive(Debug, Clone)]
pub struct MockServerScript {
    /// One lookup per entry, in order.
    pub lookups: Vec<MockLookup>,
    /// Features sent after the n-th stream open; the last entry repeats.
    pub stream_features: Vec<StreamFeatures>,
    /// Answer our closing stream tag with one of its own.
    pub answer_stream_close: bool,
    /// Answer `compress` requests with `compressed` instead of `failure`.
    pub accept_compression: bool,
    /// The server offers TLS. The transport is secured unless the security
    /// mode is disabled.
    pub secured: bool,
    /// The establishing state fails instead of connecting.
    pub connect_fails: bool,
}

impl Default for MockServerScript {
    fn default() -> Self {
        Self {
            lookups: vec![MockLookup::Endpoints(vec![RemoteEndpoint::new(
                "localhost",
                5222,
            )])],
            stream_features: vec![pre_auth_features(), post_auth_features()],
            answer_stream_close: true,
            accept_compression: true,
            secured: true,
            connect_fails: false,
        }
    }
}

/// Features offered before authentication: SASL PLAIN.
#[must_use]
pub fn pre_auth_features() -> StreamFeatures {
    StreamFeatures::new()
        .with(StreamFeature::new("mechanisms", SASL_NAMESPACE).with_value("PLAIN"))
}

/// Features offered after authentication: resource binding.
#[must_use]
pub fn post_auth_features() -> StreamFeatures {
    StreamFeatures::new().with(StreamFeature::new("bind", BIND_NAMESPACE))
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockTransportState {
    discovered: Vec<RemoteEndpoint>,
    connected_to: Option<RemoteEndpoint>,
    stream_opens: usize,
    sent: Vec<TopLevelElement>,
    disconnects: usize,
    hanging: Vec<oneshot::Sender<LookupResult>>,
}

/// In-memory transport playing the server side of a [`MockServerScript`].
pub struct MockTransport {
    internal: Weak<ConnectionInternal>,
    script: MockServerScript,
    state: Mutex<MockTransportState>,
    bytes_written: AtomicU64,
}

impl MockTransport {
    fn new(internal: &Arc<ConnectionInternal>, script: MockServerScript) -> Self {
        Self {
            internal: Arc::downgrade(internal),
            script,
            state: Mutex::new(MockTransportState::default()),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Every element delivered so far.
    #[must_use]
    pub fn sent_elements(&self) -> Vec<TopLevelElement> {
        lock(&self.state).sent.clone()
    }

    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected_to.is_some()
    }

    #[must_use]
    pub fn discovered_endpoints(&self) -> Vec<RemoteEndpoint> {
        lock(&self.state).discovered.clone()
    }

    fn connect(&self) -> Option<RemoteEndpoint> {
        let mut state = lock(&self.state);
        let endpoint = state.discovered.first().cloned()?;
        state.connected_to = Some(endpoint.clone());
        state.stream_opens = 0;
        Some(endpoint)
    }

    fn close_socket(&self) {
        let mut state = lock(&self.state);
        if state.connected_to.take().is_some() {
            state.disconnects += 1;
        }
    }

    /// The server's answer to `element`, if any.
    fn respond(&self, element: &TopLevelElement) -> Vec<TopLevelElement> {
        match element {
            TopLevelElement::StreamOpen(open) => {
                let mut state = lock(&self.state);
                let features = self
                    .script
                    .stream_features
                    .get(state.stream_opens)
                    .or_else(|| self.script.stream_features.last())
                    .cloned()
                    .unwrap_or_default();
                state.stream_opens += 1;
                let mut answer = StreamOpen::client(open.from.clone().unwrap_or_default());
                answer.from = Some(open.to.clone());
                answer.id = Some(uuid::Uuid::new_v4().to_string());
                vec![
                    TopLevelElement::StreamOpen(answer),
                    TopLevelElement::Features(features),
                ]
            }
            TopLevelElement::StreamClose if self.script.answer_stream_close => {
                vec![TopLevelElement::StreamClose]
            }
            TopLevelElement::Nonza(nonza) if nonza.name.name == "compress" => {
                let name = if self.script.accept_compression {
                    "compressed"
                } else {
                    "failure"
                };
                vec![TopLevelElement::Nonza(Nonza::new(
                    name,
                    nonza.name.namespace.clone(),
                ))]
            }
            _ => Vec::new(),
        }
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn lookup_endpoints(&self) -> Vec<PendingLookup> {
        // A configured host replaces the scripted lookups.
        if let Some(internal) = self.internal.upgrade() {
            let settings = &internal.config().connection;
            if let Some(host) = &settings.host {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(LookupResult::Success(LookupSuccess {
                    endpoints: vec![RemoteEndpoint::new(host.clone(), settings.port)],
                }));
                return vec![rx];
            }
        }
        let mut pending = Vec::with_capacity(self.script.lookups.len());
        for lookup in &self.script.lookups {
            let (tx, rx) = oneshot::channel();
            match lookup {
                MockLookup::Endpoints(endpoints) => {
                    let _ = tx.send(LookupResult::Success(LookupSuccess {
                        endpoints: endpoints.clone(),
                    }));
                }
                MockLookup::Fail(description) => {
                    let _ = tx.send(LookupResult::Failed(LookupFailure::new(
                        TRANSPORT_NAME,
                        description.clone(),
                    )));
                }
                MockLookup::Hang => lock(&self.state).hanging.push(tx),
                MockLookup::Delayed(delay, endpoints) => {
                    let delay = *delay;
                    let endpoints = endpoints.clone();
                    let task = async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(LookupResult::Success(LookupSuccess { endpoints }));
                    };
                    match self.internal.upgrade() {
                        Some(internal) => {
                            internal.spawn(task);
                        }
                        None => {
                            tokio::spawn(task);
                        }
                    }
                }
            }
            pending.push(rx);
        }
        pending
    }

    fn load_endpoints(&self, success: LookupSuccess) {
        lock(&self.state).discovered.extend(success.endpoints);
    }

    fn reset_discovered_endpoints(&self) {
        let mut state = lock(&self.state);
        state.discovered.clear();
        state.hanging.clear();
    }

    fn notify_about_new_outgoing_elements(&self) {
        let Some(internal) = self.internal.upgrade() else {
            return;
        };
        while let Some(element) = internal.outgoing_queue().poll() {
            let wire = format!("{element:?}");
            match internal.filters().process_output(wire.as_bytes()) {
                Ok(bytes) => {
                    self.bytes_written
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    internal.notify_connection_error(&e.into());
                    return;
                }
            }
            trace!(kind = element.kind(), "mock server received element");
            let answers = self.respond(&element);
            lock(&self.state).sent.push(element);
            for answer in answers {
                internal.process_element(answer);
            }
        }
    }

    fn disconnect(&self) {
        debug!("mock transport disconnecting");
        self.close_socket();
    }

    fn is_transport_secured(&self) -> bool {
        let tls_disabled = self.internal.upgrade().is_some_and(|internal| {
            internal.config().connection.security_mode == SecurityMode::Disabled
        });
        self.script.secured && !tls_disabled
    }

    fn stats(&self) -> StatsReport {
        let state = lock(&self.state);
        StatsReport::new()
            .with("bytes_written", self.bytes_written.load(Ordering::Relaxed))
            .with("elements_sent", state.sent.len())
            .with("disconnects", state.disconnects)
    }
}

// ---------------------------------------------------------------------------
// MockTransportModuleDescriptor
// ---------------------------------------------------------------------------

/// Module contributing the mock transport and its establishing state.
#[derive(Debug, Clone, Default)]
pub struct MockTransportModuleDescriptor {
    script: MockServerScript,
}

impl MockTransportModuleDescriptor {
    #[must_use]
    pub fn new(script: MockServerScript) -> Self {
        Self { script }
    }
}

impl ModuleDescriptor for MockTransportModuleDescriptor {
    fn name(&self) -> &'static str {
        "mock-transport"
    }

    fn state_descriptors(&self) -> Vec<StateDescriptor> {
        vec![StateDescriptor::builder(ESTABLISHING_MOCK_CONNECTION)
            .predecessor(LOOKUP_REMOTE_CONNECTION_ENDPOINTS)
            .successor(CONNECTED_BUT_UNAUTHENTICATED)
            .factory(|binding| Ok(Arc::new(EstablishingMockConnectionState::new(binding)?)))
            .build()]
    }

    fn construct(
        &self,
        internal: &Arc<ConnectionInternal>,
    ) -> Result<ConnectionModule, ConfigurationError> {
        let transport = Arc::new(MockTransport::new(internal, self.script.clone()));
        Ok(ConnectionModule::new("mock-transport", Arc::clone(&transport)).with_transport(transport))
    }
}

/// Connects the mock transport to the first discovered endpoint and opens
/// the stream.
pub struct EstablishingMockConnectionState {
    descriptor: Arc<StateDescriptor>,
    internal: Arc<ConnectionInternal>,
    transport: Arc<MockTransport>,
}

impl EstablishingMockConnectionState {
    pub fn new(binding: &StateBinding<'_>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            descriptor: binding.descriptor(),
            internal: binding.internal(),
            transport: binding.module::<MockTransport>()?,
        })
    }
}

#[async_trait]
impl State for EstablishingMockConnectionState {
    fn descriptor(&self) -> &Arc<StateDescriptor> {
        &self.descriptor
    }

    async fn transition_into(
        &self,
        _ctx: &WalkStateGraphContext,
    ) -> Result<AttemptResult, ConnectionError> {
        if self.transport.script.connect_fails {
            return Ok(TransitionFailure::new("connection refused").into());
        }
        let Some(endpoint) = self.transport.connect() else {
            return Ok(TransitionFailure::new("no endpoint to connect to").into());
        };
        let transport: Arc<dyn Transport> = self.transport.clone();
        self.internal.set_transport(transport);
        self.internal
            .new_stream_open_wait_for_features_sequence("initial stream features")
            .await?;
        Ok(TransitionSuccess::new(format!("connected to {endpoint}")).into())
    }

    fn reset_state(&self) {
        self.internal.disconnect_active_transport();
        self.transport.close_socket();
    }
}

// ---------------------------------------------------------------------------
// MockSession
// ---------------------------------------------------------------------------

/// Session handler accepting exactly one username and password.
#[derive(Debug)]
pub struct MockSession {
    username: String,
    password: String,
    authentications: AtomicUsize,
    bindings: AtomicUsize,
    logins: AtomicUsize,
}

impl MockSession {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            authentications: AtomicUsize::new(0),
            bindings: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn authentication_count(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandler for MockSession {
    async fn authenticate(
        &self,
        internal: &ConnectionInternal,
        login: &LoginContext,
    ) -> Result<SaslOutcome, ConnectionError> {
        self.authentications.fetch_add(1, Ordering::SeqCst);
        if login.username != self.username || login.password != self.password {
            return Ok(SaslOutcome::Failure {
                condition: "not-authorized".to_string(),
            });
        }
        internal.send_stream_open().await?;
        Ok(SaslOutcome::Success {
            mechanism: "PLAIN".to_string(),
        })
    }

    async fn bind_resource(
        &self,
        _internal: &ConnectionInternal,
        requested: Option<&Resource>,
    ) -> Result<Resource, ConnectionError> {
        let n = self.bindings.fetch_add(1, Ordering::SeqCst) + 1;
        match requested {
            Some(resource) => Ok(resource.clone()),
            None => Resource::new(format!("mock-{n}"))
                .map_err(|e| ConnectionError::Stream(e.to_string())),
        }
    }

    async fn after_successful_login(
        &self,
        _internal: &ConnectionInternal,
        _resumed: bool,
    ) -> Result<(), ConnectionError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
