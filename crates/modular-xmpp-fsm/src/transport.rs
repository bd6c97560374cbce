//! Transport abstraction: endpoint discovery, outgoing element delivery and
//! stream open/close element creation.

use std::sync::Arc;

use modular_xmpp_types::{StreamOpen, TopLevelElement};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::stats::StatsReport;

/// A network endpoint a transport can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSuccess {
    pub endpoints: Vec<RemoteEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub transport: String,
    pub description: String,
}

impl LookupFailure {
    #[must_use]
    pub fn new(transport: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.transport, self.description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Success(LookupSuccess),
    Failed(LookupFailure),
}

/// An endpoint lookup in flight.
pub type PendingLookup = oneshot::Receiver<LookupResult>;

/// Creates the stream open and close elements for a transport.
pub trait StreamOpenAndCloseFactory: Send + Sync + 'static {
    fn create_stream_open(
        &self,
        to: &str,
        from: Option<&str>,
        id: Option<&str>,
        lang: Option<&str>,
    ) -> TopLevelElement;

    fn create_stream_close(&self) -> TopLevelElement;
}

/// Plain `jabber:client` stream elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStreamFactory;

impl StreamOpenAndCloseFactory for DefaultStreamFactory {
    fn create_stream_open(
        &self,
        to: &str,
        from: Option<&str>,
        id: Option<&str>,
        lang: Option<&str>,
    ) -> TopLevelElement {
        let mut open = StreamOpen::client(to);
        open.from = from.map(str::to_owned);
        open.id = id.map(str::to_owned);
        open.lang = lang.map(str::to_owned);
        TopLevelElement::StreamOpen(open)
    }

    fn create_stream_close(&self) -> TopLevelElement {
        TopLevelElement::StreamClose
    }
}

/// A transport contributed by a module.
///
/// Transports discover endpoints during the lookup state and are told when
/// the outgoing queue has new elements. Connecting itself happens in the
/// transport's own establishing state.
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Start endpoint lookups. Each lookup resolves through its channel.
    fn lookup_endpoints(&self) -> Vec<PendingLookup>;

    /// Remember the endpoints of a successful lookup.
    fn load_endpoints(&self, success: LookupSuccess);

    fn reset_discovered_endpoints(&self);

    /// Elements were put on the outgoing queue.
    fn notify_about_new_outgoing_elements(&self);

    fn disconnect(&self);

    /// Called during shutdown once every filter has been asked to close.
    fn after_filters_closed(&self) {}

    fn is_transport_secured(&self) -> bool;

    fn stats(&self) -> StatsReport {
        StatsReport::new()
    }

    fn stream_factory(&self) -> Arc<dyn StreamOpenAndCloseFactory> {
        Arc::new(DefaultStreamFactory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modular_xmpp_types::CLIENT_NAMESPACE;

    #[test]
    fn default_factory_builds_client_stream_open() {
        let open = DefaultStreamFactory.create_stream_open(
            "example.org",
            Some("juliet@example.org"),
            None,
            Some("en"),
        );
        let TopLevelElement::StreamOpen(open) = open else {
            panic!("expected stream open");
        };
        assert_eq!(open.to, "example.org");
        assert_eq!(open.from.as_deref(), Some("juliet@example.org"));
        assert_eq!(open.lang.as_deref(), Some("en"));
        assert_eq!(open.namespace, CLIENT_NAMESPACE);
        assert!(DefaultStreamFactory.create_stream_close().is_stream_close());
    }

    #[test]
    fn endpoint_and_failure_display() {
        assert_eq!(RemoteEndpoint::new("xmpp.example.org", 5222).to_string(), "xmpp.example.org:5222");
        assert_eq!(
            LookupFailure::new("tcp", "NXDOMAIN").to_string(),
            "tcp: NXDOMAIN"
        );
    }
}
