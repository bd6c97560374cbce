//! Top-level stream elements.
//!
//! Everything the connection puts on (or takes off) the wire between the
//! opening and closing stream tags is one of these.

use serde::{Deserialize, Serialize};

/// Default namespace of client-to-server streams.
pub const CLIENT_NAMESPACE: &str = "jabber:client";

/// Namespace of the stream wrapper element.
pub const STREAM_NAMESPACE: &str = "http://etherx.jabber.org/streams";

/// Qualified element name, used to match nonza responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementName {
    pub name: String,
    pub namespace: String,
}

impl ElementName {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for ElementName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// A top-level element of an XMPP stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopLevelElement {
    /// Opening stream tag.
    StreamOpen(StreamOpen),
    /// Closing stream tag.
    StreamClose,
    /// Stream features advertised by the server.
    Features(crate::features::StreamFeatures),
    /// Stream-level error condition. Fatal for the connection.
    StreamError(String),
    Stanza(Stanza),
    Nonza(Nonza),
}

impl TopLevelElement {
    /// Short element name, for logging.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::StreamOpen(_) => "stream-open",
            Self::StreamClose => "stream-close",
            Self::Features(_) => "features",
            Self::StreamError(_) => "stream-error",
            Self::Stanza(stanza) => stanza.kind.as_str(),
            Self::Nonza(nonza) => &nonza.name.name,
        }
    }

    #[must_use]
    pub fn is_stream_close(&self) -> bool {
        matches!(self, Self::StreamClose)
    }
}

/// The opening stream tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpen {
    pub to: String,
    pub from: Option<String>,
    pub id: Option<String>,
    pub lang: Option<String>,
    pub namespace: String,
}

impl StreamOpen {
    /// Create a client stream open towards `to`.
    #[must_use]
    pub fn client(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: None,
            id: None,
            lang: None,
            namespace: CLIENT_NAMESPACE.to_owned(),
        }
    }
}

/// Stanza kinds defined for client streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stanza. The payload is kept as serialized XML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    pub kind: StanzaKind,
    pub id: Option<String>,
    pub to: Option<String>,
    pub payload: String,
}

impl Stanza {
    #[must_use]
    pub fn new(kind: StanzaKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            id: None,
            to: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }
}

/// A top-level element that is not a stanza, e.g. SASL or compression
/// negotiation elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonza {
    pub name: ElementName,
    pub payload: String,
}

impl Nonza {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: ElementName::new(name, namespace),
            payload: String::new(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Whether this nonza has the given qualified name.
    #[must_use]
    pub fn is(&self, name: &ElementName) -> bool {
        self.name == *name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_stream_open_uses_client_namespace() {
        let open = StreamOpen::client("example.org");
        assert_eq!(open.to, "example.org");
        assert_eq!(open.namespace, CLIENT_NAMESPACE);
        assert!(open.id.is_none());
    }

    #[test]
    fn element_kind_names() {
        let stanza = TopLevelElement::Stanza(Stanza::new(StanzaKind::Iq, "<ping/>"));
        assert_eq!(stanza.kind(), "iq");

        let nonza = TopLevelElement::Nonza(Nonza::new("compress", "http://jabber.org/protocol/compress"));
        assert_eq!(nonza.kind(), "compress");

        assert!(TopLevelElement::StreamClose.is_stream_close());
        assert!(!stanza.is_stream_close());
    }

    #[test]
    fn nonza_matches_qualified_name() {
        let nonza = Nonza::new("compressed", "http://jabber.org/protocol/compress");
        assert!(nonza.is(&ElementName::new(
            "compressed",
            "http://jabber.org/protocol/compress"
        )));
        assert!(!nonza.is(&ElementName::new("compressed", "urn:other")));
        assert!(!nonza.is(&ElementName::new(
            "failure",
            "http://jabber.org/protocol/compress"
        )));
    }

    #[test]
    fn element_name_display() {
        let name = ElementName::new("bind", "urn:ietf:params:xml:ns:xmpp-bind");
        assert_eq!(name.to_string(), "urn:ietf:params:xml:ns:xmpp-bind:bind");
    }
}
