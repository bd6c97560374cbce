//! Shared types for modular-xmpp.
//!
//! This crate contains the types shared across the modular-xmpp workspace:
//! top-level stream elements, advertised stream features, and the login
//! data handed to the connection state machine.

pub mod element;
pub mod features;
pub mod login;

pub use element::{
    ElementName, Nonza, Stanza, StanzaKind, StreamOpen, TopLevelElement, CLIENT_NAMESPACE,
    STREAM_NAMESPACE,
};
pub use features::{StreamFeature, StreamFeatures};
pub use login::{LoginContext, Resource, ResourceError, MAX_RESOURCE_LENGTH};
