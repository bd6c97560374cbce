//! Session establishment hooks.
//!
//! SASL mechanisms and resource binding payloads live outside the state
//! machine. The authentication and binding states call into a
//! [`SessionHandler`] supplied when the connection is created.

use async_trait::async_trait;
use modular_xmpp_types::{LoginContext, Resource};

use crate::error::ConnectionError;
use crate::internal::ConnectionInternal;

/// Result of a SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    Success { mechanism: String },
    Failure { condition: String },
}

#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Run the SASL exchange. On success the handler restarts the stream
    /// (see [`ConnectionInternal::send_stream_open`]); the authentication
    /// state then waits for the new stream features.
    async fn authenticate(
        &self,
        internal: &ConnectionInternal,
        login: &LoginContext,
    ) -> Result<SaslOutcome, ConnectionError>;

    /// Bind a resource, returning the one the server assigned.
    async fn bind_resource(
        &self,
        internal: &ConnectionInternal,
        requested: Option<&Resource>,
    ) -> Result<Resource, ConnectionError>;

    async fn after_successful_login(
        &self,
        _internal: &ConnectionInternal,
        _resumed: bool,
    ) -> Result<(), ConnectionError> {
        Ok(())
    }
}
