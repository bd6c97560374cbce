//! Core states of every client-to-server connection.
//!
//! ```text
//! Disconnected -> LookupRemoteConnectionEndpoints -> (transport) -> ConnectedButUnauthenticated
//! ConnectedButUnauthenticated -> SaslAuthentication | InstantShutdown | Shutdown
//! SaslAuthentication -> AuthenticatedButUnbound -> ResourceBinding -> AuthenticatedAndResourceBound
//! AuthenticatedAndResourceBound -> InstantShutdown | Shutdown
//! Shutdown | InstantShutdown -> CloseConnection -> Disconnected
//! ```
//!
//! The lookup state declares no successor; transport modules splice their
//! establishing state in behind it.

mod authenticated;
mod connected;
mod disconnected;
mod lookup;
mod sasl;
mod shutdown;

use std::sync::Arc;

use crate::context::WalkStateGraphContext;
use crate::descriptor::{StateDescriptor, StateId};
use crate::error::{ConnectionError, StateMachineError};
use crate::state::State;

pub use authenticated::{AuthenticatedAndResourceBoundState, ResourceBindingState};
pub use connected::ConnectedButUnauthenticatedState;
pub use disconnected::DisconnectedState;
pub use lookup::LookupRemoteConnectionEndpointsState;
pub use sasl::SaslAuthenticationState;
pub use shutdown::{CloseConnectionState, InstantShutdownState, ShutdownState};

pub const DISCONNECTED: StateId = StateId::new("Disconnected");
pub const LOOKUP_REMOTE_CONNECTION_ENDPOINTS: StateId =
    StateId::new("LookupRemoteConnectionEndpoints");
pub const CONNECTED_BUT_UNAUTHENTICATED: StateId = StateId::new("ConnectedButUnauthenticated");
pub const SASL_AUTHENTICATION: StateId = StateId::new("SaslAuthentication");
pub const AUTHENTICATED_BUT_UNBOUND: StateId = StateId::new("AuthenticatedButUnbound");
pub const RESOURCE_BINDING: StateId = StateId::new("ResourceBinding");
pub const AUTHENTICATED_AND_RESOURCE_BOUND: StateId =
    StateId::new("AuthenticatedAndResourceBound");
pub const SHUTDOWN: StateId = StateId::new("Shutdown");
pub const INSTANT_SHUTDOWN: StateId = StateId::new("InstantShutdown");
pub const CLOSE_CONNECTION: StateId = StateId::new("CloseConnection");

/// Descriptors of the core states.
#[must_use]
pub fn core_descriptors() -> Vec<StateDescriptor> {
    vec![
        StateDescriptor::builder(DISCONNECTED)
            .successor(LOOKUP_REMOTE_CONNECTION_ENDPOINTS)
            .final_state()
            .factory(|binding| Ok(Arc::new(DisconnectedState::new(binding))))
            .build(),
        StateDescriptor::builder(LOOKUP_REMOTE_CONNECTION_ENDPOINTS)
            .factory(|binding| Ok(Arc::new(LookupRemoteConnectionEndpointsState::new(binding))))
            .build(),
        StateDescriptor::builder(CONNECTED_BUT_UNAUTHENTICATED)
            .successor(SASL_AUTHENTICATION)
            .successor(INSTANT_SHUTDOWN)
            .successor(SHUTDOWN)
            .final_state()
            .factory(|binding| Ok(Arc::new(ConnectedButUnauthenticatedState::new(binding))))
            .build(),
        StateDescriptor::builder(SASL_AUTHENTICATION)
            .successor(AUTHENTICATED_BUT_UNBOUND)
            .reference("RFC 6120 § 6")
            .factory(|binding| Ok(Arc::new(SaslAuthenticationState::new(binding))))
            .build(),
        StateDescriptor::builder(AUTHENTICATED_BUT_UNBOUND)
            .successor(RESOURCE_BINDING)
            .multi_visit()
            .build(),
        StateDescriptor::builder(RESOURCE_BINDING)
            .successor(AUTHENTICATED_AND_RESOURCE_BOUND)
            .reference("RFC 6120 § 7")
            .factory(|binding| Ok(Arc::new(ResourceBindingState::new(binding))))
            .build(),
        StateDescriptor::builder(AUTHENTICATED_AND_RESOURCE_BOUND)
            .successor(INSTANT_SHUTDOWN)
            .successor(SHUTDOWN)
            .final_state()
            .factory(|binding| Ok(Arc::new(AuthenticatedAndResourceBoundState::new(binding))))
            .build(),
        StateDescriptor::builder(SHUTDOWN)
            .successor(CLOSE_CONNECTION)
            .factory(|binding| Ok(Arc::new(ShutdownState::new(binding))))
            .build(),
        StateDescriptor::builder(INSTANT_SHUTDOWN)
            .successor(CLOSE_CONNECTION)
            .factory(|binding| Ok(Arc::new(InstantShutdownState::new(binding))))
            .build(),
        StateDescriptor::builder(CLOSE_CONNECTION)
            .successor(DISCONNECTED)
            .factory(|binding| Ok(Arc::new(CloseConnectionState::new(binding))))
            .build(),
    ]
}

/// Precondition of the shutdown states: they must never be entered by a
/// walk heading for the authenticated state.
fn ensure_not_on_way_to_authenticated(
    ctx: &WalkStateGraphContext,
    state: &dyn State,
) -> Result<(), ConnectionError> {
    if ctx.is_final_state_authenticated_and_resource_bound() {
        return Err(StateMachineError::OnWayToAuthenticated { state: state.id() }.into());
    }
    Ok(())
}
