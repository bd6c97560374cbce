//! Modular XMPP client-to-server connection.
//!
//! The connection lifecycle is a directed graph of states. Each state is
//! described by a [`StateDescriptor`]; the core states (lookup,
//! authentication, resource binding, shutdown) are always present, and
//! modules contribute further states (transports, stream compression)
//! that splice themselves into the graph through backward edges and
//! precedence hints. Connecting, logging in and disconnecting are walks
//! through the bound [`StateGraph`] towards a target state.

pub mod config;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod filter;
pub mod graph;
pub mod internal;
pub mod module;
pub mod queue;
pub mod session;
pub mod state;
pub mod states;
pub mod stats;
pub mod tls;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{ConnectionConfig, ConnectionConfiguration, SecurityMode};
pub use connection::ModularConnection;
pub use context::WalkStateGraphContext;
pub use descriptor::{StateBinding, StateDescriptor, StateId};
pub use error::{ConfigurationError, ConnectionError, FilterError, QueueError, StateMachineError};
pub use event::{ConnectionStateEvent, ConnectionStateMachineListener, ListenerId};
pub use filter::{FilterChain, InputOutputFilter};
pub use graph::{StateDescriptorGraph, StateGraph, VertexIndex};
pub use internal::ConnectionInternal;
pub use module::{ConnectionModule, ModuleDescriptor};
pub use queue::OutgoingQueue;
pub use session::{SaslOutcome, SessionHandler};
pub use state::{
    State, StateTransitionResult, TransitionFailure, TransitionImpossible, TransitionSuccess,
};
pub use stats::{ConnectionStats, StatsFormat, StatsReport};
pub use transport::{LookupResult, RemoteEndpoint, StreamOpenAndCloseFactory, Transport};
