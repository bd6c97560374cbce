//! State machine events and listener dispatch.
//!
//! Events, listener registrations and removals go through one unbounded
//! channel to a dispatcher task per connection, so listeners observe
//! events strictly in submission order and never run on the walking task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::descriptor::StateId;
use crate::state::{TransitionFailure, TransitionImpossible, TransitionSuccess};
use crate::transport::LookupFailure;

#[derive(Debug, Clone)]
pub enum ConnectionStateEvent {
    AboutToTransitionInto {
        from: StateId,
        to: StateId,
    },
    SuccessfullyTransitionedInto {
        state: StateId,
        result: TransitionSuccess,
    },
    TransitionFailed {
        from: StateId,
        to: StateId,
        failure: TransitionFailure,
    },
    TransitionNotPossible {
        from: StateId,
        to: StateId,
        reason: TransitionImpossible,
    },
    TransitionIgnoredDueCycle {
        from: StateId,
        to: StateId,
    },
    StateRevertBackwardsWalk {
        state: StateId,
    },
    FinalStateReached {
        state: StateId,
    },
    /// A non-fatal endpoint lookup failure: some other lookup produced
    /// usable endpoints.
    EndpointLookupFailed {
        failure: LookupFailure,
    },
}

impl std::fmt::Display for ConnectionStateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AboutToTransitionInto { from, to } => {
                write!(f, "about to transition from {from} into {to}")
            }
            Self::SuccessfullyTransitionedInto { state, result } => {
                write!(f, "successfully transitioned into {state}: {result}")
            }
            Self::TransitionFailed { from, to, failure } => {
                write!(f, "transition from {from} into {to} failed: {failure}")
            }
            Self::TransitionNotPossible { from, to, reason } => {
                write!(f, "transition from {from} into {to} not possible: {reason}")
            }
            Self::TransitionIgnoredDueCycle { from, to } => {
                write!(f, "transition from {from} into {to} ignored due to cycle")
            }
            Self::StateRevertBackwardsWalk { state } => write!(f, "reverting {state}"),
            Self::FinalStateReached { state } => write!(f, "final state {state} reached"),
            Self::EndpointLookupFailed { failure } => {
                write!(f, "endpoint lookup failed: {failure}")
            }
        }
    }
}

pub trait ConnectionStateMachineListener: Send + Sync + 'static {
    fn on_connection_state_event(&self, event: &ConnectionStateEvent);
}

impl<F> ConnectionStateMachineListener for F
where
    F: Fn(&ConnectionStateEvent) + Send + Sync + 'static,
{
    fn on_connection_state_event(&self, event: &ConnectionStateEvent) {
        self(event);
    }
}

/// Listener forwarding every event into a channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ConnectionStateEvent>,
}

impl ChannelListener {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionStateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConnectionStateMachineListener for ChannelListener {
    fn on_connection_state_event(&self, event: &ConnectionStateEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum DispatchCommand {
    Add(ListenerId, Arc<dyn ConnectionStateMachineListener>),
    Remove(ListenerId),
    Event(ConnectionStateEvent),
}

pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchCommand>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Spawn the dispatcher task. Must be called within a tokio runtime.
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(rx));
        Self {
            tx,
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn ConnectionStateMachineListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(DispatchCommand::Add(id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        let _ = self.tx.send(DispatchCommand::Remove(id));
    }

    pub(crate) fn emit(&self, event: ConnectionStateEvent) {
        debug!(%event, "state machine event");
        if self.tx.send(DispatchCommand::Event(event)).is_err() {
            trace!("listener dispatcher gone, dropping event");
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<DispatchCommand>) {
    let mut listeners: Vec<(ListenerId, Arc<dyn ConnectionStateMachineListener>)> = Vec::new();
    while let Some(command) = rx.recv().await {
        match command {
            DispatchCommand::Add(id, listener) => listeners.push((id, listener)),
            DispatchCommand::Remove(id) => listeners.retain(|(existing, _)| *existing != id),
            DispatchCommand::Event(event) => {
                for (_, listener) in &listeners {
                    listener.on_connection_state_event(&event);
                }
            }
        }
    }
    trace!("listener dispatcher finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ConnectionStateEvent>) -> ConnectionStateEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn events_delivered_in_order() {
        let dispatcher = EventDispatcher::spawn();
        let (listener, mut rx) = ChannelListener::new();
        dispatcher.add(Arc::new(listener));

        for name in ["A", "B", "C"] {
            dispatcher.emit(ConnectionStateEvent::FinalStateReached {
                state: StateId::new(name),
            });
        }
        for name in ["A", "B", "C"] {
            match recv(&mut rx).await {
                ConnectionStateEvent::FinalStateReached { state } => {
                    assert_eq!(state, StateId::new(name));
                }
                other => panic!("unexpected event {other}"),
            }
        }
    }

    #[tokio::test]
    async fn removed_listener_gets_nothing_after_removal() {
        let dispatcher = EventDispatcher::spawn();
        let (first, mut first_rx) = ChannelListener::new();
        let (second, mut second_rx) = ChannelListener::new();
        let first_id = dispatcher.add(Arc::new(first));
        dispatcher.add(Arc::new(second));

        dispatcher.emit(ConnectionStateEvent::StateRevertBackwardsWalk {
            state: StateId::new("A"),
        });
        dispatcher.remove(first_id);
        dispatcher.emit(ConnectionStateEvent::StateRevertBackwardsWalk {
            state: StateId::new("B"),
        });

        recv(&mut first_rx).await;
        recv(&mut second_rx).await;
        recv(&mut second_rx).await;
        // The dispatcher dropped the removed listener, closing its channel.
        let next = tokio::time::timeout(Duration::from_secs(1), first_rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn event_display() {
        let event = ConnectionStateEvent::TransitionIgnoredDueCycle {
            from: StateId::new("ConnectedButUnauthenticated"),
            to: StateId::new("Shutdown"),
        };
        assert_eq!(
            event.to_string(),
            "transition from ConnectedButUnauthenticated into Shutdown ignored due to cycle"
        );
    }
}
