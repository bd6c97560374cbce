//! Per-walk bookkeeping.

use std::sync::Arc;

use modular_xmpp_types::LoginContext;

use crate::descriptor::StateId;
use crate::error::FailedState;
use crate::graph::{StateGraph, VertexIndex};
use crate::state::StateTransitionResult;
use crate::states::AUTHENTICATED_AND_RESOURCE_BOUND;

/// Context of one walk through the state graph: its target, an optional
/// mandatory intermediate state, the login data, the path walked so far
/// and the states that could not be entered.
pub struct WalkStateGraphContext {
    graph: Arc<StateGraph>,
    initial_state: StateId,
    final_state: StateId,
    mandatory_intermediate_state: Option<StateId>,
    mandatory_intermediate_state_handled: bool,
    login: Option<LoginContext>,
    walked: Vec<VertexIndex>,
    failed_states: Vec<FailedState>,
}

impl WalkStateGraphContext {
    pub(crate) fn builder(
        graph: Arc<StateGraph>,
        initial_state: StateId,
        final_state: StateId,
    ) -> WalkStateGraphContextBuilder {
        WalkStateGraphContextBuilder {
            graph,
            initial_state,
            final_state,
            mandatory_intermediate_state: None,
            login: None,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<StateGraph> {
        &self.graph
    }

    #[must_use]
    pub fn initial_state(&self) -> StateId {
        self.initial_state
    }

    #[must_use]
    pub fn final_state(&self) -> StateId {
        self.final_state
    }

    #[must_use]
    pub fn mandatory_intermediate_state(&self) -> Option<StateId> {
        self.mandatory_intermediate_state
    }

    #[must_use]
    pub fn login(&self) -> Option<&LoginContext> {
        self.login.as_ref()
    }

    #[must_use]
    pub fn is_walks_final_state(&self, id: StateId) -> bool {
        self.final_state == id
    }

    #[must_use]
    pub fn is_final_state_authenticated_and_resource_bound(&self) -> bool {
        self.final_state == AUTHENTICATED_AND_RESOURCE_BOUND
    }

    /// Vertices walked so far, in order, starting with the initial state.
    #[must_use]
    pub fn walk(&self) -> &[VertexIndex] {
        &self.walked
    }

    #[must_use]
    pub fn walk_ids(&self) -> Vec<StateId> {
        self.walked.iter().map(|index| self.graph.id(*index)).collect()
    }

    #[must_use]
    pub fn walk_length(&self) -> usize {
        self.walked.len()
    }

    #[must_use]
    pub fn state_already_visited(&self, index: VertexIndex) -> bool {
        self.walked.contains(&index)
    }

    #[must_use]
    pub fn failed_states(&self) -> &[FailedState] {
        &self.failed_states
    }

    pub(crate) fn record_walk_to(&mut self, index: VertexIndex) {
        self.walked.push(index);
    }

    /// Record a state that could not be entered. A later result for the
    /// same state replaces the earlier one but keeps its position.
    pub(crate) fn record_failed_state(&mut self, state: StateId, result: StateTransitionResult) {
        if let Some(existing) = self.failed_states.iter_mut().find(|f| f.state == state) {
            existing.result = result;
        } else {
            self.failed_states.push(FailedState { state, result });
        }
    }

    /// If the mandatory intermediate state has not been handled yet and is
    /// one of `outgoing`, mark it handled and return it.
    pub(crate) fn maybe_take_mandatory_intermediate_state(
        &mut self,
        outgoing: &[VertexIndex],
    ) -> Option<VertexIndex> {
        if self.mandatory_intermediate_state_handled {
            return None;
        }
        let mandatory = self.mandatory_intermediate_state?;
        let index = outgoing
            .iter()
            .copied()
            .find(|index| self.graph.id(*index) == mandatory)?;
        self.mandatory_intermediate_state_handled = true;
        Some(index)
    }

    /// Whether trying `successor` can only lead back into this walk instead
    /// of towards the final state.
    ///
    /// The final state must be reachable from `successor` without passing
    /// through the walk's initial state or through any already-walked state
    /// that may not be visited twice.
    #[must_use]
    pub fn would_cause_cycle(&self, successor: VertexIndex) -> bool {
        if self.graph.id(successor) == self.final_state {
            return false;
        }
        let start = self.walked.first().copied();
        let mut visited = vec![false; self.graph.len()];
        visited[successor.get()] = true;
        let mut stack = vec![successor];

        while let Some(vertex) = stack.pop() {
            for &next in self.graph.outgoing(vertex) {
                if self.graph.id(next) == self.final_state {
                    return false;
                }
                if Some(next) == start || visited[next.get()] {
                    continue;
                }
                if self.walked.contains(&next) && !self.graph.descriptor(next).is_multi_visit() {
                    continue;
                }
                visited[next.get()] = true;
                stack.push(next);
            }
        }
        true
    }
}

pub(crate) struct WalkStateGraphContextBuilder {
    graph: Arc<StateGraph>,
    initial_state: StateId,
    final_state: StateId,
    mandatory_intermediate_state: Option<StateId>,
    login: Option<LoginContext>,
}

impl WalkStateGraphContextBuilder {
    #[must_use]
    pub(crate) fn with_mandatory_intermediate_state(mut self, state: StateId) -> Self {
        self.mandatory_intermediate_state = Some(state);
        self
    }

    #[must_use]
    pub(crate) fn with_login(mut self, login: LoginContext) -> Self {
        self.login = Some(login);
        self
    }

    pub(crate) fn build(self) -> WalkStateGraphContext {
        WalkStateGraphContext {
            graph: self.graph,
            initial_state: self.initial_state,
            final_state: self.final_state,
            mandatory_intermediate_state: self.mandatory_intermediate_state,
            mandatory_intermediate_state_handled: false,
            login: self.login,
            walked: Vec::new(),
            failed_states: Vec::new(),
        }
    }
}
