//! State descriptors: the static description of a state and its edges.
//!
//! A descriptor names its forward edges (successors), may splice itself in
//! behind other states through backward edges (predecessors), and can rank
//! itself against sibling successors with precedence hints. Descriptors
//! carry a factory that creates the runtime [`State`] once the graph is
//! bound to a connection; descriptors without a factory become no-op
//! states.

use std::any::Any;
use std::sync::Arc;

use crate::error::ConfigurationError;
use crate::graph::VertexIndex;
use crate::internal::ConnectionInternal;
use crate::state::State;

/// Identity of a state within the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(&'static str);

impl StateId {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Creates the runtime state for a descriptor.
pub type StateFactory =
    Arc<dyn Fn(&StateBinding<'_>) -> Result<Arc<dyn State>, ConfigurationError> + Send + Sync>;

/// Static description of a state.
pub struct StateDescriptor {
    id: StateId,
    successors: Vec<StateId>,
    predecessors: Vec<StateId>,
    precedence_over: Vec<StateId>,
    inferior_to: Vec<StateId>,
    references: Vec<String>,
    is_final: bool,
    multi_visit: bool,
    not_implemented: bool,
    factory: Option<StateFactory>,
}

impl StateDescriptor {
    #[must_use]
    pub fn builder(id: StateId) -> StateDescriptorBuilder {
        StateDescriptorBuilder {
            descriptor: Self {
                id,
                successors: Vec::new(),
                predecessors: Vec::new(),
                precedence_over: Vec::new(),
                inferior_to: Vec::new(),
                references: Vec::new(),
                is_final: false,
                multi_visit: false,
                not_implemented: false,
                factory: None,
            },
        }
    }

    #[must_use]
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Declared forward edges, in declaration order.
    #[must_use]
    pub fn successors(&self) -> &[StateId] {
        &self.successors
    }

    /// Backward edges: states that get an inferred forward edge to this one.
    #[must_use]
    pub fn predecessors(&self) -> &[StateId] {
        &self.predecessors
    }

    /// Sibling successors this state should be tried before.
    #[must_use]
    pub fn precedence_over(&self) -> &[StateId] {
        &self.precedence_over
    }

    /// Sibling successors that should be tried before this state.
    #[must_use]
    pub fn inferior_to(&self) -> &[StateId] {
        &self.inferior_to
    }

    /// Protocol references (RFC or XEP sections) implemented by this state.
    #[must_use]
    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// A walk may legitimately stop in a final state.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// The state may be entered more than once per walk.
    #[must_use]
    pub fn is_multi_visit(&self) -> bool {
        self.multi_visit
    }

    /// Entering the state always yields an impossible transition.
    #[must_use]
    pub fn is_not_implemented(&self) -> bool {
        self.not_implemented
    }

    pub(crate) fn factory(&self) -> Option<&StateFactory> {
        self.factory.as_ref()
    }

    /// State name followed by its protocol references, for diagnostics and
    /// graph renderings.
    #[must_use]
    pub fn full_state_name(&self, break_line: bool) -> String {
        if self.references.is_empty() {
            return self.id.to_string();
        }
        let separator = if break_line { "\\n" } else { " " };
        format!("{}{separator}({})", self.id, self.references.join(", "))
    }
}

impl std::fmt::Debug for StateDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("id", &self.id)
            .field("successors", &self.successors)
            .field("predecessors", &self.predecessors)
            .field("precedence_over", &self.precedence_over)
            .field("inferior_to", &self.inferior_to)
            .field("is_final", &self.is_final)
            .field("multi_visit", &self.multi_visit)
            .field("not_implemented", &self.not_implemented)
            .field("has_factory", &self.factory.is_some())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for StateDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_state_name(false))
    }
}

pub struct StateDescriptorBuilder {
    descriptor: StateDescriptor,
}

impl StateDescriptorBuilder {
    #[must_use]
    pub fn successor(mut self, id: StateId) -> Self {
        self.descriptor.successors.push(id);
        self
    }

    #[must_use]
    pub fn predecessor(mut self, id: StateId) -> Self {
        self.descriptor.predecessors.push(id);
        self
    }

    #[must_use]
    pub fn precedence_over(mut self, id: StateId) -> Self {
        self.descriptor.precedence_over.push(id);
        self
    }

    #[must_use]
    pub fn inferior_to(mut self, id: StateId) -> Self {
        self.descriptor.inferior_to.push(id);
        self
    }

    #[must_use]
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.descriptor.references.push(reference.into());
        self
    }

    #[must_use]
    pub fn final_state(mut self) -> Self {
        self.descriptor.is_final = true;
        self
    }

    #[must_use]
    pub fn multi_visit(mut self) -> Self {
        self.descriptor.multi_visit = true;
        self
    }

    #[must_use]
    pub fn not_implemented(mut self) -> Self {
        self.descriptor.not_implemented = true;
        self
    }

    #[must_use]
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&StateBinding<'_>) -> Result<Arc<dyn State>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.descriptor.factory = Some(Arc::new(factory));
        self
    }

    #[must_use]
    pub fn build(self) -> StateDescriptor {
        self.descriptor
    }
}

/// Everything a state factory gets to construct its runtime state.
pub struct StateBinding<'a> {
    descriptor: Arc<StateDescriptor>,
    internal: &'a Arc<ConnectionInternal>,
    index: VertexIndex,
}

impl<'a> StateBinding<'a> {
    pub(crate) fn new(
        descriptor: Arc<StateDescriptor>,
        internal: &'a Arc<ConnectionInternal>,
        index: VertexIndex,
    ) -> Self {
        Self {
            descriptor,
            internal,
            index,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> Arc<StateDescriptor> {
        Arc::clone(&self.descriptor)
    }

    #[must_use]
    pub fn internal(&self) -> Arc<ConnectionInternal> {
        Arc::clone(self.internal)
    }

    /// Vertex of the state being constructed.
    #[must_use]
    pub fn index(&self) -> VertexIndex {
        self.index
    }

    /// Look up the constructed instance of the module that contributed
    /// this state.
    pub fn module<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ConfigurationError> {
        self.internal.module::<T>().ok_or_else(|| {
            ConfigurationError::StateConstruction(
                self.descriptor.id(),
                format!("module {} not installed", std::any::type_name::<T>()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: StateId = StateId::new("A");
    const B: StateId = StateId::new("B");

    #[test]
    fn builder_collects_edges_and_flags() {
        let descriptor = StateDescriptor::builder(A)
            .successor(B)
            .predecessor(StateId::new("P"))
            .precedence_over(StateId::new("Q"))
            .reference("RFC 6120 § 6")
            .final_state()
            .multi_visit()
            .build();

        assert_eq!(descriptor.id(), A);
        assert_eq!(descriptor.successors(), &[B]);
        assert_eq!(descriptor.predecessors(), &[StateId::new("P")]);
        assert_eq!(descriptor.precedence_over(), &[StateId::new("Q")]);
        assert!(descriptor.inferior_to().is_empty());
        assert!(descriptor.is_final());
        assert!(descriptor.is_multi_visit());
        assert!(!descriptor.is_not_implemented());
        assert!(descriptor.factory().is_none());
    }

    #[test]
    fn full_state_name_includes_references() {
        let plain = StateDescriptor::builder(A).build();
        assert_eq!(plain.full_state_name(false), "A");

        let referenced = StateDescriptor::builder(A)
            .reference("RFC 6120 § 6")
            .reference("RFC 4422")
            .build();
        assert_eq!(referenced.full_state_name(false), "A (RFC 6120 § 6, RFC 4422)");
        assert_eq!(referenced.full_state_name(true), "A\\n(RFC 6120 § 6, RFC 4422)");
    }
}
