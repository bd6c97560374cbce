//! State descriptor graph construction and binding.
//!
//! [`StateDescriptorGraph`] is built once per configuration from the core
//! descriptors plus every module's descriptors. Binding it to a connection
//! produces a [`StateGraph`] with the same vertex indices and edges, where
//! each vertex holds the runtime state.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::trace;

use crate::descriptor::{StateBinding, StateDescriptor, StateId};
use crate::error::ConfigurationError;
use crate::internal::ConnectionInternal;
use crate::state::{NoOpState, State};
use crate::states::DISCONNECTED;

/// Index of a vertex. Identical between a descriptor graph and every state
/// graph bound from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexIndex(usize);

impl VertexIndex {
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct GraphVertex<T> {
    element: T,
    outgoing: Vec<VertexIndex>,
}

/// Arena-backed directed graph. Vertex 0 is the root.
#[derive(Debug, Clone)]
struct Graph<T> {
    vertices: Vec<GraphVertex<T>>,
}

impl<T> Graph<T> {
    fn element(&self, index: VertexIndex) -> &T {
        &self.vertices[index.0].element
    }

    fn outgoing(&self, index: VertexIndex) -> &[VertexIndex] {
        &self.vertices[index.0].outgoing
    }

    fn indices(&self) -> impl Iterator<Item = VertexIndex> {
        (0..self.vertices.len()).map(VertexIndex)
    }

    fn try_map<U, E>(
        &self,
        mut f: impl FnMut(VertexIndex, &T) -> Result<U, E>,
    ) -> Result<Graph<U>, E> {
        let mut vertices = Vec::with_capacity(self.vertices.len());
        for (i, vertex) in self.vertices.iter().enumerate() {
            vertices.push(GraphVertex {
                element: f(VertexIndex(i), &vertex.element)?,
                outgoing: vertex.outgoing.clone(),
            });
        }
        Ok(Graph { vertices })
    }
}

/// Graph of state descriptors reachable from the disconnected state.
#[derive(Debug)]
pub struct StateDescriptorGraph {
    graph: Graph<Arc<StateDescriptor>>,
    index: HashMap<StateId, VertexIndex>,
}

impl StateDescriptorGraph {
    /// Build the graph from a descriptor registry.
    ///
    /// Forward edges are the declared successors followed by the edges
    /// inferred from other descriptors' predecessors. Each vertex's
    /// successors are ordered by their precedence hints. Descriptors not
    /// reachable from the root are dropped.
    pub fn build(
        descriptors: impl IntoIterator<Item = StateDescriptor>,
    ) -> Result<Self, ConfigurationError> {
        let mut registry: Vec<Arc<StateDescriptor>> = Vec::new();
        let mut by_id: HashMap<StateId, usize> = HashMap::new();
        for descriptor in descriptors {
            if by_id.insert(descriptor.id(), registry.len()).is_some() {
                return Err(ConfigurationError::DuplicateState(descriptor.id()));
            }
            registry.push(Arc::new(descriptor));
        }

        let mut inferred: HashMap<StateId, Vec<StateId>> = HashMap::new();
        for descriptor in &registry {
            for predecessor in descriptor.predecessors() {
                if !by_id.contains_key(predecessor) {
                    return Err(ConfigurationError::UnknownState {
                        from: descriptor.id(),
                        to: *predecessor,
                    });
                }
                inferred
                    .entry(*predecessor)
                    .or_default()
                    .push(descriptor.id());
            }
        }

        let root = *by_id
            .get(&DISCONNECTED)
            .ok_or(ConfigurationError::MissingRoot(DISCONNECTED))?;

        // Registry positions in vertex order; vertices are numbered in
        // breadth-first discovery order.
        let mut order = vec![root];
        let mut index = HashMap::from([(DISCONNECTED, VertexIndex(0))]);
        let mut vertices = Vec::new();

        let mut next = 0;
        while next < order.len() {
            let descriptor = Arc::clone(&registry[order[next]]);
            next += 1;

            let mut successor_ids: Vec<StateId> = Vec::new();
            let inferred_ids = inferred.get(&descriptor.id()).into_iter().flatten();
            for id in descriptor.successors().iter().chain(inferred_ids) {
                push_unique(&mut successor_ids, *id);
            }
            if successor_ids.is_empty() {
                return Err(ConfigurationError::NoSuccessor(descriptor.id()));
            }

            let mut successors = Vec::with_capacity(successor_ids.len());
            for id in &successor_ids {
                let position = by_id.get(id).ok_or(ConfigurationError::UnknownState {
                    from: descriptor.id(),
                    to: *id,
                })?;
                successors.push(Arc::clone(&registry[*position]));
            }

            let mut outgoing = Vec::with_capacity(successors.len());
            for id in sort_by_precedence(&successors, &by_id)? {
                let vertex = *index.entry(id).or_insert_with(|| {
                    order.push(by_id[&id]);
                    VertexIndex(order.len() - 1)
                });
                outgoing.push(vertex);
            }

            vertices.push(GraphVertex {
                element: descriptor,
                outgoing,
            });
        }

        trace!(states = vertices.len(), "built state descriptor graph");
        Ok(Self {
            graph: Graph { vertices },
            index,
        })
    }

    #[must_use]
    pub fn root(&self) -> VertexIndex {
        VertexIndex(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.vertices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.vertices.is_empty()
    }

    #[must_use]
    pub fn descriptor(&self, index: VertexIndex) -> &Arc<StateDescriptor> {
        self.graph.element(index)
    }

    #[must_use]
    pub fn outgoing(&self, index: VertexIndex) -> &[VertexIndex] {
        self.graph.outgoing(index)
    }

    #[must_use]
    pub fn index_of(&self, id: StateId) -> Option<VertexIndex> {
        self.index.get(&id).copied()
    }

    /// Successor ids of a state, in walk order.
    #[must_use]
    pub fn successors_of(&self, id: StateId) -> Option<Vec<StateId>> {
        let index = self.index_of(id)?;
        Some(
            self.outgoing(index)
                .iter()
                .map(|successor| self.descriptor(*successor).id())
                .collect(),
        )
    }

    /// Render the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self, break_state_name: bool) -> String {
        let name = |index: VertexIndex| self.descriptor(index).full_state_name(break_state_name);

        let mut dot = String::from("digraph {\n");
        let mut visited = HashSet::new();
        let mut stack = vec![self.root()];
        visited.insert(self.root());
        let mut vertex_order = Vec::new();
        while let Some(vertex) = stack.pop() {
            vertex_order.push(vertex);
            let outgoing = self.outgoing(vertex);
            for (i, successor) in outgoing.iter().enumerate() {
                let _ = write!(dot, "\t\"{}\" -> \"{}\"", name(vertex), name(*successor));
                if outgoing.len() > 1 {
                    let _ = write!(dot, " [xlabel=\"{}\"]", i + 1);
                }
                dot.push_str(";\n");
            }
            for successor in outgoing.iter().rev() {
                if visited.insert(*successor) {
                    stack.push(*successor);
                }
            }
        }

        for vertex in vertex_order {
            let descriptor = self.descriptor(vertex);
            let mut styles = Vec::new();
            if descriptor.is_multi_visit() {
                styles.push("bold");
            }
            if descriptor.is_final() {
                styles.push("filled");
            }
            if descriptor.is_not_implemented() {
                styles.push("dashed");
            }
            if !styles.is_empty() {
                let _ = writeln!(
                    dot,
                    "\t\"{}\" [ style=\"{}\" ];",
                    name(vertex),
                    styles.join(",")
                );
            }
        }
        dot.push('}');
        dot
    }
}

/// Graph of runtime states bound to one connection.
pub struct StateGraph {
    graph: Graph<Arc<dyn State>>,
}

impl StateGraph {
    /// Create the runtime state for every vertex of `descriptors`.
    pub fn bind(
        descriptors: &StateDescriptorGraph,
        internal: &Arc<ConnectionInternal>,
    ) -> Result<Self, ConfigurationError> {
        let graph = descriptors.graph.try_map(|index, descriptor| {
            let state: Arc<dyn State> = match descriptor.factory() {
                Some(factory) => {
                    factory(&StateBinding::new(Arc::clone(descriptor), internal, index))?
                }
                None => Arc::new(NoOpState::new(Arc::clone(descriptor))),
            };
            Ok::<_, ConfigurationError>(state)
        })?;
        Ok(Self { graph })
    }

    #[must_use]
    pub fn root(&self) -> VertexIndex {
        VertexIndex(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.vertices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.vertices.is_empty()
    }

    #[must_use]
    pub fn state(&self, index: VertexIndex) -> &Arc<dyn State> {
        self.graph.element(index)
    }

    #[must_use]
    pub fn descriptor(&self, index: VertexIndex) -> &Arc<StateDescriptor> {
        self.graph.element(index).descriptor()
    }

    #[must_use]
    pub fn id(&self, index: VertexIndex) -> StateId {
        self.descriptor(index).id()
    }

    #[must_use]
    pub fn outgoing(&self, index: VertexIndex) -> &[VertexIndex] {
        self.graph.outgoing(index)
    }

    #[must_use]
    pub fn index_of(&self, id: StateId) -> Option<VertexIndex> {
        self.graph.indices().find(|index| self.id(*index) == id)
    }
}

impl std::fmt::Debug for StateGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.graph.indices().map(|index| self.id(index)))
            .finish()
    }
}

fn push_unique(ids: &mut Vec<StateId>, id: StateId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Order sibling successors: the precedence relation among them is sorted
/// topologically, successors without precedence information follow in
/// their original order.
fn sort_by_precedence(
    successors: &[Arc<StateDescriptor>],
    registered: &HashMap<StateId, usize>,
) -> Result<Vec<StateId>, ConfigurationError> {
    let siblings: Vec<StateId> = successors.iter().map(|d| d.id()).collect();
    let mut nodes: Vec<StateId> = Vec::new();
    let mut edges: HashMap<StateId, Vec<StateId>> = HashMap::new();

    for descriptor in successors {
        let id = descriptor.id();
        let ranked = descriptor
            .precedence_over()
            .iter()
            .map(|lower| (id, *lower, *lower))
            .chain(
                descriptor
                    .inferior_to()
                    .iter()
                    .map(|higher| (*higher, id, *higher)),
            );
        for (higher, lower, named) in ranked {
            if !registered.contains_key(&named) {
                return Err(ConfigurationError::UnknownState { from: id, to: named });
            }
            if !siblings.contains(&named) {
                continue;
            }
            push_unique(&mut nodes, higher);
            push_unique(&mut nodes, lower);
            edges.entry(higher).or_default().push(lower);
        }
    }

    let mut visited = HashSet::new();
    let mut finished = Vec::with_capacity(nodes.len());
    for node in &nodes {
        visit(*node, &edges, &mut visited, &mut finished);
    }
    finished.reverse();

    for id in siblings {
        push_unique(&mut finished, id);
    }
    Ok(finished)
}

fn visit(
    node: StateId,
    edges: &HashMap<StateId, Vec<StateId>>,
    visited: &mut HashSet<StateId>,
    finished: &mut Vec<StateId>,
) {
    if !visited.insert(node) {
        return;
    }
    for next in edges.get(&node).into_iter().flatten() {
        visit(*next, edges, visited, finished);
    }
    finished.push(node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::{
        core_descriptors, AUTHENTICATED_AND_RESOURCE_BOUND, AUTHENTICATED_BUT_UNBOUND,
        CLOSE_CONNECTION, CONNECTED_BUT_UNAUTHENTICATED, INSTANT_SHUTDOWN,
        LOOKUP_REMOTE_CONNECTION_ENDPOINTS, RESOURCE_BINDING, SASL_AUTHENTICATION, SHUTDOWN,
    };

    const ESTABLISHING: StateId = StateId::new("EstablishingTestConnection");
    const COMPRESSION: StateId = StateId::new("Compression");

    fn transport_descriptor() -> StateDescriptor {
        StateDescriptor::builder(ESTABLISHING)
            .predecessor(LOOKUP_REMOTE_CONNECTION_ENDPOINTS)
            .successor(CONNECTED_BUT_UNAUTHENTICATED)
            .build()
    }

    fn compression_descriptor() -> StateDescriptor {
        StateDescriptor::builder(COMPRESSION)
            .predecessor(AUTHENTICATED_BUT_UNBOUND)
            .successor(AUTHENTICATED_BUT_UNBOUND)
            .precedence_over(RESOURCE_BINDING)
            .reference("XEP-0138")
            .build()
    }

    #[test]
    fn core_graph_with_transport() {
        let mut descriptors = core_descriptors();
        descriptors.push(transport_descriptor());
        let graph = StateDescriptorGraph::build(descriptors).unwrap();

        assert_eq!(graph.descriptor(graph.root()).id(), DISCONNECTED);
        assert_eq!(
            graph.successors_of(LOOKUP_REMOTE_CONNECTION_ENDPOINTS).unwrap(),
            vec![ESTABLISHING]
        );
        assert_eq!(
            graph.successors_of(CONNECTED_BUT_UNAUTHENTICATED).unwrap(),
            vec![SASL_AUTHENTICATION, INSTANT_SHUTDOWN, SHUTDOWN]
        );
        assert_eq!(
            graph.successors_of(AUTHENTICATED_BUT_UNBOUND).unwrap(),
            vec![RESOURCE_BINDING]
        );
        assert_eq!(
            graph.successors_of(AUTHENTICATED_AND_RESOURCE_BOUND).unwrap(),
            vec![INSTANT_SHUTDOWN, SHUTDOWN]
        );
        assert_eq!(graph.successors_of(SHUTDOWN).unwrap(), vec![CLOSE_CONNECTION]);
        assert_eq!(graph.successors_of(CLOSE_CONNECTION).unwrap(), vec![DISCONNECTED]);
    }

    #[test]
    fn lookup_without_transport_is_rejected() {
        let err = StateDescriptorGraph::build(core_descriptors()).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::NoSuccessor(id) if id == LOOKUP_REMOTE_CONNECTION_ENDPOINTS
        ));
    }

    #[test]
    fn precedence_orders_inferred_successor_first() {
        let mut descriptors = core_descriptors();
        descriptors.push(transport_descriptor());
        descriptors.push(compression_descriptor());
        let graph = StateDescriptorGraph::build(descriptors).unwrap();

        assert_eq!(
            graph.successors_of(AUTHENTICATED_BUT_UNBOUND).unwrap(),
            vec![COMPRESSION, RESOURCE_BINDING]
        );
        assert_eq!(
            graph.successors_of(COMPRESSION).unwrap(),
            vec![AUTHENTICATED_BUT_UNBOUND]
        );
    }

    #[test]
    fn inferior_to_orders_after_named_sibling() {
        const A: StateId = StateId::new("A");
        const B: StateId = StateId::new("B");
        let descriptors = vec![
            StateDescriptor::builder(DISCONNECTED).successor(A).successor(B).build(),
            StateDescriptor::builder(A)
                .inferior_to(B)
                .successor(DISCONNECTED)
                .build(),
            StateDescriptor::builder(B).successor(DISCONNECTED).build(),
        ];
        let graph = StateDescriptorGraph::build(descriptors).unwrap();
        assert_eq!(graph.successors_of(DISCONNECTED).unwrap(), vec![B, A]);
    }

    #[test]
    fn duplicate_state_is_rejected() {
        let mut descriptors = core_descriptors();
        descriptors.push(transport_descriptor());
        descriptors.push(transport_descriptor());
        let err = StateDescriptorGraph::build(descriptors).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateState(id) if id == ESTABLISHING));
    }

    #[test]
    fn unknown_successor_is_rejected() {
        let mut descriptors = core_descriptors();
        descriptors.push(
            StateDescriptor::builder(ESTABLISHING)
                .predecessor(LOOKUP_REMOTE_CONNECTION_ENDPOINTS)
                .successor(StateId::new("Nowhere"))
                .build(),
        );
        let err = StateDescriptorGraph::build(descriptors).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnknownState { from, to }
                if from == ESTABLISHING && to == StateId::new("Nowhere")
        ));
    }

    #[test]
    fn unknown_precedence_is_rejected() {
        let mut descriptors = core_descriptors();
        descriptors.push(transport_descriptor());
        descriptors.push(
            StateDescriptor::builder(COMPRESSION)
                .predecessor(AUTHENTICATED_BUT_UNBOUND)
                .successor(AUTHENTICATED_BUT_UNBOUND)
                .precedence_over(StateId::new("StreamResumption"))
                .build(),
        );
        let err = StateDescriptorGraph::build(descriptors).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownState { from, .. } if from == COMPRESSION));
    }

    #[test]
    fn dot_output_marks_vertex_kinds() {
        let mut descriptors = core_descriptors();
        descriptors.push(transport_descriptor());
        descriptors.push(compression_descriptor());
        let dot = StateDescriptorGraph::build(descriptors).unwrap().to_dot(false);

        assert!(dot.starts_with("digraph {"));
        assert!(dot.ends_with('}'));
        assert!(dot.contains("\"Disconnected\" -> \"LookupRemoteConnectionEndpoints\";"));
        assert!(dot.contains(
            "\"AuthenticatedButUnbound\" -> \"Compression (XEP-0138)\" [xlabel=\"1\"];"
        ));
        assert!(dot.contains("\"AuthenticatedButUnbound\" [ style=\"bold\" ];"));
        assert!(dot.contains("\"Disconnected\" [ style=\"filled\" ];"));
    }
}
