//! Typed state machines.
//!
//! Every node type of a [`Graph`] declares, through [`Node::edges`], which
//! node types it may return and whether it may end the run. The graph checks
//! those declarations against its own node set when it is built, and checks
//! every actual transition while it runs.

mod history;
mod node;
mod runner;

use std::collections::HashMap;
use std::fmt::{self, Write};
use std::marker::PhantomData;

use petgraph::Graph as DiGraph;
use petgraph::graph::NodeIndex;

pub use async_trait::async_trait;

pub use crate::graph::history::{EndStep, History, HistoryStep, NodeStep, StepRecord};
pub use crate::graph::node::{DynNode, Edges, End, GraphContext, Next, Node, NodeId};
pub use crate::graph::runner::{RunOptions, RunResult};

use crate::error::GraphBuildError;
use crate::utils::comma_and;

/// What the graph knows about one node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDef {
    pub id: NodeId,
    pub next: Vec<NodeId>,
    pub can_end: bool,
    pub dest_any: bool,
}

/// A validated set of node types.
///
/// ```rust
/// use tsunagi::graph::{Edges, Graph, GraphContext, Next, Node, async_trait};
///
/// #[derive(Debug)]
/// struct Start;
///
/// #[async_trait]
/// impl Node<(), &'static str> for Start {
///     fn edges() -> Edges<(), &'static str> {
///         Edges::new().end()
///     }
///
///     async fn run(&self, _: &mut GraphContext) -> anyhow::Result<Next<(), &'static str>> {
///         Ok(Next::end("done"))
///     }
/// }
///
/// let graph = Graph::builder().node::<Start>().build().unwrap();
/// let result = graph.run_blocking(Start, ()).unwrap();
/// assert_eq!(result.output, "done");
/// ```
pub struct Graph<S = (), O = ()> {
    defs: Vec<NodeDef>,
    index: HashMap<NodeId, usize>,
    topology: DiGraph<NodeId, ()>,
    _marker: PhantomData<fn() -> (S, O)>,
}

impl<S, O> Graph<S, O>
where
    S: Send + 'static,
    O: Send + 'static,
{
    pub fn builder() -> GraphBuilder<S, O> {
        GraphBuilder {
            defs: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<S, O> Graph<S, O> {
    /// Node definitions in registration order.
    pub fn nodes(&self) -> &[NodeDef] {
        &self.defs
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeDef> {
        self.index.get(&id).map(|&index| &self.defs[index])
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Nodes that cannot be reached from `start`.
    pub fn unreachable_from(&self, start: NodeId) -> Vec<NodeId> {
        let Some(&start) = self.index.get(&start) else {
            return Vec::new();
        };

        let mut reached = vec![false; self.defs.len()];
        let mut dfs = petgraph::visit::Dfs::new(&self.topology, NodeIndex::new(start));
        while let Some(index) = dfs.next(&self.topology) {
            reached[index.index()] = true;
        }

        self.defs
            .iter()
            .zip(reached)
            .filter(|(_, reached)| !reached)
            .map(|(def, _)| def.id)
            .collect()
    }

    /// Mermaid flowchart of the graph.
    pub fn mermaid_code(&self) -> String {
        let mut code = String::from("graph TD");

        for def in &self.defs {
            if def.dest_any {
                for other in &self.defs {
                    let _ = write!(code, "\n  {} --> {}", def.id, other.id);
                }
            }

            // destinations in registration order
            let mut next: Vec<usize> = def.next.iter().filter_map(|id| self.index.get(id).copied()).collect();
            next.sort_unstable();
            for index in next {
                let _ = write!(code, "\n  {} --> {}", def.id, self.defs[index].id);
            }

            if def.can_end {
                let _ = write!(code, "\n  {} --> END", def.id);
            }
        }

        code
    }
}

impl<S, O> fmt::Debug for Graph<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.defs)
            .field("edges", &self.topology.edge_count())
            .finish()
    }
}

/// Collects node types for a [`Graph`].
pub struct GraphBuilder<S = (), O = ()> {
    defs: Vec<NodeDef>,
    _marker: PhantomData<fn() -> (S, O)>,
}

impl<S, O> GraphBuilder<S, O>
where
    S: Send + 'static,
    O: Send + 'static,
{
    /// Register `N`. Registering the same node type twice has no effect.
    pub fn node<N: Node<S, O>>(mut self) -> Self {
        let id = N::id();
        if self.defs.iter().all(|def| def.id != id) {
            let edges = N::edges();
            self.defs.push(NodeDef {
                id,
                next: edges.next,
                can_end: edges.can_end,
                dest_any: edges.dest_any,
            });
        }
        self
    }

    pub fn build(self) -> Result<Graph<S, O>, GraphBuildError> {
        if self.defs.is_empty() {
            return Err(GraphBuildError::Empty);
        }

        if let Some(def) = self
            .defs
            .iter()
            .find(|def| def.next.is_empty() && !def.can_end && !def.dest_any)
        {
            return Err(GraphBuildError::MissingTransitions(def.id));
        }

        let index: HashMap<NodeId, usize> = self
            .defs
            .iter()
            .enumerate()
            .map(|(i, def)| (def.id, i))
            .collect();

        // target -> the nodes referencing it, in order of first reference
        let mut bad_edges: Vec<(NodeId, Vec<String>)> = Vec::new();
        for def in &self.defs {
            for target in def.next.iter().filter(|id| !index.contains_key(id)) {
                let source = format!("\"{}\"", def.id);
                match bad_edges.iter_mut().find(|(id, _)| id == target) {
                    Some((_, sources)) => sources.push(source),
                    None => bad_edges.push((*target, vec![source])),
                }
            }
        }

        if !bad_edges.is_empty() {
            let lines: Vec<String> = bad_edges
                .iter()
                .map(|(target, sources)| {
                    format!("\"{}\" is referenced by {}", target, comma_and(sources))
                })
                .collect();
            return Err(match lines.as_slice() {
                [line] => GraphBuildError::UnknownNode(line.clone()),
                _ => GraphBuildError::UnknownNodes(
                    lines
                        .iter()
                        .map(|line| format!(" {line}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
            });
        }

        let mut topology = DiGraph::new();
        let nodes: Vec<NodeIndex> = self.defs.iter().map(|def| topology.add_node(def.id)).collect();
        for (from, def) in self.defs.iter().enumerate() {
            if def.dest_any {
                for &to in &nodes {
                    topology.add_edge(nodes[from], to, ());
                }
            } else {
                for target in &def.next {
                    topology.add_edge(nodes[from], nodes[index[target]], ());
                }
            }
        }

        tracing::debug!(nodes = self.defs.len(), edges = topology.edge_count(), "graph built");

        Ok(Graph {
            defs: self.defs,
            index,
            topology,
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! node {
        ($name:ident, $edges:expr) => {
            #[derive(Debug)]
            struct $name;

            #[async_trait]
            impl Node for $name {
                fn edges() -> Edges {
                    $edges
                }

                async fn run(&self, _: &mut GraphContext) -> anyhow::Result<Next> {
                    Ok(Next::end(()))
                }
            }
        };
    }

    node!(A, Edges::new().to::<B>());
    node!(B, Edges::new().to::<C>().end());
    node!(C, Edges::new().to::<A>().to::<B>().end());
    node!(Hub, Edges::any());
    node!(Lonely, Edges::new());
    node!(Orphan, Edges::new().end());

    #[test]
    fn test_mermaid_code() {
        let graph = Graph::builder().node::<A>().node::<B>().node::<C>().build().unwrap();
        assert_eq!(
            graph.mermaid_code(),
            "graph TD\n  A --> B\n  B --> C\n  B --> END\n  C --> A\n  C --> B\n  C --> END"
        );

        let graph = Graph::builder().node::<Hub>().node::<Orphan>().build().unwrap();
        assert_eq!(
            graph.mermaid_code(),
            "graph TD\n  Hub --> Hub\n  Hub --> Orphan\n  Orphan --> END"
        );
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let graph = Graph::builder().node::<Orphan>().node::<Orphan>().build().unwrap();
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn test_debug_lists_nodes() {
        let graph = Graph::builder().node::<A>().node::<B>().node::<C>().build().unwrap();
        let debug = format!("{graph:?}");
        assert!(debug.starts_with("Graph { nodes: [NodeDef { id: \"A\""));
        assert!(debug.ends_with("edges: 4 }"));
    }

    #[test]
    fn test_unknown_edge() {
        let err = Graph::builder().node::<A>().build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "\"B\" is referenced by \"A\" but not included in the graph."
        );

        let err = Graph::builder().node::<A>().node::<C>().build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "\"B\" is referenced by \"A\", and \"C\" but not included in the graph."
        );

        let err = Graph::builder().node::<C>().build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Nodes are referenced in the graph but not included in the graph:\n \"A\" is referenced by \"C\"\n \"B\" is referenced by \"C\""
        );
    }

    #[test]
    fn test_node_without_transitions() {
        let err = Graph::builder().node::<Lonely>().build().unwrap_err();
        assert_eq!(err, GraphBuildError::MissingTransitions(Lonely::id()));
        assert!(matches!(
            Graph::<(), ()>::builder().build(),
            Err(GraphBuildError::Empty)
        ));
    }

    #[test]
    fn test_unreachable_nodes() {
        let graph = Graph::builder()
            .node::<A>()
            .node::<B>()
            .node::<C>()
            .node::<Orphan>()
            .build()
            .unwrap();
        assert_eq!(graph.unreachable_from(A::id()), vec![Orphan::id()]);
        assert!(graph.unreachable_from(Orphan::id()).len() == 3);
    }
}
