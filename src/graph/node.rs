use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::core::Dynamic;
use crate::utils::short_type_name;

/// Identifier of a node type within a graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(&'static str);

impl NodeId {
    pub const fn new(id: &'static str) -> Self {
        Self(id)
    }

    /// The bare name of `N`, without module path or generics.
    pub fn of<N: ?Sized + 'static>() -> Self {
        Self(short_type_name::<N>())
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Serialize for NodeId {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        serializer.serialize_str(self.0)
    }
}

/// The transitions a node type declares: which nodes it may return, and
/// whether it may end the graph.
pub struct Edges<S = (), O = ()> {
    pub(crate) next: Vec<NodeId>,
    pub(crate) can_end: bool,
    pub(crate) dest_any: bool,
    _marker: PhantomData<fn() -> (S, O)>,
}

impl<S, O> Edges<S, O>
where
    S: Send + 'static,
    O: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            next: Vec::new(),
            can_end: false,
            dest_any: false,
            _marker: PhantomData,
        }
    }

    /// May go to any node of the graph.
    pub fn any() -> Self {
        Self {
            dest_any: true,
            ..Self::new()
        }
    }

    /// May go to `N`.
    pub fn to<N: Node<S, O>>(self) -> Self {
        self.to_id(N::id())
    }

    pub fn to_id(mut self, id: NodeId) -> Self {
        if !self.next.contains(&id) {
            self.next.push(id);
        }
        self
    }

    /// May end the graph.
    pub fn end(mut self) -> Self {
        self.can_end = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty() && !self.can_end && !self.dest_any
    }
}

impl<S, O> Default for Edges<S, O>
where
    S: Send + 'static,
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Shared context of one graph run: the mutable state, and dependencies
/// every node can read.
#[derive(Debug, Clone, Default)]
pub struct GraphContext<S = ()> {
    pub state: S,
    pub deps: Option<Dynamic>,
}

impl<S> GraphContext<S> {
    pub fn new(state: S) -> Self {
        Self { state, deps: None }
    }

    /// The run's dependencies as a `T`, if they are one.
    pub fn deps<T: 'static>(&self) -> Option<&T> {
        self.deps.as_ref()?.downcast_ref::<T>()
    }
}

/// Marks the end of a run, carrying its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct End<T>(pub T);

/// What a node returns: the next node, or the end of the run.
pub enum Next<S = (), O = ()> {
    Node(Arc<dyn DynNode<S, O>>),
    End(End<O>),
}

impl<S, O> Next<S, O>
where
    S: Send + 'static,
    O: Send + 'static,
{
    pub fn node<N: Node<S, O>>(node: N) -> Self {
        Next::Node(Arc::new(node))
    }

    pub fn end(value: O) -> Self {
        Next::End(End(value))
    }
}

impl<S, O: fmt::Debug> fmt::Debug for Next<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Node(node) => f.debug_tuple("Node").field(node).finish(),
            Next::End(end) => f.debug_tuple("End").field(end).finish(),
        }
    }
}

/// A step of a graph. The node value is the input of the step, and its type
/// is the state of the machine.
///
/// # Example
///
/// ```rust
/// use tsunagi::graph::{Edges, GraphContext, Next, Node};
///
/// #[derive(Debug)]
/// struct Double(i64);
///
/// #[async_trait::async_trait]
/// impl Node<(), i64> for Double {
///     fn edges() -> Edges<(), i64> {
///         Edges::new().end()
///     }
///
///     async fn run(&self, _: &mut GraphContext) -> anyhow::Result<Next<(), i64>> {
///         Ok(Next::end(self.0 * 2))
///     }
/// }
/// ```
#[async_trait]
pub trait Node<S = (), O = ()>: fmt::Debug + Send + Sync + 'static
where
    S: Send + 'static,
    O: Send + 'static,
{
    /// Identifier of this node type. Defaults to the type name.
    fn id() -> NodeId
    where
        Self: Sized,
    {
        NodeId::of::<Self>()
    }

    /// The transitions this node type may take.
    fn edges() -> Edges<S, O>
    where
        Self: Sized;

    async fn run(&self, ctx: &mut GraphContext<S>) -> anyhow::Result<Next<S, O>>;
}

/// Type-erased counterpart of [`Node`], the form nodes take once returned.
#[async_trait]
pub trait DynNode<S, O>: fmt::Debug + Send + Sync {
    fn node_id(&self) -> NodeId;

    async fn run_dyn(&self, ctx: &mut GraphContext<S>) -> anyhow::Result<Next<S, O>>;
}

#[async_trait]
impl<S, O, N> DynNode<S, O> for N
where
    S: Send + 'static,
    O: Send + 'static,
    N: Node<S, O>,
{
    fn node_id(&self) -> NodeId {
        N::id()
    }

    async fn run_dyn(&self, ctx: &mut GraphContext<S>) -> anyhow::Result<Next<S, O>> {
        self.run(ctx).await
    }
}
