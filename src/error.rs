use std::borrow::Cow;

use thiserror::Error;

pub use anyhow::Error as RuntimeError;

use crate::depends::CallKind;
use crate::graph::NodeId;

/// Raised while turning a [`Callable`](crate::Callable) into a
/// [`CallModel`](crate::CallModel). These are programming errors in the
/// declared signatures, so nothing is ever resolved from a model that failed
/// to build.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Cannot specify multiple `Depends` markers for `{param}` of `{call}`")]
    DuplicateMarker { call: Cow<'static, str>, param: String },

    #[error(
        "Cannot use `Depends` both as an annotation and as a default value for `{param}` of `{call}`"
    )]
    AnnotatedAndDefault { call: Cow<'static, str>, param: String },

    #[error("You cannot use async dependency `{call}` at sync main")]
    AsyncInSync { call: Cow<'static, str> },

    #[error("Parameter `{param}` is declared more than once on `{call}`")]
    DuplicateParam { call: Cow<'static, str>, param: String },

    #[error("Variadic parameter `{param}` of `{call}` is declared out of order")]
    VariadicOrder { call: Cow<'static, str>, param: String },

    #[error("Variadic parameter `{param}` of `{call}` cannot be a dependency")]
    VariadicDependency { call: Cow<'static, str>, param: String },
}

/// Failures owned by the injection layer itself. Errors returned by producer
/// callables are never converted into this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("`{call}` is missing a value for parameter `{param}`")]
    MissingArgument { call: Cow<'static, str>, param: String },

    #[error("`{call}` takes {expected} positional arguments but {given} were given")]
    TooManyPositional {
        call: Cow<'static, str>,
        expected: usize,
        given: usize,
    },

    #[error("Parameter `{param}` of `{call}` expected a value of type {expected}")]
    TypeMismatch {
        call: Cow<'static, str>,
        param: String,
        expected: &'static str,
    },

    #[error("You cannot use async dependency `{call}` at sync main")]
    AsyncOverride { call: Cow<'static, str> },

    #[error("Override `{replacement}` for `{call}` must match its generator kind")]
    OverrideKindMismatch {
        call: Cow<'static, str>,
        replacement: Cow<'static, str>,
    },

    #[error("Generator `{call}` didn't yield")]
    GeneratorDidNotYield { call: Cow<'static, str> },

    #[error("`{call}` is a {kind} callable and cannot be driven with `{entry}`")]
    WrongEntry {
        call: Cow<'static, str>,
        kind: CallKind,
        entry: &'static str,
    },
}

/// A configured usage limit was hit. This is kept separate from producer
/// errors so callers can tell "we stopped you" from "your code failed".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct UsageLimitExceeded(pub String);

impl UsageLimitExceeded {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Raised when a [`Graph`](crate::graph::Graph) is assembled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("{0} but not included in the graph.")]
    UnknownNode(String),

    #[error("Nodes are referenced in the graph but not included in the graph:\n{0}")]
    UnknownNodes(String),

    #[error("Node {0} doesn't declare any transition")]
    MissingTransitions(NodeId),

    #[error("Graph has no nodes")]
    Empty,
}

/// Raised while a graph is running. None of these are retried.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node {0} is not in the Graph")]
    UnknownStart(NodeId),

    #[error("Node {from} cannot go to {to} which is not in the Graph")]
    UnknownDestination { from: NodeId, to: NodeId },

    #[error("Node {from} cannot go to {to} which is not in its list of allowed next nodes")]
    DisallowedTransition { from: NodeId, to: NodeId },

    #[error("Node {0} cannot end the graph")]
    CannotEnd(NodeId),

    #[error(transparent)]
    UsageLimit(#[from] UsageLimitExceeded),

    #[error("Node {0}:\n{1}")]
    Node(NodeId, anyhow::Error),
}
