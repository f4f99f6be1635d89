use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graph::node::{DynNode, NodeId};

/// A node that ran, with the state as it was right before.
pub struct NodeStep<S, O> {
    pub state: S,
    pub node: Arc<dyn DynNode<S, O>>,
    pub start_ts: DateTime<Utc>,
    /// Set once the node returns.
    pub duration: Option<Duration>,
}

/// The end of a run, with the final state.
pub struct EndStep<S, O> {
    pub state: S,
    pub result: O,
    pub ts: DateTime<Utc>,
}

pub enum HistoryStep<S, O> {
    Node(NodeStep<S, O>),
    End(EndStep<S, O>),
}

impl<S, O> HistoryStep<S, O> {
    pub fn state(&self) -> &S {
        match self {
            HistoryStep::Node(step) => &step.state,
            HistoryStep::End(step) => &step.state,
        }
    }
}

impl<S: fmt::Debug, O: fmt::Debug> fmt::Debug for HistoryStep<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryStep::Node(step) => f
                .debug_struct("NodeStep")
                .field("node", &step.node)
                .field("state", &step.state)
                .field("start_ts", &step.start_ts)
                .field("duration", &step.duration)
                .finish(),
            HistoryStep::End(step) => f
                .debug_struct("EndStep")
                .field("result", &step.result)
                .field("state", &step.state)
                .field("ts", &step.ts)
                .finish(),
        }
    }
}

/// Serializable form of a [`HistoryStep`], for tracers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepRecord {
    Node {
        id: NodeId,
        node: String,
        state: String,
        start_ts: DateTime<Utc>,
        /// Seconds.
        duration: Option<f64>,
    },
    End {
        result: String,
        state: String,
        ts: DateTime<Utc>,
    },
}

/// Append-only record of a run. States are snapshots: later changes to the
/// live state don't show up here.
pub struct History<S, O> {
    steps: Vec<HistoryStep<S, O>>,
}

impl<S, O> History<S, O> {
    pub(crate) fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub(crate) fn push_node(&mut self, node: Arc<dyn DynNode<S, O>>, state: S) -> usize {
        self.steps.push(HistoryStep::Node(NodeStep {
            state,
            node,
            start_ts: Utc::now(),
            duration: None,
        }));
        self.steps.len() - 1
    }

    pub(crate) fn set_duration(&mut self, index: usize, duration: Duration) {
        if let Some(HistoryStep::Node(step)) = self.steps.get_mut(index) {
            step.duration = Some(duration);
        }
    }

    pub(crate) fn push_end(&mut self, result: O, state: S) {
        self.steps.push(HistoryStep::End(EndStep {
            state,
            result,
            ts: Utc::now(),
        }));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HistoryStep<S, O>> {
        self.steps.iter()
    }

    pub fn steps(&self) -> &[HistoryStep<S, O>] {
        &self.steps
    }

    /// Ids of the nodes that ran, in order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                HistoryStep::Node(step) => Some(step.node.node_id()),
                HistoryStep::End(_) => None,
            })
            .collect()
    }
}

impl<S: fmt::Debug, O: fmt::Debug> History<S, O> {
    pub fn records(&self) -> Vec<StepRecord> {
        self.steps
            .iter()
            .map(|step| match step {
                HistoryStep::Node(step) => StepRecord::Node {
                    id: step.node.node_id(),
                    node: format!("{:?}", step.node),
                    state: format!("{:?}", step.state),
                    start_ts: step.start_ts,
                    duration: step.duration.map(|duration| duration.as_secs_f64()),
                },
                HistoryStep::End(step) => StepRecord::End {
                    result: format!("{:?}", step.result),
                    state: format!("{:?}", step.state),
                    ts: step.ts,
                },
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records())
    }
}

impl<S: fmt::Debug, O: fmt::Debug> fmt::Debug for History<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.steps).finish()
    }
}

impl<'a, S, O> IntoIterator for &'a History<S, O> {
    type Item = &'a HistoryStep<S, O>;
    type IntoIter = std::slice::Iter<'a, HistoryStep<S, O>>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}
