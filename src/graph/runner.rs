use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use crate::core::{Dynamic, dynamic};
use crate::error::{GraphError, UsageLimitExceeded};
use crate::graph::history::History;
use crate::graph::node::{DynNode, End, GraphContext, Next, Node};
use crate::graph::Graph;

/// Knobs for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Maximum number of nodes to run. `None` means no limit.
    pub step_limit: Option<usize>,
    /// Read-only dependencies, handed to every node through its context.
    pub deps: Option<Dynamic>,
}

impl RunOptions {
    pub fn step_limit(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit);
        self
    }

    pub fn deps<T: Send + Sync + 'static>(mut self, deps: T) -> Self {
        self.deps = Some(dynamic(deps));
        self
    }
}

/// Outcome of a run that reached an end.
#[derive(Debug)]
pub struct RunResult<S, O> {
    pub output: O,
    pub state: S,
    pub history: History<S, O>,
}

impl<S, O> Graph<S, O>
where
    S: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    pub async fn run<N: Node<S, O>>(&self, start: N, state: S) -> Result<RunResult<S, O>, GraphError> {
        self.run_with(start, state, RunOptions::default()).await
    }

    /// Run from `start` until a node ends the graph.
    ///
    /// Every transition is checked against the edges the returning node
    /// declared. A violation stops the run, as does any error from a node.
    pub async fn run_with<N: Node<S, O>>(
        &self,
        start: N,
        state: S,
        options: RunOptions,
    ) -> Result<RunResult<S, O>, GraphError> {
        let start_id = N::id();
        if !self.contains(start_id) {
            return Err(GraphError::UnknownStart(start_id));
        }
        for id in self.unreachable_from(start_id) {
            tracing::warn!(node = %id, start = %start_id, "node is unreachable from the start node");
        }

        let mut ctx = GraphContext {
            state,
            deps: options.deps,
        };
        let mut history = History::new();
        let mut current: Arc<dyn DynNode<S, O>> = Arc::new(start);
        let mut steps = 0;

        loop {
            let id = current.node_id();
            let Some(def) = self.get(id) else {
                return Err(GraphError::UnknownStart(id));
            };

            if let Some(limit) = options.step_limit
                && steps >= limit
            {
                return Err(UsageLimitExceeded::new(format!(
                    "The next step would exceed the step_limit of {limit}"
                ))
                .into());
            }
            steps += 1;

            let index = history.push_node(current.clone(), ctx.state.clone());
            let started = Instant::now();
            let next = current
                .run_dyn(&mut ctx)
                .instrument(tracing::info_span!("node", id = %id))
                .await;
            history.set_duration(index, started.elapsed());

            match next.map_err(|err| GraphError::Node(id, err))? {
                Next::End(End(output)) => {
                    if !def.can_end {
                        return Err(GraphError::CannotEnd(id));
                    }
                    history.push_end(output.clone(), ctx.state.clone());
                    tracing::debug!(steps, "graph ended");
                    return Ok(RunResult {
                        output,
                        state: ctx.state,
                        history,
                    });
                }
                Next::Node(node) => {
                    let to = node.node_id();
                    if !self.contains(to) {
                        return Err(GraphError::UnknownDestination { from: id, to });
                    }
                    if !def.dest_any && !def.next.contains(&to) {
                        return Err(GraphError::DisallowedTransition { from: id, to });
                    }
                    current = node;
                }
            }
        }
    }

    /// [`Graph::run`] on the current thread.
    pub fn run_blocking<N: Node<S, O>>(&self, start: N, state: S) -> Result<RunResult<S, O>, GraphError> {
        futures::executor::block_on(self.run(start, state))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::graph::{Edges, HistoryStep, NodeId, StepRecord, async_trait};

    #[derive(Debug)]
    struct Add(i64);

    #[async_trait]
    impl Node<i64, i64> for Add {
        fn edges() -> Edges<i64, i64> {
            Edges::new().to::<Double>()
        }

        async fn run(&self, ctx: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            ctx.state += self.0;
            Ok(Next::node(Double))
        }
    }

    #[derive(Debug)]
    struct Double;

    #[async_trait]
    impl Node<i64, i64> for Double {
        fn edges() -> Edges<i64, i64> {
            Edges::new().end()
        }

        async fn run(&self, ctx: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            Ok(Next::end(ctx.state * 2))
        }
    }

    /// Declares only `Double` but goes back to `Add`.
    #[derive(Debug)]
    struct Rogue;

    #[async_trait]
    impl Node<i64, i64> for Rogue {
        fn edges() -> Edges<i64, i64> {
            Edges::new().to::<Double>()
        }

        async fn run(&self, _: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            Ok(Next::node(Add(1)))
        }
    }

    #[derive(Debug)]
    struct Stubborn;

    #[async_trait]
    impl Node<i64, i64> for Stubborn {
        fn edges() -> Edges<i64, i64> {
            Edges::new().to::<Add>()
        }

        async fn run(&self, _: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            Ok(Next::end(0))
        }
    }

    #[derive(Debug)]
    struct Spin;

    #[async_trait]
    impl Node<i64, i64> for Spin {
        fn edges() -> Edges<i64, i64> {
            Edges::any()
        }

        async fn run(&self, ctx: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            ctx.state += 1;
            Ok(Next::node(Spin))
        }
    }

    /// Adds the run's dependencies to the state.
    #[derive(Debug)]
    struct Offset;

    #[async_trait]
    impl Node<i64, i64> for Offset {
        fn edges() -> Edges<i64, i64> {
            Edges::new().end()
        }

        async fn run(&self, ctx: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            let offset = ctx.deps::<i64>().copied().unwrap_or(0);
            Ok(Next::end(ctx.state + offset))
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("broken")]
    struct Broken;

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl Node<i64, i64> for Failing {
        fn edges() -> Edges<i64, i64> {
            Edges::new().end()
        }

        async fn run(&self, _: &mut GraphContext<i64>) -> anyhow::Result<Next<i64, i64>> {
            Err(Broken.into())
        }
    }

    fn graph() -> Graph<i64, i64> {
        Graph::builder()
            .node::<Add>()
            .node::<Double>()
            .node::<Rogue>()
            .node::<Stubborn>()
            .node::<Spin>()
            .node::<Failing>()
            .node::<Offset>()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_to_end() {
        let result = graph().run(Add(30), 0).await.unwrap();
        assert_eq!(result.output, 60);
        assert_eq!(result.state, 30);
        assert_eq!(result.history.len(), 3);
        assert_eq!(result.history.node_ids(), vec![NodeId::new("Add"), NodeId::new("Double")]);

        // snapshots taken before each node ran
        let states: Vec<i64> = result.history.iter().map(|step| *step.state()).collect();
        assert_eq!(states, vec![0, 30, 30]);

        match &result.history.steps()[1] {
            HistoryStep::Node(step) => assert!(step.duration.is_some()),
            HistoryStep::End(_) => panic!("expected a node step"),
        }
        assert!(matches!(
            result.history.steps()[2],
            HistoryStep::End(ref end) if end.result == 60
        ));
    }

    #[test]
    fn test_run_blocking() {
        let result = graph().run_blocking(Add(1), 1).unwrap();
        assert_eq!(result.output, 4);
    }

    #[tokio::test]
    async fn test_disallowed_transition() {
        let err = graph().run(Rogue, 0).await.unwrap_err();
        assert!(matches!(err, GraphError::DisallowedTransition { .. }));
        assert_eq!(
            err.to_string(),
            "Node Rogue cannot go to Add which is not in its list of allowed next nodes"
        );
    }

    #[tokio::test]
    async fn test_unknown_destination_and_start() {
        let small = Graph::builder().node::<Add>().node::<Rogue>().node::<Double>().build().unwrap();
        let err = small.run(Stubborn, 0).await.unwrap_err();
        assert!(matches!(err, GraphError::UnknownStart(id) if id == Stubborn::id()));

        let tiny: Graph<i64, i64> = Graph::builder().node::<Spin>().node::<Add>().node::<Double>().build().unwrap();
        let err = tiny.run(Rogue, 0).await.unwrap_err();
        assert!(matches!(err, GraphError::UnknownStart(_)));

        let err = Graph::<i64, i64>::builder()
            .node::<Rogue>()
            .node::<Double>()
            .build()
            .unwrap()
            .run(Rogue, 0)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Node Rogue cannot go to Add which is not in the Graph");
    }

    #[tokio::test]
    async fn test_cannot_end() {
        let err = graph().run(Stubborn, 0).await.unwrap_err();
        assert_eq!(err.to_string(), "Node Stubborn cannot end the graph");
    }

    #[tokio::test]
    async fn test_step_limit() {
        let options = RunOptions::default().step_limit(5);
        let err = graph().run_with(Spin, 0, options).await.unwrap_err();
        let GraphError::UsageLimit(limit) = err else {
            panic!("expected a usage limit error");
        };
        assert_eq!(limit.to_string(), "The next step would exceed the step_limit of 5");
    }

    #[tokio::test]
    async fn test_nodes_read_run_deps() {
        let graph = graph();
        let result = graph
            .run_with(Offset, 1, RunOptions::default().deps(41_i64))
            .await
            .unwrap();
        assert_eq!(result.output, 42);

        let result = graph.run(Offset, 1).await.unwrap();
        assert_eq!(result.output, 1);
    }

    #[tokio::test]
    async fn test_node_error_is_kept() {
        let err = graph().run(Failing, 0).await.unwrap_err();
        let GraphError::Node(id, source) = err else {
            panic!("expected a node error");
        };
        assert_eq!(id, Failing::id());
        assert!(source.downcast_ref::<Broken>().is_some());

        let err = GraphError::Node(id, anyhow!("plain"));
        assert_eq!(err.to_string(), "Node Failing:\nplain");
    }

    #[tokio::test]
    async fn test_history_records() {
        let result = graph().run(Add(2), 0).await.unwrap();
        let records = result.history.records();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], StepRecord::Node { id, node, state, .. }
            if id.as_str() == "Add" && node == "Add(2)" && state == "0"));
        assert!(matches!(&records[2], StepRecord::End { result, .. } if result == "4"));

        let json: serde_json::Value = serde_json::from_str(&result.history.to_json().unwrap()).unwrap();
        assert_eq!(json[0]["kind"], "node");
        assert_eq!(json[0]["id"], "Add");
        assert_eq!(json[2]["kind"], "end");
    }
}
