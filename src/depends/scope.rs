//! Finalizer stacks scoped to a single top-level invocation.
//!
//! Generator dependencies hand out their first item as the injected value and
//! keep the remainder suspended here. Closing a stack drains the suspended
//! generators in reverse order of entry.

use std::borrow::Cow;
use std::mem;

use futures::{FutureExt, StreamExt};
use futures::future::BoxFuture;

use crate::core::Dynamic;
use crate::depends::callable::{Generator, ValueStream};
use crate::error::ResolveError;

type SyncFinalizer = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type AsyncFinalizer = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

fn drain(mut generator: Generator) -> anyhow::Result<()> {
    generator.try_for_each(|item| item.map(drop))
}

/// Keep the first of several finalizer errors, log the rest.
fn collect(name: &str, result: anyhow::Result<()>, first: &mut Option<anyhow::Error>) {
    if let Err(err) = result {
        if first.is_none() {
            *first = Some(err);
        } else {
            tracing::warn!(call = name, "suppressed finalizer error: {err:#}");
        }
    }
}

/// Prefer the error of the body over any finalizer error.
fn merge<T>(result: anyhow::Result<T>, close: anyhow::Result<()>) -> anyhow::Result<T> {
    match (result, close) {
        (Err(err), Err(close)) => {
            tracing::warn!("finalizer error while unwinding: {close:#}");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(_), Err(close)) => Err(close),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Finalizers of a sync invocation.
#[derive(Default)]
pub struct ExitStack {
    finalizers: Vec<(Cow<'static, str>, SyncFinalizer)>,
}

impl ExitStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.finalizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    pub fn push<F>(&mut self, name: impl Into<Cow<'static, str>>, finalizer: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.finalizers.push((name.into(), Box::new(finalizer)));
    }

    /// Pull the first item out of `generator` and keep the rest of it for
    /// [`ExitStack::close`].
    pub fn enter_generator(
        &mut self,
        name: Cow<'static, str>,
        mut generator: Generator,
    ) -> anyhow::Result<Dynamic> {
        let value = match generator.next() {
            Some(item) => item?,
            None => return Err(ResolveError::GeneratorDidNotYield { call: name }.into()),
        };
        self.push(name, move || drain(generator));
        Ok(value)
    }

    /// Run every finalizer, last entered first. All of them run even when
    /// some fail; the first failure is returned.
    pub fn close(&mut self) -> anyhow::Result<()> {
        let mut first = None;
        while let Some((name, finalizer)) = self.finalizers.pop() {
            tracing::trace!(call = %name, "finalize");
            collect(&name, finalizer(), &mut first);
        }
        first.map_or(Ok(()), Err)
    }

    /// Close the stack after the body produced `result`.
    pub fn exit<T>(mut self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        let close = self.close();
        merge(result, close)
    }
}

impl Drop for ExitStack {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!("finalizer failed during drop: {err:#}");
        }
    }
}

enum Finalizer {
    Sync(SyncFinalizer),
    Async(AsyncFinalizer),
}

/// Finalizers of an async invocation. Holds both sync generators and async
/// streams.
#[derive(Default)]
pub struct AsyncExitStack {
    finalizers: Vec<(Cow<'static, str>, Finalizer)>,
}

impl AsyncExitStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.finalizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    pub fn push<F>(&mut self, name: impl Into<Cow<'static, str>>, finalizer: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.finalizers
            .push((name.into(), Finalizer::Sync(Box::new(finalizer))));
    }

    pub fn push_async<F>(&mut self, name: impl Into<Cow<'static, str>>, finalizer: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.finalizers
            .push((name.into(), Finalizer::Async(Box::new(finalizer))));
    }

    pub fn enter_generator(
        &mut self,
        name: Cow<'static, str>,
        mut generator: Generator,
    ) -> anyhow::Result<Dynamic> {
        let value = match generator.next() {
            Some(item) => item?,
            None => return Err(ResolveError::GeneratorDidNotYield { call: name }.into()),
        };
        self.push(name, move || drain(generator));
        Ok(value)
    }

    /// Pull the first item out of `stream` and keep the rest of it for
    /// [`AsyncExitStack::close`].
    pub async fn enter_stream(
        &mut self,
        name: Cow<'static, str>,
        mut stream: ValueStream,
    ) -> anyhow::Result<Dynamic> {
        let value = match stream.next().await {
            Some(item) => item?,
            None => return Err(ResolveError::GeneratorDidNotYield { call: name }.into()),
        };
        self.push_async(name, move || {
            async move {
                while let Some(item) = stream.next().await {
                    item?;
                }
                Ok(())
            }
            .boxed()
        });
        Ok(value)
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        let mut first = None;
        // Popping one at a time keeps the rest on the stack if this future is
        // dropped halfway, so `Drop` can still finish them.
        while let Some((name, finalizer)) = self.finalizers.pop() {
            tracing::trace!(call = %name, "finalize");
            let result = match finalizer {
                Finalizer::Sync(finalizer) => finalizer(),
                Finalizer::Async(finalizer) => finalizer().await,
            };
            collect(&name, result, &mut first);
        }
        first.map_or(Ok(()), Err)
    }

    pub async fn exit<T>(mut self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        let close = self.close().await;
        merge(result, close)
    }
}

/// Run `finalizers`, last entered first, logging the first failure.
async fn finalize_detached(finalizers: Vec<(Cow<'static, str>, Finalizer)>) {
    let mut first = None;
    for (name, finalizer) in finalizers.into_iter().rev() {
        let result = match finalizer {
            Finalizer::Sync(finalizer) => finalizer(),
            Finalizer::Async(finalizer) => finalizer().await,
        };
        collect(&name, result, &mut first);
    }
    if let Some(err) = first {
        tracing::warn!("finalizer failed during drop: {err:#}");
    }
}

impl Drop for AsyncExitStack {
    /// Sync finalizers on top of the stack run right away. From the first
    /// async one on, the rest is spawned on the current tokio runtime, or
    /// driven in place when there is none. The runtime thread must not block
    /// on them.
    fn drop(&mut self) {
        let mut first = None;
        while matches!(self.finalizers.last(), Some((_, Finalizer::Sync(_)))) {
            if let Some((name, Finalizer::Sync(finalizer))) = self.finalizers.pop() {
                collect(&name, finalizer(), &mut first);
            }
        }
        if let Some(err) = first {
            tracing::warn!("finalizer failed during drop: {err:#}");
        }

        let pending = mem::take(&mut self.finalizers);
        if pending.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(pending = pending.len(), "finalizing on the runtime");
                runtime.spawn(finalize_detached(pending));
            }
            Err(_) => futures::executor::block_on(finalize_detached(pending)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn tracked(log: &Log, name: &'static str) -> Generator {
        let log = log.clone();
        let after = std::iter::from_fn(move || {
            log.lock().push(format!("exit {name}"));
            None
        });
        Box::new(std::iter::once(Ok(crate::core::dynamic(name))).chain(after))
    }

    #[test]
    fn test_close_runs_in_reverse() {
        let log = Log::default();
        let mut stack = ExitStack::new();
        for name in ["a", "b", "c"] {
            let value = stack.enter_generator(name.into(), tracked(&log, name)).unwrap();
            assert_eq!(*value.downcast_ref::<&str>().unwrap(), name);
        }
        assert_eq!(stack.len(), 3);

        stack.close().unwrap();
        assert_eq!(*log.lock(), vec!["exit c", "exit b", "exit a"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_body_error_wins() {
        let mut stack = ExitStack::new();
        stack.push("f", || Err(anyhow::anyhow!("finalizer")));
        let result: anyhow::Result<()> = stack.exit(Err(anyhow::anyhow!("body")));
        assert_eq!(result.unwrap_err().to_string(), "body");

        let mut stack = ExitStack::new();
        stack.push("f", || Err(anyhow::anyhow!("finalizer")));
        let result = stack.exit(Ok(1));
        assert_eq!(result.unwrap_err().to_string(), "finalizer");
    }

    #[test]
    fn test_empty_generator() {
        let mut stack = ExitStack::new();
        let err = stack
            .enter_generator("g".into(), Box::new(std::iter::empty()))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ResolveError>(),
            Some(&ResolveError::GeneratorDidNotYield { call: "g".into() })
        );
    }

    #[test]
    fn test_drop_closes() {
        let log = Log::default();
        {
            let mut stack = AsyncExitStack::new();
            stack.enter_generator("a".into(), tracked(&log, "a")).unwrap();
            let log = log.clone();
            stack.push_async("b", move || {
                async move {
                    log.lock().push("exit b".into());
                    Ok(())
                }
                .boxed()
            });
        }
        assert_eq!(*log.lock(), vec!["exit b", "exit a"]);
    }

    #[tokio::test]
    async fn test_drop_on_runtime_does_not_block() {
        let log = Log::default();
        {
            let mut stack = AsyncExitStack::new();
            stack.enter_generator("a".into(), tracked(&log, "a")).unwrap();
            let slow = log.clone();
            stack.push_async("b", move || {
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    slow.lock().push("exit b".into());
                    Ok(())
                }
                .boxed()
            });
            stack.enter_generator("c".into(), tracked(&log, "c")).unwrap();
        }
        assert_eq!(*log.lock(), vec!["exit c"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock(), vec!["exit c", "exit b", "exit a"]);
    }

    #[tokio::test]
    async fn test_async_close() {
        let log = Log::default();
        let mut stack = AsyncExitStack::new();

        let stream_log = log.clone();
        let stream = async_stream::stream! {
            yield Ok::<_, anyhow::Error>(crate::core::dynamic(1_i64));
            stream_log.lock().push("exit s".to_string());
        };
        let value = stack.enter_stream("s".into(), Box::pin(stream)).await.unwrap();
        assert_eq!(*value.downcast_ref::<i64>().unwrap(), 1);
        stack.enter_generator("g".into(), tracked(&log, "g")).unwrap();

        stack.close().await.unwrap();
        assert_eq!(*log.lock(), vec!["exit g", "exit s"]);
    }
}
