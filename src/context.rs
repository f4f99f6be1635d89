//! The context of the current agent call, reachable from any producer.
//!
//! The context is set for the duration of a closure or, for futures, around
//! every poll, so it follows the task rather than the thread.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::LazyLock;
use std::task::Poll;

use crate::core::{Arguments, Dynamic};
use crate::depends::{CallKind, Callable, Injected};
use crate::error::ResolveError;

/// What a producer may want to know about the call it is serving.
#[derive(Clone)]
pub struct CallContext {
    pub deps: Dynamic,
    pub retry: u32,
    pub tool_name: Option<String>,
}

impl CallContext {
    pub fn new(deps: Dynamic, retry: u32, tool_name: Option<String>) -> Self {
        Self {
            deps,
            retry,
            tool_name,
        }
    }

    pub fn deps<T: 'static>(&self) -> Option<&T> {
        self.deps.downcast_ref::<T>()
    }

    /// Wrap `future` so this context is current whenever it is polled.
    pub fn scope_future<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        let mut future = Box::pin(future);
        futures::future::poll_fn(move |cx| -> Poll<F::Output> {
            with_call_context(self.clone(), || future.as_mut().poll(cx))
        })
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("retry", &self.retry)
            .field("tool_name", &self.tool_name)
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CONTEXT: RefCell<Vec<CallContext>> = const { RefCell::new(Vec::new()) };
}

struct Restore;

impl Drop for Restore {
    fn drop(&mut self) {
        CONTEXT.with(|stack| stack.borrow_mut().pop());
    }
}

/// Run `f` with `ctx` as the current call context.
pub fn with_call_context<T>(ctx: CallContext, f: impl FnOnce() -> T) -> T {
    CONTEXT.with(|stack| stack.borrow_mut().push(ctx));
    let _restore = Restore;
    f()
}

/// The innermost call context, if any is set.
pub fn get_call_context() -> Option<CallContext> {
    CONTEXT.with(|stack| stack.borrow().last().cloned())
}

static PRODUCER: LazyLock<Callable> = LazyLock::new(|| {
    Callable::named("get_call_context").function(|args| {
        get_call_context().ok_or_else(|| {
            anyhow::Error::from(ResolveError::MissingArgument {
                call: args.call_name().to_owned().into(),
                param: "call context".to_owned(),
            })
        })
    })
});

/// A producer of the current [`CallContext`], for use with
/// [`Depends`](crate::Depends). Fails when no context is set.
pub fn call_context_producer() -> Callable {
    PRODUCER.clone()
}

/// Runs an injected system-prompt function inside a fresh call context.
#[derive(Clone)]
pub struct SystemPromptRunner {
    function: Injected,
}

impl SystemPromptRunner {
    pub fn new(function: Injected) -> Self {
        Self { function }
    }

    pub fn is_async(&self) -> bool {
        self.function.kind() == CallKind::Future
    }

    pub async fn run(&self, deps: Dynamic) -> anyhow::Result<String> {
        let ctx = CallContext::new(deps, 0, None);
        if self.is_async() {
            let function = self.function.clone();
            ctx.scope_future(async move { function.call_async_as::<String>(Arguments::new()).await })
                .await
        } else {
            with_call_context(ctx, || self.function.call_as::<String>(Arguments::new()))
        }
    }
}

impl fmt::Debug for SystemPromptRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemPromptRunner")
            .field("function", &self.function.name())
            .finish()
    }
}
