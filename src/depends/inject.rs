//! Entry points: wrapping a callable so that calling it resolves its
//! dependencies first.

use std::fmt;
use std::mem;
use std::sync::Arc;

use futures::StreamExt;

use crate::core::{Arguments, Dynamic};
use crate::depends::callable::{CallId, CallKind, Callable, Generator, ValueStream};
use crate::depends::model::CallModel;
use crate::depends::provider::{Provider, dependency_provider};
use crate::depends::scope::{AsyncExitStack, ExitStack};
use crate::depends::solve::{Outcome, Solver};
use crate::error::{BuildError, ResolveError};

/// Wrap `call` using the process-wide [`Provider`] for overrides.
///
/// ```rust
/// use tsunagi::{Arguments, Callable, Depends, Param, inject};
///
/// let g = Callable::named("g").function(|_| Ok(42_i64));
/// let f = Callable::named("f")
///     .param(Param::positional("x").of::<i64>().default_depends(Depends::on(&g)))
///     .function(|args| Ok(*args.get::<i64>("x")?));
///
/// let f = inject(&f).unwrap();
/// assert_eq!(f.call_as::<i64>(Arguments::new()).unwrap(), 42);
/// assert_eq!(f.call_as::<i64>(Arguments::new().kwarg("x", 7_i64)).unwrap(), 7);
/// ```
pub fn inject(call: &Callable) -> Result<Injected, BuildError> {
    Inject::new().wrap(call)
}

/// Wrap `call` with an explicit provider, or with no overrides at all.
pub fn inject_with(call: &Callable, provider: Option<Arc<Provider>>) -> Result<Injected, BuildError> {
    Inject { provider }.wrap(call)
}

/// Options for wrapping a callable.
#[derive(Clone)]
pub struct Inject {
    provider: Option<Arc<Provider>>,
}

impl Default for Inject {
    fn default() -> Self {
        Self {
            provider: Some(dependency_provider()),
        }
    }
}

impl Inject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: Arc<Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Ignore overrides entirely.
    pub fn without_overrides(mut self) -> Self {
        self.provider = None;
        self
    }

    /// Build the model of `call` and return the wrapped callable.
    pub fn wrap(self, call: &Callable) -> Result<Injected, BuildError> {
        let model = CallModel::build(call)?;
        tracing::debug!(call = call.name(), kind = %call.kind(), "inject");
        Ok(Injected {
            model: Arc::new(model),
            provider: self.provider,
        })
    }
}

/// A callable whose dependencies are resolved on every call.
///
/// Which method drives it depends on its [`CallKind`]: [`Injected::call`]
/// for sync functions, [`Injected::call_async`] for sync or async functions,
/// [`Injected::iter`] for generators and [`Injected::stream`] for generators
/// of either kind. Each call owns its own cache and scope.
#[derive(Clone)]
pub struct Injected {
    model: Arc<CallModel>,
    provider: Option<Arc<Provider>>,
}

impl Injected {
    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn id(&self) -> CallId {
        self.model.id()
    }

    pub fn kind(&self) -> CallKind {
        self.model.kind()
    }

    pub fn callable(&self) -> &Callable {
        self.model.callable()
    }

    pub fn model(&self) -> &CallModel {
        &self.model
    }

    fn expect(&self, entry: &'static str, kinds: &[CallKind]) -> Result<(), ResolveError> {
        if kinds.contains(&self.kind()) {
            Ok(())
        } else {
            Err(ResolveError::WrongEntry {
                call: self.model.name_cow(),
                kind: self.kind(),
                entry,
            })
        }
    }

    /// Resolve and invoke a sync function.
    pub fn call(&self, args: Arguments) -> anyhow::Result<Dynamic> {
        self.expect("call", &[CallKind::Function])?;

        let mut solver = Solver::<ExitStack>::new(self.provider.as_deref());
        let result = solver
            .solve(&self.model, args.args, args.kwargs, None)
            .and_then(|outcome| Ok(outcome.into_value(&self.model)?));
        solver.stack.exit(result)
    }

    /// Like [`Injected::call`], downcasting the result to `T`.
    pub fn call_as<T: Clone + 'static>(&self, args: Arguments) -> anyhow::Result<T> {
        let value = self.call(args)?;
        self.downcast(&value)
    }

    /// Resolve and invoke a sync or async function. Dropping the returned
    /// future still closes every resource opened so far.
    pub async fn call_async(&self, args: Arguments) -> anyhow::Result<Dynamic> {
        self.expect("call_async", &[CallKind::Function, CallKind::Future])?;

        let mut solver = Solver::<AsyncExitStack>::new(self.provider.as_deref());
        let result = solver
            .solve_async(&self.model, args.args, args.kwargs, None)
            .await
            .and_then(|outcome| Ok(outcome.into_value(&self.model)?));
        solver.stack.exit(result).await
    }

    pub async fn call_async_as<T: Clone + 'static>(&self, args: Arguments) -> anyhow::Result<T> {
        let value = self.call_async(args).await?;
        self.downcast(&value)
    }

    fn downcast<T: Clone + 'static>(&self, value: &Dynamic) -> anyhow::Result<T> {
        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| ResolveError::TypeMismatch {
                call: self.model.name_cow(),
                param: "return".to_string(),
                expected: std::any::type_name::<T>(),
            })?;
        Ok(value.clone())
    }

    /// Lazily run a sync generator. Nothing is resolved until the first
    /// pull; the dependencies stay open until the generator is exhausted,
    /// fails or the iterator is dropped.
    pub fn iter(&self, args: Arguments) -> anyhow::Result<InjectedIter> {
        self.expect("iter", &[CallKind::Generator])?;
        Ok(InjectedIter {
            model: self.model.clone(),
            provider: self.provider.clone(),
            state: IterState::Pending(args),
        })
    }

    /// Lazily run a generator of either kind as a stream.
    pub fn stream(&self, args: Arguments) -> anyhow::Result<ValueStream> {
        self.expect("stream", &[CallKind::Generator, CallKind::Stream])?;

        let model = self.model.clone();
        let provider = self.provider.clone();

        let stream = async_stream::stream! {
            let mut solver = Solver::<AsyncExitStack>::new(provider.as_deref());
            let outcome = solver
                .solve_async(&model, args.args, args.kwargs, None)
                .await;
            let stack = solver.stack;

            let mut failed = None;
            match outcome {
                Ok(Outcome::Stream(mut inner)) => {
                    while let Some(item) = inner.next().await {
                        match item {
                            Ok(value) => {
                                yield Ok(value);
                            }
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                }
                Ok(Outcome::Iter(inner)) => {
                    for item in inner {
                        match item {
                            Ok(value) => {
                                yield Ok(value);
                            }
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                }
                Ok(Outcome::Value(value)) => {
                    yield Ok(value);
                }
                Err(err) => failed = Some(err),
            }

            let result = failed.map_or(Ok(()), Err);
            if let Err(err) = stack.exit(result).await {
                yield Err(err);
            }
        };

        Ok(stream.boxed())
    }
}

impl fmt::Debug for Injected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injected")
            .field("call", &self.name())
            .field("kind", &self.kind())
            .field("overrides", &self.provider.is_some())
            .finish()
    }
}

enum IterState {
    Pending(Arguments),
    // `inner` goes before `stack` so the generator is dropped before its
    // dependencies are closed
    Running { inner: Generator, stack: ExitStack },
    Done,
}

/// Iterator returned by [`Injected::iter`].
pub struct InjectedIter {
    model: Arc<CallModel>,
    provider: Option<Arc<Provider>>,
    state: IterState,
}

impl InjectedIter {
    fn start(&mut self, args: Arguments) -> Option<anyhow::Result<Dynamic>> {
        let mut solver = Solver::<ExitStack>::new(self.provider.as_deref());
        match solver.solve(&self.model, args.args, args.kwargs, None) {
            Ok(Outcome::Iter(inner)) => self.advance(inner, solver.stack),
            Ok(other) => {
                let value = other.into_value(&self.model).map_err(Into::into);
                Some(solver.stack.exit(value))
            }
            Err(err) => solver.stack.exit::<()>(Err(err)).err().map(Err),
        }
    }

    fn advance(
        &mut self,
        mut inner: Generator,
        stack: ExitStack,
    ) -> Option<anyhow::Result<Dynamic>> {
        match inner.next() {
            Some(Ok(value)) => {
                self.state = IterState::Running { inner, stack };
                Some(Ok(value))
            }
            Some(Err(err)) => {
                drop(inner);
                stack.exit::<()>(Err(err)).err().map(Err)
            }
            None => {
                drop(inner);
                stack.exit(Ok(())).err().map(Err)
            }
        }
    }
}

impl Iterator for InjectedIter {
    type Item = anyhow::Result<Dynamic>;

    fn next(&mut self) -> Option<Self::Item> {
        match mem::replace(&mut self.state, IterState::Done) {
            IterState::Pending(args) => self.start(args),
            IterState::Running { inner, stack } => self.advance(inner, stack),
            IterState::Done => None,
        }
    }
}

impl fmt::Debug for InjectedIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            IterState::Pending(_) => "pending",
            IterState::Running { .. } => "running",
            IterState::Done => "done",
        };
        f.debug_struct("InjectedIter")
            .field("call", &self.model.name())
            .field("state", &state)
            .finish()
    }
}
