use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::BoxStream;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};

use crate::core::{Bound, Dynamic, TypeTag, dynamic};

/// Values produced one by one by a generator callable.
pub type Generator = Box<dyn Iterator<Item = anyhow::Result<Dynamic>> + Send>;

/// Values produced one by one by an async generator callable.
pub type ValueStream = BoxStream<'static, anyhow::Result<Dynamic>>;

type FunctionPtr = Arc<dyn Fn(Bound) -> anyhow::Result<Dynamic> + Send + Sync>;
type FuturePtr = Arc<dyn Fn(Bound) -> BoxFuture<'static, anyhow::Result<Dynamic>> + Send + Sync>;
type GeneratorPtr = Arc<dyn Fn(Bound) -> anyhow::Result<Generator> + Send + Sync>;
type StreamPtr = Arc<dyn Fn(Bound) -> ValueStream + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a [`Callable`]. Clones of a callable share it, which is what
/// caches and override registries key on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// How a callable is invoked, decided once when it is created.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CallKind {
    /// Plain synchronous function.
    Function,
    /// Asynchronous function.
    Future,
    /// Synchronous generator.
    Generator,
    /// Asynchronous generator.
    Stream,
}

impl CallKind {
    pub fn is_async(self) -> bool {
        matches!(self, CallKind::Future | CallKind::Stream)
    }

    pub fn is_generator(self) -> bool {
        matches!(self, CallKind::Generator | CallKind::Stream)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallKind::Function => "sync",
            CallKind::Future => "async",
            CallKind::Generator => "generator",
            CallKind::Stream => "async generator",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub(crate) enum Body {
    Function(FunctionPtr),
    Future(FuturePtr),
    Generator(GeneratorPtr),
    Stream(StreamPtr),
}

impl Body {
    fn kind(&self) -> CallKind {
        match self {
            Body::Function(_) => CallKind::Function,
            Body::Future(_) => CallKind::Future,
            Body::Generator(_) => CallKind::Generator,
            Body::Stream(_) => CallKind::Stream,
        }
    }
}

/// How a parameter accepts its value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ParamKind {
    /// Filled by position or by name.
    Positional,
    /// Collects surplus positional values.
    VarPositional,
    /// Filled by name only.
    KeywordOnly,
    /// Collects surplus keyword values.
    VarKeyword,
}

/// Marks a parameter whose value comes from calling `producer`, unless the
/// caller passes a value for it explicitly.
#[derive(Clone)]
pub struct Depends {
    pub(crate) producer: Callable,
    pub(crate) use_cache: bool,
}

impl Depends {
    pub fn on(producer: &Callable) -> Self {
        Self {
            producer: producer.clone(),
            use_cache: true,
        }
    }

    /// Whether the produced value is shared by every consumer within one
    /// invocation. Defaults to `true`.
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn producer(&self) -> &Callable {
        &self.producer
    }

    pub fn is_cached(&self) -> bool {
        self.use_cache
    }
}

impl fmt::Debug for Depends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Depends")
            .field("producer", &self.producer.name())
            .field("use_cache", &self.use_cache)
            .finish()
    }
}

#[derive(Clone)]
pub(crate) enum DefaultValue {
    Value(Dynamic),
    Depends(Depends),
}

/// A parameter as declared by the author of a callable.
///
/// A dependency can be attached either as an annotation
/// ([`Param::annotate`]) or as the default value ([`Param::default_depends`]),
/// never both.
#[derive(Clone)]
pub struct Param {
    pub(crate) name: String,
    pub(crate) kind: ParamKind,
    pub(crate) ty: TypeTag,
    pub(crate) default: Option<DefaultValue>,
    pub(crate) annotations: Vec<Depends>,
}

impl Param {
    fn with_kind(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ty: TypeTag::any(),
            default: None,
            annotations: Vec::new(),
        }
    }

    pub fn positional(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::Positional)
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::KeywordOnly)
    }

    pub fn var_positional(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::VarPositional)
    }

    pub fn var_keyword(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::VarKeyword)
    }

    /// Declare the type of this parameter.
    pub fn of<T: 'static>(mut self) -> Self {
        self.ty = TypeTag::of::<T>();
        self
    }

    pub fn default<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.default_dynamic(dynamic(value))
    }

    pub fn default_dynamic(mut self, value: Dynamic) -> Self {
        self.default = Some(DefaultValue::Value(value));
        self
    }

    /// Attach a dependency through the default value.
    pub fn default_depends(mut self, depends: Depends) -> Self {
        self.default = Some(DefaultValue::Depends(depends));
        self
    }

    /// Attach a dependency through the type annotation.
    pub fn annotate(mut self, depends: Depends) -> Self {
        self.annotations.push(depends);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

struct CallableData {
    id: CallId,
    name: Cow<'static, str>,
    params: Vec<Param>,
    body: Body,
}

/// A function, async function, generator or async generator together with
/// its declared parameters.
///
/// Callables are created with [`Callable::named`] and are cheap to clone;
/// every clone keeps the identity of the original.
///
/// # Example
///
/// ```rust
/// use tsunagi::{Callable, Depends, Param};
///
/// let g = Callable::named("g").function(|_| Ok(42_i64));
/// let f = Callable::named("f")
///     .param(Param::positional("x").of::<i64>().default_depends(Depends::on(&g)))
///     .function(|args| Ok(*args.get::<i64>("x")?));
/// ```
#[derive(Clone)]
pub struct Callable(Arc<CallableData>);

impl Callable {
    /// The entry point. Declare parameters, then finish with a body.
    pub fn named(name: impl Into<Cow<'static, str>>) -> CallableDef {
        CallableDef {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn id(&self) -> CallId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub(crate) fn name_cow(&self) -> Cow<'static, str> {
        self.0.name.clone()
    }

    pub fn kind(&self) -> CallKind {
        self.0.body.kind()
    }

    pub fn params(&self) -> &[Param] {
        &self.0.params
    }

    pub(crate) fn body(&self) -> &Body {
        &self.0.body
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Callable {}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("kind", &self.kind())
            .field("params", &self.0.params)
            .finish()
    }
}

/// A callable being declared.
pub struct CallableDef {
    name: Cow<'static, str>,
    params: Vec<Param>,
}

impl CallableDef {
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    fn finish(self, body: Body) -> Callable {
        Callable(Arc::new(CallableData {
            id: CallId::next(),
            name: self.name,
            params: self.params,
            body,
        }))
    }

    /// Finish with a synchronous body.
    pub fn function<F, R>(self, callback: F) -> Callable
    where
        F: Fn(Bound) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.finish(Body::Function(Arc::new(move |args| {
            callback(args).map(dynamic)
        })))
    }

    /// Finish with an asynchronous body.
    pub fn future<F, Fut, R>(self, callback: F) -> Callable
    where
        F: Fn(Bound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        self.finish(Body::Future(Arc::new(move |args| {
            callback(args).map(|result| result.map(dynamic)).boxed()
        })))
    }

    /// Finish with a generator body. Used as a dependency, the first item is
    /// the injected value and the rest of the iterator is drained when the
    /// owning invocation finishes.
    pub fn generator<F, I, R>(self, callback: F) -> Callable
    where
        F: Fn(Bound) -> anyhow::Result<I> + Send + Sync + 'static,
        I: IntoIterator<Item = anyhow::Result<R>>,
        I::IntoIter: Send + 'static,
        R: Send + Sync + 'static,
    {
        self.finish(Body::Generator(Arc::new(move |args| {
            let iter = callback(args)?.into_iter();
            Ok(Box::new(iter.map(|item| item.map(dynamic))) as Generator)
        })))
    }

    /// Finish with an async generator body.
    pub fn stream<F, S, R>(self, callback: F) -> Callable
    where
        F: Fn(Bound) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        self.finish(Body::Stream(Arc::new(move |args| {
            callback(args).map(|item| item.map(dynamic)).boxed()
        })))
    }
}
