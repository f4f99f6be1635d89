//! Resolution of a [`CallModel`] for one invocation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::core::{Bound, Dynamic};
use crate::depends::callable::{Body, CallId, Callable, Generator, ValueStream};
use crate::depends::model::CallModel;
use crate::depends::provider::Provider;
use crate::depends::scope::{AsyncExitStack, ExitStack};
use crate::error::ResolveError;

/// Values produced during one invocation, by effective callable.
pub(crate) type Cache = HashMap<CallId, Dynamic>;

/// What resolving a model gives back. Generators only come back unopened
/// when they are the top-level call.
pub(crate) enum Outcome {
    Value(Dynamic),
    Iter(Generator),
    Stream(ValueStream),
}

/// Names the top-level caller passed a value for. Only these suppress a
/// dependency; defaults and values produced by the resolver never do.
type Explicit = BTreeSet<String>;

/// The working keyword map of a call, plus whatever went to its variadic
/// parameters.
#[derive(Default)]
struct Binding {
    kw: BTreeMap<String, Dynamic>,
    rest: Vec<Dynamic>,
    extra: BTreeMap<String, Dynamic>,
    /// Names bound from caller values, before defaults were applied.
    supplied: Explicit,
}

impl Binding {
    /// Whether the dependency `name` already has its value.
    fn is_explicit(&self, explicit: &Explicit, name: &str) -> bool {
        explicit.contains(name) && self.kw.contains_key(name)
    }
}

impl Binding {
    /// Keyword values handed down to dependencies.
    fn for_child(&self) -> BTreeMap<String, Dynamic> {
        let mut kwargs = self.kw.clone();
        for (name, value) in &self.extra {
            kwargs.entry(name.clone()).or_insert_with(|| value.clone());
        }
        kwargs
    }
}

/// Place caller supplied values. Explicit values always win; dependency
/// parameters are left empty for the resolver.
fn bind(
    model: &CallModel,
    args: Vec<Dynamic>,
    mut kwargs: BTreeMap<String, Dynamic>,
) -> Result<Binding, ResolveError> {
    let mut binding = Binding::default();
    let given = args.len();

    for name in &model.keyword {
        if let Some(value) = kwargs.remove(name) {
            binding.kw.insert(name.clone(), value);
        }
    }

    if model.var_keyword.is_some() {
        for (name, value) in kwargs {
            if model.positional.contains(&name) {
                binding.kw.insert(name, value);
            } else {
                binding.extra.insert(name, value);
            }
        }
    } else {
        binding.kw.extend(kwargs);
    }

    let mut args = args.into_iter();
    for name in &model.positional {
        match args.next() {
            Some(value) => binding.kw.insert(name.clone(), value),
            None => break,
        };
    }

    if model.var_positional.is_some() {
        binding.rest.extend(args);
    } else {
        // all positional names are taken at this point, the surplus goes to
        // the keyword names in order
        let mut names = model.keyword.iter();
        for value in args {
            let Some(name) = names.next() else {
                return Err(ResolveError::TooManyPositional {
                    call: model.name_cow(),
                    expected: model.positional.len() + model.keyword.len(),
                    given,
                });
            };
            binding.kw.insert(name.clone(), value);
        }
    }

    binding.supplied = binding.kw.keys().chain(binding.extra.keys()).cloned().collect();

    for (name, field) in &model.params {
        if let Some(default) = &field.default {
            binding
                .kw
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }
    }

    Ok(binding)
}

/// Turn the working map into the arguments of the body. Every declared name
/// must have a value by now.
fn finish(model: &CallModel, mut binding: Binding) -> Result<Bound, ResolveError> {
    let mut bound = Bound::new(model.name_cow());

    for name in model.positional.iter().chain(&model.keyword) {
        let value = binding
            .kw
            .remove(name)
            .ok_or_else(|| ResolveError::MissingArgument {
                call: model.name_cow(),
                param: name.clone(),
            })?;

        if let Some(field) = model.params.get(name)
            && !field.ty.matches(&value)
        {
            return Err(ResolveError::TypeMismatch {
                call: model.name_cow(),
                param: name.clone(),
                expected: field.ty.name(),
            });
        }

        bound.values.insert(name.clone(), value);
    }

    bound.rest = binding.rest;
    bound.extra = binding.extra;
    Ok(bound)
}

/// State shared by every model resolved within one top-level invocation.
pub(crate) struct Solver<'p, S> {
    overrides: Option<&'p Provider>,
    cache: Cache,
    pub(crate) stack: S,
}

impl<'p, S: Default> Solver<'p, S> {
    pub(crate) fn new(overrides: Option<&'p Provider>) -> Self {
        Self {
            overrides,
            cache: Cache::new(),
            stack: S::default(),
        }
    }
}

impl<S> Solver<'_, S> {
    /// The callable that actually runs for `model`.
    fn effective(&self, model: &CallModel, is_sync: bool) -> Result<Callable, ResolveError> {
        let Some(replacement) = self.overrides.and_then(|p| p.get(model.id())) else {
            return Ok(model.call.clone());
        };

        if is_sync && replacement.kind().is_async() {
            return Err(ResolveError::AsyncOverride {
                call: model.name_cow(),
            });
        }
        if replacement.kind().is_generator() != model.kind().is_generator() {
            return Err(ResolveError::OverrideKindMismatch {
                call: model.name_cow(),
                replacement: replacement.name_cow(),
            });
        }

        tracing::trace!(
            call = model.name(),
            replacement = replacement.name(),
            "using override"
        );
        Ok(replacement)
    }

    fn cached(&self, model: &CallModel, call: &Callable) -> Option<Dynamic> {
        if !model.use_cache {
            return None;
        }
        let value = self.cache.get(&call.id())?;
        tracing::trace!(call = call.name(), "cache hit");
        Some(value.clone())
    }

    fn remember(&mut self, model: &CallModel, call: &Callable, value: &Dynamic) {
        if model.use_cache {
            self.cache.insert(call.id(), value.clone());
        }
    }
}

impl Solver<'_, ExitStack> {
    /// `explicit` is `None` for the top-level call, whose own caller values
    /// become the explicit set of the whole tree.
    pub(crate) fn solve(
        &mut self,
        model: &CallModel,
        args: Vec<Dynamic>,
        kwargs: BTreeMap<String, Dynamic>,
        explicit: Option<&Explicit>,
    ) -> anyhow::Result<Outcome> {
        let nested = explicit.is_some();
        let _span = tracing::debug_span!("resolve", call = model.name(), nested).entered();

        let call = self.effective(model, true)?;
        if let Some(value) = self.cached(model, &call) {
            return Ok(Outcome::Value(value));
        }

        let mut binding = bind(model, args, kwargs)?;
        let top = mem::take(&mut binding.supplied);
        let explicit = explicit.unwrap_or(&top);
        for (name, child) in &model.dependencies {
            if binding.is_explicit(explicit, name) {
                continue;
            }
            let value = self
                .solve(child, Vec::new(), binding.for_child(), Some(explicit))?
                .into_value(child)?;
            binding.kw.insert(name.clone(), value);
        }
        let bound = finish(model, binding)?;

        let value = match call.body() {
            Body::Function(body) => body(bound)?,
            Body::Generator(body) if nested => {
                self.stack.enter_generator(call.name_cow(), body(bound)?)?
            }
            Body::Generator(body) => return Ok(Outcome::Iter(body(bound)?)),
            Body::Future(_) | Body::Stream(_) => {
                return Err(ResolveError::AsyncOverride {
                    call: model.name_cow(),
                }
                .into());
            }
        };

        self.remember(model, &call, &value);
        Ok(Outcome::Value(value))
    }
}

impl<'p> Solver<'p, AsyncExitStack> {
    pub(crate) fn solve_async<'a>(
        &'a mut self,
        model: &'a CallModel,
        args: Vec<Dynamic>,
        kwargs: BTreeMap<String, Dynamic>,
        explicit: Option<&'a Explicit>,
    ) -> BoxFuture<'a, anyhow::Result<Outcome>>
    where
        'p: 'a,
    {
        let nested = explicit.is_some();
        let span = tracing::debug_span!("resolve", call = model.name(), nested);

        async move {
            let call = self.effective(model, false)?;
            if let Some(value) = self.cached(model, &call) {
                return Ok(Outcome::Value(value));
            }

            let mut binding = bind(model, args, kwargs)?;
            let top = mem::take(&mut binding.supplied);
            let explicit = explicit.unwrap_or(&top);
            for (name, child) in &model.dependencies {
                if binding.is_explicit(explicit, name) {
                    continue;
                }
                let value = self
                    .solve_async(child, Vec::new(), binding.for_child(), Some(explicit))
                    .await?
                    .into_value(child)?;
                binding.kw.insert(name.clone(), value);
            }
            let bound = finish(model, binding)?;

            let value = match call.body() {
                Body::Function(body) => body(bound)?,
                Body::Future(body) => body(bound).await?,
                Body::Generator(body) if nested => {
                    self.stack.enter_generator(call.name_cow(), body(bound)?)?
                }
                Body::Generator(body) => return Ok(Outcome::Iter(body(bound)?)),
                Body::Stream(body) if nested => {
                    self.stack.enter_stream(call.name_cow(), body(bound)).await?
                }
                Body::Stream(body) => return Ok(Outcome::Stream(body(bound))),
            };

            self.remember(model, &call, &value);
            Ok(Outcome::Value(value))
        }
        .instrument(span)
        .boxed()
    }
}

impl Outcome {
    /// Nested resolutions always produce a value; generators are entered
    /// into the scope before they get here.
    pub(crate) fn into_value(self, model: &CallModel) -> Result<Dynamic, ResolveError> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Iter(_) | Outcome::Stream(_) => Err(ResolveError::GeneratorDidNotYield {
                call: model.name_cow(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dynamic;
    use crate::depends::callable::{Depends, Param};

    fn int(value: &Dynamic) -> i64 {
        *value.downcast_ref::<i64>().unwrap()
    }

    #[test]
    fn test_keyword_values_win() {
        let g = Callable::named("g").function(|_| Ok(1_i64));
        let f = Callable::named("f")
            .param(Param::positional("a"))
            .param(Param::keyword("b").default(2_i64))
            .param(Param::keyword("dep").default_depends(Depends::on(&g)))
            .function(|_| Ok(()));
        let model = CallModel::build(&f).unwrap();

        let kwargs = BTreeMap::from([
            ("a".to_string(), dynamic(10_i64)),
            ("dep".to_string(), dynamic(30_i64)),
            ("unknown".to_string(), dynamic(0_i64)),
        ]);
        let binding = bind(&model, Vec::new(), kwargs).unwrap();

        assert_eq!(int(&binding.kw["a"]), 10);
        assert_eq!(int(&binding.kw["b"]), 2);
        assert_eq!(int(&binding.kw["dep"]), 30);
        assert!(binding.kw.contains_key("unknown"));
        // "b" only has its default
        assert_eq!(
            binding.supplied.iter().collect::<Vec<_>>(),
            vec!["a", "dep", "unknown"]
        );
    }

    #[test]
    fn test_surplus_positional_values() {
        let f = Callable::named("f")
            .param(Param::positional("a"))
            .param(Param::keyword("b"))
            .function(|_| Ok(()));
        let model = CallModel::build(&f).unwrap();

        let binding = bind(&model, vec![dynamic(1_i64), dynamic(2_i64)], BTreeMap::new()).unwrap();
        assert_eq!(int(&binding.kw["a"]), 1);
        assert_eq!(int(&binding.kw["b"]), 2);

        let args = vec![dynamic(1_i64), dynamic(2_i64), dynamic(3_i64)];
        assert!(matches!(
            bind(&model, args, BTreeMap::new()),
            Err(ResolveError::TooManyPositional {
                expected: 2,
                given: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_variadic_sinks() {
        let f = Callable::named("f")
            .param(Param::positional("a"))
            .param(Param::var_positional("args"))
            .param(Param::keyword("b").default(0_i64))
            .param(Param::var_keyword("kwargs"))
            .function(|_| Ok(()));
        let model = CallModel::build(&f).unwrap();

        let kwargs = BTreeMap::from([
            ("a".to_string(), dynamic(5_i64)),
            ("z".to_string(), dynamic(9_i64)),
        ]);
        let binding = bind(&model, vec![dynamic(1_i64), dynamic(2_i64)], kwargs).unwrap();
        // positional value replaces the keyword one of the same name
        assert_eq!(int(&binding.kw["a"]), 1);
        assert_eq!(binding.rest.len(), 1);
        assert_eq!(int(&binding.extra["z"]), 9);
        assert_eq!(int(&binding.kw["b"]), 0);

        let child = binding.for_child();
        assert!(child.contains_key("z"));

        let bound = finish(&model, binding).unwrap();
        assert_eq!(bound.rest().len(), 1);
        assert_eq!(bound.extra().len(), 1);
    }

    #[test]
    fn test_finish_checks_declared_types() {
        let f = Callable::named("f")
            .param(Param::positional("a").of::<i64>())
            .param(Param::positional("b"))
            .function(|_| Ok(()));
        let model = CallModel::build(&f).unwrap();

        let binding = bind(&model, vec![dynamic("text")], BTreeMap::new()).unwrap();
        assert!(matches!(
            finish(&model, binding),
            Err(ResolveError::TypeMismatch { .. })
        ));

        let binding = bind(&model, vec![dynamic(1_i64)], BTreeMap::new()).unwrap();
        assert_eq!(
            finish(&model, binding).unwrap_err(),
            ResolveError::MissingArgument {
                call: "f".into(),
                param: "b".into()
            }
        );
    }
}
