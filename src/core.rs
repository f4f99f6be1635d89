use std::any::{Any, TypeId, type_name};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ResolveError;

/// A type-erased, thread-safe container.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Erase a value into a [`Dynamic`].
pub fn dynamic<T: Send + Sync + 'static>(value: T) -> Dynamic {
    Arc::new(value)
}

/// The declared type of a parameter.
///
/// Captured once, when the parameter is declared, so nothing about types has
/// to be worked out later during resolution. An undeclared type is `Any`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    id: Option<TypeId>,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: Some(TypeId::of::<T>()),
            name: type_name::<T>(),
        }
    }

    pub const fn any() -> Self {
        Self {
            id: None,
            name: "Any",
        }
    }

    pub fn is_any(&self) -> bool {
        self.id.is_none()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether `value` holds an instance of this type. `Any` matches everything.
    pub fn matches(&self, value: &Dynamic) -> bool {
        match self.id {
            Some(id) => Any::type_id(&**value) == id,
            None => true,
        }
    }
}

impl Default for TypeTag {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

/// Values supplied by the caller of an injected function.
///
/// # Example
///
/// ```rust
/// use tsunagi::Arguments;
///
/// let args = Arguments::new().arg(1_i64).kwarg("name", String::from("x"));
/// assert_eq!(args.positional().len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct Arguments {
    pub(crate) args: Vec<Dynamic>,
    pub(crate) kwargs: BTreeMap<String, Dynamic>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.arg_dynamic(dynamic(value))
    }

    pub fn arg_dynamic(mut self, value: Dynamic) -> Self {
        self.args.push(value);
        self
    }

    pub fn kwarg<T: Send + Sync + 'static>(self, name: impl Into<String>, value: T) -> Self {
        self.kwarg_dynamic(name, dynamic(value))
    }

    pub fn kwarg_dynamic(mut self, name: impl Into<String>, value: Dynamic) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn positional(&self) -> &[Dynamic] {
        &self.args
    }

    pub fn keywords(&self) -> &BTreeMap<String, Dynamic> {
        &self.kwargs
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("args", &self.args.len())
            .field("kwargs", &self.kwargs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The fully bound arguments a callable body receives.
///
/// Every declared parameter that is not variadic is present by name; the
/// variable-positional tail and the variable-keyword map are exposed through
/// [`Bound::rest`] and [`Bound::extra`].
#[derive(Clone)]
pub struct Bound {
    pub(crate) call: Cow<'static, str>,
    pub(crate) values: BTreeMap<String, Dynamic>,
    pub(crate) rest: Vec<Dynamic>,
    pub(crate) extra: BTreeMap<String, Dynamic>,
}

impl Bound {
    pub(crate) fn new(call: Cow<'static, str>) -> Self {
        Self {
            call,
            values: BTreeMap::new(),
            rest: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Borrow the value bound to `name` as a `T`.
    pub fn get<T: 'static>(&self, name: &str) -> Result<&T, ResolveError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| ResolveError::MissingArgument {
                call: self.call.clone(),
                param: name.to_string(),
            })?;

        value
            .downcast_ref::<T>()
            .ok_or_else(|| ResolveError::TypeMismatch {
                call: self.call.clone(),
                param: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Clone the value bound to `name` out as a `T`.
    pub fn cloned<T: Clone + 'static>(&self, name: &str) -> Result<T, ResolveError> {
        self.get::<T>(name).cloned()
    }

    /// The raw, type-erased value bound to `name`.
    pub fn value(&self, name: &str) -> Option<&Dynamic> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Positional values collected by a variable-positional parameter.
    pub fn rest(&self) -> &[Dynamic] {
        &self.rest
    }

    /// Keyword values collected by a variable-keyword parameter.
    pub fn extra(&self) -> &BTreeMap<String, Dynamic> {
        &self.extra
    }

    /// Name of the callable these arguments were bound for.
    pub fn call_name(&self) -> &str {
        &self.call
    }
}

impl fmt::Debug for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("call", &self.call)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("rest", &self.rest.len())
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}
