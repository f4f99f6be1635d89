//! Dependency injection for plain closures.
//!
//! A [`Callable`] declares its parameters; some of them are marked with
//! [`Depends`] and get their value from another callable. Wrapping it with
//! [`inject`] builds a [`CallModel`] once, and every call resolves the tree:
//!
//! * explicit arguments always win over injected values,
//! * a producer used by several parameters runs once per call (unless
//!   `use_cache(false)`),
//! * generator producers hand out their first item and are drained when the
//!   call is over, last opened first closed,
//! * a [`Provider`] can swap producers for replacements, e.g. in tests.

mod callable;
pub mod generator;
mod inject;
mod model;
mod provider;
mod scope;
mod signature;
mod solve;

pub use crate::depends::callable::{
    CallId, CallKind, Callable, CallableDef, Depends, Generator, Param, ParamKind, ValueStream,
};
pub use crate::depends::inject::{Inject, Injected, InjectedIter, inject, inject_with};
pub use crate::depends::model::{CallModel, ParamField};
pub use crate::depends::provider::{OverrideScope, Provider, dependency_provider};
pub use crate::depends::scope::{AsyncExitStack, ExitStack};
pub use crate::depends::signature::{Origin, ParameterSpec, introspect};
