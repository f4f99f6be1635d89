#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod context;
mod core;
pub mod depends;
mod error;
pub mod graph;
pub mod usage;
mod utils;

pub use crate::core::{Arguments, Bound, Dynamic, TypeTag, dynamic};
pub use crate::depends::generator;
pub use crate::depends::{
    CallId, CallKind, CallModel, Callable, CallableDef, Depends, Inject, Injected, InjectedIter,
    Param, ParamKind, Provider, dependency_provider, inject, inject_with,
};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
