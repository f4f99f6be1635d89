//! Turns the parameters declared on a [`Callable`] into a normalized
//! signature, deciding once where each parameter's value comes from.

use std::fmt;

use crate::core::{Dynamic, TypeTag};
use crate::depends::callable::{Callable, DefaultValue, Depends, ParamKind};
use crate::error::BuildError;

/// Where the value of a parameter comes from.
#[derive(Clone, Debug)]
pub enum Origin {
    /// Passed by the caller, or taken from the default.
    Literal,
    /// Produced by another callable.
    Dependency(Depends),
}

/// A normalized parameter. Immutable once built.
#[derive(Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub ty: TypeTag,
    pub default: Option<Dynamic>,
    pub kind: ParamKind,
    pub origin: Origin,
}

impl ParameterSpec {
    pub fn is_dependency(&self) -> bool {
        matches!(self.origin, Origin::Dependency(_))
    }
}

impl fmt::Debug for ParameterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSpec")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("default", &self.default.is_some())
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Produce the ordered parameter list of `callable`.
pub fn introspect(callable: &Callable) -> Result<Vec<ParameterSpec>, BuildError> {
    let call = callable.name_cow();
    let mut specs: Vec<ParameterSpec> = Vec::with_capacity(callable.params().len());
    let mut last_kind = ParamKind::Positional;

    for param in callable.params() {
        if specs.iter().any(|spec| spec.name == param.name) {
            return Err(BuildError::DuplicateParam {
                call,
                param: param.name.clone(),
            });
        }

        // positional, *args, keyword-only, **kwargs; at most one of each variadic
        let repeated_variadic = param.kind == last_kind
            && matches!(param.kind, ParamKind::VarPositional | ParamKind::VarKeyword);
        if param.kind < last_kind || repeated_variadic {
            return Err(BuildError::VariadicOrder {
                call,
                param: param.name.clone(),
            });
        }
        last_kind = param.kind;

        let mut marker = match param.annotations.as_slice() {
            [] => None,
            [depends] => Some(depends.clone()),
            _ => {
                return Err(BuildError::DuplicateMarker {
                    call,
                    param: param.name.clone(),
                });
            }
        };

        let default = match &param.default {
            Some(DefaultValue::Depends(depends)) => {
                if marker.is_some() {
                    return Err(BuildError::AnnotatedAndDefault {
                        call,
                        param: param.name.clone(),
                    });
                }
                marker = Some(depends.clone());
                None
            }
            Some(DefaultValue::Value(value)) => Some(value.clone()),
            None => None,
        };

        let variadic = matches!(param.kind, ParamKind::VarPositional | ParamKind::VarKeyword);
        if variadic && marker.is_some() {
            return Err(BuildError::VariadicDependency {
                call,
                param: param.name.clone(),
            });
        }

        specs.push(ParameterSpec {
            name: param.name.clone(),
            ty: param.ty,
            default,
            kind: param.kind,
            origin: match marker {
                Some(depends) => Origin::Dependency(depends),
                None => Origin::Literal,
            },
        });
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depends::callable::Param;

    fn producer() -> Callable {
        Callable::named("g").function(|_| Ok(42_i64))
    }

    #[test]
    fn test_marker_from_default_or_annotation() {
        let g = producer();
        let f = Callable::named("f")
            .param(Param::positional("a").of::<i64>().default_depends(Depends::on(&g)))
            .param(Param::keyword("b").annotate(Depends::on(&g).use_cache(false)))
            .param(Param::keyword("c").default(3_i64))
            .function(|_| Ok(()));

        let specs = introspect(&f).unwrap();
        assert_eq!(specs.len(), 3);

        assert!(specs[0].is_dependency());
        assert!(specs[0].default.is_none());
        assert_eq!(specs[0].ty, TypeTag::of::<i64>());

        match &specs[1].origin {
            Origin::Dependency(depends) => {
                assert_eq!(depends.producer(), &g);
                assert!(!depends.is_cached());
            }
            Origin::Literal => panic!("expected a dependency"),
        }

        assert!(!specs[2].is_dependency());
        assert!(specs[2].default.is_some());
        assert!(specs[2].ty.is_any());
    }

    #[test]
    fn test_annotation_and_default_conflict() {
        let g = producer();
        let f = Callable::named("f")
            .param(
                Param::positional("x")
                    .annotate(Depends::on(&g))
                    .default_depends(Depends::on(&g)),
            )
            .function(|_| Ok(()));

        let err = introspect(&f).unwrap_err();
        assert_eq!(
            err,
            BuildError::AnnotatedAndDefault {
                call: "f".into(),
                param: "x".into()
            }
        );
        assert!(err.to_string().contains("`x`"));
    }

    #[test]
    fn test_two_annotations_conflict() {
        let g = producer();
        let f = Callable::named("f")
            .param(
                Param::positional("x")
                    .annotate(Depends::on(&g))
                    .annotate(Depends::on(&g)),
            )
            .function(|_| Ok(()));

        assert!(matches!(
            introspect(&f),
            Err(BuildError::DuplicateMarker { .. })
        ));
    }

    #[test]
    fn test_parameter_order_is_checked() {
        let f = Callable::named("f")
            .param(Param::keyword("k"))
            .param(Param::positional("p"))
            .function(|_| Ok(()));
        assert!(matches!(
            introspect(&f),
            Err(BuildError::VariadicOrder { .. })
        ));

        let f = Callable::named("f")
            .param(Param::var_keyword("a"))
            .param(Param::var_keyword("b"))
            .function(|_| Ok(()));
        assert!(matches!(
            introspect(&f),
            Err(BuildError::VariadicOrder { .. })
        ));

        let f = Callable::named("f")
            .param(Param::positional("a"))
            .param(Param::positional("a"))
            .function(|_| Ok(()));
        assert!(matches!(
            introspect(&f),
            Err(BuildError::DuplicateParam { .. })
        ));
    }
}
