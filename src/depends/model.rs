use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::core::{Dynamic, TypeTag};
use crate::depends::callable::{CallId, CallKind, Callable, ParamKind};
use crate::depends::signature::{Origin, introspect};
use crate::error::BuildError;

/// A plain parameter of a [`CallModel`], one that the caller fills in.
#[derive(Clone)]
pub struct ParamField {
    pub ty: TypeTag,
    pub default: Option<Dynamic>,
}

impl fmt::Debug for ParamField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamField")
            .field("ty", &self.ty)
            .field("default", &self.default.is_some())
            .finish()
    }
}

/// The resolution plan of a callable: its plain parameters, how each of them
/// binds, and the models of everything it depends on.
///
/// Models are immutable once built and are shared between parents through
/// [`Arc`], so the same tree can drive any number of concurrent resolutions.
#[derive(Clone)]
pub struct CallModel {
    pub(crate) call: Callable,
    pub(crate) use_cache: bool,
    /// Plain parameters, by name.
    pub(crate) params: BTreeMap<String, ParamField>,
    /// Dependency parameters in declaration order.
    pub(crate) dependencies: Vec<(String, Arc<CallModel>)>,
    /// Plain names that bind by position, in declaration order.
    pub(crate) positional: Vec<String>,
    /// Names that bind by keyword only, dependencies included.
    pub(crate) keyword: Vec<String>,
    pub(crate) var_positional: Option<String>,
    pub(crate) var_keyword: Option<String>,
}

impl CallModel {
    /// Build the model of `call`, and of its whole dependency tree.
    ///
    /// Any combination of sync and async members is accepted. To reject async
    /// members up front use [`CallModel::build_with`].
    pub fn build(call: &Callable) -> Result<Self, BuildError> {
        Self::build_with(call, true, None)
    }

    /// Build a model with an explicit cache flag and sync requirement.
    ///
    /// With `is_sync` set to `Some(true)` every async member of the tree is a
    /// [`BuildError::AsyncInSync`]. With `None` it is inferred from `call`:
    /// a sync root will not accept async dependencies.
    pub fn build_with(
        call: &Callable,
        use_cache: bool,
        is_sync: Option<bool>,
    ) -> Result<Self, BuildError> {
        let is_sync = is_sync.unwrap_or(!call.kind().is_async());
        if is_sync && call.kind().is_async() {
            return Err(BuildError::AsyncInSync {
                call: call.name_cow(),
            });
        }

        let mut model = Self {
            call: call.clone(),
            use_cache,
            params: BTreeMap::new(),
            dependencies: Vec::new(),
            positional: Vec::new(),
            keyword: Vec::new(),
            var_positional: None,
            var_keyword: None,
        };

        for spec in introspect(call)? {
            match (&spec.origin, spec.kind) {
                (Origin::Dependency(depends), _) => {
                    let child = Self::build_with(&depends.producer, depends.use_cache, Some(is_sync))?;
                    model.keyword.push(spec.name.clone());
                    model.dependencies.push((spec.name, Arc::new(child)));
                }
                (Origin::Literal, ParamKind::VarPositional) => {
                    model.var_positional = Some(spec.name);
                }
                (Origin::Literal, ParamKind::VarKeyword) => {
                    model.var_keyword = Some(spec.name);
                }
                (Origin::Literal, kind) => {
                    if kind == ParamKind::Positional {
                        model.positional.push(spec.name.clone());
                    } else {
                        model.keyword.push(spec.name.clone());
                    }
                    model.params.insert(
                        spec.name,
                        ParamField {
                            ty: spec.ty,
                            default: spec.default,
                        },
                    );
                }
            }
        }

        Ok(model)
    }

    pub fn callable(&self) -> &Callable {
        &self.call
    }

    pub fn id(&self) -> CallId {
        self.call.id()
    }

    pub fn name(&self) -> &str {
        self.call.name()
    }

    pub(crate) fn name_cow(&self) -> Cow<'static, str> {
        self.call.name_cow()
    }

    pub fn kind(&self) -> CallKind {
        self.call.kind()
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    pub fn params(&self) -> &BTreeMap<String, ParamField> {
        &self.params
    }

    pub fn dependencies(&self) -> impl Iterator<Item = (&str, &CallModel)> {
        self.dependencies
            .iter()
            .map(|(name, model)| (name.as_str(), model.as_ref()))
    }

    /// Every model reachable from this one, dependencies before dependants,
    /// each callable once. The root itself is not included.
    pub fn sorted_dependencies(&self) -> Vec<&CallModel> {
        fn visit<'a>(model: &'a CallModel, seen: &mut HashSet<CallId>, out: &mut Vec<&'a CallModel>) {
            for (_, child) in &model.dependencies {
                if seen.insert(child.id()) {
                    visit(child, seen, out);
                    out.push(child);
                }
            }
        }

        let mut seen = HashSet::from([self.id()]);
        let mut out = Vec::new();
        visit(self, &mut seen, &mut out);
        out
    }

    /// Plain parameters of this model and of every model it depends on,
    /// first declaration wins.
    pub fn flat_params(&self) -> BTreeMap<String, ParamField> {
        let mut flat = self.params.clone();
        for model in self.sorted_dependencies() {
            for (name, field) in &model.params {
                flat.entry(name.clone()).or_insert_with(|| field.clone());
            }
        }
        flat
    }
}

impl fmt::Debug for CallModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallModel")
            .field("call", &self.call.name())
            .field("kind", &self.kind())
            .field("use_cache", &self.use_cache)
            .field("params", &self.params)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
