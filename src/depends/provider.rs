use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use crate::depends::callable::{CallId, Callable};

static DEPENDENCY_PROVIDER: LazyLock<Arc<Provider>> = LazyLock::new(|| Arc::new(Provider::new()));

/// The process-wide provider used by [`inject`](crate::inject).
pub fn dependency_provider() -> Arc<Provider> {
    DEPENDENCY_PROVIDER.clone()
}

/// Registry of replacement producers, keyed by the identity of the producer
/// they stand in for.
///
/// The lock only keeps the map itself consistent. Changing overrides while
/// invocations that use this provider are running is up to the caller to
/// coordinate: an invocation may observe the registry before or after the
/// change, and different dependencies of one invocation may observe
/// different states.
#[derive(Default)]
pub struct Provider {
    overrides: RwLock<HashMap<CallId, Callable>>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `replacement` wherever `original` is a dependency, until cleared.
    pub fn override_with(&self, original: &Callable, replacement: &Callable) {
        tracing::debug!(
            original = original.name(),
            replacement = replacement.name(),
            "override"
        );
        self.overrides
            .write()
            .insert(original.id(), replacement.clone());
    }

    /// Install `replacement` until the returned guard is dropped. Whatever
    /// was registered for `original` before, including nothing, comes back.
    #[must_use = "the override is removed as soon as the guard is dropped"]
    pub fn scope(&self, original: &Callable, replacement: &Callable) -> OverrideScope<'_> {
        let previous = self
            .overrides
            .write()
            .insert(original.id(), replacement.clone());
        OverrideScope {
            provider: self,
            key: original.id(),
            previous,
        }
    }

    pub fn remove(&self, original: &Callable) -> Option<Callable> {
        self.overrides.write().remove(&original.id())
    }

    pub fn clear(&self) {
        self.overrides.write().clear();
    }

    pub fn get(&self, id: CallId) -> Option<Callable> {
        self.overrides.read().get(&id).cloned()
    }

    pub fn is_overridden(&self, original: &Callable) -> bool {
        self.overrides.read().contains_key(&original.id())
    }

    pub fn len(&self) -> usize {
        self.overrides.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.read().is_empty()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overrides = self.overrides.read();
        f.debug_map()
            .entries(overrides.iter().map(|(id, call)| (id, call.name())))
            .finish()
    }
}

/// Guard returned by [`Provider::scope`].
pub struct OverrideScope<'a> {
    provider: &'a Provider,
    key: CallId,
    previous: Option<Callable>,
}

impl Drop for OverrideScope<'_> {
    fn drop(&mut self) {
        let mut overrides = self.provider.overrides.write();
        match self.previous.take() {
            Some(previous) => overrides.insert(self.key, previous),
            None => overrides.remove(&self.key),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &'static str, value: i64) -> Callable {
        Callable::named(name).function(move |_| Ok(value))
    }

    fn current(provider: &Provider, key: &Callable) -> Option<String> {
        provider.get(key.id()).map(|call| call.name().to_string())
    }

    #[test]
    fn test_nested_scopes_restore_in_reverse() {
        let provider = Provider::new();
        let key = constant("k", 0);
        let x = constant("x", 1);
        let y = constant("y", 2);
        let z = constant("z", 3);

        {
            let _a = provider.scope(&key, &x);
            assert_eq!(current(&provider, &key).as_deref(), Some("x"));
            {
                let _b = provider.scope(&key, &y);
                assert_eq!(current(&provider, &key).as_deref(), Some("y"));
                {
                    let _c = provider.scope(&key, &z);
                    assert_eq!(current(&provider, &key).as_deref(), Some("z"));
                }
                assert_eq!(current(&provider, &key).as_deref(), Some("y"));
            }
            assert_eq!(current(&provider, &key).as_deref(), Some("x"));
        }
        assert!(!provider.is_overridden(&key));
    }

    #[test]
    fn test_scope_restores_permanent_override() {
        let provider = Provider::new();
        let key = constant("k", 0);
        let x = constant("x", 1);
        let y = constant("y", 2);

        provider.override_with(&key, &x);
        {
            let _scope = provider.scope(&key, &y);
            assert_eq!(current(&provider, &key).as_deref(), Some("y"));
        }
        assert_eq!(current(&provider, &key).as_deref(), Some("x"));

        provider.clear();
        assert!(provider.is_empty());
    }

    #[test]
    fn test_default_provider_is_shared() {
        assert!(Arc::ptr_eq(&dependency_provider(), &dependency_provider()));
    }
}
