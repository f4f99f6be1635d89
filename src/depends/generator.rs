//! Helpers for the usual shape of a generator dependency: acquire a
//! resource, hand it out, release it when the invocation is over.

use futures::Stream;
use std::future::Future;

/// Yields `value` once, then runs `release`.
///
/// `release` runs exactly once: on the pull after the value, or when the
/// iterator is dropped before that.
///
/// ```rust
/// use tsunagi::{Callable, generator};
///
/// let session = Callable::named("session").generator(|_| {
///     let id = 7_u32;
///     Ok(generator::scoped(id, move || {
///         println!("closing {id}");
///         Ok(())
///     }))
/// });
/// ```
pub fn scoped<T, F>(value: T, release: F) -> Scoped<T, F>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    Scoped {
        value: Some(value),
        release: Some(release),
    }
}

pub struct Scoped<T, F>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    value: Option<T>,
    release: Option<F>,
}

impl<T, F> Iterator for Scoped<T, F>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    type Item = anyhow::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(value) = self.value.take() {
            return Some(Ok(value));
        }
        let release = self.release.take()?;
        release().err().map(Err)
    }
}

impl<T, F> Drop for Scoped<T, F>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    fn drop(&mut self) {
        if let Some(release) = self.release.take()
            && let Err(err) = release()
        {
            tracing::warn!("release failed during drop: {err:#}");
        }
    }
}

/// Async counterpart of [`scoped`]. The release future runs once the stream
/// is polled past the value, which every scope does when it closes.
pub fn scoped_async<T, R>(value: T, release: R) -> impl Stream<Item = anyhow::Result<T>>
where
    R: Future<Output = anyhow::Result<()>>,
{
    async_stream::stream! {
        yield Ok(value);
        if let Err(err) = release.await {
            yield Err(err);
        }
    }
}
