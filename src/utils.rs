use std::any::type_name;

/// Name of `T` without module path or generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = match full.find('<') {
        Some(index) => &full[..index],
        None => full,
    };
    match base.rfind("::") {
        Some(index) => &base[index + 2..],
        None => base,
    }
}

/// Join with commas, and "and" before the last item.
pub(crate) fn comma_and(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => only.clone(),
        [head @ .., last] => format!("{}, and {}", head.join(", "), last),
    }
}

/// Install a `tracing` subscriber printing to stderr, filtered by
/// `RUST_LOG` (default `info`).
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;
    #[allow(dead_code)]
    struct Wrapper<T>(T);

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Plain>(), "Plain");
        assert_eq!(short_type_name::<Wrapper<Plain>>(), "Wrapper");
        assert_eq!(short_type_name::<i64>(), "i64");
    }

    #[test]
    fn test_comma_and() {
        let items = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(comma_and(&items(&["a"])), "a");
        assert_eq!(comma_and(&items(&["a", "b"])), "a, and b");
        assert_eq!(comma_and(&items(&["a", "b", "c"])), "a, b, and c");
    }
}
