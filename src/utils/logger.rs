use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// An explicit `level` applies to this crate and the root; without one
/// `RUST_LOG` is honoured. russh stays at warn either way.
pub fn init(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(directives(level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directives_default())),
    };

    // A second init (tests, embedders) keeps the first subscriber
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true))
        .try_init();

    if installed.is_ok() {
        tracing::debug!("Logging initialized");
    }
}

fn directives(level: &str) -> String {
    format!("{level},ssh_console={level},russh=warn")
}

fn directives_default() -> String {
    "info,ssh_console=debug,russh=warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_covers_crate() {
        assert_eq!(directives("trace"), "trace,ssh_console=trace,russh=warn");
    }
}
