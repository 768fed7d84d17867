use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install a stderr subscriber for binaries built on this crate.
///
/// `RUST_LOG` wins when set. Otherwise `PROCBRIDGE_LOG` picks the level for
/// this crate, falling back to `default_level`. `LOG_FORMAT=json` switches to
/// JSON lines. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("PROCBRIDGE_LOG").ok();
        EnvFilter::new(filter_directives(level.as_deref(), default_level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    // stdout belongs to the protocol in a worker, so logs always go to stderr.
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn filter_directives(level: Option<&str>, default_level: &str) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        Some("off") => "off",
        _ => default_level,
    };
    format!("procbridge={level},procbridge_echo={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(
            filter_directives(Some("warning"), "info"),
            "procbridge=warn,procbridge_echo=warn"
        );
        assert_eq!(
            filter_directives(Some("nonsense"), "info"),
            "procbridge=info,procbridge_echo=info"
        );
        assert_eq!(
            filter_directives(None, "error"),
            "procbridge=error,procbridge_echo=error"
        );
    }
}
