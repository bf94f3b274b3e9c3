use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable colored output (for interactive CLI use).
    Human,
    /// Structured JSON output (for the cke daemon and rivers).
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Call once at program startup. Respects `RUST_LOG` env var for filtering.
/// Default filter: `cke=info,warn` (info+ from cke, warnings from dependencies).
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cke=info,warn"));

    match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .compact();
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .try_init();
        }
        LogFormat::Json => {
            let subscriber = fmt::layer().json().with_target(true);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_equality() {
        assert_eq!(LogFormat::Human, LogFormat::Human);
        assert_ne!(LogFormat::Human, LogFormat::Json);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(LogFormat::Human);
        init(LogFormat::Json);
    }
}
