use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize logging from the `[logging]` section.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    init_tracing_with_config(&level, config.json, true)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
            .wrap_err("Failed to install JSON tracing subscriber")?;
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install console tracing subscriber")?;
    }

    tracing::info!(
        "Waypoint logging initialized with level: {}, json: {}, spans: {}",
        level,
        json_format,
        include_spans
    );
    Ok(())
}

/// Span wrapping one inbound gateway request.
pub fn create_request_span(method: &str, path: &str, service: &str) -> tracing::Span {
    tracing::info_span!(
        "gateway_request",
        http.method = method,
        http.path = path,
        service = service,
        api.version = tracing::field::Empty,
        cache = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_with_config() {
        let result = init_tracing_with_config("debug", true, true);
        assert!(result.is_ok());

        // a second global subscriber is refused instead of panicking
        assert!(init_tracing_with_config("info", false, false).is_err());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let err = init_tracing_with_config("waypoint=loud", true, false).unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/api/users/1", "user-service");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "gateway_request");
        }
    }
}
