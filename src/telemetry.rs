//! Structured logging setup
//!
//! ```text
//! tracing macros → EnvFilter → fmt layer (human) | json layer (log shippers)
//! ```
//!
//! `RUST_LOG` overrides the configured filter when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when neither `RUST_LOG` nor the config set one
pub const DEFAULT_FILTER: &str = "info,bhyvisor=debug";

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(
    json: bool,
    default_filter: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fallback = if default_filter.is_empty() {
        DEFAULT_FILTER
    } else {
        default_filter
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(fallback))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()?;
    }

    tracing::info!(json, filter = fallback, "logging initialized");
    Ok(())
}
