//! Tracing initialisation shared by the skillgate binaries.
//!
//! The filter comes from `SKILLGATE_LOG` (standard `EnvFilter` syntax) and
//! falls back to the supplied level. Logs go to stderr so command output on
//! stdout stays machine-readable. Only the first call takes effect.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "SKILLGATE_LOG";

/// Install the global subscriber, as newline-delimited JSON when `json`.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    // A subscriber installed earlier (e.g. by a test harness) wins.
    result.ok();
}
