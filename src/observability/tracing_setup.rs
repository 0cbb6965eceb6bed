//! Logging setup for the server binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set; otherwise only this crate
/// logs, at `LOG_LEVEL` (default "info"), with the HTTP stack held at
/// warn so tar transfers do not drown the log in per-chunk noise.
/// `LOG_FORMAT=json` switches to line-oriented JSON for log shipping; the
/// default is a compact human format.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives()));
    let registry = tracing_subscriber::registry().with(filter);

    if json_requested() {
        registry
            .with(fmt::layer().json().flatten_event(true))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .init();
    }
}

fn json_requested() -> bool {
    std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn default_directives() -> String {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    format!("bucketstore={level},tower=warn,hyper=warn,reqwest=warn")
}
