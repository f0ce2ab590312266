//! Tracing initialisation for the allocator server.
//!
//! Log verbosity follows `RUST_LOG` via `EnvFilter`, defaulting to `info`.
//! HTTP request spans come from tower-http's `TraceLayer`, attached in the
//! entrypoint.

use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Handle for the registered tracing stack.
pub struct Telemetry {
    service: &'static str,
}

impl Telemetry {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }

    /// Installs the global subscriber: env-filtered, formatted to stdout.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        tracing::info!(service = self.service, "Tracing initialized");
        self
    }

    /// Layer producing one span per HTTP request.
    pub fn http_tracing(
        &self,
    ) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
    {
        TraceLayer::new_for_http()
    }
}
