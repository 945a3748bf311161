//! Logging during tests.

use tokio::runtime::RuntimeFlavor;
use tracing_subscriber::{
    EnvFilter,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "orbit_oplog=trace,orbit_db=trace,warn";

/// Configures logging for the current test, **single-threaded runtime only**.
///
/// Logs are captured by the test harness and only shown for failing tests. `RUST_LOG`
/// replaces the default filter, which traces the orbit crates.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn test_something() {
///     let _guard = orbit_test::logging::setup();
///     assert!(true);
/// }
/// ```
#[must_use = "The tracing guard must only be dropped at the end of the test"]
pub fn setup() -> tracing::subscriber::DefaultGuard {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        match handle.runtime_flavor() {
            RuntimeFlavor::CurrentThread => (),
            RuntimeFlavor::MultiThread => {
                panic!("setup() does not work in a multi-threaded tokio runtime");
            }
            _ => panic!("unknown runtime flavour"),
        }
    }
    testing_subscriber().set_default()
}

/// Returns a [`tracing::Subscriber`] configured for our tests.
///
/// To use this in a multi-threaded runtime, install it for the whole test instead:
///
/// ```ignore
/// use tracing::instrument::WithSubscriber;
///
/// #[tokio::test(flavor = "multi_thread")]
/// async fn test_something() {
///     async move {}.with_subscriber(orbit_test::logging::testing_subscriber()).await
/// }
/// ```
pub fn testing_subscriber() -> impl tracing::Subscriber {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .event_format(tracing_subscriber::fmt::format().with_line_number(true))
            .with_test_writer()
            .with_filter(filter),
    )
}
