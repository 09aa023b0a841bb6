//! Bootstrap utilities for labcell binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Retries after the first failed attempt to open a device link.
pub const LINK_CONNECT_RETRIES: usize = 20;

/// Delays for reopening a device link: 250ms doubling up to 8s, jittered.
fn link_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(8))
        .with_max_times(LINK_CONNECT_RETRIES)
        .with_jitter()
}

/// Initialize tracing with the LABCELL_LOG environment variable.
///
/// Defaults to "info" level if LABCELL_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Open a device link, retrying with [`link_backoff`] and warning on each
/// failed attempt. Returns the last error after [`LINK_CONNECT_RETRIES`].
pub async fn connect_with_retry<T, E, F, Fut>(link_name: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = connect
        .retry(link_backoff())
        .notify(|err: &E, delay: Duration| {
            warn!(link = %link_name, error = %err, ?delay, "Connection failed, retrying");
        })
        .await;

    match &result {
        Ok(_) => info!(link = %link_name, "Connected"),
        Err(e) => error!(link = %link_name, error = %e, "Giving up on connection"),
    }
    result
}
