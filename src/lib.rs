//! # fanout-fetch
//!
//! Resilient fetching of large, hierarchical sets of remote resources.
//!
//! ## Design Philosophy
//!
//! fanout-fetch is designed to be:
//! - **Tolerant of flaky networks** - Bounded retry with exponential backoff and full jitter
//! - **Free of duplicate work** - Concurrent requests for one resource share a single fetch
//! - **Tolerant of partial failure** - One failing item never aborts unrelated work
//! - **Honest about failure** - Every failure ends up in a navigable [`Fault`] tree
//!
//! ## Quick Start
//!
//! ```no_run
//! use fanout_fetch::{Config, FanOut};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.run.manifest_url = "https://data.example.com/sets.json".to_string();
//!     config.run.group_manifest_base = "https://data.example.com/sets/".to_string();
//!     config.validate()?;
//!
//!     let fan_out = FanOut::from_config(config)?;
//!     let report = fan_out.run(&CancellationToken::new()).await;
//!
//!     if let Some(fault) = &report.final_fault {
//!         eprintln!("{}", fault.report());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Resilient request execution
pub mod executor;
/// Fan-out orchestration (batch, group, leaf)
pub mod fanout;
/// Failure trees and aggregation
pub mod fault;
/// Process-wide request concurrency cap
pub mod limiter;
/// Single-flight memoizing loader
pub mod loader;
/// Retry logic with exponential backoff
pub mod retry;
/// HTTP transport seam
pub mod transport;

// Re-export commonly used types
pub use config::{Config, FetchConfig, RetryOverrides, RetryPolicy, RunConfig};
pub use error::{Error, Result};
pub use executor::{RequestExecutor, RequestOptions};
pub use fanout::{
    DirectorySink, DiscardSink, FanOut, GroupRef, LeafReceipt, LeafRef, PayloadSink, RunReport,
};
pub use fault::{Fault, FaultKind, TraceId, assert_all};
pub use limiter::RequestLimiter;
pub use loader::Loader;
pub use retry::{AttemptOutcome, IsRetryable};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives a termination signal.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Returns early, without cancelling, if `token` is cancelled by someone else.
///
/// # Example
///
/// ```no_run
/// use fanout_fetch::cancel_on_shutdown;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let cancel = CancellationToken::new();
///     tokio::spawn(cancel_on_shutdown(cancel.clone()));
/// }
/// ```
pub async fn cancel_on_shutdown(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = wait_for_signal() => {
            tracing::warn!("Shutdown requested, cancelling in-flight requests");
            token.cancel();
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
///
/// A source whose listener cannot be installed never fires.
async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_on_shutdown_returns_when_token_is_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let watcher = tokio::spawn(cancel_on_shutdown(token.clone()));

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn signal_wait_stays_pending_without_a_signal() {
        let waited = tokio::time::timeout(Duration::from_millis(50), wait_for_signal()).await;
        assert!(waited.is_err(), "no signal was sent");
    }
}
