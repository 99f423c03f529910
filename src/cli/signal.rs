//! Ctrl+C handling for long-running commands

use std::future::Future;

/// Exit codes for CLI commands
#[repr(i32)]
pub enum ExitCode {
    /// Search or completion returned nothing
    NoResults = 2,
    /// Health check reported problems
    Unhealthy = 3,
    /// User interrupted with Ctrl+C
    Interrupted = 130,
}

/// Run `fut` to completion, or exit with code 130 on Ctrl+C.
///
/// Dropping the future releases any pooled connection it holds.
pub async fn interruptible<F: Future>(fut: F) -> F::Output {
    tokio::select! {
        out = fut => out,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted.");
            std::process::exit(ExitCode::Interrupted as i32);
        }
    }
}
