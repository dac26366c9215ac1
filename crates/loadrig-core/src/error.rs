use thiserror::Error;

/// Fatal pre-run failure. Setup never produced a shared context, so no VU
/// starts and teardown is skipped.
#[derive(Debug, Error)]
#[error("setup failed: {0}")]
pub struct SetupError(#[from] pub anyhow::Error);

impl SetupError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(anyhow::anyhow!("{message}"))
    }
}

/// Transport-level failure. Recorded as a failed-request sample; never
/// propagated past the iteration that issued the request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
}

/// Failure of a single iteration. Caught by the iteration runner and turned
/// into metric samples; the owning VU loop keeps going.
#[derive(Debug, Error)]
pub enum IterationError {
    /// A scripted assertion failed hard enough for the scenario to bail out
    /// of the current iteration.
    #[error("check failed: {0}")]
    CheckFailed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
