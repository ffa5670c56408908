use thiserror::Error;

/// Failures surfaced by library, slideshow and coordinator operations.
///
/// Every variant is reported to the caller as a structured per-item result;
/// none of them aborts a whole request.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request payload or unsafe name; rejected before any mutation.
    #[error("{0}")]
    Validation(String),

    /// The candidate's longer side is below the configured floor.
    #[error("resolution too low: long side is {long_side}px, at least {minimum}px required")]
    ResolutionTooLow { long_side: u32, minimum: u32 },

    /// Decoding, orienting, resizing or encoding failed.
    #[error("image transform failed: {0:#}")]
    Transform(anyhow::Error),

    /// Writing or removing an asset failed.
    #[error("asset storage failed: {0:#}")]
    Storage(anyhow::Error),

    /// The persisted order could not be written.
    #[error("persisting image order failed: {0:#}")]
    Persistence(anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
