//! Dispatch-level error type.
//!
//! Everything here is reported before the parallel region starts: an `Err`
//! from a dispatch entry point means no worker thread ran and no output
//! buffer was touched. There are no runtime-recoverable errors in this
//! layer — a kernel failure mid-dispatch is a panic that tears the whole
//! parallel region down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvError {
    /// The job descriptor violates an invariant the drivers depend on
    /// (zero extent, non-dividing chunk factor, unsupported stride, ...).
    #[error("invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    /// A buffer is shorter than the span its layout addresses.
    #[error("{buffer} buffer too small: need {needed} elements, got {got}")]
    ShortBuffer {
        buffer: &'static str,
        needed: usize,
        got: usize,
    },
}

impl ConvError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ConvError::InvalidDescriptor {
            reason: reason.into(),
        }
    }
}
