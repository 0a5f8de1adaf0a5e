//! Graphics error types.

use thiserror::Error;

/// Errors that can occur in the graphics system.
///
/// Arena exhaustion is never reported here: pools recover from it by
/// growing. Everything in this enum comes either from the underlying API or
/// from invalid arguments, and is returned to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// Failed to create a resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// The device could not provide the memory a pool needed to grow.
    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// Queue submission was rejected.
    #[error("queue submission failed: {0}")]
    SubmitFailed(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}
