//! Error types for the specular-removal crate.

/// Errors that can occur while building the network or predicting highlights.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input is too large for the memory or compute available to the forward pass.
    ///
    /// Raised before the pass when the padded image exceeds the configured pixel
    /// budget, or afterwards when the tensor runtime reports an allocation failure.
    #[error("image too large ({width}x{height}), shrink it and try again: {detail}")]
    ResourceExhausted {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
        /// What ran out.
        detail: String,
    },

    /// The input image has a zero width or height.
    #[error("image has no pixels ({width}x{height})")]
    EmptyImage {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
    },

    /// The network channel table is inconsistent.
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    /// The tensor runtime failed (missing parameter, shape mismatch, device error).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred during image processing (load, save, encode).
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Whether this error means the input was too large to process.
    ///
    /// Callers typically abort or retry with a downscaled image when this is `true`.
    #[must_use]
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

/// Whether a runtime error reports an allocation failure on the compute device.
pub(crate) fn is_out_of_memory(err: &candle_core::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("out of memory") || msg.contains("out_of_memory")
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
