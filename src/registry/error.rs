use std::path::PathBuf;

use thiserror::Error;

pub type PullResult<T> = Result<T, PullError>;

/// Distribution failures. Nothing here is retried by the puller.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidImageFormat { reference: String, reason: String },

    #[error("Failed to fetch registry token: {0}")]
    TokenFetchFailed(String),

    #[error("Failed to fetch manifest: {0}")]
    ManifestFetchFailed(String),

    #[error("Image config carries no uncompressed-size annotation")]
    MissingUncompressedSizeAnnotation,

    #[error("Failed to download layer {digest}: {reason}")]
    LayerDownloadFailed { digest: String, reason: String },

    #[error("Failed to decompress {}: {reason}", file.display())]
    DecompressionFailed { file: PathBuf, reason: String },

    #[error("Failed to create {}: {reason}", path.display())]
    FileCreationFailed { path: PathBuf, reason: String },

    #[error("Failed to prepare reassembly target {}: {cause}", path.display())]
    ReassemblySetupFailed { path: PathBuf, cause: String },

    /// Part `n` (1-based) is absent when reassembly starts
    #[error("Image part {0} is missing")]
    MissingPart(u32),

    #[error("Reassembly failed: {0}")]
    ReassemblyFailed(String),

    #[error("Image '{0}' is not in the local image store")]
    ImageNotFound(String),

    #[error("Pull cancelled")]
    Cancelled,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PullError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PullError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn layer(digest: &str, reason: impl ToString) -> Self {
        PullError::LayerDownloadFailed {
            digest: digest.to_string(),
            reason: reason.to_string(),
        }
    }
}
