use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the embedding extractor.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Configuration is inconsistent (zero image size, crop larger than the image, ...).
    #[error("invalid extractor config: {0}")]
    InvalidConfig(String),
    /// The requested image directory does not exist.
    #[error("image directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    /// The directory exists but holds no JPEG/PNG files.
    #[error("no image files found in {}", .0.display())]
    NoImages(PathBuf),
    /// Every candidate image failed to decode.
    #[error("no images were successfully processed ({attempted} attempted)")]
    NoImagesDecoded { attempted: usize },
    /// A single image could not be read or decoded.
    #[error("failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
    /// Low-level IO failures while touching the filesystem.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Backbone construction or forward pass failed.
    #[error("model failure: {0}")]
    Model(#[from] candle_core::Error),
    /// Fine-tuning diverged or was given unusable data.
    #[error("fine-tuning failed: {0}")]
    Training(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_directory_not_found() {
        let err = EmbeddingError::DirectoryNotFound(PathBuf::from("/no/such/dir"));
        assert!(err.to_string().contains("image directory not found"));
        assert!(err.to_string().contains("/no/such/dir"));
    }

    #[test]
    fn error_no_images_decoded() {
        let err = EmbeddingError::NoImagesDecoded { attempted: 4 };
        assert!(err.to_string().contains("4 attempted"));
    }

    #[test]
    fn error_decode() {
        let err = EmbeddingError::Decode {
            path: "broken.jpg".into(),
            reason: "unexpected EOF".into(),
        };
        assert!(err.to_string().contains("broken.jpg"));
        assert!(err.to_string().contains("unexpected EOF"));
    }

    #[test]
    fn error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: EmbeddingError = io_err.into();
        assert!(err.to_string().contains("io error"));
    }

    #[test]
    fn error_debug_formatting() {
        let err = EmbeddingError::InvalidConfig("image_size must be positive".into());
        let debug_str = format!("{err:?}");
        assert!(debug_str.contains("InvalidConfig"));
    }
}
