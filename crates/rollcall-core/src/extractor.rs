//! Boundary to the face detection / embedding network.
//!
//! The network itself lives outside this crate. An implementation takes one
//! encoded image and returns every face it found, each with a bounding box,
//! landmarks and an embedding vector.

use crate::types::Detection;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractorError {
    /// Malformed image or a fault inside the backend.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    /// The backend could not be reached at all (process or network failure).
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extraction timed out after {0} ms")]
    Timeout(u64),
}

/// Face detector + embedding extractor.
///
/// An empty result is "no face detected" and is not an error. Implementations
/// are blocking; the daemon runs them on a dedicated thread.
pub trait Extractor: Send {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Detection>, ExtractorError>;
}

impl<F> Extractor for F
where
    F: FnMut(&[u8]) -> Result<Vec<Detection>, ExtractorError> + Send,
{
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Detection>, ExtractorError> {
        self(image)
    }
}
