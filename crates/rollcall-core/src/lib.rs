//! rollcall-core — Face enrollment and attendance recognition engine.
//!
//! Everything in this crate is synchronous and free of I/O. The face
//! detector / embedding network is an external [`Extractor`]; this crate
//! decides which frames to keep, folds them into one identity vector, and
//! matches live probes against a roster-scoped gallery.

pub mod calibration;
pub mod codec;
pub mod enrollment;
pub mod extractor;
pub mod frame;
pub mod matcher;
pub mod pose;
pub mod session;
pub mod types;

pub use enrollment::{EnrollmentBatch, EnrollmentError, EnrollmentSession, SampleOutcome};
pub use extractor::{Extractor, ExtractorError};
pub use matcher::{CosineMatcher, Gallery, Match, MatchError, Matcher};
pub use pose::{CapturePose, CaptureProtocol, Pose, PoseConfig, PoseEstimator, PoseReading};
pub use session::{AttendanceReport, AttendanceSession, SessionError, SessionStatus};
pub use types::{BoundingBox, Detection, Embedding, IdentityEmbedding, IdentityId};
