//! Multi-pose enrollment: collect posed samples, fold them into one vector.
//!
//! Every accepted sample counts equally; there is no weighting by pose or
//! detector confidence. The mean is taken in f64 and the result is
//! L2-normalized, so the stored vector is always unit length.

use crate::pose::{
    CapturePose, CaptureProtocol, CaptureStage, Guidance, Pose, PoseConfig, PoseEstimator,
};
use crate::types::{Detection, Embedding, IdentityEmbedding, IdentityId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentError {
    #[error("no samples to aggregate")]
    NoSamples,
    #[error("sample {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("invalid embedding data: averaged vector has zero or non-finite norm")]
    DegenerateEmbedding,
    #[error("incomplete poses: missing {}", pose_list(.missing))]
    IncompletePoses { missing: Vec<CapturePose> },
    #[error("incomplete batch: {captured} of {target} samples captured")]
    IncompleteBatch { captured: usize, target: usize },
    #[error("batch already holds {target} samples")]
    BatchFull { target: usize },
}

fn pose_list(poses: &[CapturePose]) -> String {
    poses.iter().map(|p| p.label()).collect::<Vec<_>>().join(", ")
}

/// Element-wise mean of `embeddings`, normalized to unit length.
pub fn aggregate<'a, I>(embeddings: I) -> Result<Embedding, EnrollmentError>
where
    I: IntoIterator<Item = &'a Embedding>,
{
    let mut iter = embeddings.into_iter();
    let first = iter.next().ok_or(EnrollmentError::NoSamples)?;
    let dim = first.dim();
    if dim == 0 {
        return Err(EnrollmentError::DegenerateEmbedding);
    }

    let mut sum: Vec<f64> = first.values.iter().map(|&v| v as f64).collect();
    let mut count = 1usize;

    for (i, e) in iter.enumerate() {
        if e.dim() != dim {
            return Err(EnrollmentError::DimensionMismatch {
                index: i + 1,
                expected: dim,
                actual: e.dim(),
            });
        }
        for (acc, &v) in sum.iter_mut().zip(e.values.iter()) {
            *acc += v as f64;
        }
        count += 1;
    }

    let n = count as f64;
    let mean: Vec<f64> = sum.into_iter().map(|s| s / n).collect();
    let norm = mean.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EnrollmentError::DegenerateEmbedding);
    }

    Ok(Embedding {
        values: mean.into_iter().map(|v| (v / norm) as f32).collect(),
        model_version: first.model_version.clone(),
    })
}

/// One captured frame's embedding. The image itself is not retained.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pub embedding: Embedding,
    pub pose: CapturePose,
    pub captured_at: DateTime<Utc>,
}

/// Samples for one enrollment attempt.
#[derive(Debug, Clone)]
pub struct EnrollmentBatch {
    samples: Vec<FaceSample>,
    target: usize,
}

impl EnrollmentBatch {
    pub fn new(target: usize) -> Self {
        Self {
            samples: Vec::with_capacity(target),
            target,
        }
    }

    pub fn push(&mut self, sample: FaceSample) -> Result<(), EnrollmentError> {
        if self.samples.len() >= self.target {
            return Err(EnrollmentError::BatchFull {
                target: self.target,
            });
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn count(&self, pose: CapturePose) -> usize {
        self.samples.iter().filter(|s| s.pose == pose).count()
    }

    pub fn missing_poses(&self) -> Vec<CapturePose> {
        CapturePose::ALL
            .into_iter()
            .filter(|&p| self.count(p) == 0)
            .collect()
    }

    /// Check the pose and count preconditions, then aggregate.
    pub fn finalize(&self) -> Result<Embedding, EnrollmentError> {
        let missing = self.missing_poses();
        if !missing.is_empty() {
            return Err(EnrollmentError::IncompletePoses { missing });
        }
        if self.samples.len() != self.target {
            return Err(EnrollmentError::IncompleteBatch {
                captured: self.samples.len(),
                target: self.target,
            });
        }
        aggregate(self.samples.iter().map(|s| &s.embedding))
    }
}

/// Why a submitted frame was not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoFaceDetected,
    PoorFraming,
    WrongPose,
    /// Right pose, but not yet held still for long enough.
    Holding,
    InvalidEmbedding,
    EnrollmentComplete,
    ExtractionFailed(String),
}

/// Answer to one `submit` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleOutcome {
    pub accepted: bool,
    /// Pose read from this frame.
    pub pose: Pose,
    /// Stage after this frame was processed.
    pub stage: CaptureStage,
    pub guidance: Guidance,
    pub reason: Option<RejectReason>,
    pub captured: usize,
    pub target: usize,
}

/// One identity's in-progress enrollment.
pub struct EnrollmentSession {
    id: Uuid,
    identity: IdentityId,
    estimator: PoseEstimator,
    protocol: CaptureProtocol,
    batch: EnrollmentBatch,
}

impl EnrollmentSession {
    pub fn new(
        identity: impl Into<IdentityId>,
        pose_config: PoseConfig,
        shots_per_pose: usize,
    ) -> Self {
        let shots_per_pose = shots_per_pose.max(1);
        let hold = pose_config.stability_window;
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            estimator: PoseEstimator::new(pose_config),
            protocol: CaptureProtocol::new(shots_per_pose, hold),
            batch: EnrollmentBatch::new(shots_per_pose * CapturePose::ALL.len()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn stage(&self) -> CaptureStage {
        self.protocol.stage()
    }

    pub fn batch(&self) -> &EnrollmentBatch {
        &self.batch
    }

    fn outcome(
        &self,
        pose: Pose,
        guidance: Guidance,
        reason: Option<RejectReason>,
    ) -> SampleOutcome {
        SampleOutcome {
            accepted: reason.is_none(),
            pose,
            stage: self.protocol.stage(),
            guidance,
            reason,
            captured: self.batch.len(),
            target: self.batch.target(),
        }
    }

    fn interrupt(&mut self) {
        self.estimator.reset();
        self.protocol.interrupt();
    }

    /// Feed one frame's detections. With several faces the largest is used.
    pub fn submit(
        &mut self,
        detections: &[Detection],
        frame_width: u32,
        frame_height: u32,
    ) -> SampleOutcome {
        if self.protocol.is_done() {
            return self.outcome(
                Pose::Align,
                Guidance::Done,
                Some(RejectReason::EnrollmentComplete),
            );
        }

        let face = detections.iter().max_by(|a, b| {
            a.bbox
                .area()
                .partial_cmp(&b.bbox.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(face) = face {
            let expected = self.batch.samples.first().map(|s| s.embedding.dim());
            let dim_ok = expected.map_or(true, |d| d == face.embedding.dim());
            if !dim_ok || face.embedding.normalized().is_none() {
                tracing::warn!(
                    identity = %self.identity,
                    dim = face.embedding.dim(),
                    ?expected,
                    "rejecting unusable embedding"
                );
                // The frame is a gap in the hold window.
                self.interrupt();
                return self.outcome(
                    Pose::Align,
                    Guidance::HoldStill,
                    Some(RejectReason::InvalidEmbedding),
                );
            }
        }

        let reading = self
            .estimator
            .observe(face.map(|d| &d.bbox), frame_width, frame_height);
        let step = self.protocol.step(&reading);

        let Some(pose) = step.capture else {
            let reason = match step.guidance {
                Guidance::NoFace => RejectReason::NoFaceDetected,
                Guidance::OffCenter | Guidance::TooFar | Guidance::TooClose => {
                    RejectReason::PoorFraming
                }
                Guidance::FaceFront | Guidance::TurnLeft | Guidance::TurnRight => {
                    RejectReason::WrongPose
                }
                Guidance::Done => RejectReason::EnrollmentComplete,
                Guidance::HoldStill | Guidance::Capture => RejectReason::Holding,
            };
            return self.outcome(reading.pose, step.guidance, Some(reason));
        };

        // A capture always comes with a face.
        let Some(face) = face else {
            return self.outcome(reading.pose, step.guidance, Some(RejectReason::NoFaceDetected));
        };

        let sample = FaceSample {
            embedding: face.embedding.clone(),
            pose,
            captured_at: Utc::now(),
        };
        if let Err(e) = self.batch.push(sample) {
            tracing::warn!(identity = %self.identity, error = %e, "sample dropped");
            return self.outcome(
                reading.pose,
                Guidance::Done,
                Some(RejectReason::EnrollmentComplete),
            );
        }

        tracing::debug!(
            identity = %self.identity,
            pose = pose.label(),
            captured = self.batch.len(),
            target = self.batch.target(),
            "enrollment sample accepted"
        );
        self.outcome(reading.pose, step.guidance, None)
    }

    /// Record a frame the extractor could not process. Motion history is
    /// dropped since the frame sequence is no longer contiguous.
    pub fn extraction_failed(&mut self, message: impl Into<String>) -> SampleOutcome {
        self.interrupt();
        self.outcome(
            Pose::Align,
            Guidance::NoFace,
            Some(RejectReason::ExtractionFailed(message.into())),
        )
    }

    /// Derive the identity vector. On error the session keeps its samples
    /// so capture can resume.
    pub fn finalize(&self) -> Result<IdentityEmbedding, EnrollmentError> {
        let embedding = self.batch.finalize()?;
        tracing::info!(
            identity = %self.identity,
            samples = self.batch.len(),
            dim = embedding.dim(),
            "enrollment finalized"
        );
        Ok(IdentityEmbedding {
            identity: self.identity.clone(),
            embedding,
            enrolled_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn sample(values: Vec<f32>, pose: CapturePose) -> FaceSample {
        FaceSample {
            embedding: Embedding::new(values),
            pose,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_enrollment_happy_path_average() {
        let mut batch = EnrollmentBatch::new(6);
        for _ in 0..2 {
            batch.push(sample(vec![1.0, 0.0, 0.0, 0.0], CapturePose::Front)).unwrap();
        }
        for _ in 0..2 {
            batch.push(sample(vec![0.0, 1.0, 0.0, 0.0], CapturePose::Left)).unwrap();
        }
        for _ in 0..2 {
            batch.push(sample(vec![0.0, 0.0, 1.0, 0.0], CapturePose::Right)).unwrap();
        }

        let e = batch.finalize().unwrap();
        let expected = 1.0 / 3.0f32.sqrt();
        assert!((e.values[0] - expected).abs() < 1e-6);
        assert!((e.values[1] - expected).abs() < 1e-6);
        assert!((e.values[2] - expected).abs() < 1e-6);
        assert_eq!(e.values[3], 0.0);
        assert!((e.l2_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_incomplete_poses_rejected() {
        let mut batch = EnrollmentBatch::new(6);
        batch.push(sample(vec![1.0, 0.0], CapturePose::Front)).unwrap();
        batch.push(sample(vec![0.0, 1.0], CapturePose::Left)).unwrap();

        let err = batch.finalize().unwrap_err();
        assert_eq!(
            err,
            EnrollmentError::IncompletePoses {
                missing: vec![CapturePose::Right]
            }
        );
        assert!(err.to_string().contains("right"));
    }

    #[test]
    fn test_incomplete_count_rejected() {
        let mut batch = EnrollmentBatch::new(6);
        for pose in CapturePose::ALL {
            batch.push(sample(vec![1.0, 1.0], pose)).unwrap();
        }
        assert_eq!(
            batch.finalize().unwrap_err(),
            EnrollmentError::IncompleteBatch {
                captured: 3,
                target: 6
            }
        );
    }

    #[test]
    fn test_batch_full() {
        let mut batch = EnrollmentBatch::new(1);
        batch.push(sample(vec![1.0], CapturePose::Front)).unwrap();
        assert!(matches!(
            batch.push(sample(vec![1.0], CapturePose::Left)),
            Err(EnrollmentError::BatchFull { target: 1 })
        ));
    }

    #[test]
    fn test_aggregate_preconditions() {
        let none: Vec<Embedding> = Vec::new();
        assert_eq!(aggregate(&none).unwrap_err(), EnrollmentError::NoSamples);

        let mixed = [Embedding::new(vec![1.0, 0.0]), Embedding::new(vec![1.0, 0.0, 0.0])];
        assert_eq!(
            aggregate(&mixed).unwrap_err(),
            EnrollmentError::DimensionMismatch {
                index: 1,
                expected: 2,
                actual: 3
            }
        );

        let cancelling = [Embedding::new(vec![1.0, -2.0]), Embedding::new(vec![-1.0, 2.0])];
        assert_eq!(aggregate(&cancelling).unwrap_err(), EnrollmentError::DegenerateEmbedding);
    }

    #[test]
    fn test_aggregate_is_unit_and_order_independent() {
        let a = [
            Embedding::new(vec![0.3, -1.7, 2.2, 0.01]),
            Embedding::new(vec![5.0, 0.2, -0.4, 1.0]),
            Embedding::new(vec![0.9, 0.9, 0.9, -3.0]),
        ];
        let b = [a[2].clone(), a[0].clone(), a[1].clone()];
        let ea = aggregate(&a).unwrap();
        let eb = aggregate(&b).unwrap();
        assert!((ea.l2_norm() - 1.0).abs() < 1e-6);
        for (x, y) in ea.values.iter().zip(eb.values.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    /// Centered face; `nose_dx` shifts the nose to change yaw.
    fn detection(nose_dx: f32, embedding: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 200.0,
                y: 120.0,
                width: 240.0,
                height: 240.0,
                confidence: 0.98,
                landmarks: Some([
                    (280.0, 200.0),
                    (360.0, 200.0),
                    (320.0 + nose_dx, 240.0),
                    (290.0, 290.0),
                    (350.0, 290.0),
                ]),
            },
            embedding: Embedding::new(embedding),
        }
    }

    fn feed(session: &mut EnrollmentSession, nose_dx: f32, emb: &[f32], frames: usize) -> usize {
        (0..frames)
            .filter(|_| session.submit(&[detection(nose_dx, emb.to_vec())], 640, 480).accepted)
            .count()
    }

    #[test]
    fn test_session_walks_all_poses() {
        let mut s = EnrollmentSession::new("stu-1", PoseConfig::default(), 2);

        let early = finalize_err(&s);
        assert!(matches!(early, EnrollmentError::IncompletePoses { .. }));

        assert_eq!(feed(&mut s, 0.0, &[1.0, 0.0, 0.0, 0.0], 6), 2);
        assert_eq!(s.stage(), CaptureStage::Left);
        assert_eq!(feed(&mut s, 25.0, &[0.0, 1.0, 0.0, 0.0], 6), 2);
        assert_eq!(feed(&mut s, -25.0, &[0.0, 0.0, 1.0, 0.0], 6), 2);
        assert_eq!(s.stage(), CaptureStage::Done);

        let extra = s.submit(&[detection(0.0, vec![1.0, 0.0, 0.0, 0.0])], 640, 480);
        assert_eq!(extra.reason, Some(RejectReason::EnrollmentComplete));

        let identity = s.finalize().unwrap();
        assert_eq!(identity.identity, "stu-1");
        let expected = 1.0 / 3.0f32.sqrt();
        assert!((identity.embedding.values[0] - expected).abs() < 1e-6);
        assert!((identity.embedding.values[3]).abs() < 1e-6);
    }

    fn finalize_err(s: &EnrollmentSession) -> EnrollmentError {
        s.finalize().unwrap_err()
    }

    #[test]
    fn test_session_rejection_reasons() {
        let mut s = EnrollmentSession::new("stu-2", PoseConfig::default(), 2);

        let none = s.submit(&[], 640, 480);
        assert!(!none.accepted);
        assert_eq!(none.reason, Some(RejectReason::NoFaceDetected));

        let holding = s.submit(&[detection(0.0, vec![1.0, 0.0])], 640, 480);
        assert_eq!(holding.reason, Some(RejectReason::Holding));
        assert_eq!(holding.pose, Pose::Front);

        let zero = s.submit(&[detection(0.0, vec![0.0, 0.0])], 640, 480);
        assert_eq!(zero.reason, Some(RejectReason::InvalidEmbedding));

        let failed = s.extraction_failed("backend fault");
        assert_eq!(failed.reason, Some(RejectReason::ExtractionFailed("backend fault".into())));
    }

    #[test]
    fn test_unusable_embedding_breaks_hold() {
        let mut s = EnrollmentSession::new("stu-4", PoseConfig::default(), 2);
        let emb = [1.0, 0.0, 0.0, 0.0];
        assert_eq!(feed(&mut s, 0.0, &emb, 4), 0);

        let mut moved = detection(0.0, vec![0.0; 4]);
        moved.bbox.x += 60.0;
        let gap = s.submit(&[moved], 640, 480);
        assert_eq!(gap.reason, Some(RejectReason::InvalidEmbedding));

        // The window starts over after the gap.
        assert_eq!(feed(&mut s, 0.0, &emb, 1), 0);
        assert_eq!(feed(&mut s, 0.0, &emb, 4), 1);
    }

    #[test]
    fn test_session_picks_largest_face() {
        let mut s = EnrollmentSession::new("stu-3", PoseConfig::default(), 1);
        let mut small = detection(0.0, vec![0.0, 1.0]);
        small.bbox.width = 50.0;
        small.bbox.height = 50.0;
        let big = detection(0.0, vec![1.0, 0.0]);

        let mut accepted = None;
        for _ in 0..5 {
            let o = s.submit(&[small.clone(), big.clone()], 640, 480);
            if o.accepted {
                accepted = Some(o);
            }
        }
        assert!(accepted.is_some());
        assert_eq!(s.batch().count(CapturePose::Front), 1);
        assert_eq!(s.batch().samples[0].embedding.values, vec![1.0, 0.0]);
    }
}
