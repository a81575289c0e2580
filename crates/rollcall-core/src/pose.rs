//! Head pose and stability gating for enrollment capture.
//!
//! Yaw is approximated from the nose-to-eye distance ratio of the five-point
//! landmarks, and stillness from how far the nose tip wanders over a short
//! sliding window. Neither step ever fails: a frame that is not usable simply
//! reads as [`Pose::Align`] with a [`Framing`] hint explaining why.
//!
//! [`CaptureProtocol`] walks the subject through front, left and right poses,
//! and only asks for a capture once the requested pose has been held, still
//! and framed, for a full stability window. A quick head shake that crosses a
//! yaw threshold for one or two frames never triggers a capture.

use crate::types::BoundingBox;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const LEFT_EYE: usize = 0;
const RIGHT_EYE: usize = 1;
const NOSE: usize = 2;

/// Tunable thresholds for framing, yaw and stability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    /// Max distance of the face center from the frame center, as a fraction
    /// of frame width (horizontal) and height (vertical).
    pub center_tolerance: f32,
    /// Face width / frame width below which the subject is too far away.
    pub min_face_ratio: f32,
    /// Face width / frame width above which the subject is too close.
    pub max_face_ratio: f32,
    /// Yaw ratio above which the head reads as turned left.
    pub yaw_left: f32,
    /// Yaw ratio below which the head reads as turned right.
    pub yaw_right: f32,
    /// Number of recent nose positions kept for the stability metric.
    pub stability_window: usize,
    /// Mean nose displacement between consecutive frames (pixels) below
    /// which the face counts as still.
    pub jitter_threshold: f32,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            center_tolerance: 0.15,
            min_face_ratio: 0.25,
            max_face_ratio: 0.70,
            yaw_left: 0.6,
            yaw_right: 0.4,
            stability_window: 5,
            jitter_threshold: 4.0,
        }
    }
}

/// Pose classification for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    /// No usable face; the subject must recenter.
    Align,
    Front,
    Left,
    Right,
}

/// The poses an enrollment must collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePose {
    Front,
    Left,
    Right,
}

impl CapturePose {
    /// Capture order.
    pub const ALL: [CapturePose; 3] = [CapturePose::Front, CapturePose::Left, CapturePose::Right];

    pub fn label(self) -> &'static str {
        match self {
            CapturePose::Front => "front",
            CapturePose::Left => "left",
            CapturePose::Right => "right",
        }
    }
}

impl From<CapturePose> for Pose {
    fn from(p: CapturePose) -> Self {
        match p {
            CapturePose::Front => Pose::Front,
            CapturePose::Left => Pose::Left,
            CapturePose::Right => Pose::Right,
        }
    }
}

/// Why a frame is or is not correctly framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    Ok,
    NoFace,
    NoLandmarks,
    OffCenter,
    TooFar,
    TooClose,
}

/// Estimator output for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseReading {
    pub pose: Pose,
    pub framing: Framing,
    pub stable: bool,
    /// Nose-to-left-eye share of the summed nose-to-eye distances.
    pub yaw: Option<f32>,
    /// Mean nose displacement over the current window, in pixels.
    pub jitter: Option<f32>,
}

impl PoseReading {
    pub fn framed(&self) -> bool {
        self.framing == Framing::Ok
    }

    fn unusable(framing: Framing) -> Self {
        Self {
            pose: Pose::Align,
            framing,
            stable: false,
            yaw: None,
            jitter: None,
        }
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// `d(nose, left_eye) / (d(nose, left_eye) + d(nose, right_eye))`.
///
/// 0.5 means facing the camera. `None` when both distances are zero.
pub fn yaw_ratio(nose: (f32, f32), left_eye: (f32, f32), right_eye: (f32, f32)) -> Option<f32> {
    let dl = distance(nose, left_eye);
    let dr = distance(nose, right_eye);
    let sum = dl + dr;
    if sum > 0.0 && sum.is_finite() {
        Some(dl / sum)
    } else {
        None
    }
}

/// Mean Euclidean distance between consecutive points; `None` with fewer than two.
pub fn stability_metric<'a, I>(points: I) -> Option<f32>
where
    I: IntoIterator<Item = &'a (f32, f32)>,
{
    let mut iter = points.into_iter();
    let mut prev = *iter.next()?;
    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for &p in iter {
        total += distance(prev, p);
        pairs += 1;
        prev = p;
    }
    (pairs > 0).then(|| total / pairs as f32)
}

pub fn classify_yaw(yaw: f32, config: &PoseConfig) -> Pose {
    if yaw > config.yaw_left {
        Pose::Left
    } else if yaw < config.yaw_right {
        Pose::Right
    } else {
        Pose::Front
    }
}

/// Check centering and size of a face box within a frame.
pub fn check_framing(
    face: &BoundingBox,
    frame_width: u32,
    frame_height: u32,
    config: &PoseConfig,
) -> Framing {
    let fw = frame_width as f32;
    let fh = frame_height as f32;
    if fw <= 0.0 || fh <= 0.0 {
        return Framing::NoFace;
    }

    let ratio = face.width / fw;
    if ratio < config.min_face_ratio {
        return Framing::TooFar;
    }
    if ratio > config.max_face_ratio {
        return Framing::TooClose;
    }

    let (cx, cy) = face.center();
    if (cx - fw / 2.0).abs() > config.center_tolerance * fw
        || (cy - fh / 2.0).abs() > config.center_tolerance * fh
    {
        return Framing::OffCenter;
    }

    Framing::Ok
}

/// Per-frame pose and stillness estimator.
pub struct PoseEstimator {
    config: PoseConfig,
    nose_history: VecDeque<(f32, f32)>,
}

impl PoseEstimator {
    pub fn new(config: PoseConfig) -> Self {
        let cap = config.stability_window.max(2);
        Self {
            config,
            nose_history: VecDeque::with_capacity(cap),
        }
    }

    pub fn config(&self) -> &PoseConfig {
        &self.config
    }

    /// Forget motion history, e.g. after the face was lost.
    pub fn reset(&mut self) {
        self.nose_history.clear();
    }

    /// Evaluate one frame. `face` is the subject's detection, if any.
    pub fn observe(
        &mut self,
        face: Option<&BoundingBox>,
        frame_width: u32,
        frame_height: u32,
    ) -> PoseReading {
        let Some(face) = face else {
            self.reset();
            return PoseReading::unusable(Framing::NoFace);
        };
        let Some(landmarks) = face.landmarks.as_ref() else {
            self.reset();
            return PoseReading::unusable(Framing::NoLandmarks);
        };
        let nose = landmarks[NOSE];
        let Some(yaw) = yaw_ratio(nose, landmarks[LEFT_EYE], landmarks[RIGHT_EYE]) else {
            self.reset();
            return PoseReading::unusable(Framing::NoLandmarks);
        };

        let window = self.config.stability_window.max(2);
        if self.nose_history.len() == window {
            self.nose_history.pop_front();
        }
        self.nose_history.push_back(nose);

        let jitter = stability_metric(self.nose_history.iter());
        let stable = self.nose_history.len() == window
            && jitter.is_some_and(|j| j < self.config.jitter_threshold);

        let framing = check_framing(face, frame_width, frame_height, &self.config);
        let pose = if framing == Framing::Ok {
            classify_yaw(yaw, &self.config)
        } else {
            Pose::Align
        };

        PoseReading {
            pose,
            framing,
            stable,
            yaw: Some(yaw),
            jitter,
        }
    }
}

/// Where the subject is in the capture sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStage {
    Align,
    Front,
    Left,
    Right,
    Done,
}

impl CaptureStage {
    pub fn target(self) -> Option<CapturePose> {
        match self {
            CaptureStage::Front => Some(CapturePose::Front),
            CaptureStage::Left => Some(CapturePose::Left),
            CaptureStage::Right => Some(CapturePose::Right),
            CaptureStage::Align | CaptureStage::Done => None,
        }
    }

    fn next(self) -> CaptureStage {
        match self {
            CaptureStage::Align => CaptureStage::Front,
            CaptureStage::Front => CaptureStage::Left,
            CaptureStage::Left => CaptureStage::Right,
            CaptureStage::Right | CaptureStage::Done => CaptureStage::Done,
        }
    }
}

/// Hint for the person in front of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guidance {
    NoFace,
    OffCenter,
    TooFar,
    TooClose,
    HoldStill,
    FaceFront,
    TurnLeft,
    TurnRight,
    Capture,
    Done,
}

impl Guidance {
    fn for_framing(framing: Framing) -> Guidance {
        match framing {
            Framing::NoFace | Framing::NoLandmarks => Guidance::NoFace,
            Framing::OffCenter => Guidance::OffCenter,
            Framing::TooFar => Guidance::TooFar,
            Framing::TooClose => Guidance::TooClose,
            Framing::Ok => Guidance::HoldStill,
        }
    }

    fn toward(target: CapturePose) -> Guidance {
        match target {
            CapturePose::Front => Guidance::FaceFront,
            CapturePose::Left => Guidance::TurnLeft,
            CapturePose::Right => Guidance::TurnRight,
        }
    }
}

/// Result of feeding one reading to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub guidance: Guidance,
    /// Set when this frame should be kept as a sample for the given pose.
    pub capture: Option<CapturePose>,
}

/// `align → front → left → right → done` capture sequence.
pub struct CaptureProtocol {
    stage: CaptureStage,
    shots_per_pose: usize,
    hold_frames: usize,
    held: usize,
    shots: usize,
}

impl CaptureProtocol {
    /// `hold_frames` consecutive qualifying frames are needed before the
    /// first capture of each pose; usually the estimator's stability window.
    pub fn new(shots_per_pose: usize, hold_frames: usize) -> Self {
        Self {
            stage: CaptureStage::Align,
            shots_per_pose: shots_per_pose.max(1),
            hold_frames: hold_frames.max(1),
            held: 0,
            shots: 0,
        }
    }

    pub fn stage(&self) -> CaptureStage {
        self.stage
    }

    pub fn is_done(&self) -> bool {
        self.stage == CaptureStage::Done
    }

    /// Break the current hold after a frame that could not be evaluated.
    /// The stage and shots already taken are kept.
    pub fn interrupt(&mut self) {
        self.held = 0;
    }

    pub fn step(&mut self, reading: &PoseReading) -> StepOutcome {
        if self.stage == CaptureStage::Done {
            return StepOutcome {
                guidance: Guidance::Done,
                capture: None,
            };
        }

        if !reading.framed() {
            self.held = 0;
            return StepOutcome {
                guidance: Guidance::for_framing(reading.framing),
                capture: None,
            };
        }

        if self.stage == CaptureStage::Align {
            self.stage = CaptureStage::Front;
            self.held = 0;
            self.shots = 0;
        }

        let Some(target) = self.stage.target() else {
            return StepOutcome {
                guidance: Guidance::Done,
                capture: None,
            };
        };

        if reading.pose != Pose::from(target) {
            self.held = 0;
            return StepOutcome {
                guidance: Guidance::toward(target),
                capture: None,
            };
        }

        self.held += 1;
        if self.held < self.hold_frames || !reading.stable {
            return StepOutcome {
                guidance: Guidance::HoldStill,
                capture: None,
            };
        }

        self.shots += 1;
        if self.shots >= self.shots_per_pose {
            self.stage = self.stage.next();
            self.held = 0;
            self.shots = 0;
        }

        StepOutcome {
            guidance: Guidance::Capture,
            capture: Some(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 640;
    const H: u32 = 480;

    /// Centered 240px face with eyes at y=200 and the nose shifted by `nose_dx`.
    fn face(nose_dx: f32) -> BoundingBox {
        BoundingBox {
            x: 200.0,
            y: 120.0,
            width: 240.0,
            height: 240.0,
            confidence: 0.99,
            landmarks: Some([
                (280.0, 200.0),
                (360.0, 200.0),
                (320.0 + nose_dx, 240.0),
                (290.0, 290.0),
                (350.0, 290.0),
            ]),
        }
    }

    #[test]
    fn test_yaw_ratio_front_and_turned() {
        let f = face(0.0).landmarks.unwrap();
        let yaw = yaw_ratio(f[NOSE], f[LEFT_EYE], f[RIGHT_EYE]).unwrap();
        assert!((yaw - 0.5).abs() < 1e-6);

        let l = face(25.0).landmarks.unwrap();
        let yaw = yaw_ratio(l[NOSE], l[LEFT_EYE], l[RIGHT_EYE]).unwrap();
        assert!(yaw > 0.6, "yaw = {yaw}");

        let r = face(-25.0).landmarks.unwrap();
        let yaw = yaw_ratio(r[NOSE], r[LEFT_EYE], r[RIGHT_EYE]).unwrap();
        assert!(yaw < 0.4, "yaw = {yaw}");
    }

    #[test]
    fn test_yaw_ratio_degenerate() {
        assert!(yaw_ratio((1.0, 1.0), (1.0, 1.0), (1.0, 1.0)).is_none());
    }

    #[test]
    fn test_classify_yaw_thresholds_are_exclusive() {
        let cfg = PoseConfig::default();
        assert_eq!(classify_yaw(0.6, &cfg), Pose::Front);
        assert_eq!(classify_yaw(0.4, &cfg), Pose::Front);
        assert_eq!(classify_yaw(0.61, &cfg), Pose::Left);
        assert_eq!(classify_yaw(0.39, &cfg), Pose::Right);
    }

    #[test]
    fn test_framing_checks() {
        let cfg = PoseConfig::default();
        assert_eq!(check_framing(&face(0.0), W, H, &cfg), Framing::Ok);

        let mut small = face(0.0);
        small.width = 100.0; // 15.6% of width
        small.x = 270.0;
        assert_eq!(check_framing(&small, W, H, &cfg), Framing::TooFar);

        let mut big = face(0.0);
        big.width = 500.0; // 78% of width
        big.x = 70.0;
        assert_eq!(check_framing(&big, W, H, &cfg), Framing::TooClose);

        let mut shifted = face(0.0);
        shifted.x = 20.0; // center at x=140, 180px off
        assert_eq!(check_framing(&shifted, W, H, &cfg), Framing::OffCenter);
    }

    #[test]
    fn test_stability_metric() {
        assert!(stability_metric(&[(0.0, 0.0)]).is_none());
        let pts = [(0.0, 0.0), (3.0, 4.0), (3.0, 4.0)];
        // 5.0 then 0.0
        assert!((stability_metric(&pts).unwrap() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_estimator_needs_full_window_to_be_stable() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        for i in 0..4 {
            let r = est.observe(Some(&face(0.0)), W, H);
            assert_eq!(r.pose, Pose::Front);
            assert!(!r.stable, "frame {i} should not be stable yet");
        }
        let r = est.observe(Some(&face(0.0)), W, H);
        assert!(r.stable);
        assert_eq!(r.jitter, Some(0.0));
    }

    #[test]
    fn test_estimator_motion_is_unstable() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let mut last = None;
        for i in 0..6 {
            let dx = if i % 2 == 0 { 0.0 } else { 12.0 };
            last = Some(est.observe(Some(&face(dx)), W, H));
        }
        let r = last.unwrap();
        assert!(!r.stable);
        assert!(r.jitter.unwrap() >= 4.0);
    }

    #[test]
    fn test_estimator_lost_face_resets_history() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        for _ in 0..5 {
            est.observe(Some(&face(0.0)), W, H);
        }
        let r = est.observe(None, W, H);
        assert_eq!(r.pose, Pose::Align);
        assert_eq!(r.framing, Framing::NoFace);
        let r = est.observe(Some(&face(0.0)), W, H);
        assert!(!r.stable);
    }

    #[test]
    fn test_estimator_no_landmarks_is_align() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let mut f = face(0.0);
        f.landmarks = None;
        let r = est.observe(Some(&f), W, H);
        assert_eq!(r.pose, Pose::Align);
        assert_eq!(r.framing, Framing::NoLandmarks);
    }

    fn run(
        est: &mut PoseEstimator,
        proto: &mut CaptureProtocol,
        f: &BoundingBox,
        n: usize,
    ) -> Vec<StepOutcome> {
        (0..n).map(|_| proto.step(&est.observe(Some(f), W, H))).collect()
    }

    #[test]
    fn test_protocol_full_sequence() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let mut proto = CaptureProtocol::new(2, 5);

        let front = run(&mut est, &mut proto, &face(0.0), 6);
        // Four frames of holding, then a two-shot burst.
        assert!(front[..4].iter().all(|o| o.capture.is_none()));
        assert_eq!(front[4].capture, Some(CapturePose::Front));
        assert_eq!(front[5].capture, Some(CapturePose::Front));
        assert_eq!(proto.stage(), CaptureStage::Left);

        // Turning: motion breaks the window, so left needs a fresh hold.
        let left = run(&mut est, &mut proto, &face(25.0), 6);
        assert_eq!(left.iter().filter(|o| o.capture == Some(CapturePose::Left)).count(), 2);
        assert_eq!(proto.stage(), CaptureStage::Right);

        let right = run(&mut est, &mut proto, &face(-25.0), 6);
        assert_eq!(right.iter().filter(|o| o.capture == Some(CapturePose::Right)).count(), 2);
        assert!(proto.is_done());

        let after = run(&mut est, &mut proto, &face(0.0), 1);
        assert_eq!(after[0].guidance, Guidance::Done);
    }

    #[test]
    fn test_protocol_ignores_quick_head_shake() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let mut proto = CaptureProtocol::new(2, 5);
        run(&mut est, &mut proto, &face(0.0), 6);
        assert_eq!(proto.stage(), CaptureStage::Left);

        // Alternating left / front never holds long enough.
        for i in 0..10 {
            let dx = if i % 2 == 0 { 25.0 } else { 0.0 };
            let o = proto.step(&est.observe(Some(&face(dx)), W, H));
            assert!(o.capture.is_none());
        }
        assert_eq!(proto.stage(), CaptureStage::Left);
    }

    #[test]
    fn test_protocol_interrupt_restarts_hold() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let mut proto = CaptureProtocol::new(2, 5);
        let held = run(&mut est, &mut proto, &face(0.0), 4);
        assert!(held.iter().all(|o| o.capture.is_none()));

        est.reset();
        proto.interrupt();
        let resumed = run(&mut est, &mut proto, &face(0.0), 5);
        assert!(resumed[..4].iter().all(|o| o.capture.is_none()));
        assert_eq!(resumed[4].capture, Some(CapturePose::Front));
        assert_eq!(proto.stage(), CaptureStage::Front);
    }

    #[test]
    fn test_protocol_wrong_pose_guidance() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let mut proto = CaptureProtocol::new(1, 1);
        let o = proto.step(&est.observe(Some(&face(25.0)), W, H));
        assert_eq!(proto.stage(), CaptureStage::Front);
        assert_eq!(o.guidance, Guidance::FaceFront);

        let o = proto.step(&est.observe(None, W, H));
        assert_eq!(o.guidance, Guidance::NoFace);
    }
}
