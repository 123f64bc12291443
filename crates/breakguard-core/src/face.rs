//! Face template enrollment and matching
//!
//! Face detection is an external capability behind [`FaceDetector`]. This
//! module turns detected regions into feature vectors (the face crop
//! resampled to a fixed grid and min-max normalized), builds templates from
//! enrollment captures and scores live frames by Pearson correlation
//! against every enrolled sample.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AuthError, CollaboratorError, CoreError};
use crate::secret_store::{SecretRecord, SecretStore};

/// Side length of the resampled face crop
pub const FEATURE_SIDE: usize = 64;

/// An 8-bit grayscale camera frame
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Build a frame from row-major pixels
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, AuthError> {
        if width == 0 || height == 0 {
            return Err(AuthError::InvalidFrame("empty frame".to_string()));
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(AuthError::InvalidFrame(format!(
                "expected {} pixels for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({}x{})", self.width, self.height)
    }
}

/// A detected face bounding box, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn fits(&self, frame: &Frame) -> bool {
        self.x.checked_add(self.width).is_some_and(|right| right <= frame.width)
            && self.y.checked_add(self.height).is_some_and(|bottom| bottom <= frame.height)
    }
}

/// Locates faces in a frame
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion>;
}

/// Detector for sources that already deliver cropped faces
///
/// The whole frame is reported as one face; size limits still apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct CroppedFaceDetector;

impl FaceDetector for CroppedFaceDetector {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
        vec![FaceRegion {
            x: 0,
            y: 0,
            width: frame.width,
            height: frame.height,
        }]
    }
}

/// Camera access, driven from the daemon's capture task
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Frame, CollaboratorError>;
}

/// Enrolled reference samples plus the threshold they must be matched at
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTemplate {
    samples: Vec<Vec<f32>>,
    threshold: f32,
}

impl FaceTemplate {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl fmt::Debug for FaceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceTemplate")
            .field("samples", &self.samples.len())
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Result of scoring one live frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceOutcome {
    Match { score: f32 },
    NoMatch { score: f32 },
    /// Soft failure, the caller may retry
    NoFaceDetected,
}

/// Face verifier settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceVerifierConfig {
    /// Accepted frames needed for a template
    pub min_samples: usize,
    /// Most frames examined during one enrollment
    pub capture_window: usize,
    /// Smallest usable face edge, in pixels
    pub min_face_size: u32,
    /// Correlation needed for a match
    pub threshold: f32,
}

impl Default for FaceVerifierConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            capture_window: 30,
            min_face_size: 100,
            threshold: 0.6,
        }
    }
}

/// Enrolls and verifies faces using an injected detector
#[derive(Clone)]
pub struct FaceVerifier {
    detector: Arc<dyn FaceDetector>,
    config: FaceVerifierConfig,
}

impl FaceVerifier {
    pub fn new(detector: Arc<dyn FaceDetector>, config: FaceVerifierConfig) -> Self {
        Self { detector, config }
    }

    pub fn config(&self) -> &FaceVerifierConfig {
        &self.config
    }

    /// Build a template from enrollment captures
    ///
    /// Frames without exactly one usable face are skipped. Capture stops
    /// once `min_samples` frames are accepted or `capture_window` frames
    /// have been examined.
    pub fn enroll<I>(&self, frames: I) -> Result<FaceTemplate, AuthError>
    where
        I: IntoIterator<Item = Frame>,
    {
        let mut samples = Vec::with_capacity(self.config.min_samples);
        for (index, frame) in frames.into_iter().take(self.config.capture_window).enumerate() {
            if self.accept_sample(&mut samples, &frame, index) {
                break;
            }
        }
        self.finish_enrollment(samples)
    }

    /// Enroll from a live camera and seal the template, replacing any
    /// previous one
    ///
    /// Failed captures count toward the capture window. Nothing is stored
    /// unless enrollment succeeds.
    pub async fn enroll_from(
        &self,
        source: &dyn FrameSource,
        store: &SecretStore,
    ) -> Result<FaceTemplate, CoreError> {
        let mut samples = Vec::with_capacity(self.config.min_samples);
        for index in 0..self.config.capture_window {
            match source.capture().await {
                Ok(frame) => {
                    if self.accept_sample(&mut samples, &frame, index) {
                        break;
                    }
                }
                Err(e) => warn!("Enrollment capture {} failed: {}", index, e),
            }
        }

        let template = self.finish_enrollment(samples)?;
        store.seal(SecretRecord::FaceTemplate, &template)?;
        info!("Stored face template");
        Ok(template)
    }

    /// Add `frame` to `samples` if it holds exactly one usable face;
    /// true once enough samples are collected
    fn accept_sample(&self, samples: &mut Vec<Vec<f32>>, frame: &Frame, index: usize) -> bool {
        let faces = self.usable_faces(frame);
        if faces.len() != 1 {
            debug!("Enrollment frame {} rejected: {} usable faces", index, faces.len());
            return false;
        }
        samples.push(extract_features(frame, &faces[0]));
        samples.len() >= self.config.min_samples
    }

    fn finish_enrollment(&self, samples: Vec<Vec<f32>>) -> Result<FaceTemplate, AuthError> {
        if samples.len() < self.config.min_samples {
            return Err(AuthError::EnrollmentInsufficientSamples {
                accepted: samples.len(),
                required: self.config.min_samples,
            });
        }

        info!("Enrolled face template from {} samples", samples.len());
        Ok(FaceTemplate {
            samples,
            threshold: self.config.threshold,
        })
    }

    /// Score the largest usable face in `frame` against `template`
    pub fn verify(&self, frame: &Frame, template: &FaceTemplate) -> FaceOutcome {
        let faces = self.usable_faces(frame);
        let Some(face) = faces.iter().max_by_key(|region| region.area()) else {
            return FaceOutcome::NoFaceDetected;
        };

        let live = extract_features(frame, face);
        let best = template
            .samples
            .iter()
            .map(|sample| pearson(&live, sample))
            .fold(None, |best: Option<f32>, score| match (best, score.is_nan()) {
                (_, true) => best,
                (None, false) => Some(score),
                (Some(b), false) => Some(b.max(score)),
            });

        match best {
            Some(score) if score >= template.threshold => FaceOutcome::Match { score },
            Some(score) => FaceOutcome::NoMatch { score },
            None => FaceOutcome::NoMatch { score: 0.0 },
        }
    }

    fn usable_faces(&self, frame: &Frame) -> Vec<FaceRegion> {
        let min = self.config.min_face_size;
        self.detector
            .detect(frame)
            .into_iter()
            .filter(|region| region.width >= min && region.height >= min && region.fits(frame))
            .collect()
    }
}

impl fmt::Debug for FaceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Crop, resample to `FEATURE_SIDE` squared (nearest neighbour) and
/// min-max normalize to [0, 1]
fn extract_features(frame: &Frame, region: &FaceRegion) -> Vec<f32> {
    let mut features = Vec::with_capacity(FEATURE_SIDE * FEATURE_SIDE);
    for row in 0..FEATURE_SIDE {
        let y = region.y + (row as u64 * region.height as u64 / FEATURE_SIDE as u64) as u32;
        for col in 0..FEATURE_SIDE {
            let x = region.x + (col as u64 * region.width as u64 / FEATURE_SIDE as u64) as u32;
            features.push(frame.pixel(x, y) as f32);
        }
    }

    let (min, max) = features
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if range > 0.0 {
        for value in &mut features {
            *value = (*value - min) / range;
        }
    } else {
        features.iter_mut().for_each(|value| *value = 0.0);
    }
    features
}

/// Pearson correlation; NaN when either side has no variance or the
/// lengths differ
fn pearson(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::NAN;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let dx = x as f64 - mean_a;
        let dy = y as f64 - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        return f32::NAN;
    }
    (cov / denom) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u32 = 200;

    /// Reports the same regions for every frame
    struct FixedDetector(Vec<FaceRegion>);

    impl FaceDetector for FixedDetector {
        fn detect(&self, _frame: &Frame) -> Vec<FaceRegion> {
            self.0.clone()
        }
    }

    fn whole_frame() -> FaceRegion {
        FaceRegion {
            x: 0,
            y: 0,
            width: SIZE,
            height: SIZE,
        }
    }

    fn verifier_with(regions: Vec<FaceRegion>) -> FaceVerifier {
        FaceVerifier::new(Arc::new(FixedDetector(regions)), FaceVerifierConfig::default())
    }

    fn horizontal_gradient() -> Frame {
        let pixels = (0..SIZE * SIZE).map(|i| (i % SIZE) as u8).collect();
        Frame::new(SIZE, SIZE, pixels).unwrap()
    }

    fn vertical_gradient() -> Frame {
        let pixels = (0..SIZE * SIZE).map(|i| (i / SIZE) as u8).collect();
        Frame::new(SIZE, SIZE, pixels).unwrap()
    }

    fn flat() -> Frame {
        Frame::new(SIZE, SIZE, vec![128; (SIZE * SIZE) as usize]).unwrap()
    }

    #[test]
    fn test_frame_size_checked() {
        assert!(matches!(Frame::new(2, 2, vec![0; 3]), Err(AuthError::InvalidFrame(_))));
        assert!(matches!(Frame::new(0, 2, vec![]), Err(AuthError::InvalidFrame(_))));
    }

    #[test]
    fn test_enroll_and_match_same_face() {
        let verifier = verifier_with(vec![whole_frame()]);
        let template = verifier.enroll(std::iter::repeat(horizontal_gradient()).take(10)).unwrap();
        assert_eq!(template.sample_count(), 5);

        match verifier.verify(&horizontal_gradient(), &template) {
            FaceOutcome::Match { score } => assert!(score > 0.99),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_different_face_does_not_match() {
        let verifier = verifier_with(vec![whole_frame()]);
        let template = verifier.enroll(std::iter::repeat(horizontal_gradient()).take(5)).unwrap();

        assert!(matches!(
            verifier.verify(&vertical_gradient(), &template),
            FaceOutcome::NoMatch { .. }
        ));
    }

    #[test]
    fn test_degenerate_frame_is_no_match() {
        let verifier = verifier_with(vec![whole_frame()]);
        let template = verifier.enroll(std::iter::repeat(horizontal_gradient()).take(5)).unwrap();

        assert!(matches!(verifier.verify(&flat(), &template), FaceOutcome::NoMatch { .. }));
    }

    #[test]
    fn test_no_face_detected() {
        let verifier = verifier_with(vec![]);
        let template = verifier_with(vec![whole_frame()])
            .enroll(std::iter::repeat(horizontal_gradient()).take(5))
            .unwrap();

        assert_eq!(verifier.verify(&horizontal_gradient(), &template), FaceOutcome::NoFaceDetected);
    }

    #[test]
    fn test_small_faces_ignored() {
        let small = FaceRegion {
            x: 0,
            y: 0,
            width: 50,
            height: 50,
        };
        let verifier = verifier_with(vec![small]);
        let err = verifier
            .enroll(std::iter::repeat(horizontal_gradient()).take(30))
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::EnrollmentInsufficientSamples {
                accepted: 0,
                required: 5
            }
        );
    }

    #[test]
    fn test_multiple_faces_rejected_during_enrollment() {
        let half = FaceRegion {
            x: 0,
            y: 0,
            width: 100,
            height: 100,
        };
        let other = FaceRegion { x: 100, ..half };
        let verifier = verifier_with(vec![half, other]);
        assert!(verifier
            .enroll(std::iter::repeat(horizontal_gradient()).take(30))
            .is_err());
    }

    #[test]
    fn test_capture_window_bounds_enrollment() {
        let config = FaceVerifierConfig {
            capture_window: 3,
            ..Default::default()
        };
        let verifier = FaceVerifier::new(Arc::new(FixedDetector(vec![whole_frame()])), config);
        let err = verifier
            .enroll(std::iter::repeat(horizontal_gradient()).take(30))
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::EnrollmentInsufficientSamples {
                accepted: 3,
                required: 5
            }
        );
    }

    #[test]
    fn test_template_serialization_keeps_threshold() {
        let verifier = verifier_with(vec![whole_frame()]);
        let template = verifier.enroll(std::iter::repeat(horizontal_gradient()).take(5)).unwrap();
        let json = serde_json::to_string(&template).unwrap();
        let restored: FaceTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, template);
        assert_eq!(restored.threshold(), 0.6);
    }

    /// Replays queued captures, then reports the camera as gone
    struct ScriptedCamera(std::sync::Mutex<std::collections::VecDeque<Result<Frame, CollaboratorError>>>);

    impl ScriptedCamera {
        fn new(captures: impl IntoIterator<Item = Result<Frame, CollaboratorError>>) -> Self {
            Self(std::sync::Mutex::new(captures.into_iter().collect()))
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedCamera {
        async fn capture(&self) -> Result<Frame, CollaboratorError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CollaboratorError::Unavailable("camera closed".to_string())))
        }
    }

    #[test]
    fn test_cropped_detector_uses_whole_frame() {
        let verifier = FaceVerifier::new(Arc::new(CroppedFaceDetector), FaceVerifierConfig::default());
        let template = verifier.enroll(std::iter::repeat(horizontal_gradient()).take(5)).unwrap();
        assert!(matches!(
            verifier.verify(&horizontal_gradient(), &template),
            FaceOutcome::Match { .. }
        ));

        let tiny = Frame::new(20, 20, vec![7; 400]).unwrap();
        assert_eq!(verifier.verify(&tiny, &template), FaceOutcome::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_camera_enrollment_is_sealed_and_loadable() {
        use crate::gate::{Enrollment, Factors};
        use crate::totp::TotpEngine;

        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();
        let config = FaceVerifierConfig {
            threshold: 0.9,
            ..Default::default()
        };
        let verifier = FaceVerifier::new(Arc::new(FixedDetector(vec![whole_frame()])), config);

        // A first enrollment of another face is replaced wholesale
        let first = ScriptedCamera::new(std::iter::repeat_with(|| Ok(vertical_gradient())).take(5));
        verifier.enroll_from(&first, &store).await.unwrap();

        let flaky = ScriptedCamera::new(
            [Err(CollaboratorError::Timeout), Ok(horizontal_gradient())]
                .into_iter()
                .cycle()
                .take(10),
        );
        let template = verifier.enroll_from(&flaky, &store).await.unwrap();
        assert_eq!(template.sample_count(), 5);
        assert_eq!(template.threshold(), 0.9);

        let factors = Factors::load(&store, TotpEngine::default(), Some(verifier.clone()));
        let face = factors.face.expect("face factor");
        let Enrollment::Ready(stored) = &face.template else {
            panic!("template not loaded: {:?}", face.template);
        };
        assert_eq!(stored, &template);
        assert!(matches!(
            verifier.verify(&horizontal_gradient(), stored),
            FaceOutcome::Match { .. }
        ));
        assert!(matches!(
            verifier.verify(&vertical_gradient(), stored),
            FaceOutcome::NoMatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_camera_enrollment_keeps_previous_template() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();
        let verifier = verifier_with(vec![whole_frame()]);

        let good = ScriptedCamera::new(std::iter::repeat_with(|| Ok(horizontal_gradient())).take(5));
        let template = verifier.enroll_from(&good, &store).await.unwrap();

        let broken = ScriptedCamera::new([]);
        let err = verifier.enroll_from(&broken, &store).await.unwrap_err();
        assert!(matches!(
            err.as_auth(),
            Some(AuthError::EnrollmentInsufficientSamples { accepted: 0, .. })
        ));

        let stored: FaceTemplate = store.unseal(SecretRecord::FaceTemplate).unwrap().unwrap();
        assert_eq!(stored, template);
    }
}
