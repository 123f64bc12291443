//! Camera frames from an external capture program
//!
//! The program is run once per frame and must write a single PNG or
//! binary PGM image to stdout, e.g. a wrapper around `ffmpeg` or
//! `fswebcam`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use breakguard_core::{CollaboratorError, Frame, FrameSource};
use tracing::debug;

/// Longest a single capture may take
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`FrameSource`] that runs `<program>` and decodes its stdout
#[derive(Debug, Clone)]
pub struct CommandCamera {
    program: PathBuf,
    timeout: Duration,
}

impl CommandCamera {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: CAPTURE_TIMEOUT,
        }
    }
}

#[async_trait]
impl FrameSource for CommandCamera {
    async fn capture(&self) -> Result<Frame, CollaboratorError> {
        let output = tokio::process::Command::new(&self.program)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| CollaboratorError::Timeout)?
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(CollaboratorError::Failed(format!(
                "{:?} exited with {}",
                self.program, output.status
            )));
        }
        decode_frame(&output.stdout)
    }
}

/// Decode an encoded image into a grayscale frame
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CollaboratorError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| CollaboratorError::Failed(format!("undecodable frame: {}", e)))?
        .into_luma8();
    let (width, height) = image.dimensions();
    debug!("Captured {}x{} frame", width, height);
    Frame::new(width, height, image.into_raw()).map_err(|e| CollaboratorError::Failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgm(width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = format!("P5\n{} {}\n255\n", width, height).into_bytes();
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn test_decodes_binary_pgm() {
        let frame = decode_frame(&pgm(3, 2, &[0, 10, 20, 30, 40, 50])).unwrap();
        assert_eq!(frame, Frame::new(3, 2, vec![0, 10, 20, 30, 40, 50]).unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(decode_frame(b"not an image"), Err(CollaboratorError::Failed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_is_reported() {
        let camera = CommandCamera::new("false");
        assert!(matches!(camera.capture().await, Err(CollaboratorError::Failed(_))));

        let missing = CommandCamera::new("/nonexistent/breakguard-camera");
        assert!(matches!(missing.capture().await, Err(CollaboratorError::Unavailable(_))));
    }
}
