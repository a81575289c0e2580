//! Extractor backed by an external program.
//!
//! The program receives one encoded image on stdin and prints a JSON array
//! on stdout, one object per face:
//!
//! ```json
//! [{"bbox": {"x": 12, "y": 40, "width": 96, "height": 96, "confidence": 0.98},
//!   "landmarks": [[40, 70], [80, 70], [60, 90], [45, 110], [75, 110]],
//!   "embedding": [0.013, -0.092, ...],
//!   "model": "facenet-128"}]
//! ```
//!
//! `landmarks`, `confidence` and `model` are optional.

use rollcall_core::{BoundingBox, Detection, Embedding, Extractor, ExtractorError};
use serde::Deserialize;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Deserialize)]
struct WireBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    #[serde(default = "full_confidence")]
    confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    bbox: WireBox,
    #[serde(default)]
    landmarks: Option<Vec<[f32; 2]>>,
    embedding: Vec<f32>,
    #[serde(default)]
    model: Option<String>,
}

impl WireDetection {
    fn into_detection(self) -> Result<Detection, ExtractorError> {
        let landmarks = match self.landmarks {
            None => None,
            Some(points) => {
                let points: [[f32; 2]; 5] = points.try_into().map_err(|p: Vec<[f32; 2]>| {
                    let msg = format!("expected 5 landmarks, got {}", p.len());
                    ExtractorError::ExtractionFailed(msg)
                })?;
                Some(points.map(|[x, y]| (x, y)))
            }
        };
        if self.embedding.is_empty() {
            return Err(ExtractorError::ExtractionFailed("empty embedding".into()));
        }
        let mut embedding = Embedding::new(self.embedding);
        embedding.model_version = self.model;
        Ok(Detection {
            bbox: BoundingBox {
                x: self.bbox.x,
                y: self.bbox.y,
                width: self.bbox.width,
                height: self.bbox.height,
                confidence: self.bbox.confidence,
                landmarks,
            },
            embedding,
        })
    }
}

/// Parse the extractor's stdout.
pub fn parse_detections(stdout: &[u8]) -> Result<Vec<Detection>, ExtractorError> {
    let wire: Vec<WireDetection> = serde_json::from_slice(stdout)
        .map_err(|e| ExtractorError::ExtractionFailed(format!("invalid extractor output: {e}")))?;
    wire.into_iter().map(WireDetection::into_detection).collect()
}

pub struct ProcessExtractor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn unavailable(&self, e: std::io::Error) -> ExtractorError {
        ExtractorError::Unavailable(format!("{}: {e}", self.program))
    }
}

/// Drain a child pipe on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl Extractor for ProcessExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Detection>, ExtractorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.unavailable(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractorError::Unavailable("extractor stdin not captured".into()))?;

        // Pipes are serviced off-thread so a chatty or hung child cannot
        // block the wait loop below.
        let image = image.to_vec();
        std::thread::spawn(move || {
            if let Err(e) = stdin.write_all(&image) {
                tracing::debug!(error = %e, "extractor closed stdin early");
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait().map_err(|e| self.unavailable(e))? {
                Some(status) => break status,
                None if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(
                        program = %self.program,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "extractor killed after timeout"
                    );
                    return Err(ExtractorError::Timeout(self.timeout.as_millis() as u64));
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(ExtractorError::ExtractionFailed(format!(
                "extractor exited with {status}: {}",
                stderr.trim()
            )));
        }
        parse_detections(&stdout)
    }
}
