use rollcall_core::frame::{self, FrameError, LowLight};
use rollcall_core::{Detection, Extractor, ExtractorError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Collapse into the extractor error a session records for the frame.
    pub fn into_extractor_error(self) -> ExtractorError {
        match self {
            EngineError::Extractor(e) => e,
            EngineError::Frame(e) => ExtractorError::ExtractionFailed(e.to_string()),
            EngineError::Spawn(e) => ExtractorError::Unavailable(e.to_string()),
            EngineError::ChannelClosed => {
                ExtractorError::Unavailable("engine thread exited".into())
            }
        }
    }
}

/// Result of running one image through the extractor.
#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
    /// Whether low-light gamma correction was applied before extraction.
    pub enhanced: bool,
    pub elapsed: Duration,
}

/// Messages sent from service handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        /// Signalled when the engine thread dequeues the request.
        started: oneshot::Sender<()>,
        reply: oneshot::Sender<Result<ExtractedFrame, EngineError>>,
    },
}

type Reply = oneshot::Receiver<Result<ExtractedFrame, EngineError>>;

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn enqueue(&self, image: Vec<u8>) -> Result<(oneshot::Receiver<()>, Reply), EngineError> {
        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                started: started_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok((started_rx, reply_rx))
    }

    /// Decode, correct and extract one image.
    pub async fn extract(&self, image: Vec<u8>) -> Result<ExtractedFrame, EngineError> {
        let (_, reply_rx) = self.enqueue(image).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// [`extract`](Self::extract) bounded by `timeout`.
    ///
    /// The clock starts when the engine thread picks the request up, so
    /// time spent queued behind other frames is not charged to this one.
    /// On timeout the result is dropped.
    pub async fn extract_with_timeout(
        &self,
        image: Vec<u8>,
        timeout: Duration,
    ) -> Result<ExtractedFrame, ExtractorError> {
        let (started_rx, reply_rx) = self
            .enqueue(image)
            .await
            .map_err(EngineError::into_extractor_error)?;
        started_rx
            .await
            .map_err(|_| EngineError::ChannelClosed.into_extractor_error())?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result.map_err(EngineError::into_extractor_error),
            Ok(Err(_)) => Err(EngineError::ChannelClosed.into_extractor_error()),
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "extraction timed out");
                Err(ExtractorError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// Extraction is blocking (a child process or a native model), so it never
/// runs on the async runtime. Requests are served one at a time in arrival
/// order. The extractor must bound its own run time; a call that never
/// returns stalls every queued request.
pub fn spawn_engine<E>(mut extractor: E, low_light: LowLight) -> Result<EngineHandle, EngineError>
where
    E: Extractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, started, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("caller gone, skipping extraction");
                            continue;
                        }
                        let _ = started.send(());
                        let result = run_extract(&mut extractor, &low_light, &image);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_extract<E: Extractor>(
    extractor: &mut E,
    low_light: &LowLight,
    image: &[u8],
) -> Result<ExtractedFrame, EngineError> {
    let started = Instant::now();
    let prepared = frame::prepare(image, low_light)?;

    let detections = extractor.extract(prepared.payload(image))?;
    let elapsed = started.elapsed();
    tracing::debug!(
        faces = detections.len(),
        width = prepared.width,
        height = prepared.height,
        elapsed_ms = elapsed.as_millis() as u64,
        "frame extracted"
    );

    Ok(ExtractedFrame {
        width: prepared.width,
        height: prepared.height,
        detections,
        enhanced: prepared.enhanced.is_some(),
        elapsed,
    })
}
