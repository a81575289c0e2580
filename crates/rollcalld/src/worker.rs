//! One tokio task per attendance session.
//!
//! The task owns the [`AttendanceSession`] exclusively. Callers talk to it
//! through a [`SessionHandle`]; cancellation travels on a separate watch
//! channel so it can interrupt an extraction that is already in flight.

use crate::engine::{EngineHandle, ExtractedFrame};
use rollcall_core::session::{ProbeFrame, ProbeReport, RosterEntry};
use rollcall_core::{
    AttendanceReport, AttendanceSession, ExtractorError, SessionError, SessionStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session task has exited")]
    Closed,
}

enum SessionCommand {
    Probe {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<ProbeReport, SessionError>>,
    },
    Batch {
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Vec<ProbeReport>, SessionError>>,
    },
    SetPresence {
        identity: String,
        present: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Review {
        reply: oneshot::Sender<Vec<RosterEntry>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Finalize {
        reply: oneshot::Sender<Result<AttendanceReport, SessionError>>,
    },
}

/// Clone-safe handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
    cancel: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| WorkerError::Closed)?;
        reply_rx.await.map_err(|_| WorkerError::Closed)
    }

    /// Extract one frame and match its faces against the roster.
    pub async fn submit_probe(&self, image: Vec<u8>) -> Result<ProbeReport, WorkerError> {
        Ok(self
            .request(|reply| SessionCommand::Probe { image, reply })
            .await??)
    }

    /// Extract several frames concurrently and apply them in submission order.
    pub async fn submit_batch(
        &self,
        images: Vec<Vec<u8>>,
    ) -> Result<Vec<ProbeReport>, WorkerError> {
        Ok(self
            .request(|reply| SessionCommand::Batch { images, reply })
            .await??)
    }

    pub async fn set_presence(&self, identity: &str, present: bool) -> Result<(), WorkerError> {
        let identity = identity.to_string();
        Ok(self
            .request(|reply| SessionCommand::SetPresence {
                identity,
                present,
                reply,
            })
            .await??)
    }

    pub async fn review(&self) -> Result<Vec<RosterEntry>, WorkerError> {
        self.request(|reply| SessionCommand::Review { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus, WorkerError> {
        self.request(|reply| SessionCommand::Status { reply }).await
    }

    pub async fn finalize(&self) -> Result<AttendanceReport, WorkerError> {
        Ok(self
            .request(|reply| SessionCommand::Finalize { reply })
            .await??)
    }

    /// Stop scanning. Takes effect even while a frame is being extracted.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

/// Session clock: tokio's, so paused-time tests drive deadlines.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

enum Interrupt {
    Cancelled,
    Deadline,
}

pub fn spawn_session(
    session: AttendanceSession,
    engine: EngineHandle,
    extract_timeout: Duration,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(16);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let id = session.id();
    let worker = SessionWorker {
        session,
        engine,
        extract_timeout,
        rx,
        cancel_rx,
        next_seq: 0,
    };
    tokio::spawn(worker.run());
    SessionHandle {
        id,
        tx,
        cancel: Arc::new(cancel_tx),
    }
}

struct SessionWorker {
    session: AttendanceSession,
    engine: EngineHandle,
    extract_timeout: Duration,
    rx: mpsc::Receiver<SessionCommand>,
    cancel_rx: watch::Receiver<bool>,
    next_seq: u64,
}

/// Resolves once cancellation is requested or every handle is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|&c| c).await;
}

impl SessionWorker {
    async fn run(mut self) {
        let id = self.session.id();
        loop {
            let scanning = self.session.is_scanning();
            let deadline = tokio::time::Instant::from_std(self.session.deadline());
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel_rx), if scanning => {
                    let _ = self.session.cancel();
                }
                _ = tokio::time::sleep_until(deadline), if scanning => {
                    self.session.tick(now());
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
        tracing::debug!(session = %id, "session task exiting");
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Probe { image, reply } => {
                let result = self.probe(image).await;
                let _ = reply.send(result);
            }
            SessionCommand::Batch { images, reply } => {
                let result = self.batch(images).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetPresence {
                identity,
                present,
                reply,
            } => {
                let _ = reply.send(self.session.set_presence(&identity, present));
            }
            SessionCommand::Review { reply } => {
                let _ = reply.send(self.session.review());
            }
            SessionCommand::Status { reply } => {
                self.session.tick(now());
                let _ = reply.send(self.session.status(now()));
            }
            SessionCommand::Finalize { reply } => {
                let _ = reply.send(self.session.finalize());
            }
        }
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Report for a frame that never reached the matcher.
    fn empty_frame(&mut self, seq: u64) -> Result<ProbeReport, SessionError> {
        self.session.apply_probes(
            ProbeFrame {
                seq,
                probes: Vec::new(),
                latency: Duration::ZERO,
            },
            now(),
        )
    }

    fn interrupt(&mut self, reason: Interrupt) {
        match reason {
            Interrupt::Cancelled => {
                let _ = self.session.cancel();
            }
            Interrupt::Deadline => {
                self.session.tick(now());
            }
        }
    }

    fn apply(
        &mut self,
        seq: u64,
        extracted: Result<ExtractedFrame, ExtractorError>,
    ) -> Result<ProbeReport, SessionError> {
        match extracted {
            Ok(frame) => {
                tracing::debug!(
                    session = %self.session.id(),
                    seq,
                    faces = frame.detections.len(),
                    enhanced = frame.enhanced,
                    elapsed_ms = frame.elapsed.as_millis() as u64,
                    "probe frame extracted"
                );
                self.session.apply_probes(
                    ProbeFrame {
                        seq,
                        probes: frame.detections.into_iter().map(|d| d.embedding).collect(),
                        latency: frame.elapsed,
                    },
                    now(),
                )
            }
            Err(e) => self.session.record_failure(seq, &e, now()),
        }
    }

    async fn probe(&mut self, image: Vec<u8>) -> Result<ProbeReport, SessionError> {
        let seq = self.take_seq();
        if !self.session.is_scanning() {
            return self.empty_frame(seq);
        }

        let deadline = tokio::time::Instant::from_std(self.session.deadline());
        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel_rx) => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
            r = self.engine.extract_with_timeout(image, self.extract_timeout) => Ok(r),
        };

        match outcome {
            Ok(extracted) => self.apply(seq, extracted),
            Err(reason) => {
                self.interrupt(reason);
                self.empty_frame(seq)
            }
        }
    }

    async fn batch(&mut self, images: Vec<Vec<u8>>) -> Result<Vec<ProbeReport>, SessionError> {
        let seqs: Vec<u64> = images.iter().map(|_| self.take_seq()).collect();
        if !self.session.is_scanning() {
            return seqs.into_iter().map(|seq| self.empty_frame(seq)).collect();
        }

        let count = images.len();
        let mut tasks = JoinSet::new();
        for (index, image) in images.into_iter().enumerate() {
            let engine = self.engine.clone();
            let timeout = self.extract_timeout;
            tasks.spawn(async move { (index, engine.extract_with_timeout(image, timeout).await) });
        }

        let deadline = tokio::time::Instant::from_std(self.session.deadline());
        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel_rx) => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
            r = collect(&mut tasks, count) => Ok(r),
        };

        let results = match outcome {
            Ok(results) => results,
            Err(reason) => {
                tasks.abort_all();
                self.interrupt(reason);
                return seqs.into_iter().map(|seq| self.empty_frame(seq)).collect();
            }
        };

        // One bad frame does not sink the batch: hard errors are reported on
        // that frame alone.
        let mut reports = Vec::with_capacity(count);
        for (seq, extracted) in seqs.into_iter().zip(results) {
            let extracted = extracted.unwrap_or_else(|| {
                Err(ExtractorError::ExtractionFailed("extraction task failed".into()))
            });
            let report = match self.apply(seq, extracted) {
                Ok(report) => report,
                Err(SessionError::Finalized) => return Err(SessionError::Finalized),
                Err(e) => {
                    tracing::warn!(session = %self.session.id(), seq, error = %e, "frame rejected");
                    let status = self.session.status(now());
                    ProbeReport {
                        seq,
                        discarded: None,
                        detected_faces: 0,
                        matches: Vec::new(),
                        newly_confirmed: Vec::new(),
                        error: Some(e.to_string()),
                        phase: status.phase,
                        present: status.present,
                        roster_size: status.roster_size,
                    }
                }
            };
            reports.push(report);
        }
        Ok(reports)
    }
}

async fn collect(
    tasks: &mut JoinSet<(usize, Result<ExtractedFrame, ExtractorError>)>,
    count: usize,
) -> Vec<Option<Result<ExtractedFrame, ExtractorError>>> {
    let mut results: Vec<Option<_>> = (0..count).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => tracing::warn!(error = %e, "extraction task panicked"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{detection, fake, png};
    use rollcall_core::frame::LowLight;
    use rollcall_core::session::{Discarded, EndReason, Phase, SessionConfig};
    use rollcall_core::{Embedding, Gallery};

    fn gallery() -> Arc<Gallery> {
        let mut g = Gallery::new();
        g.insert("alice", Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        g.insert("bob", Embedding::new(vec![0.0, 1.0, 0.0])).unwrap();
        Arc::new(g)
    }

    fn session(deadline: Duration) -> AttendanceSession {
        AttendanceSession::new(
            vec!["alice".into(), "bob".into()],
            gallery(),
            SessionConfig {
                threshold: 0.5,
                deadline,
                failure_threshold: 3,
            },
            now(),
        )
        .unwrap()
    }

    /// The image's first pixel picks who is in the frame.
    fn by_brightness() -> EngineHandle {
        spawn_engine(
            fake(|bytes| {
                let img = image::load_from_memory(bytes).unwrap().to_rgb8();
                Ok(match img.get_pixel(0, 0)[0] {
                    100 => vec![detection(vec![1.0, 0.05, 0.0])],
                    150 => vec![detection(vec![0.05, 1.0, 0.0])],
                    200 => vec![detection(vec![0.0, 1.0])],
                    _ => Vec::new(),
                })
            }),
            LowLight::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_probes_complete_roster() {
        let handle = spawn_session(
            session(Duration::from_secs(30)),
            by_brightness(),
            Duration::from_secs(5),
        );

        let r1 = handle.submit_probe(png(8, 8, 100)).await.unwrap();
        assert_eq!(r1.seq, 1);
        assert_eq!(r1.newly_confirmed, vec!["alice".to_string()]);

        let r2 = handle.submit_probe(png(8, 8, 150)).await.unwrap();
        assert_eq!(r2.phase, Phase::Reviewing);

        let status = handle.status().await.unwrap();
        assert_eq!(status.end_reason, Some(EndReason::RosterComplete));

        let report = handle.finalize().await.unwrap();
        assert_eq!(report.present, vec!["alice".to_string(), "bob".to_string()]);
        assert!(report.absent.is_empty());
    }

    #[tokio::test]
    async fn test_batch_applies_in_order_and_isolates_bad_frames() {
        let handle = spawn_session(
            session(Duration::from_secs(30)),
            by_brightness(),
            Duration::from_secs(5),
        );

        let reports = handle
            .submit_batch(vec![png(8, 8, 200), png(8, 8, 100), b"garbage".to_vec()])
            .await
            .unwrap();
        assert_eq!(reports.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        // Wrong dimension: rejected on that frame only.
        assert!(reports[0].error.is_some());
        assert_eq!(reports[1].newly_confirmed, vec!["alice".to_string()]);
        assert!(reports[2].error.is_some());

        let entries = handle.review().await.unwrap();
        assert!(entries[0].present);
        assert!(!entries[1].present);
    }

    #[tokio::test]
    async fn test_batch_on_slow_backend_does_not_time_out_queued_frames() {
        let slow = spawn_engine(
            fake(|_| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(vec![detection(vec![1.0, 0.0, 0.0])])
            }),
            LowLight::default(),
        )
        .unwrap();
        let handle = spawn_session(
            session(Duration::from_secs(30)),
            slow,
            Duration::from_millis(250),
        );

        let reports = handle.submit_batch((0..5).map(|_| png(8, 8, 100)).collect()).await.unwrap();
        assert_eq!(reports.len(), 5);
        for report in &reports {
            assert_eq!(report.error, None, "frame {}", report.seq);
            assert_eq!(report.detected_faces, 1);
        }
        assert_eq!(reports[0].newly_confirmed, vec!["alice".to_string()]);

        let status = handle.status().await.unwrap();
        assert!(!status.backend_degraded);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_idle_session() {
        let handle = spawn_session(
            session(Duration::from_secs(45)),
            by_brightness(),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_secs(46)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Reviewing);
        assert_eq!(status.end_reason, Some(EndReason::Deadline));

        let late = handle.submit_probe(png(8, 8, 100)).await.unwrap();
        assert_eq!(late.discarded, Some(Discarded::NotScanning));
        assert!(late.newly_confirmed.is_empty());

        let report = handle.finalize().await.unwrap();
        assert!(report.present.is_empty());
        assert_eq!(report.absent.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_extraction() {
        let slow = spawn_engine(
            fake(|_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(vec![detection(vec![1.0, 0.0, 0.0])])
            }),
            LowLight::default(),
        )
        .unwrap();
        let handle = spawn_session(session(Duration::from_secs(30)), slow, Duration::from_secs(5));

        let probing = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.submit_probe(png(8, 8, 100)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let report = probing.await.unwrap().unwrap();
        assert_eq!(report.discarded, Some(Discarded::NotScanning));
        let status = handle.status().await.unwrap();
        assert_eq!(status.end_reason, Some(EndReason::Cancelled));
        assert_eq!(status.present, 0);
    }

    #[tokio::test]
    async fn test_backend_failures_keep_session_open() {
        let down = spawn_engine(
            fake(|_| Err(ExtractorError::Unavailable("connection refused".into()))),
            LowLight::default(),
        )
        .unwrap();
        let handle = spawn_session(session(Duration::from_secs(30)), down, Duration::from_secs(5));
        for _ in 0..3 {
            let r = handle.submit_probe(png(8, 8, 100)).await.unwrap();
            assert!(r.error.is_some());
        }
        let status = handle.status().await.unwrap();
        assert!(status.backend_degraded);
        assert_eq!(status.phase, Phase::Scanning);

        handle.set_presence("bob", true).await.unwrap();
        assert!(matches!(
            handle.set_presence("mallory", true).await,
            Err(WorkerError::Session(SessionError::UnknownIdentity(_)))
        ));
    }
}
