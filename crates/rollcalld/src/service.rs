//! Enrollment and recognition APIs, independent of the transport.

use crate::config::{Config, MAX_SESSION_DEADLINE_SECS};
use crate::engine::EngineHandle;
use crate::store::{EnrolledFace, FaceStore, StoreError};
use crate::worker::{self, SessionHandle, WorkerError};
use rollcall_core::matcher::Verification;
use rollcall_core::session::{ProbeReport, RosterEntry};
use rollcall_core::{
    AttendanceReport, AttendanceSession, CosineMatcher, EnrollmentError, EnrollmentSession,
    ExtractorError, Gallery, IdentityEmbedding, IdentityId, MatchError, SampleOutcome, SessionError,
    SessionStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown handle {0}")]
    UnknownHandle(Uuid),
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("{0} is not enrolled")]
    NotEnrolled(IdentityId),
    #[error("no face detected")]
    NoFace,
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session task has exited")]
    WorkerGone,
}

impl From<WorkerError> for ServiceError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Session(e) => ServiceError::Session(e),
            WorkerError::Closed => ServiceError::WorkerGone,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub enrollments: usize,
    pub sessions: usize,
    pub enrolled: usize,
    pub threshold: f32,
}

pub struct AttendanceService {
    config: Config,
    engine: EngineHandle,
    store: FaceStore,
    enrollments: Mutex<HashMap<Uuid, EnrollmentSession>>,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl AttendanceService {
    pub fn new(config: Config, engine: EngineHandle, store: FaceStore) -> Self {
        Self {
            config,
            engine,
            store,
            enrollments: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn enrollments(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, EnrollmentSession>> {
        self.enrollments.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- enrollment ----

    pub fn start_enrollment(&self, identity: &str) -> Result<Uuid, ServiceError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(ServiceError::EmptyIdentity);
        }
        let session = EnrollmentSession::new(
            identity,
            self.config.pose.clone(),
            self.config.shots_per_pose,
        );
        let id = session.id();
        tracing::info!(enrollment = %id, identity, "enrollment started");
        self.enrollments().insert(id, session);
        Ok(id)
    }

    pub async fn submit_sample(
        &self,
        handle: Uuid,
        image: Vec<u8>,
    ) -> Result<SampleOutcome, ServiceError> {
        if !self.enrollments().contains_key(&handle) {
            return Err(ServiceError::UnknownHandle(handle));
        }
        let extracted = self
            .engine
            .extract_with_timeout(image, self.config.extractor_timeout())
            .await;

        let mut enrollments = self.enrollments();
        let session = enrollments
            .get_mut(&handle)
            .ok_or(ServiceError::UnknownHandle(handle))?;
        Ok(match extracted {
            Ok(frame) => session.submit(&frame.detections, frame.width, frame.height),
            Err(e) => session.extraction_failed(e.to_string()),
        })
    }

    /// Aggregate and persist. An incomplete enrollment stays open so the
    /// caller can resume capture.
    pub async fn finalize_enrollment(
        &self,
        handle: Uuid,
    ) -> Result<IdentityEmbedding, ServiceError> {
        let face = {
            let enrollments = self.enrollments();
            let session = enrollments
                .get(&handle)
                .ok_or(ServiceError::UnknownHandle(handle))?;
            session.finalize()?
        };
        self.store.upsert(&face).await?;
        self.enrollments().remove(&handle);
        tracing::info!(enrollment = %handle, identity = %face.identity, "enrollment finalized");
        Ok(face)
    }

    pub fn cancel_enrollment(&self, handle: Uuid) -> Result<(), ServiceError> {
        if self.enrollments().remove(&handle).is_none() {
            return Err(ServiceError::UnknownHandle(handle));
        }
        tracing::info!(enrollment = %handle, "enrollment cancelled");
        Ok(())
    }

    // ---- recognition ----

    /// Start scanning against `roster`. With no explicit gallery the roster's
    /// vectors are loaded from the store.
    pub async fn start_session(
        &self,
        roster: Vec<IdentityId>,
        gallery: Option<Gallery>,
        deadline_secs: Option<u64>,
    ) -> Result<Uuid, ServiceError> {
        if let Some(secs) = deadline_secs.filter(|&s| s > MAX_SESSION_DEADLINE_SECS) {
            return Err(SessionError::DeadlineOutOfRange(Duration::from_secs(secs)).into());
        }
        let gallery = match gallery {
            Some(g) => g,
            None => Gallery::from_enrolled(self.store.load(&roster).await?)?,
        };
        let session = AttendanceSession::new(
            roster,
            Arc::new(gallery),
            self.config.session_config(deadline_secs),
            tokio::time::Instant::now().into_std(),
        )?;
        let handle = worker::spawn_session(
            session,
            self.engine.clone(),
            self.config.extractor_timeout(),
        );
        let id = handle.id();
        self.sessions().insert(id, handle);
        Ok(id)
    }

    fn session(&self, id: Uuid) -> Result<SessionHandle, ServiceError> {
        self.sessions()
            .get(&id)
            .cloned()
            .ok_or(ServiceError::UnknownHandle(id))
    }

    pub async fn submit_probe(
        &self,
        id: Uuid,
        image: Vec<u8>,
    ) -> Result<ProbeReport, ServiceError> {
        Ok(self.session(id)?.submit_probe(image).await?)
    }

    pub async fn submit_batch(
        &self,
        id: Uuid,
        images: Vec<Vec<u8>>,
    ) -> Result<Vec<ProbeReport>, ServiceError> {
        Ok(self.session(id)?.submit_batch(images).await?)
    }

    pub async fn set_presence(
        &self,
        id: Uuid,
        identity: &str,
        present: bool,
    ) -> Result<(), ServiceError> {
        Ok(self.session(id)?.set_presence(identity, present).await?)
    }

    pub async fn review(&self, id: Uuid) -> Result<Vec<RosterEntry>, ServiceError> {
        Ok(self.session(id)?.review().await?)
    }

    pub async fn session_status(&self, id: Uuid) -> Result<SessionStatus, ServiceError> {
        Ok(self.session(id)?.status().await?)
    }

    pub fn cancel(&self, id: Uuid) -> Result<(), ServiceError> {
        self.session(id)?.cancel();
        tracing::info!(session = %id, "cancel requested");
        Ok(())
    }

    /// Commit attendance. The session is forgotten afterwards.
    pub async fn finalize(&self, id: Uuid) -> Result<AttendanceReport, ServiceError> {
        let report = self.session(id)?.finalize().await?;
        self.sessions().remove(&id);
        Ok(report)
    }

    // ---- one-to-one and bookkeeping ----

    /// Compare the largest face in `image` against one enrolled identity.
    pub async fn verify(
        &self,
        identity: &str,
        image: Vec<u8>,
    ) -> Result<Verification, ServiceError> {
        let enrolled = self
            .store
            .load(&[identity.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ServiceError::NotEnrolled(identity.to_string()))?;
        let frame = self
            .engine
            .extract_with_timeout(image, self.config.extractor_timeout())
            .await?;
        let probe = frame
            .detections
            .iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
            .ok_or(ServiceError::NoFace)?;
        let verification = CosineMatcher::new(self.config.similarity_threshold)
            .verify(&probe.embedding, &enrolled.embedding)?;
        tracing::info!(
            identity,
            matched = verification.matched,
            similarity = verification.similarity,
            "verify complete"
        );
        Ok(verification)
    }

    pub async fn list_enrolled(&self) -> Result<Vec<EnrolledFace>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub async fn remove_enrolled(&self, identity: &str) -> Result<bool, ServiceError> {
        Ok(self.store.remove(identity).await?)
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let enrolled = self.store.list().await?.len();
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            enrollments: self.enrollments().len(),
            sessions: self.sessions().len(),
            enrolled,
            threshold: self.config.similarity_threshold,
        })
    }
}
