use crate::service::{AttendanceService, ServiceError};
use rollcall_core::{EnrollmentError, SessionError};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Handles are UUID strings. Structured results are returned as JSON.
pub struct AttendanceBus {
    service: Arc<AttendanceService>,
}

impl AttendanceBus {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

fn to_fdo(e: ServiceError) -> fdo::Error {
    let msg = e.to_string();
    match e {
        ServiceError::UnknownHandle(_) => fdo::Error::UnknownObject(msg),
        ServiceError::EmptyIdentity
        | ServiceError::NotEnrolled(_)
        | ServiceError::NoFace
        | ServiceError::Match(_)
        | ServiceError::Enrollment(EnrollmentError::IncompletePoses { .. })
        | ServiceError::Enrollment(EnrollmentError::IncompleteBatch { .. })
        | ServiceError::Session(SessionError::EmptyRoster)
        | ServiceError::Session(SessionError::UnknownIdentity(_))
        | ServiceError::Session(SessionError::Finalized)
        | ServiceError::Session(SessionError::DeadlineOutOfRange(_))
        | ServiceError::Session(SessionError::Match(_)) => fdo::Error::InvalidArgs(msg),
        _ => fdo::Error::Failed(msg),
    }
}

fn parse_handle(handle: &str) -> fdo::Result<Uuid> {
    Uuid::parse_str(handle)
        .map_err(|_| fdo::Error::InvalidArgs(format!("invalid handle: {handle}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceBus {
    /// Begin enrolling an identity. Returns the enrollment handle.
    async fn start_enrollment(&self, identity: &str) -> fdo::Result<String> {
        tracing::info!(identity, "start_enrollment requested");
        let handle = self.service.start_enrollment(identity).map_err(to_fdo)?;
        Ok(handle.to_string())
    }

    /// Submit one frame to an enrollment. Returns the sample outcome as JSON.
    async fn submit_sample(&self, handle: &str, image: Vec<u8>) -> fdo::Result<String> {
        let handle = parse_handle(handle)?;
        let outcome = self.service.submit_sample(handle, image).await.map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Aggregate and store the enrollment. Returns `{identity, dim}` as JSON.
    async fn finalize_enrollment(&self, handle: &str) -> fdo::Result<String> {
        let handle = parse_handle(handle)?;
        let face = self.service.finalize_enrollment(handle).await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "identity": face.identity,
            "dim": face.embedding.dim(),
            "enrolled_at": face.enrolled_at,
        })
        .to_string())
    }

    async fn cancel_enrollment(&self, handle: &str) -> fdo::Result<()> {
        let handle = parse_handle(handle)?;
        self.service.cancel_enrollment(handle).map_err(to_fdo)
    }

    /// Start an attendance scan against a roster of enrolled identities.
    /// `deadline_secs` of 0 uses the configured default.
    async fn start_session(&self, roster: Vec<String>, deadline_secs: u32) -> fdo::Result<String> {
        tracing::info!(roster = roster.len(), deadline_secs, "start_session requested");
        let deadline = (deadline_secs > 0).then_some(deadline_secs as u64);
        let id = self
            .service
            .start_session(roster, None, deadline)
            .await
            .map_err(to_fdo)?;
        Ok(id.to_string())
    }

    async fn submit_probe(&self, session: &str, image: Vec<u8>) -> fdo::Result<String> {
        let id = parse_handle(session)?;
        let report = self.service.submit_probe(id, image).await.map_err(to_fdo)?;
        to_json(&report)
    }

    async fn submit_batch(&self, session: &str, images: Vec<Vec<u8>>) -> fdo::Result<String> {
        let id = parse_handle(session)?;
        let reports = self.service.submit_batch(id, images).await.map_err(to_fdo)?;
        to_json(&reports)
    }

    async fn set_presence(&self, session: &str, identity: &str, present: bool) -> fdo::Result<()> {
        let id = parse_handle(session)?;
        self.service
            .set_presence(id, identity, present)
            .await
            .map_err(to_fdo)
    }

    async fn review(&self, session: &str) -> fdo::Result<String> {
        let id = parse_handle(session)?;
        let entries = self.service.review(id).await.map_err(to_fdo)?;
        to_json(&entries)
    }

    async fn session_status(&self, session: &str) -> fdo::Result<String> {
        let id = parse_handle(session)?;
        let status = self.service.session_status(id).await.map_err(to_fdo)?;
        to_json(&status)
    }

    async fn cancel(&self, session: &str) -> fdo::Result<()> {
        let id = parse_handle(session)?;
        self.service.cancel(id).map_err(to_fdo)
    }

    /// Commit attendance. Returns `{present, absent, entries}` as JSON.
    async fn finalize(&self, session: &str) -> fdo::Result<String> {
        let id = parse_handle(session)?;
        let report = self.service.finalize(id).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Compare one frame against a single enrolled identity.
    async fn verify(&self, identity: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(identity, "verify requested");
        let verification = self.service.verify(identity, image).await.map_err(to_fdo)?;
        to_json(&verification)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.service.status().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// List enrolled identities (no vectors).
    async fn list_enrolled(&self) -> fdo::Result<String> {
        let faces = self.service.list_enrolled().await.map_err(to_fdo)?;
        to_json(&faces)
    }

    async fn remove_enrolled(&self, identity: &str) -> fdo::Result<bool> {
        tracing::info!(identity, "remove_enrolled requested");
        self.service.remove_enrolled(identity).await.map_err(to_fdo)
    }
}
