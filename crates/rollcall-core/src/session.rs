//! Attendance session: roster, gallery snapshot and the confirmed-present set.
//!
//! The session is a plain single-writer state machine. It never captures or
//! extracts anything itself; its owner feeds it one frame result at a time
//! with a sequence number and the current time.
//!
//! ```text
//! scanning ──(roster complete | deadline | cancel | finalize)──▶ reviewing
//! reviewing ──(finalize)──▶ finalized
//! ```
//!
//! Absence is the default. A roster member is present only after a probe
//! matched them or an operator marked them present.

use crate::extractor::ExtractorError;
use crate::matcher::{CosineMatcher, Gallery, Match, MatchError, Matcher};
use crate::types::{Embedding, IdentityId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("roster is empty")]
    EmptyRoster,
    #[error("session is finalized")]
    Finalized,
    #[error("{0} is not on this session's roster")]
    UnknownIdentity(IdentityId),
    #[error("deadline of {0:?} is out of range")]
    DeadlineOutOfRange(Duration),
    #[error(transparent)]
    Match(#[from] MatchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scanning,
    Reviewing,
    Finalized,
}

/// Why scanning stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    RosterComplete,
    Deadline,
    Cancelled,
    UserFinalized,
}

/// Coarse session state for callers that only care about the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Active,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceSource {
    Matched,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub threshold: f32,
    pub deadline: Duration,
    /// Consecutive extractor failures before the backend is reported degraded.
    pub failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            deadline: Duration::from_secs(45),
            failure_threshold: 3,
        }
    }
}

/// Faces extracted from one frame.
#[derive(Debug, Clone)]
pub struct ProbeFrame {
    pub seq: u64,
    pub probes: Vec<Embedding>,
    pub latency: Duration,
}

/// Why a frame result was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Discarded {
    /// Sequence number not newer than the last applied frame.
    Stale,
    /// Scanning already ended.
    NotScanning,
}

/// What happened to one submitted frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub seq: u64,
    pub discarded: Option<Discarded>,
    pub detected_faces: usize,
    /// Roster matches in this frame.
    pub matches: Vec<Match>,
    pub newly_confirmed: Vec<IdentityId>,
    pub error: Option<String>,
    pub phase: Phase,
    pub present: usize,
    pub roster_size: usize,
}

/// One roster line in the review list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub identity: IdentityId,
    pub present: bool,
    /// Best similarity seen this session, if ever matched.
    pub confidence: Option<f32>,
    pub source: Option<PresenceSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReport {
    pub session: Uuid,
    pub present: Vec<IdentityId>,
    pub absent: Vec<IdentityId>,
    pub entries: Vec<RosterEntry>,
}

/// Live diagnostics for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session: Uuid,
    pub phase: Phase,
    pub outcome: Outcome,
    pub end_reason: Option<EndReason>,
    pub roster_size: usize,
    /// Roster members with no enrolled embedding in the gallery.
    pub not_enrolled: usize,
    pub present: usize,
    pub frames_processed: u64,
    pub last_detected_faces: usize,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub backend_degraded: bool,
    pub remaining_ms: u64,
}

pub struct AttendanceSession {
    id: Uuid,
    roster: Vec<IdentityId>,
    roster_set: HashSet<IdentityId>,
    gallery: Arc<Gallery>,
    matcher: CosineMatcher,
    failure_threshold: u32,
    deadline: Instant,
    phase: Phase,
    end_reason: Option<EndReason>,
    matched: HashMap<IdentityId, f32>,
    overrides: HashMap<IdentityId, bool>,
    last_seq: Option<u64>,
    frames_processed: u64,
    last_detected_faces: usize,
    last_latency: Option<Duration>,
    consecutive_failures: u32,
}

impl AttendanceSession {
    /// Start scanning. Duplicate roster ids are collapsed, first one wins.
    ///
    /// Only roster members are kept from `gallery`, so an off-roster entry
    /// can never outscore a roster member for the same face.
    pub fn new(
        roster: Vec<IdentityId>,
        gallery: Arc<Gallery>,
        config: SessionConfig,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let mut roster_set = HashSet::with_capacity(roster.len());
        let roster: Vec<IdentityId> = roster
            .into_iter()
            .filter(|id| roster_set.insert(id.clone()))
            .collect();
        if roster.is_empty() {
            return Err(SessionError::EmptyRoster);
        }
        let deadline = now
            .checked_add(config.deadline)
            .ok_or(SessionError::DeadlineOutOfRange(config.deadline))?;
        let gallery = Arc::new(gallery.scoped_to(&roster));

        let id = Uuid::new_v4();
        tracing::info!(
            session = %id,
            roster = roster.len(),
            gallery = gallery.len(),
            threshold = config.threshold,
            deadline_secs = config.deadline.as_secs_f32(),
            "attendance session started"
        );

        Ok(Self {
            id,
            roster,
            roster_set,
            gallery,
            matcher: CosineMatcher::new(config.threshold),
            failure_threshold: config.failure_threshold.max(1),
            deadline,
            phase: Phase::Scanning,
            end_reason: None,
            matched: HashMap::new(),
            overrides: HashMap::new(),
            last_seq: None,
            frames_processed: 0,
            last_detected_faces: 0,
            last_latency: None,
            consecutive_failures: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn roster(&self) -> &[IdentityId] {
        &self.roster
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn is_scanning(&self) -> bool {
        self.phase == Phase::Scanning
    }

    pub fn backend_degraded(&self) -> bool {
        self.consecutive_failures >= self.failure_threshold
    }

    /// Best matched similarity for an identity this session.
    pub fn confidence(&self, identity: &str) -> Option<f32> {
        self.matched.get(identity).copied()
    }

    fn is_present(&self, identity: &str) -> bool {
        match self.overrides.get(identity) {
            Some(&manual) => manual,
            None => self.matched.contains_key(identity),
        }
    }

    fn present_count(&self) -> usize {
        self.roster.iter().filter(|id| self.is_present(id)).count()
    }

    fn end_scan(&mut self, reason: EndReason) {
        if self.phase != Phase::Scanning {
            return;
        }
        self.phase = Phase::Reviewing;
        self.end_reason = Some(reason);
        tracing::info!(
            session = %self.id,
            ?reason,
            present = self.present_count(),
            roster = self.roster.len(),
            "scanning ended"
        );
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.phase == Phase::Finalized {
            Err(SessionError::Finalized)
        } else {
            Ok(())
        }
    }

    fn check_complete(&mut self) {
        if self.phase == Phase::Scanning && self.present_count() == self.roster.len() {
            self.end_scan(EndReason::RosterComplete);
        }
    }

    /// Expire the scan if the deadline has passed. Returns the phase afterwards.
    pub fn tick(&mut self, now: Instant) -> Phase {
        if self.phase == Phase::Scanning && now >= self.deadline {
            self.end_scan(EndReason::Deadline);
        }
        self.phase
    }

    /// Stop scanning early. Not an error, and a no-op once scanning ended.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.end_scan(EndReason::Cancelled);
        Ok(())
    }

    fn report(&self, seq: u64) -> ProbeReport {
        ProbeReport {
            seq,
            discarded: None,
            detected_faces: 0,
            matches: Vec::new(),
            newly_confirmed: Vec::new(),
            error: None,
            phase: self.phase,
            present: self.present_count(),
            roster_size: self.roster.len(),
        }
    }

    /// Shared guard for frame results: deadline, phase and ordering.
    fn admit(&mut self, seq: u64, now: Instant) -> Result<Option<ProbeReport>, SessionError> {
        self.ensure_open()?;
        self.tick(now);
        let discarded = if self.phase != Phase::Scanning {
            Some(Discarded::NotScanning)
        } else if self.last_seq.is_some_and(|last| seq <= last) {
            Some(Discarded::Stale)
        } else {
            None
        };
        Ok(discarded.map(|d| {
            tracing::debug!(session = %self.id, seq, ?d, "frame discarded");
            ProbeReport {
                discarded: Some(d),
                ..self.report(seq)
            }
        }))
    }

    /// Apply the faces extracted from one frame.
    ///
    /// A probe whose dimension does not match the gallery is a configuration
    /// error and fails the call without touching the session.
    pub fn apply_probes(
        &mut self,
        frame: ProbeFrame,
        now: Instant,
    ) -> Result<ProbeReport, SessionError> {
        if let Some(report) = self.admit(frame.seq, now)? {
            return Ok(report);
        }
        if let Some(dim) = self.gallery.dim() {
            if let Some(bad) = frame.probes.iter().find(|p| p.dim() != dim) {
                return Err(MatchError::DimensionMismatch {
                    expected: dim,
                    actual: bad.dim(),
                }
                .into());
            }
        }

        self.last_seq = Some(frame.seq);
        self.frames_processed += 1;
        self.last_detected_faces = frame.probes.len();
        self.last_latency = Some(frame.latency);
        self.consecutive_failures = 0;

        let batch = self.matcher.match_all(&frame.probes, &self.gallery);
        let mut matches = Vec::with_capacity(batch.matches.len());
        let mut newly_confirmed = Vec::new();

        for m in batch.matches {
            match self.matched.get_mut(&m.identity) {
                Some(best) => {
                    if m.confidence > *best {
                        *best = m.confidence;
                    }
                }
                None => {
                    tracing::info!(
                        session = %self.id,
                        identity = %m.identity,
                        similarity = m.confidence,
                        seq = frame.seq,
                        "identity confirmed"
                    );
                    self.matched.insert(m.identity.clone(), m.confidence);
                    newly_confirmed.push(m.identity.clone());
                }
            }
            matches.push(m);
        }

        self.check_complete();

        Ok(ProbeReport {
            detected_faces: frame.probes.len(),
            matches,
            newly_confirmed,
            ..self.report(frame.seq)
        })
    }

    /// Record a frame the extractor failed on. Never ends the session.
    pub fn record_failure(
        &mut self,
        seq: u64,
        error: &ExtractorError,
        now: Instant,
    ) -> Result<ProbeReport, SessionError> {
        if let Some(report) = self.admit(seq, now)? {
            return Ok(report);
        }
        self.last_seq = Some(seq);
        self.frames_processed += 1;
        self.last_detected_faces = 0;
        self.consecutive_failures += 1;

        if self.consecutive_failures == self.failure_threshold {
            tracing::warn!(
                session = %self.id,
                failures = self.consecutive_failures,
                error = %error,
                "extraction backend degraded"
            );
        } else {
            tracing::debug!(session = %self.id, seq, error = %error, "frame extraction failed");
        }

        Ok(ProbeReport {
            error: Some(error.to_string()),
            ..self.report(seq)
        })
    }

    /// Operator override for one roster member.
    pub fn set_presence(&mut self, identity: &str, present: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.roster_set.contains(identity) {
            return Err(SessionError::UnknownIdentity(identity.to_string()));
        }
        tracing::info!(session = %self.id, identity, present, "manual override");
        self.overrides.insert(identity.to_string(), present);
        self.check_complete();
        Ok(())
    }

    /// Present/absent for every roster member, in roster order.
    pub fn review(&self) -> Vec<RosterEntry> {
        self.roster
            .iter()
            .map(|id| {
                let source = match self.overrides.get(id) {
                    Some(_) => Some(PresenceSource::Manual),
                    None if self.matched.contains_key(id) => Some(PresenceSource::Matched),
                    None => None,
                };
                RosterEntry {
                    identity: id.clone(),
                    present: self.is_present(id),
                    confidence: self.matched.get(id).copied(),
                    source,
                }
            })
            .collect()
    }

    /// Commit the result. Ends scanning first if it is still running.
    pub fn finalize(&mut self) -> Result<AttendanceReport, SessionError> {
        self.ensure_open()?;
        self.end_scan(EndReason::UserFinalized);
        self.phase = Phase::Finalized;

        let entries = self.review();
        let (present, absent): (Vec<_>, Vec<_>) = entries.iter().partition(|e| e.present);
        let report = AttendanceReport {
            session: self.id,
            present: present.into_iter().map(|e| e.identity.clone()).collect(),
            absent: absent.into_iter().map(|e| e.identity.clone()).collect(),
            entries,
        };
        tracing::info!(
            session = %self.id,
            present = report.present.len(),
            absent = report.absent.len(),
            "attendance finalized"
        );
        Ok(report)
    }

    pub fn status(&self, now: Instant) -> SessionStatus {
        let outcome = match (self.phase, self.end_reason) {
            (Phase::Scanning, _) => Outcome::Active,
            (_, Some(EndReason::Deadline)) => Outcome::Expired,
            _ => Outcome::Completed,
        };
        SessionStatus {
            session: self.id,
            phase: self.phase,
            outcome,
            end_reason: self.end_reason,
            roster_size: self.roster.len(),
            not_enrolled: self
                .roster
                .iter()
                .filter(|id| !self.gallery.contains(id))
                .count(),
            present: self.present_count(),
            frames_processed: self.frames_processed,
            last_detected_faces: self.last_detected_faces,
            last_latency_ms: self.last_latency.map(|d| d.as_millis() as u64),
            consecutive_failures: self.consecutive_failures,
            backend_degraded: self.backend_degraded(),
            remaining_ms: if self.phase == Phase::Scanning {
                self.deadline.saturating_duration_since(now).as_millis() as u64
            } else {
                0
            },
        }
    }
}
