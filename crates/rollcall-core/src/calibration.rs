//! Empirical threshold calibration for a given extractor.
//!
//! The right acceptance threshold depends entirely on the embedding model.
//! Collect several embeddings per identity with the extractor that will be
//! deployed, run [`calibrate`], and use the recommended threshold: it is the
//! cut that minimizes false accepts + false rejects on that data.

use crate::types::{Embedding, IdentityId};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("need at least one identity with two or more embeddings")]
    NoGenuinePairs,
    #[error("need at least two identities")]
    NoImpostorPairs,
    #[error("embedding for {identity} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        identity: IdentityId,
        expected: usize,
        actual: usize,
    },
    #[error("embedding for {0} has zero or non-finite norm")]
    Degenerate(IdentityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl Summary {
    fn of(scores: &[f32]) -> Summary {
        let count = scores.len();
        let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = (scores.iter().map(|&s| s as f64).sum::<f64>() / count.max(1) as f64) as f32;
        Summary { count, min, max, mean }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calibration {
    pub genuine: Summary,
    pub impostor: Summary,
    pub threshold: f32,
    /// Share of impostor pairs at or above the threshold.
    pub false_accept_rate: f64,
    /// Share of genuine pairs below the threshold.
    pub false_reject_rate: f64,
}

/// Error rates at a threshold, given ascending score lists.
fn rates(genuine: &[f32], impostor: &[f32], threshold: f32) -> (f64, f64) {
    let false_accepts = impostor.len() - impostor.partition_point(|&s| s < threshold);
    let false_rejects = genuine.partition_point(|&s| s < threshold);
    (
        false_accepts as f64 / impostor.len() as f64,
        false_rejects as f64 / genuine.len() as f64,
    )
}

pub fn calibrate(
    labeled: &BTreeMap<IdentityId, Vec<Embedding>>,
) -> Result<Calibration, CalibrationError> {
    let mut dim: Option<usize> = None;
    let mut normalized: Vec<(&str, Vec<Embedding>)> = Vec::with_capacity(labeled.len());
    for (identity, embeddings) in labeled {
        let mut out = Vec::with_capacity(embeddings.len());
        for e in embeddings {
            let expected = *dim.get_or_insert(e.dim());
            if e.dim() != expected {
                return Err(CalibrationError::DimensionMismatch {
                    identity: identity.clone(),
                    expected,
                    actual: e.dim(),
                });
            }
            out.push(
                e.normalized()
                    .ok_or_else(|| CalibrationError::Degenerate(identity.clone()))?,
            );
        }
        if !out.is_empty() {
            normalized.push((identity.as_str(), out));
        }
    }

    let mut genuine = Vec::new();
    let mut impostor = Vec::new();
    for (i, (_, a)) in normalized.iter().enumerate() {
        for (x, ea) in a.iter().enumerate() {
            for eb in &a[x + 1..] {
                genuine.push(ea.dot(eb) as f32);
            }
            for (_, b) in &normalized[i + 1..] {
                for eb in b {
                    impostor.push(ea.dot(eb) as f32);
                }
            }
        }
    }

    if genuine.is_empty() {
        return Err(CalibrationError::NoGenuinePairs);
    }
    if impostor.is_empty() {
        return Err(CalibrationError::NoImpostorPairs);
    }

    genuine.sort_by(f32::total_cmp);
    impostor.sort_by(f32::total_cmp);

    let mut all: Vec<f32> = genuine.iter().chain(impostor.iter()).copied().collect();
    all.sort_by(f32::total_cmp);
    all.dedup();

    // Candidate cuts: midpoints between neighbouring scores, accept-all and reject-all.
    let mut candidates = Vec::with_capacity(all.len() + 1);
    candidates.push(all[0]);
    candidates.extend(all.windows(2).map(|w| (w[0] + w[1]) / 2.0));
    candidates.push(f32::INFINITY);

    let mut best = (f64::INFINITY, candidates[0], 0.0, 0.0);
    for &t in &candidates {
        let (far, frr) = rates(&genuine, &impostor, t);
        let err = far + frr;
        // Ties go to the stricter threshold.
        if err <= best.0 {
            best = (err, t, far, frr);
        }
    }

    let (_, threshold, far, frr) = best;
    tracing::info!(
        genuine = genuine.len(),
        impostor = impostor.len(),
        threshold,
        far,
        frr,
        "calibration complete"
    );

    Ok(Calibration {
        genuine: Summary::of(&genuine),
        impostor: Summary::of(&impostor),
        threshold,
        false_accept_rate: far,
        false_reject_rate: frr,
    })
}
