//! Gallery snapshot and probe matching.
//!
//! Gallery vectors are unit length, so cosine similarity against a
//! normalized probe is a plain dot product. The probe is always
//! re-normalized here because extractors do not all normalize their output.

use crate::types::{Embedding, IdentityEmbedding, IdentityId};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe has dimension {actual}, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("probe embedding has zero or non-finite norm")]
    DegenerateProbe,
    #[error("gallery entry for {identity} has zero or non-finite norm")]
    DegenerateEntry { identity: IdentityId },
}

/// One enrolled identity inside a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub embedding: Embedding,
}

/// Identity → unit embedding, in insertion order.
///
/// A session holds its gallery behind an `Arc` and never mutates it; a new
/// snapshot is built for the next session instead.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    dim: Option<usize>,
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored identity vectors. Later entries for the same
    /// identity replace earlier ones.
    pub fn from_enrolled<I>(faces: I) -> Result<Self, MatchError>
    where
        I: IntoIterator<Item = IdentityEmbedding>,
    {
        let mut gallery = Self::new();
        for face in faces {
            gallery.insert(face.identity, face.embedding)?;
        }
        Ok(gallery)
    }

    /// Add or replace an identity. The vector is re-normalized on the way in.
    pub fn insert(
        &mut self,
        identity: impl Into<IdentityId>,
        embedding: Embedding,
    ) -> Result<(), MatchError> {
        let identity = identity.into();
        if let Some(dim) = self.dim {
            if embedding.dim() != dim {
                return Err(MatchError::DimensionMismatch {
                    expected: dim,
                    actual: embedding.dim(),
                });
            }
        }
        let embedding = embedding
            .normalized()
            .ok_or_else(|| MatchError::DegenerateEntry {
                identity: identity.clone(),
            })?;

        self.dim = Some(embedding.dim());
        match self.entries.iter_mut().find(|e| e.identity == identity) {
            Some(existing) => existing.embedding = embedding,
            None => self.entries.push(GalleryEntry { identity, embedding }),
        }
        Ok(())
    }

    /// Copy containing only the given identities, in roster order. The
    /// dimension carries over even when no roster member is enrolled.
    pub fn scoped_to(&self, roster: &[IdentityId]) -> Gallery {
        let entries: Vec<GalleryEntry> = roster
            .iter()
            .filter_map(|id| self.get(id).cloned())
            .collect();
        Gallery { dim: self.dim, entries }
    }

    pub fn get(&self, identity: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.get(identity).is_some()
    }

    /// Embedding dimension, or `None` for an empty gallery.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }
}

/// A probe that cleared the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub identity: IdentityId,
    /// Cosine similarity in [-1, 1].
    pub confidence: f32,
}

/// Outcome of matching every face found in one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMatch {
    pub matches: Vec<Match>,
    /// Probes that could not be compared, by index.
    pub rejected: Vec<(usize, MatchError)>,
}

/// Result of a one-to-one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub matched: bool,
    pub similarity: f32,
}

fn normalize_probe(probe: &Embedding, expected: Option<usize>) -> Result<Embedding, MatchError> {
    if let Some(expected) = expected {
        if probe.dim() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                actual: probe.dim(),
            });
        }
    }
    probe.normalized().ok_or(MatchError::DegenerateProbe)
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Highest-scoring identity at or above the threshold, if any.
    fn best_match(&self, probe: &Embedding, gallery: &Gallery) -> Result<Option<Match>, MatchError>;

    /// Match several probes from one frame. A probe that fails is recorded
    /// in `rejected` and the rest are still processed.
    fn match_all(&self, probes: &[Embedding], gallery: &Gallery) -> BatchMatch {
        let mut out = BatchMatch::default();
        for (i, probe) in probes.iter().enumerate() {
            match self.best_match(probe, gallery) {
                Ok(Some(m)) => out.matches.push(m),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(probe = i, error = %e, "probe skipped");
                    out.rejected.push((i, e));
                }
            }
        }
        out
    }
}

/// Cosine similarity matcher with an inclusive threshold.
///
/// Always iterates ALL gallery entries; ties keep the earliest entry, so the
/// result only depends on the gallery order and the probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// One-to-one check of a probe against a single enrolled vector.
    pub fn verify(
        &self,
        probe: &Embedding,
        enrolled: &Embedding,
    ) -> Result<Verification, MatchError> {
        let probe = normalize_probe(probe, Some(enrolled.dim()))?;
        let enrolled = enrolled.normalized().ok_or_else(|| MatchError::DegenerateEntry {
            identity: String::new(),
        })?;
        let similarity = probe.dot(&enrolled) as f32;
        Ok(Verification {
            matched: similarity >= self.threshold,
            similarity,
        })
    }
}

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
    ) -> Result<Option<Match>, MatchError> {
        let probe = normalize_probe(probe, gallery.dim())?;

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        // Score every entry; strict `>` keeps the earliest of equal scores.
        for (i, entry) in gallery.entries.iter().enumerate() {
            let sim = probe.dot(&entry.embedding) as f32;
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_sim >= self.threshold => Some(Match {
                identity: gallery.entries[idx].identity.clone(),
                confidence: best_sim,
            }),
            _ => None,
        })
    }
}
