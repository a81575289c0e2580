use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity key (a student record id).
pub type IdentityId = String;

/// Tolerance used when checking that a stored vector is unit length.
pub const UNIT_NORM_TOLERANCE: f64 = 1e-4;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (128 or 512 dimensions depending on the extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding, if the extractor reports one.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm, accumulated in f64.
    pub fn l2_norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// Unit-length copy of this embedding.
    ///
    /// Returns `None` for a zero or non-finite norm; callers decide whether
    /// that is a data error or simply "no usable face".
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.l2_norm();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        Some(Embedding {
            values: self
                .values
                .iter()
                .map(|&v| ((v as f64) / norm) as f32)
                .collect(),
            model_version: self.model_version.clone(),
        })
    }

    pub fn is_unit(&self) -> bool {
        (self.l2_norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Dot product in f64. Dimensions are the caller's responsibility;
    /// extra trailing elements on either side are ignored.
    pub fn dot(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (a as f64) * (b as f64))
            .sum()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let denom = self.l2_norm() * other.l2_norm();
        if denom > 0.0 {
            (self.dot(other) / denom) as f32
        } else {
            0.0
        }
    }
}

/// One face reported by the extractor for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// The durable per-identity artifact: one unit-length vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEmbedding {
    pub identity: IdentityId,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}
