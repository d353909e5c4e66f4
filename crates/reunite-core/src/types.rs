use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Integer face region inside a decoded image.
///
/// Always fully contained in the image it was located in, with non-zero
/// width and height. The locator drops detections that cannot satisfy this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
    /// Landmarks in image coordinates, when the detector provides them.
    pub landmarks: Option<Landmarks>,
}

impl BoundingBox {
    /// Clamp a floating-point detection to `image_width` × `image_height`.
    ///
    /// Returns `None` when nothing of the box is left inside the image.
    #[allow(clippy::too_many_arguments)]
    pub fn clamped(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        confidence: f32,
        landmarks: Option<Landmarks>,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if !(x.is_finite() && y.is_finite() && width.is_finite() && height.is_finite()) {
            return None;
        }

        let x1 = x.round().clamp(0.0, image_width as f32) as u32;
        let y1 = y.round().clamp(0.0, image_height as f32) as u32;
        let x2 = (x + width).round().clamp(0.0, image_width as f32) as u32;
        let y2 = (y + height).round().clamp(0.0, image_height as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
            landmarks,
        })
    }

    /// True if the box lies entirely inside a `width` × `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
///
/// Values are fixed at construction; there is no mutable access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
}

impl FaceEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn with_model_version(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must check dimensions first; extra trailing values are ignored.
    pub fn euclidean_distance(&self, other: &FaceEmbedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.0.
    pub fn similarity(&self, other: &FaceEmbedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One registered missing-person record's stored descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    /// Identity reference understood by the store (record ID).
    pub identity: String,
    /// Human-readable name, if the store supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub embedding: FaceEmbedding,
}

impl GalleryEntry {
    pub fn new(identity: impl Into<String>, embedding: FaceEmbedding) -> Self {
        Self {
            identity: identity.into(),
            label: None,
            embedding,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Match,
    NoMatch,
}

/// Result of matching a query embedding against a gallery.
///
/// Always names the nearest candidate, even when it falls outside the
/// acceptance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub distance: f32,
    pub decision: Decision,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.decision == Decision::Match
    }
}
