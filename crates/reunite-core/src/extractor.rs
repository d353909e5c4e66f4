//! Embedding extraction: the `EmbeddingExtractor` seam and its ArcFace implementation.
//!
//! ArcFace (w600k_r50) produces 512-dimensional embeddings from 112×112
//! face crops, aligned by landmarks when the locator supplied them.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::raster::FaceCrop;
use crate::types::FaceEmbedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = ALIGNED_SIZE as usize;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Derives a fixed-length descriptor from one face crop.
///
/// Must be deterministic: the same crop always yields the same embedding.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, face: &FaceCrop) -> Result<FaceEmbedding, ExtractorError>;

    /// Length of every embedding this extractor produces.
    fn dimension(&self) -> usize;
}

/// ArcFace-based embedding extractor.
pub struct ArcFaceExtractor {
    session: Mutex<Session>,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session: Mutex::new(session) })
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| ExtractorError::InferenceFailed(format!("session lock poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;
        Ok(raw.to_vec())
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn extract(&self, face: &FaceCrop) -> Result<FaceEmbedding, ExtractorError> {
        let normalized = normalize_crop(face);
        let input = preprocess(&normalized);
        let raw = self.infer(&input)?;
        let values = finish_embedding(raw)?;
        Ok(FaceEmbedding::with_model_version(values, ARCFACE_MODEL_VERSION))
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

/// Bring a crop to 112×112: landmark alignment when possible, else a resize.
fn normalize_crop(face: &FaceCrop) -> RgbImage {
    if let Some(aligned) = face.landmarks().and_then(|lms| alignment::align_face(face.pixels(), lms)) {
        return aligned;
    }
    tracing::debug!(
        width = face.width(),
        height = face.height(),
        "no usable landmarks, resizing crop"
    );
    imageops::resize(face.pixels(), ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}

/// Convert a 112×112 RGB crop into a normalized NCHW float tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in aligned.enumerate_pixels() {
        if x as usize >= size || y as usize >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}

/// Validate raw model output and L2-normalize it.
fn finish_embedding(raw: Vec<f32>) -> Result<Vec<f32>, ExtractorError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(ExtractorError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(ExtractorError::InferenceFailed("embedding contains non-finite values".into()));
    }

    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return Err(ExtractorError::InferenceFailed("embedding has zero norm".into()));
    }

    Ok(raw.iter().map(|x| x / norm).collect())
}
