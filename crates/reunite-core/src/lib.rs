//! reunite-core: face identification engine for missing-person search.
//!
//! Locates faces with SCRFD, embeds them with ArcFace (both via ONNX
//! Runtime on the CPU) and searches a gallery of registered embeddings
//! for the nearest identity under an acceptance threshold.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod raster;
pub mod service;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorError, FaceLocator, ScrfdLocator};
pub use extractor::{ArcFaceExtractor, EmbeddingExtractor, ExtractorError};
pub use matcher::{DistanceMetric, GalleryMatcher, MatchError, MatcherConfig};
pub use raster::{DecodeError, DecodedImage, FaceCrop};
pub use service::{
    Enrollment, GallerySource, Identification, IdentificationService, IdentifyError, Outcome,
};
pub use types::{BoundingBox, Decision, FaceEmbedding, GalleryEntry, MatchResult};

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Per-user data directory: `$XDG_DATA_HOME/reunite`, else `~/.local/share/reunite`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("reunite")
}

/// Default location of the ONNX model files, under [`default_data_dir`].
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
