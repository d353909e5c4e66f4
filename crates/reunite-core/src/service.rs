//! End-to-end identification of one found-person photo.
//!
//! LOCATE → EXTRACT → FETCH_GALLERY → MATCH, stopping at the first stage
//! that cannot continue. Nothing is retried.

use crate::detector::{DetectorError, FaceLocator};
use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::matcher::{self, GalleryMatcher, MatchError};
use crate::raster::{DecodeError, DecodedImage};
use crate::types::{BoundingBox, FaceEmbedding, GalleryEntry, MatchResult};
use serde::Serialize;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Supplies the current gallery, fresh for every request.
///
/// Implemented by whatever store owns the missing-person records.
pub trait GallerySource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch(&self) -> Result<Vec<GalleryEntry>, Self::Error>;
}

impl GallerySource for [GalleryEntry] {
    type Error = std::convert::Infallible;

    fn fetch(&self) -> Result<Vec<GalleryEntry>, Self::Error> {
        Ok(self.to_vec())
    }
}

impl GallerySource for Vec<GalleryEntry> {
    type Error = std::convert::Infallible;

    fn fetch(&self) -> Result<Vec<GalleryEntry>, Self::Error> {
        Ok(self.clone())
    }
}

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("invalid image: {0}")]
    Decode(#[from] DecodeError),
    #[error("face detection failed: {0}")]
    Detection(DetectorError),
    #[error("failed to generate face embedding: {0}")]
    ExtractionFailure(#[from] ExtractorError),
    #[error("embedding dimension mismatch: query has {expected}, gallery entry {identity} has {actual}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
    #[error("gallery unavailable: {0}")]
    Gallery(#[source] BoxError),
}

impl IdentifyError {
    /// True when the caller sent something unusable, as opposed to an
    /// internal processing fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IdentifyError::Decode(_))
    }

    /// Stable machine-readable name for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            IdentifyError::Decode(_) => "decode_error",
            IdentifyError::Detection(_) => "detection_failure",
            IdentifyError::ExtractionFailure(_) => "extraction_failure",
            IdentifyError::DimensionMismatch { .. } => "dimension_mismatch",
            IdentifyError::Gallery(_) => "gallery_unavailable",
        }
    }
}

impl From<DetectorError> for IdentifyError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::Decode(d) => IdentifyError::Decode(d),
            other => IdentifyError::Detection(other),
        }
    }
}

impl From<MatchError> for IdentifyError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::DimensionMismatch { identity, expected, actual } => {
                IdentifyError::DimensionMismatch { identity, expected, actual }
            }
            // Callers check for an empty gallery before matching.
            MatchError::EmptyGallery => IdentifyError::Gallery("gallery is empty".into()),
        }
    }
}

/// The face that was searched for and what the search found.
#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    /// The face used for the search (first detected).
    pub face: BoundingBox,
    /// How many faces the locator found in the photo.
    pub faces_detected: usize,
    pub result: MatchResult,
}

/// Normal terminal states of an identification request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Match(Identification),
    NoMatch(Identification),
    NoFaceDetected,
    EmptyGallery,
}

impl Outcome {
    pub fn message(&self) -> &'static str {
        match self {
            Outcome::Match(_) => "Potential match found for missing person!",
            Outcome::NoMatch(_) => "No match found for the uploaded face.",
            Outcome::NoFaceDetected => "No faces detected in the image.",
            Outcome::EmptyGallery => "No missing persons registered to search against.",
        }
    }
}

/// Embedding produced for registering a new gallery record.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub face: BoundingBox,
    pub faces_detected: usize,
    pub embedding: FaceEmbedding,
}

/// Composes a locator, an extractor and a matcher.
///
/// Holds no per-request state; one instance can serve concurrent requests.
pub struct IdentificationService<L, E> {
    locator: L,
    extractor: E,
    matcher: GalleryMatcher,
}

impl<L: FaceLocator, E: EmbeddingExtractor> IdentificationService<L, E> {
    pub fn new(locator: L, extractor: E, matcher: GalleryMatcher) -> Self {
        Self { locator, extractor, matcher }
    }

    pub fn matcher(&self) -> &GalleryMatcher {
        &self.matcher
    }

    pub fn embedding_dimension(&self) -> usize {
        self.extractor.dimension()
    }

    /// Identify the first face in `image_bytes` against the store's gallery.
    pub fn identify<G>(&self, image_bytes: &[u8], gallery: &G) -> Result<Outcome, IdentifyError>
    where
        G: GallerySource + ?Sized,
    {
        let Some((face, faces_detected, query)) = self.embed_first_face(image_bytes)? else {
            return Ok(Outcome::NoFaceDetected);
        };

        let entries = gallery
            .fetch()
            .map_err(|e| IdentifyError::Gallery(Box::new(e)))?;
        if entries.is_empty() {
            tracing::info!("gallery is empty, nothing to search");
            return Ok(Outcome::EmptyGallery);
        }

        let result = self.matcher.find_match(&entries, &query).map_err(|e| {
            if let MatchError::DimensionMismatch { identity, expected, actual } = &e {
                tracing::error!(
                    identity = %identity,
                    expected,
                    actual,
                    "gallery embedding dimension does not match query; refusing to compare"
                );
            }
            IdentifyError::from(e)
        })?;

        tracing::info!(
            identity = %result.identity,
            distance = result.distance,
            decision = ?result.decision,
            gallery = entries.len(),
            "identification complete"
        );

        let identification = Identification { face, faces_detected, result };
        Ok(if identification.result.is_match() {
            Outcome::Match(identification)
        } else {
            Outcome::NoMatch(identification)
        })
    }

    /// Identify against a gallery snapshot the caller already holds.
    pub fn identify_against(
        &self,
        image_bytes: &[u8],
        gallery: &[GalleryEntry],
    ) -> Result<Outcome, IdentifyError> {
        self.identify(image_bytes, gallery)
    }

    /// Locate and embed the first face, for registering a new gallery record.
    ///
    /// Returns `Ok(None)` when the photo has no face.
    pub fn enroll(&self, image_bytes: &[u8]) -> Result<Option<Enrollment>, IdentifyError> {
        Ok(self
            .embed_first_face(image_bytes)?
            .map(|(face, faces_detected, embedding)| Enrollment { face, faces_detected, embedding }))
    }

    /// Verify that every gallery embedding has the extractor's dimension.
    pub fn check_gallery(&self, gallery: &[GalleryEntry]) -> Result<(), IdentifyError> {
        matcher::check_dimensions(gallery, self.extractor.dimension()).map_err(|e| {
            tracing::error!(error = %e, "gallery failed dimension check");
            IdentifyError::from(e)
        })
    }

    fn embed_first_face(
        &self,
        image_bytes: &[u8],
    ) -> Result<Option<(BoundingBox, usize, FaceEmbedding)>, IdentifyError> {
        let (faces, image) = self.locator.locate_bytes(image_bytes)?;
        let faces_detected = faces.len();

        // Only the first detected face takes part, in the locator's own order.
        let Some(face) = faces.into_iter().next() else {
            tracing::info!(width = image.width(), height = image.height(), "no face detected");
            return Ok(None);
        };
        tracing::debug!(?face, faces_detected, "using first detected face");

        let embedding = self.extract(&image, &face)?;
        Ok(Some((face, faces_detected, embedding)))
    }

    fn extract(&self, image: &DecodedImage, face: &BoundingBox) -> Result<FaceEmbedding, IdentifyError> {
        let crop = image.crop(face).ok_or_else(|| {
            ExtractorError::InferenceFailed(format!(
                "face box {}x{}+{}+{} outside {}x{} image",
                face.width,
                face.height,
                face.x,
                face.y,
                image.width(),
                image.height()
            ))
        })?;

        let embedding = self.extractor.extract(&crop).map_err(|e| {
            tracing::warn!(error = %e, "embedding extraction failed");
            e
        })?;

        if embedding.dimension() != self.extractor.dimension() {
            return Err(ExtractorError::InferenceFailed(format!(
                "extractor declared {} dimensions but produced {}",
                self.extractor.dimension(),
                embedding.dimension()
            ))
            .into());
        }

        Ok(embedding)
    }
}
