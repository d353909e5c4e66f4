//! Decoded image type and face cropping.

use crate::types::{BoundingBox, Landmarks};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image buffer is empty")]
    Empty,
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// An RGB raster decoded from one request's uploaded bytes.
#[derive(Clone)]
pub struct DecodedImage {
    rgb: RgbImage,
}

impl DecodedImage {
    /// Decode raw encoded bytes, guessing the format from the data itself.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let dynamic = image::load_from_memory(bytes)?;
        Self::from_rgb(dynamic.into_rgb8())
    }

    /// Wrap already-decoded pixels. Rejects images with a zero side.
    pub fn from_rgb(rgb: RgbImage) -> Result<Self, DecodeError> {
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(DecodeError::ZeroDimensions);
        }
        Ok(Self { rgb })
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// Cut out the pixels under `face`, translating landmarks into crop space.
    ///
    /// Returns `None` if the box does not lie inside this image.
    pub fn crop(&self, face: &BoundingBox) -> Option<FaceCrop> {
        if !face.fits_within(self.width(), self.height()) {
            return None;
        }

        let pixels =
            image::imageops::crop_imm(&self.rgb, face.x, face.y, face.width, face.height).to_image();

        let landmarks = face.landmarks.map(|lms| {
            let (ox, oy) = (face.x as f32, face.y as f32);
            lms.map(|(lx, ly)| (lx - ox, ly - oy))
        });

        Some(FaceCrop { pixels, landmarks })
    }
}

/// The pixels of one located face, non-empty by construction.
#[derive(Clone)]
pub struct FaceCrop {
    pixels: RgbImage,
    /// Landmarks relative to the crop's top-left corner.
    landmarks: Option<Landmarks>,
}

impl FaceCrop {
    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn landmarks(&self) -> Option<&Landmarks> {
        self.landmarks.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}
