//! Face location: the `FaceLocator` seam and its SCRFD implementation.
//!
//! SCRFD (Sample and Computation Redistribution for Efficient Face Detection)
//! runs through ONNX Runtime with 3-stride anchor-free decoding and NMS
//! post-processing.

use crate::raster::{DecodeError, DecodedImage};
use crate::types::{BoundingBox, Landmarks};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// SCRFD det_10g input and decoding parameters.
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds candidate face regions in an image.
///
/// Implementations return boxes in their native ordering; callers that need
/// a single face take index 0 and apply no further ranking. An empty result
/// means "no face", not a failure.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &DecodedImage) -> Result<Vec<BoundingBox>, DetectorError>;

    /// Decode `bytes` and locate faces in the result.
    ///
    /// The decoded image is handed back so later stages can crop from it.
    fn locate_bytes(&self, bytes: &[u8]) -> Result<(Vec<BoundingBox>, DecodedImage), DetectorError> {
        let image = DecodedImage::decode(bytes)?;
        let faces = self.locate(&image)?;
        Ok((faces, image))
    }
}

/// Detection in image space before clamping to integer bounds.
#[derive(Debug, Clone)]
struct RawDetection {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    landmarks: Option<Landmarks>,
}

/// Scale and padding applied by the letterbox, needed to map boxes back.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face locator.
///
/// The session is locked only for the duration of one inference call.
pub struct ScrfdLocator {
    session: Mutex<Session>,
    input_height: usize,
    input_width: usize,
    /// Output positions for strides 8, 16 and 32.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Run the model and copy out the nine output tensors, stride-major.
    fn infer(&self, input: &Array4<f32>) -> Result<Vec<[Vec<f32>; 3]>, DetectorError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| DetectorError::InferenceFailed(format!("session lock poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut per_stride = Vec::with_capacity(SCRFD_STRIDES.len());
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];
            let extract = |idx: usize, what: &str| -> Result<Vec<f32>, DetectorError> {
                let (_, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                })?;
                Ok(data.to_vec())
            };
            per_stride.push([
                extract(score_idx, "scores")?,
                extract(bbox_idx, "bboxes")?,
                extract(kps_idx, "kps")?,
            ]);
        }

        Ok(per_stride)
    }

    /// Letterbox an RGB image into a NCHW float tensor.
    fn preprocess(&self, image: &DecodedImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (image.width() as usize, image.height() as usize);

        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = ((width as f32 * scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        let resized = imageops::resize(image.rgb(), new_w as u32, new_h as u32, FilterType::Triangle);

        // Padding is zero after normalization, so only the resized area is written.
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + pad_x_start, y as usize + pad_y_start);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceLocator for ScrfdLocator {
    /// Returns boxes sorted by descending confidence (NMS output order).
    fn locate(&self, image: &DecodedImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = self.preprocess(image);
        let per_stride = self.infer(&input)?;

        let mut all_detections = Vec::new();
        for (stride_pos, [scores, bboxes, kps]) in per_stride.iter().enumerate() {
            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                SCRFD_STRIDES[stride_pos],
                self.input_width,
                self.input_height,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept = nms(all_detections, SCRFD_NMS_THRESHOLD);
        let faces = to_image_boxes(kept, image.width(), image.height());

        tracing::debug!(
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "SCRFD located faces"
        );

        Ok(faces)
    }
}

/// Clamp detections to image bounds, dropping any that end up empty.
fn to_image_boxes(detections: Vec<RawDetection>, width: u32, height: u32) -> Vec<BoundingBox> {
    detections
        .into_iter()
        .filter_map(|d| {
            BoundingBox::clamped(d.x, d.y, d.width, d.height, d.confidence, d.landmarks, width, height)
        })
        .collect()
}

/// Map each stride to its (score, bbox, kps) outputs.
///
/// Exports that name tensors `score_8`, `bbox_16` and so on are matched by
/// name; anything else is assumed to use the insightface order of all
/// scores, then all boxes, then all keypoints.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Turn one stride's raw outputs into image-space detections above `threshold`.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawDetection> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let unmap = |px: f32, py: f32| -> (f32, f32) {
        (
            (px - letterbox.pad_x) / letterbox.scale,
            (py - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        // bbox: [left, top, right, bottom] distances in stride units
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let (x1, y1) = unmap(anchor_cx - bboxes[bbox_off] * s, anchor_cy - bboxes[bbox_off + 1] * s);
        let (x2, y2) = unmap(anchor_cx + bboxes[bbox_off + 2] * s, anchor_cy + bboxes[bbox_off + 3] * s);

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                unmap(
                    anchor_cx + kps[kps_off + i * 2] * s,
                    anchor_cy + kps[kps_off + i * 2 + 1] * s,
                )
            })
        });

        detections.push(RawDetection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Greedy NMS; survivors come back in descending confidence.
///
/// Output is ordered by descending confidence; equal confidences keep their
/// input order.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawDetection> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }

    keep
}

/// Compute Intersection-over-Union between two detections.
fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
