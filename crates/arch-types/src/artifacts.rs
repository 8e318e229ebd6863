//! Artifacts passed between stages and returned to clients.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Floats per gaussian in the packed wire format:
/// position(3) + colour dc(3) + opacity(1) + scale(3) + rotation(4).
pub const PACKED_FLOATS_PER_GAUSSIAN: usize = 14;

/// Parameters for one text-to-image sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRequest {
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub guidance_scale: f32,
}

/// Encoded image produced by an image model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl RenderedImage {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: "image/png".to_string(),
        }
    }
}

/// One 3D gaussian splat. Colour is stored as the degree-0 spherical
/// harmonic coefficient, opacity as a logit and scale as log-scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPoint {
    pub position: [f32; 3],
    pub color_dc: [f32; 3],
    pub opacity: f32,
    pub scale: [f32; 3],
    pub rotation: [f32; 4],
}

/// Point/volumetric representation produced by reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GaussianCloud {
    pub points: Vec<GaussianPoint>,
}

impl GaussianCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Axis-aligned bounds of all splat centres, `None` for an empty cloud.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = self.points.first()?.position;
        let mut min = first;
        let mut max = first;
        for point in &self.points[1..] {
            for axis in 0..3 {
                min[axis] = min[axis].min(point.position[axis]);
                max[axis] = max[axis].max(point.position[axis]);
            }
        }
        Some((min, max))
    }

    /// Decode the packed little-endian wire format used by worker processes.
    pub fn from_packed_f32(bytes: &[u8]) -> Result<Self, ModelError> {
        let stride = PACKED_FLOATS_PER_GAUSSIAN * 4;
        if bytes.len() % stride != 0 {
            return Err(ModelError::new(format!(
                "packed gaussian buffer of {} bytes is not a multiple of {stride}",
                bytes.len()
            )));
        }

        let points = bytes
            .chunks_exact(stride)
            .map(|chunk| {
                let mut f = [0f32; PACKED_FLOATS_PER_GAUSSIAN];
                for (slot, raw) in f.iter_mut().zip(chunk.chunks_exact(4)) {
                    *slot = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                }
                GaussianPoint {
                    position: [f[0], f[1], f[2]],
                    color_dc: [f[3], f[4], f[5]],
                    opacity: f[6],
                    scale: [f[7], f[8], f[9]],
                    rotation: [f[10], f[11], f[12], f[13]],
                }
            })
            .collect();

        Ok(Self { points })
    }

    /// Inverse of [`GaussianCloud::from_packed_f32`].
    pub fn to_packed_f32(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.points.len() * PACKED_FLOATS_PER_GAUSSIAN * 4);
        for p in &self.points {
            let values = p
                .position
                .iter()
                .chain(p.color_dc.iter())
                .chain(std::iter::once(&p.opacity))
                .chain(p.scale.iter())
                .chain(p.rotation.iter());
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }
}

/// Sparse structured latent: occupied voxel coordinates at `resolution`
/// plus `channels` features per voxel, row-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredLatent {
    pub resolution: u32,
    pub channels: u32,
    pub coords: Vec<[u32; 3]>,
    pub features: Vec<f32>,
}

impl StructuredLatent {
    pub fn voxel_count(&self) -> usize {
        self.coords.len()
    }

    /// Feature count must match `coords.len() * channels`.
    pub fn is_consistent(&self) -> bool {
        self.features.len() == self.coords.len() * self.channels as usize
    }
}

/// The two co-produced representations of one reconstruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub gaussians: GaussianCloud,
    pub latent: StructuredLatent,
}

/// Fixed output resolution for mesh decoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshTarget {
    /// Fraction of triangles removed during simplification.
    pub simplify: f32,
    pub texture_size: u32,
}

impl Default for MeshTarget {
    fn default() -> Self {
        Self {
            simplify: 0.95,
            texture_size: 1024,
        }
    }
}

/// Binary glTF produced by mesh decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TexturedAsset {
    pub glb: Vec<u8>,
}

/// Binary payload delivered on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Payload {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }
}

impl From<RenderedImage> for Payload {
    fn from(image: RenderedImage) -> Self {
        Self::new(image.bytes, image.mime)
    }
}

impl From<TexturedAsset> for Payload {
    fn from(asset: TexturedAsset) -> Self {
        Self::new(asset.glb, "model/gltf-binary")
    }
}
