//! Deterministic CPU stand-ins for the four model families.
//!
//! They honour the same load/run/unload contract as real backends and
//! report steps with an optional per-step delay, which makes them useful
//! for demos and for exercising the slot and relay logic in tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::thread;
use std::time::Duration;

use arch_types::{
    GaussianCloud, GaussianPoint, MeshTarget, ModelError, Reconstruction, RenderedImage,
    SamplingRequest, StructuredLatent, TexturedAsset,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::json;

use crate::capability::{
    BackgroundRemovalModel, MeshDecoderModel, ModelLifecycle, ReconstructionModel, StepCallback,
    TextToImageModel,
};
use crate::glb::{write_glb, TriangleMesh};

/// Zeroth-order spherical harmonic constant.
const SH_C0: f32 = 0.282_094_8;
const RECONSTRUCTION_STEPS: u32 = 12;
const DECODER_STEPS: u32 = 4;
const LATENT_RESOLUTION: u32 = 64;
const LATENT_CHANNELS: u32 = 8;
/// Max samples per axis when turning an image into splats.
const SAMPLE_GRID: u32 = 32;
/// Per-channel distance below which a pixel counts as background.
const KEY_TOLERANCE: i32 = 24;

struct MockCore {
    name: String,
    step_delay: Duration,
    loaded: bool,
}

impl MockCore {
    fn new(name: &str, step_delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            step_delay,
            loaded: false,
        }
    }

    fn ensure_loaded(&self) -> Result<(), ModelError> {
        if self.loaded {
            Ok(())
        } else {
            Err(ModelError::new(format!("model '{}' not initialised", self.name)))
        }
    }

    fn run_steps(&self, total: u32, on_step: StepCallback<'_>) {
        for step in 1..=total {
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
            on_step(step);
        }
    }

    fn load(&mut self) -> Result<(), ModelError> {
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        log::debug!("[MOCK] '{}' loaded", self.name);
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        if self.loaded {
            log::debug!("[MOCK] '{}' unloaded", self.name);
        }
        self.loaded = false;
    }
}

fn encode_png(image: RgbaImage) -> Result<RenderedImage, ModelError> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| ModelError::new(format!("failed to encode PNG: {e}")))?;
    Ok(RenderedImage::png(bytes))
}

fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, ModelError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| ModelError::new(format!("could not decode input image: {e}")))
}

macro_rules! impl_lifecycle {
    ($ty:ty, |$this:ident| $steps:expr) => {
        impl ModelLifecycle for $ty {
            fn load(&mut self) -> Result<(), ModelError> {
                self.core.load()
            }

            fn unload(&mut self) {
                self.core.unload()
            }

            fn total_steps(&self) -> u32 {
                let $this = self;
                $steps
            }
        }
    };
}

/// Paints a seeded two-colour gradient with a centred disc standing in for
/// "the object".
pub struct MockTextToImage {
    core: MockCore,
    steps: u32,
}

impl MockTextToImage {
    pub fn new(name: &str, steps: u32, step_delay: Duration) -> Self {
        Self {
            core: MockCore::new(name, step_delay),
            steps: steps.max(1),
        }
    }
}

impl_lifecycle!(MockTextToImage, |m| m.steps);

impl TextToImageModel for MockTextToImage {
    fn generate(
        &mut self,
        request: &SamplingRequest,
        on_step: StepCallback<'_>,
    ) -> Result<RenderedImage, ModelError> {
        self.core.ensure_loaded()?;
        if request.width == 0 || request.height == 0 {
            return Err(ModelError::new("image dimensions must be non-zero"));
        }
        self.core.run_steps(request.steps.max(1), on_step);

        let mut hasher = DefaultHasher::new();
        request.prompt.hash(&mut hasher);
        request.seed.hash(&mut hasher);
        let h = hasher.finish().to_le_bytes();
        let (w, hgt) = (request.width, request.height);
        let (cx, cy) = (w as f32 / 2.0, hgt as f32 / 2.0);
        let radius = w.min(hgt) as f32 * 0.3;

        let image = RgbaImage::from_fn(w, hgt, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy <= radius * radius {
                Rgba([h[0] / 2, h[1] / 2, h[2] / 2, 255])
            } else {
                // Flat backdrop so background removal has something to key on.
                Rgba([255, 255, 255, 255])
            }
        });
        encode_png(image)
    }
}

/// Keys out every pixel close to the top-left corner colour.
pub struct MockBackgroundRemoval {
    core: MockCore,
}

impl MockBackgroundRemoval {
    pub fn new(name: &str, step_delay: Duration) -> Self {
        Self {
            core: MockCore::new(name, step_delay),
        }
    }
}

impl_lifecycle!(MockBackgroundRemoval, |_m| 1);

impl BackgroundRemovalModel for MockBackgroundRemoval {
    fn remove_background(
        &mut self,
        image: &[u8],
        on_step: StepCallback<'_>,
    ) -> Result<RenderedImage, ModelError> {
        self.core.ensure_loaded()?;
        let mut rgba = decode_rgba(image)?;
        let key = *rgba.get_pixel(0, 0);
        for pixel in rgba.pixels_mut() {
            let close = (0..3).all(|c| (pixel[c] as i32 - key[c] as i32).abs() <= KEY_TOLERANCE);
            if close {
                pixel[3] = 0;
            }
        }
        self.core.run_steps(1, on_step);
        encode_png(rgba)
    }
}

/// Samples opaque pixels into a flat sheet of splats and voxelises them.
pub struct MockReconstruction {
    core: MockCore,
}

impl MockReconstruction {
    pub fn new(name: &str, step_delay: Duration) -> Self {
        Self {
            core: MockCore::new(name, step_delay),
        }
    }
}

impl_lifecycle!(MockReconstruction, |_m| RECONSTRUCTION_STEPS);

impl ReconstructionModel for MockReconstruction {
    fn reconstruct(
        &mut self,
        image: &[u8],
        on_step: StepCallback<'_>,
    ) -> Result<Reconstruction, ModelError> {
        self.core.ensure_loaded()?;
        let rgba = decode_rgba(image)?;
        let (w, h) = rgba.dimensions();
        let stride_x = (w / SAMPLE_GRID).max(1);
        let stride_y = (h / SAMPLE_GRID).max(1);

        let mut points = Vec::new();
        for y in (0..h).step_by(stride_y as usize) {
            for x in (0..w).step_by(stride_x as usize) {
                let px = rgba.get_pixel(x, y);
                if px[3] < 128 {
                    continue;
                }
                let rgb = [px[0], px[1], px[2]].map(|c| c as f32 / 255.0);
                let luminance = 0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2];
                points.push(GaussianPoint {
                    position: [
                        x as f32 / w as f32 - 0.5,
                        0.5 - y as f32 / h as f32,
                        (luminance - 0.5) * 0.2,
                    ],
                    color_dc: rgb.map(|c| (c - 0.5) / SH_C0),
                    opacity: 4.0,
                    scale: [(0.5 / SAMPLE_GRID as f32).ln(); 3],
                    rotation: [1.0, 0.0, 0.0, 0.0],
                });
            }
        }
        self.core.run_steps(RECONSTRUCTION_STEPS, on_step);

        let gaussians = GaussianCloud { points };
        let latent = voxelise(&gaussians);
        Ok(Reconstruction { gaussians, latent })
    }
}

fn voxelise(cloud: &GaussianCloud) -> StructuredLatent {
    let res = LATENT_RESOLUTION;
    let mut seen = HashSet::new();
    let mut coords = Vec::new();
    let mut features = Vec::new();
    for point in &cloud.points {
        let coord = point
            .position
            .map(|v| (((v + 0.5).clamp(0.0, 1.0)) * (res - 1) as f32).round() as u32);
        if !seen.insert(coord) {
            continue;
        }
        coords.push(coord);
        for channel in 0..LATENT_CHANNELS as usize {
            features.push(point.color_dc[channel % 3] * 0.1 + channel as f32 * 0.01);
        }
    }
    StructuredLatent {
        resolution: res,
        channels: LATENT_CHANNELS,
        coords,
        features,
    }
}

/// Emits a box spanning the splat bounds, tinted with their mean colour.
pub struct MockMeshDecoder {
    core: MockCore,
}

impl MockMeshDecoder {
    pub fn new(name: &str, step_delay: Duration) -> Self {
        Self {
            core: MockCore::new(name, step_delay),
        }
    }
}

impl_lifecycle!(MockMeshDecoder, |_m| DECODER_STEPS);

impl MeshDecoderModel for MockMeshDecoder {
    fn decode(
        &mut self,
        latent: &StructuredLatent,
        gaussians: &GaussianCloud,
        target: &MeshTarget,
        on_step: StepCallback<'_>,
    ) -> Result<TexturedAsset, ModelError> {
        self.core.ensure_loaded()?;
        if !latent.is_consistent() {
            return Err(ModelError::new(format!(
                "latent has {} features for {} voxels x {} channels",
                latent.features.len(),
                latent.voxel_count(),
                latent.channels
            )));
        }

        let (min, max) = gaussians
            .bounds()
            .unwrap_or(([-0.5, -0.5, -0.5], [0.5, 0.5, 0.5]));
        // Give flat clouds some depth.
        let max = [0, 1, 2].map(|a| if max[a] - min[a] < 0.01 { min[a] + 0.01 } else { max[a] });

        let mut mean = [0f32; 3];
        for point in &gaussians.points {
            for (acc, dc) in mean.iter_mut().zip(point.color_dc) {
                *acc += (dc * SH_C0 + 0.5).clamp(0.0, 1.0);
            }
        }
        let n = gaussians.len().max(1) as f32;
        let color = if gaussians.is_empty() {
            [0.8, 0.8, 0.8, 1.0]
        } else {
            [mean[0] / n, mean[1] / n, mean[2] / n, 1.0]
        };

        self.core.run_steps(DECODER_STEPS, on_step);
        let mesh = TriangleMesh::cuboid(min, max, color);
        let glb = write_glb(
            &mesh,
            json!({
                "simplify": target.simplify,
                "texture_size": target.texture_size,
                "source_voxels": latent.voxel_count(),
                "source_gaussians": gaussians.len(),
            }),
        );
        Ok(TexturedAsset { glb })
    }
}
