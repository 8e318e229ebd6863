//! Background-removal stage. Usually backed by an always-resident model, in
//! which case it never touches the device slot.

use std::io::Cursor;

use arch_types::{ArchError, RenderedImage};
use image::{DynamicImage, ImageFormat, Rgba};

use super::{run_on_slot, StageContext, StageTracker};
use crate::registry::BackgroundSlot;
use crate::relay::ProgressRelay;

pub const STAGE: &str = "background_removal";

pub fn validate(image: &[u8]) -> Result<(), ArchError> {
    if image.is_empty() {
        return Err(ArchError::invalid_input("No image provided."));
    }
    Ok(())
}

/// Cut out the subject of `image`; with `fill`, composite it onto that colour.
pub async fn run(
    ctx: &StageContext,
    model: &BackgroundSlot,
    image: Vec<u8>,
    fill: Option<[u8; 3]>,
    relay: &ProgressRelay,
    tracker: &mut StageTracker,
) -> Result<RenderedImage, ArchError> {
    validate(&image)?;
    let cut = run_on_slot(ctx, model, relay, tracker, move |m, on_step| {
        m.remove_background(&image, on_step)
    })
    .await?;

    match fill {
        None => Ok(cut),
        Some(rgb) => tokio::task::spawn_blocking(move || flatten(&cut, rgb))
            .await
            .map_err(|e| ArchError::Internal(format!("flatten task failed: {e}")))?,
    }
}

/// Alpha-composite `image` over an opaque `rgb` backdrop, re-encoded as PNG.
pub fn flatten(image: &RenderedImage, rgb: [u8; 3]) -> Result<RenderedImage, ArchError> {
    let mut rgba = image::load_from_memory(&image.bytes)
        .map_err(|e| ArchError::Internal(format!("cut-out is not a readable image: {e}")))?
        .to_rgba8();

    for pixel in rgba.pixels_mut() {
        let alpha = pixel[3] as u32;
        let blend = |fg: u8, bg: u8| ((fg as u32 * alpha + bg as u32 * (255 - alpha)) / 255) as u8;
        *pixel = Rgba([
            blend(pixel[0], rgb[0]),
            blend(pixel[1], rgb[1]),
            blend(pixel[2], rgb[2]),
            255,
        ]);
    }

    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(rgba)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| ArchError::Internal(format!("failed to encode PNG: {e}")))?;
    Ok(RenderedImage::png(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn png(image: RgbaImage) -> RenderedImage {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        RenderedImage::png(bytes)
    }

    #[test]
    fn test_empty_image_rejected() {
        assert_eq!(
            validate(&[]),
            Err(ArchError::invalid_input("No image provided."))
        );
        assert!(validate(&[1, 2, 3]).is_ok());
    }

    #[test]
    fn test_flatten_fills_transparent_pixels() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        img.put_pixel(1, 0, Rgba([10, 20, 30, 255]));

        let flat = flatten(&png(img), [255, 255, 255]).unwrap();
        let out = image::load_from_memory(&flat.bytes).unwrap().to_rgba8();
        assert_eq!(*out.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        assert_eq!(*out.get_pixel(1, 0), Rgba([10, 20, 30, 255]));
    }
}
