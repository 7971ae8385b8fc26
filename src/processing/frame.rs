use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use frame_settings::ImageSizing;
use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage, imageops};
use tracing::debug;

use super::layout::{aspect_matches, center_offset, contain, cover};
use crate::photo::{Dimensions, measure};

const BACKGROUND_BLUR_SIGMA: f32 = 12.0;
const BACKGROUND_BRIGHTEN: i32 = -51;
const INNER_BORDER: u32 = 3;
const OUTER_SPACING: u32 = 15;
const INNER_BORDER_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const OUTER_SPACING_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

pub fn resize_rgba(source: &RgbaImage, target: Dimensions) -> Result<RgbaImage> {
    if target.width == 0 || target.height == 0 {
        anyhow::bail!("resize dimensions must be positive");
    }
    if source.width() == target.width && source.height() == target.height {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .context("failed to create source view for photo resize")?;
    let mut dst_image = fir::images::Image::new(target.width, target.height, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    fir::Resizer::new()
        .resize(&src_view, &mut dst_image, Some(&options))
        .context("photo resize failed")?;
    RgbaImage::from_raw(target.width, target.height, dst_image.into_vec())
        .ok_or_else(|| anyhow!("failed to construct resized RGBA image"))
}

fn dims(image: &RgbaImage) -> Dimensions {
    Dimensions::new(image.width(), image.height())
}

/// Scales to cover `display` and crops the overhang evenly.
pub fn cover_crop(image: &RgbaImage, display: Dimensions) -> Result<RgbaImage> {
    let covered = resize_rgba(image, cover(dims(image), display))?;
    let (x, y) = center_offset(display, dims(&covered));
    Ok(imageops::crop_imm(
        &covered,
        x.max(0) as u32,
        y.max(0) as u32,
        display.width,
        display.height,
    )
    .to_image())
}

/// Adds bands of `px` on the two sides of the letterboxed axis.
fn band(image: &RgbaImage, px: u32, vertical: bool, color: Rgba<u8>) -> RgbaImage {
    let (dx, dy) = if vertical { (0, px) } else { (px, 0) };
    let mut out = RgbaImage::from_pixel(image.width() + 2 * dx, image.height() + 2 * dy, color);
    imageops::replace(&mut out, image, i64::from(dx), i64::from(dy));
    out
}

/// Letterbox or pillarbox composition: a blurred, dimmed cover of the photo
/// behind a framed inset of the whole photo.
pub fn make_fullframe(image: &RgbaImage, display: Dimensions) -> Result<RgbaImage> {
    let mut background = cover_crop(image, display)?;
    background = imageops::blur(&background, BACKGROUND_BLUR_SIGMA);
    background = imageops::colorops::brighten(&background, BACKGROUND_BRIGHTEN);

    // Wider than the display means bars above and below.
    let vertical = dims(image).aspect() > display.aspect();
    let framed = band(
        &band(image, INNER_BORDER, vertical, INNER_BORDER_COLOR),
        OUTER_SPACING,
        vertical,
        OUTER_SPACING_COLOR,
    );
    let inset = resize_rgba(&framed, contain(dims(&framed), display))?;
    let (x, y) = center_offset(dims(&inset), display);
    imageops::overlay(&mut background, &inset, x, y);
    Ok(background)
}

fn open_rgba(path: &Path) -> Result<(RgbaImage, Option<ImageFormat>)> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to sniff {}", path.display()))?;
    let format = reader.format();
    let decoded = reader
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok((decoded.to_rgba8(), format))
}

/// Writes JPEG for JPEG sources and PNG for everything else.
fn save(image: RgbaImage, source_format: Option<ImageFormat>, dest: &Path) -> Result<&'static str> {
    let format = match source_format {
        Some(ImageFormat::Jpeg) => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };
    let dynamic = DynamicImage::ImageRgba8(image);
    let result = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(dynamic.to_rgb8()).save_with_format(dest, format)
    } else {
        dynamic.save_with_format(dest, format)
    };
    result.with_context(|| format!("failed to write {}", dest.display()))?;
    Ok(format.to_mime_type())
}

/// Copies `src` to `dest`, scaling it down first when it exceeds `max`.
///
/// Returns whether the image was rescaled.
pub fn shrink_into(src: &Path, dest: &Path, max: Dimensions) -> Result<bool> {
    let fits = measure(src).is_none_or(|d| d.width <= max.width && d.height <= max.height);
    if fits {
        fs::copy(src, dest)
            .with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))?;
        return Ok(false);
    }
    let (image, format) = open_rgba(src)?;
    let target = contain(dims(&image), max);
    debug!(src = %src.display(), ?target, "scaling down local photo");
    save(resize_rgba(&image, target)?, format, dest)?;
    Ok(true)
}

/// Applies the sizing mode to `src`, writing the result to `dest`.
///
/// Returns the new MIME type when a composed file was written, or `None`
/// when the photo should be shown as it is.
pub fn compose_file(
    src: &Path,
    dest: &Path,
    display: Dimensions,
    sizing: ImageSizing,
) -> Result<Option<&'static str>> {
    if sizing == ImageSizing::None {
        return Ok(None);
    }
    let Some(size) = measure(src) else {
        return Err(anyhow!("unable to measure {}", src.display()));
    };
    if aspect_matches(size, display) {
        debug!("photo already matches the display aspect");
        return Ok(None);
    }
    let (image, format) = open_rgba(src)?;
    let composed = match sizing {
        ImageSizing::Blur => make_fullframe(&image, display)?,
        ImageSizing::Zoom => cover_crop(&image, display)?,
        ImageSizing::None => return Ok(None),
    };
    save(composed, format, dest).map(Some)
}
