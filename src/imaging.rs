use std::io::Cursor;

use anyhow::{bail, Context, Result};
use dicom_object::{from_reader, DefaultDicomObject};
use dicom_pixeldata::PixelDecoder;
use eframe::egui::{Color32, ColorImage};

/// Decodes a fetched scan image: DICOM (with or without preamble) or any
/// raster format the `image` crate understands.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<ColorImage> {
    if bytes.is_empty() {
        bail!("Image body is empty");
    }
    if is_dicom(bytes) {
        return decode_dicom(bytes);
    }

    let decoded = image::load_from_memory(bytes).context("Unsupported image encoding")?;
    let rgba = decoded.to_rgba8();
    let size = [rgba.width() as usize, rgba.height() as usize];
    Ok(ColorImage::from_rgba_unmultiplied(size, rgba.as_raw()))
}

pub fn is_dicom(bytes: &[u8]) -> bool {
    (bytes.len() >= 132 && &bytes[128..132] == b"DICM") || bytes.starts_with(b"DICM")
}

fn decode_dicom(bytes: &[u8]) -> Result<ColorImage> {
    let body = if bytes.starts_with(b"DICM") {
        bytes
    } else {
        &bytes[128..]
    };
    let obj = from_reader(Cursor::new(body)).context("Could not parse DICOM image")?;
    let decoded = obj
        .decode_pixel_data_frame(0)
        .context("Failed to decode PixelData frame 0")?;
    let width = decoded.columns() as usize;
    let height = decoded.rows() as usize;
    let pixel_count = width
        .checked_mul(height)
        .context("Overflow while calculating frame size")?;

    match decoded.samples_per_pixel() {
        1 => {
            let samples: Vec<i32> = decoded
                .to_vec_frame(0)
                .context("Could not convert decoded frame 0 to i32 samples")?;
            if samples.len() != pixel_count {
                bail!(
                    "Decoded pixel count mismatch: got {}, expected {pixel_count}",
                    samples.len()
                );
            }
            let (min_value, max_value) =
                min_max(&samples).context("No pixels available for rendering")?;
            let center = read_float_first(&obj, "WindowCenter")
                .unwrap_or_else(|| (min_value + max_value) as f32 / 2.0);
            let window = read_float_first(&obj, "WindowWidth")
                .unwrap_or_else(|| (max_value - min_value).max(1) as f32);
            let invert = read_string(&obj, "PhotometricInterpretation")
                .is_some_and(|value| value.eq_ignore_ascii_case("MONOCHROME1"));
            Ok(render_window_level(
                width, height, &samples, invert, center, window,
            ))
        }
        spp if spp >= 3 => {
            let bits_shift = decoded.bits_stored().saturating_sub(8);
            let samples: Vec<u8> = if decoded.bits_allocated() == 8 {
                decoded
                    .to_vec_frame(0)
                    .context("Could not convert decoded frame 0 to u8 samples")?
            } else {
                let wide: Vec<u16> = decoded
                    .to_vec_frame(0)
                    .context("Could not convert decoded frame 0 to u16 samples")?;
                wide.into_iter()
                    .map(|sample| (sample >> bits_shift) as u8)
                    .collect()
            };
            Ok(render_rgb(width, height, &samples, spp))
        }
        other => bail!("Unsupported SamplesPerPixel={other}"),
    }
}

pub fn render_window_level(
    width_px: usize,
    height_px: usize,
    samples: &[i32],
    invert: bool,
    center: f32,
    width: f32,
) -> ColorImage {
    let low = center - width.max(1.0) / 2.0;
    let range = width.max(1.0).max(1e-6);

    let pixels = samples
        .iter()
        .map(|&sample| {
            let normalized = ((sample as f32 - low) / range).clamp(0.0, 1.0);
            let gray = (normalized * 255.0).round() as u8;
            Color32::from_gray(if invert { 255 - gray } else { gray })
        })
        .collect();

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

pub fn render_rgb(
    width_px: usize,
    height_px: usize,
    samples: &[u8],
    samples_per_pixel: u16,
) -> ColorImage {
    let spp = samples_per_pixel.max(1) as usize;
    let pixel_count = width_px.saturating_mul(height_px);
    let mut pixels = samples
        .chunks_exact(spp)
        .take(pixel_count)
        .map(|chunk| match chunk {
            [r, g, b, ..] => Color32::from_rgb(*r, *g, *b),
            [gray, ..] => Color32::from_gray(*gray),
            [] => Color32::BLACK,
        })
        .collect::<Vec<_>>();
    pixels.resize(pixel_count, Color32::BLACK);

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

/// Nearest-neighbour shrink so the longest edge fits `max_dim`.
pub fn downsample_color_image(source: &ColorImage, max_dim: usize) -> ColorImage {
    let [source_width, source_height] = source.size;
    let longest_edge = source_width.max(source_height);
    if source_width == 0 || source_height == 0 || max_dim == 0 || longest_edge <= max_dim {
        return source.clone();
    }

    let scale = max_dim as f32 / longest_edge as f32;
    let target_width = ((source_width as f32 * scale).round() as usize).max(1);
    let target_height = ((source_height as f32 * scale).round() as usize).max(1);

    let mut pixels = Vec::with_capacity(target_width * target_height);
    for target_y in 0..target_height {
        let source_y = ((target_y * source_height) / target_height).min(source_height - 1);
        for target_x in 0..target_width {
            let source_x = ((target_x * source_width) / target_width).min(source_width - 1);
            pixels.push(source.pixels[source_y * source_width + source_x]);
        }
    }

    ColorImage {
        size: [target_width, target_height],
        pixels,
    }
}

fn read_string(obj: &DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_float_first(obj: &DefaultDicomObject, name: &str) -> Option<f32> {
    read_string(obj, name).and_then(|value| value.split('\\').next()?.trim().parse::<f32>().ok())
}

fn min_max(values: &[i32]) -> Option<(i32, i32)> {
    let first = *values.first()?;
    Some(
        values
            .iter()
            .fold((first, first), |(low, high), &v| (low.min(v), high.max(v))),
    )
}
