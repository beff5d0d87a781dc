use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use thiserror::Error;

use super::frame::{Frame, PixelFormat};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame holds {actual} bytes, {expected} expected for its geometry")]
    Truncated { expected: usize, actual: usize },
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Encode a frame as a still image the detector can decompress.
///
/// MJPEG frames are already JPEG stills and pass through untouched; raw formats
/// are encoded as PNG.
pub fn encode_still(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let image = match frame.meta().format {
        PixelFormat::Mjpeg => return Ok(frame.data().to_vec()),
        PixelFormat::Gray8 => DynamicImage::ImageLuma8(to_gray(frame)?),
        _ => DynamicImage::ImageRgb8(to_rgb(frame)?),
    };

    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Decode a frame into packed RGB.
pub fn to_rgb(frame: &Frame) -> Result<RgbImage, EncodeError> {
    let meta = frame.meta();
    let (width, height) = (meta.width, meta.height);
    let data = frame.data();

    let rgb = match meta.format {
        PixelFormat::Mjpeg => {
            return Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8())
        }
        PixelFormat::Rgb24 => packed(data, width, height, 3, meta.stride)?,
        PixelFormat::Bgr24 => {
            let mut pixels = packed(data, width, height, 3, meta.stride)?;
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            pixels
        }
        PixelFormat::Gray8 => packed(data, width, height, 1, meta.stride)?
            .into_iter()
            .flat_map(|v| [v, v, v])
            .collect(),
        PixelFormat::Yuyv => yuyv_to_rgb(&packed(data, width, height, 2, meta.stride)?),
    };

    RgbImage::from_raw(width, height, rgb).ok_or(EncodeError::Truncated {
        expected: (width * height * 3) as usize,
        actual: frame.data().len(),
    })
}

fn to_gray(frame: &Frame) -> Result<GrayImage, EncodeError> {
    let meta = frame.meta();
    let pixels = packed(frame.data(), meta.width, meta.height, 1, meta.stride)?;
    GrayImage::from_raw(meta.width, meta.height, pixels).ok_or(EncodeError::Truncated {
        expected: (meta.width * meta.height) as usize,
        actual: frame.data().len(),
    })
}

/// Copy rows out of a possibly padded buffer.
fn packed(data: &[u8], width: u32, height: u32, bpp: u32, stride: u32) -> Result<Vec<u8>, EncodeError> {
    let row = (width * bpp) as usize;
    let stride = (stride as usize).max(row);
    let expected = stride * (height as usize).saturating_sub(1) + row;
    if height == 0 || data.len() < expected {
        return Err(EncodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    if stride == row {
        return Ok(data[..row * height as usize].to_vec());
    }
    let mut out = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        out.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    Ok(out)
}

/// BT.601 YUYV (4:2:2) to RGB.
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for chunk in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    rgb
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = f32::from(y) - 16.0;
    let d = f32::from(u) - 128.0;
    let e = f32::from(v) - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(1.164 * c + 1.596 * e),
        clamp(1.164 * c - 0.392 * d - 0.813 * e),
        clamp(1.164 * c + 2.017 * d),
    ]
}
