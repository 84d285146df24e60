//! Conversions between rasters and tensors, plus size padding.

use candle_core::{Device, IndexOp, Result, Tensor};
use image::{GrayImage, Luma, Rgb, RgbImage};

/// Smallest multiple of `multiple` that is `>= n`.
#[must_use]
pub fn padded_size(n: u32, multiple: u32) -> u32 {
    n.div_ceil(multiple) * multiple
}

/// Maps an out-of-range coordinate back into `0..n` by mirroring, edge repeated.
///
/// `n = 3`: `0 1 2 | 2 1 0 | 0 1 2 | ...`
fn reflect_index(i: u32, n: u32) -> u32 {
    let period = 2 * n;
    let r = i % period;
    if r < n {
        r
    } else {
        period - 1 - r
    }
}

/// Extends `image` to `width` x `height` by reflecting it across its bottom and
/// right edges.
///
/// Pixels already inside the image are unchanged. Pads longer than the image
/// keep alternating between mirrored and straight copies.
#[must_use]
pub fn reflect_pad(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        *image.get_pixel(reflect_index(x, w), reflect_index(y, h))
    })
}

/// Converts an RGB image into a (1,3,H,W) tensor with samples in `[0, 1]`.
///
/// # Errors
///
/// Fails if the tensor cannot be allocated on `device`.
pub fn rgb_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, px) in image.pixels().enumerate() {
        for (c, v) in px.0.iter().enumerate() {
            data[c * plane + i] = f32::from(*v) / 255.0;
        }
    }
    Tensor::from_vec(data, (1, 3, h as usize, w as usize), device)
}

/// Thresholds a mask: `1.0` where `mask >= threshold`, `0.0` elsewhere.
///
/// # Errors
///
/// Fails if the comparison cannot run on the mask's device.
pub fn threshold_mask(mask: &Tensor, threshold: f32) -> Result<Tensor> {
    mask.ge(f64::from(threshold))?.to_dtype(mask.dtype())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Converts the first image of a (N,3,H,W) tensor into an RGB image cropped to
/// `width` x `height` from the top-left corner.
///
/// # Errors
///
/// Fails if the tensor is not (N,3,H,W) or is smaller than the crop.
pub fn tensor_to_rgb(t: &Tensor, width: u32, height: u32) -> Result<RgbImage> {
    let planes = crop(t, width, height)?.to_vec3::<f32>()?;
    if planes.len() != 3 {
        candle_core::bail!("expected 3 channels, got {}", planes.len());
    }
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_byte(planes[0][y][x]),
            to_byte(planes[1][y][x]),
            to_byte(planes[2][y][x]),
        ])
    }))
}

/// Converts the first image of a (N,1,H,W) tensor into a grayscale image cropped
/// to `width` x `height` from the top-left corner.
///
/// # Errors
///
/// Fails if the tensor is not (N,1,H,W) or is smaller than the crop.
pub fn tensor_to_mask(t: &Tensor, width: u32, height: u32) -> Result<GrayImage> {
    let plane = crop(t, width, height)?.i(0)?.to_vec2::<f32>()?;
    Ok(GrayImage::from_fn(width, height, |x, y| {
        Luma([to_byte(plane[y as usize][x as usize])])
    }))
}

fn crop(t: &Tensor, width: u32, height: u32) -> Result<Tensor> {
    t.i((0, .., ..height as usize, ..width as usize))
}
