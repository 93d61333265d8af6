//! Numeric pre- and post-processing around the segmentation networks

use super::SegmentationNet;
use candle_core::{DType, Device, Error, Result, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

/// Side length of the square network input
pub const INPUT_SIZE: u32 = 1024;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Alpha mask for the IS-Net family
///
/// Bilinear resize to the network input, mean 0.5 / std 1.0 normalization,
/// bilinear resize of the output back to the source size, then min-max
/// normalization against the map's own range.
pub fn isnet_mask(image: &RgbImage, net: &mut dyn SegmentationNet) -> Result<GrayImage> {
    let (width, height) = checked_dimensions(image)?;
    let side = INPUT_SIZE as usize;

    let input = rgb_to_tensor(image, net.device())?;
    let input = resize_bilinear(&input, side, side)?.affine(1.0 / 255.0, -0.5)?;

    let output = first_channel(&net.forward(&input)?)?;
    let output = resize_bilinear(&output, height, width)?;

    map_to_gray(&min_max_normalize(&output)?)
}

/// Alpha mask for the BiRefNet family
///
/// Image resampling to the network input, ImageNet normalization, sigmoid
/// over the last output head, then image resampling back to the source size.
pub fn birefnet_mask(image: &RgbImage, net: &mut dyn SegmentationNet) -> Result<GrayImage> {
    let (width, height) = checked_dimensions(image)?;
    let device = net.device().clone();

    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let mean = Tensor::new(&IMAGENET_MEAN, &device)?.reshape((1, 3, 1, 1))?;
    let std = Tensor::new(&IMAGENET_STD, &device)?.reshape((1, 3, 1, 1))?;
    let input = rgb_to_tensor(&resized, &device)?
        .affine(1.0 / 255.0, 0.0)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;

    let logits = first_channel(&net.forward(&input)?)?;
    let mask = map_to_gray(&candle_nn::ops::sigmoid(&logits)?)?;

    #[allow(clippy::cast_possible_truncation)]
    Ok(imageops::resize(
        &mask,
        width as u32,
        height as u32,
        FilterType::CatmullRom,
    ))
}

/// Copy of `source` with `mask` as its alpha channel
#[must_use]
pub fn apply_alpha(source: &DynamicImage, mask: &GrayImage) -> RgbaImage {
    let mut output = source.to_rgba8();
    debug_assert_eq!(output.dimensions(), mask.dimensions());
    for (pixel, alpha) in output.pixels_mut().zip(mask.pixels()) {
        pixel[3] = alpha[0];
    }
    output
}

fn checked_dimensions(image: &RgbImage) -> Result<(usize, usize)> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::msg("image has no pixels"));
    }
    Ok((width as usize, height as usize))
}

/// `(1, 3, H, W)` f32 tensor holding raw `[0, 255]` values
pub fn rgb_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    Tensor::from_slice(
        image.as_raw().as_slice(),
        (height as usize, width as usize, 3),
        device,
    )?
    .permute((2, 0, 1))?
    .to_dtype(DType::F32)?
    .unsqueeze(0)
}

/// First channel of a network output as an f32 `(1, 1, H, W)` map
fn first_channel(output: &Tensor) -> Result<Tensor> {
    let output = match output.rank() {
        2 => output.unsqueeze(0)?.unsqueeze(0)?,
        3 => output.unsqueeze(0)?,
        _ => output.clone(),
    };
    let (_, channels, _, _) = output.dims4()?;
    if channels == 0 {
        return Err(Error::msg("network output has no channels"));
    }
    output.narrow(0, 0, 1)?.narrow(1, 0, 1)?.to_dtype(DType::F32)
}

/// Bilinear resize of an NCHW tensor with half-pixel centres and no antialiasing
pub fn resize_bilinear(input: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, in_height, in_width) = input.dims4()?;
    if in_height == height && in_width == width {
        return Ok(input.clone());
    }
    if in_height == 0 || in_width == 0 || height == 0 || width == 0 {
        return Err(Error::msg("cannot resize an empty tensor"));
    }

    let input = input.contiguous()?;
    let device = input.device();
    let dtype = input.dtype();

    let (top, bottom, fy) = source_coords(in_height, height);
    let top = input.index_select(&Tensor::from_vec(top, height, device)?, 2)?;
    let bottom = input.index_select(&Tensor::from_vec(bottom, height, device)?, 2)?;
    let fy = Tensor::from_vec(fy, (1, 1, height, 1), device)?.to_dtype(dtype)?;
    let rows = lerp(&top, &bottom, &fy)?;

    let (left, right, fx) = source_coords(in_width, width);
    let left = rows.index_select(&Tensor::from_vec(left, width, device)?, 3)?;
    let right = rows.index_select(&Tensor::from_vec(right, width, device)?, 3)?;
    let fx = Tensor::from_vec(fx, (1, 1, 1, width), device)?.to_dtype(dtype)?;
    lerp(&left, &right, &fx)
}

fn lerp(a: &Tensor, b: &Tensor, t: &Tensor) -> Result<Tensor> {
    a.broadcast_add(&(b - a)?.broadcast_mul(t)?)
}

/// Source indices and interpolation weights along one axis
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn source_coords(in_len: usize, out_len: usize) -> (Vec<u32>, Vec<u32>, Vec<f32>) {
    let scale = in_len as f32 / out_len as f32;
    let last = in_len - 1;

    let mut lower = Vec::with_capacity(out_len);
    let mut upper = Vec::with_capacity(out_len);
    let mut weight = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
        let lo = (src.floor() as usize).min(last);
        lower.push(lo as u32);
        upper.push((lo + 1).min(last) as u32);
        weight.push(src - lo as f32);
    }

    (lower, upper, weight)
}

/// Rescale to `[0, 1]` using the tensor's own min and max
///
/// A constant map has no range and becomes all zeros.
pub fn min_max_normalize(map: &Tensor) -> Result<Tensor> {
    let flat = map.flatten_all()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let range = max - min;
    if range <= f32::EPSILON {
        return map.zeros_like();
    }
    map.affine(1.0 / f64::from(range), -f64::from(min) / f64::from(range))
}

/// `(1, 1, H, W)` map in `[0, 1]` to an 8-bit mask, truncating like a u8 cast
#[allow(clippy::cast_possible_truncation)]
fn map_to_gray(map: &Tensor) -> Result<GrayImage> {
    let (_, _, height, width) = map.dims4()?;
    let pixels = map
        .affine(255.0, 0.0)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::msg("mask buffer does not match its dimensions"))
}
