//! Cumulative dense multi-scale feature fusion.
//!
//! Starting from the coarsest encoder tensor, the block repeatedly upsamples
//! (bilinear, corners aligned), projects with a 1x1 convolution and
//! concatenates the next-finer encoder tensor. The running width grows by
//! `channels` per stage, ending at `scales * channels` channels at the input
//! resolution.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, VarBuilder};

use crate::config::{NetworkConfig, SCALE_FACTOR};

/// Upsamples `x` (N,C,H,W) by `factor` with bilinear interpolation, corners aligned.
///
/// The first and last rows and columns of the output coincide with those of the
/// input.
///
/// # Errors
///
/// Fails if `x` is not four-dimensional.
pub fn upsample_bilinear(x: &Tensor, factor: usize) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    let (out_h, out_w) = (h * factor, w * factor);
    let cols = interpolation_matrix(w, out_w, x.dtype(), x.device())?;
    let rows = interpolation_matrix(h, out_h, x.dtype(), x.device())?;

    let x = x.contiguous()?.reshape((n * c * h, w))?.matmul(&cols)?;
    let x = x
        .reshape((n, c, h, out_w))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape((n * c * out_w, h))?
        .matmul(&rows)?;
    x.reshape((n, c, out_w, out_h))?.transpose(2, 3)?.contiguous()
}

/// Weights `(input, output)` mapping `input` samples onto `output` samples.
#[allow(clippy::cast_precision_loss)]
fn interpolation_matrix(input: usize, output: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; input * output];
    let scale = if output > 1 && input > 1 {
        (input - 1) as f64 / (output - 1) as f64
    } else {
        0.0
    };
    for o in 0..output {
        let src = o as f64 * scale;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lo = (src.floor() as usize).min(input - 1);
        let hi = (lo + 1).min(input - 1);
        #[allow(clippy::cast_possible_truncation)]
        let frac = (src - lo as f64) as f32;
        weights[lo * output + o] += 1.0 - frac;
        weights[hi * output + o] += frac;
    }
    Tensor::from_vec(weights, (input, output), device)?.to_dtype(dtype)
}

/// Multi-scale fusion block.
///
/// Parameters live under `conv{k}` where `k` counts scales from the finest
/// (`conv1`) to the coarsest (`conv5` for five scales).
#[derive(Debug, Clone)]
pub struct FusionBlock {
    projections: Vec<Conv2d>,
}

impl FusionBlock {
    /// Builds one 1x1 projection per encoder scale.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing or has the wrong shape.
    pub fn new(config: &NetworkConfig, vb: VarBuilder) -> Result<Self> {
        let scales = config.scales();
        let projections = config
            .fusion_stages()
            .into_iter()
            .enumerate()
            .map(|(j, stage)| {
                conv2d(
                    stage.in_channels,
                    stage.out_channels,
                    1,
                    Default::default(),
                    vb.pp(format!("conv{}", scales - j)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { projections })
    }

    /// Fuses encoder outputs given finest first.
    ///
    /// # Errors
    ///
    /// Fails if the number of tensors differs from the number of scales, or if
    /// their widths and resolutions do not chain.
    pub fn forward(&self, features: &[Tensor]) -> Result<Tensor> {
        let scales = self.projections.len();
        if features.len() != scales {
            bail!(
                "fusion expects {scales} encoder tensors, got {}",
                features.len()
            );
        }
        let mut x = features[scales - 1].clone();
        for (j, projection) in self.projections.iter().enumerate() {
            if j > 0 {
                x = Tensor::cat(&[&x, &features[scales - 1 - j]], 1)?;
            }
            x = projection.forward(&upsample_bilinear(&x, SCALE_FACTOR)?)?;
        }
        Ok(x)
    }
}
