//! Mask-gated partial convolution.
//!
//! A partial convolution carries a validity mask alongside its features. Zero
//! mask entries mark unknown pixels (specular highlights). Each output position
//! sees only the known pixels of its receptive field, rescaled by how many of
//! them there were, and becomes known itself iff at least one of them was.

use candle_core::{DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, VarBuilder};

use crate::blocks::conv_config;
use crate::config::{KernelSpec, Stage};

/// Counts valid mask pixels under every receptive field.
///
/// This is a fixed all-ones convolution derived only from the kernel geometry.
/// It never reads from a parameter source, so it cannot be trained or loaded.
#[derive(Debug, Clone)]
pub struct MaskCounter {
    ones: Tensor,
    kernel: KernelSpec,
}

impl MaskCounter {
    /// Builds the counting kernel for `kernel`.
    ///
    /// # Errors
    ///
    /// Fails if the kernel cannot be allocated on `device`.
    pub fn new(kernel: KernelSpec, dtype: DType, device: &Device) -> Result<Self> {
        let ones = Tensor::ones((1, 1, kernel.size, kernel.size), dtype, device)?;
        Ok(Self { ones, kernel })
    }

    /// Sums `mask` (N,1,H,W) over each receptive field.
    ///
    /// # Errors
    ///
    /// Fails if `mask` does not have a single channel.
    pub fn count(&self, mask: &Tensor) -> Result<Tensor> {
        mask.conv2d(&self.ones, self.kernel.padding, 1, self.kernel.dilation, 1)
    }
}

/// Partial convolution -> batch norm -> relu, threading a validity mask.
///
/// Parameters live under `conv_I` and `bn`.
#[derive(Debug, Clone)]
pub struct PartialConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
    counter: MaskCounter,
}

impl PartialConvBlock {
    /// Builds the block, reading the learned convolution and normalization from `vb`.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing or has the wrong shape.
    pub fn new(stage: Stage, kernel: KernelSpec, eps: f64, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(
            stage.in_channels,
            stage.out_channels,
            kernel.size,
            conv_config(kernel),
            vb.pp("conv_I"),
        )?;
        let bn = batch_norm(stage.out_channels, eps, vb.pp("bn"))?;
        let counter = MaskCounter::new(kernel, vb.dtype(), vb.device())?;
        Ok(Self { conv, bn, counter })
    }

    /// Runs the block on features `x` (N,C,H,W) and mask (N,1,H,W).
    ///
    /// Returns the output features and the output mask. The output mask holds
    /// the per-position valid count, zero where the receptive field had no
    /// valid pixel; features at those positions are exactly zero.
    ///
    /// # Errors
    ///
    /// Fails if `x` and `mask` disagree on batch, height or width.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let count = self.counter.count(mask)?;
        let valid = count.ne(0f32)?.to_dtype(count.dtype())?;
        let empty = count.eq(0f32)?.to_dtype(count.dtype())?;
        // Empty fields divide by one instead of zero.
        let divisor = (&count + &empty)?;

        let y = self.conv.forward(&x.broadcast_mul(mask)?)?;
        let y = y.broadcast_div(&divisor)?;
        let y = self.bn.forward_t(&y, false)?.relu()?;
        let y = y.broadcast_mul(&valid)?;

        let mask = (divisor * valid)?;
        Ok((y, mask))
    }
}
