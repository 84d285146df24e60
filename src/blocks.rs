//! Basic convolution building blocks.
//!
//! Each block owns a convolution followed by batch normalization (always in
//! inference mode) and an activation. Parameters live under `features.0`
//! (convolution) and `features.1` (normalization), matching the layout of the
//! original checkpoints.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, Activation, BatchNorm, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, VarBuilder,
};

use crate::config::{HeadStage, KernelSpec, Stage, SCALE_FACTOR};

pub(crate) fn conv_config(kernel: KernelSpec) -> Conv2dConfig {
    Conv2dConfig {
        padding: kernel.padding,
        dilation: kernel.dilation,
        ..Default::default()
    }
}

/// Downsampling block: conv -> batch norm -> relu -> 2x2 max-pool.
#[derive(Debug, Clone)]
pub struct EncoderBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl EncoderBlock {
    /// Builds the block, reading parameters from `vb`.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing or has the wrong shape.
    pub fn new(stage: Stage, kernel: KernelSpec, eps: f64, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        let conv = conv2d(
            stage.in_channels,
            stage.out_channels,
            kernel.size,
            conv_config(kernel),
            vb.pp(0),
        )?;
        let bn = batch_norm(stage.out_channels, eps, vb.pp(1))?;
        Ok(Self { conv, bn })
    }
}

impl Module for EncoderBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, false)?.relu()?;
        x.max_pool2d(SCALE_FACTOR)
    }
}

/// Plain convolution block: conv -> batch norm -> configurable activation.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
    activation: Activation,
}

impl ConvBlock {
    /// Builds the block, reading parameters from `vb`.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing or has the wrong shape.
    pub fn new(head: HeadStage, kernel: KernelSpec, eps: f64, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        let stage = head.stage;
        let conv = conv2d(
            stage.in_channels,
            stage.out_channels,
            kernel.size,
            conv_config(kernel),
            vb.pp(0),
        )?;
        let bn = batch_norm(stage.out_channels, eps, vb.pp(1))?;
        Ok(Self {
            conv,
            bn,
            activation: head.activation,
        })
    }
}

impl Module for ConvBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, false)?;
        self.activation.forward(&x)
    }
}

/// Upsampling block: transposed conv (kernel = stride = factor) -> batch norm -> relu.
///
/// Output height and width are exactly `factor` times the input's.
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    conv: ConvTranspose2d,
    bn: BatchNorm,
}

impl DecoderBlock {
    /// Builds the block, reading parameters from `vb`.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing or has the wrong shape.
    pub fn new(stage: Stage, factor: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("features");
        let cfg = ConvTranspose2dConfig {
            stride: factor,
            ..Default::default()
        };
        let conv = conv_transpose2d(
            stage.in_channels,
            stage.out_channels,
            factor,
            cfg,
            vb.pp(0),
        )?;
        let bn = batch_norm(stage.out_channels, eps, vb.pp(1))?;
        Ok(Self { conv, bn })
    }
}

impl Module for DecoderBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        self.bn.forward_t(&x, false)?.relu()
    }
}

/// A sequence of [`ConvBlock`]s indexed `0..n` under one prefix.
#[derive(Debug, Clone)]
pub struct ConvStack {
    blocks: Vec<ConvBlock>,
}

impl ConvStack {
    /// Builds one block per head stage.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is missing or has the wrong shape.
    pub fn new(heads: &[HeadStage], kernel: KernelSpec, eps: f64, vb: VarBuilder) -> Result<Self> {
        let blocks = heads
            .iter()
            .enumerate()
            .map(|(i, head)| ConvBlock::new(*head, kernel, eps, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }
}

impl Module for ConvStack {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(x.clone(), |x, block| block.forward(&x))
    }
}
