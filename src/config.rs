//! Declarative channel table for the highlight-removal network.
//!
//! Every convolution in the network is described here as an `in -> out` stage.
//! [`NetworkConfig::validate`] audits the channel arithmetic (skip concatenations,
//! fusion growth, head inputs) without building any tensors, and the network
//! builder consumes the same table so the two can never drift apart.

use candle_nn::Activation;

use crate::error::{Error, Result};

/// Spatial factor of every pooling and upsampling step.
pub const SCALE_FACTOR: usize = 2;

/// One convolution stage: input channels to output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Channels consumed by the stage.
    pub in_channels: usize,
    /// Channels produced by the stage.
    pub out_channels: usize,
}

impl Stage {
    /// Creates a new `Stage`.
    #[must_use]
    pub const fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
        }
    }
}

/// A prediction-head stage with its final activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadStage {
    /// Channel widths of the stage.
    pub stage: Stage,
    /// Activation applied after normalization.
    pub activation: Activation,
}

impl HeadStage {
    /// A stage ending in a rectifier.
    #[must_use]
    pub const fn relu(in_channels: usize, out_channels: usize) -> Self {
        Self {
            stage: Stage::new(in_channels, out_channels),
            activation: Activation::Relu,
        }
    }

    /// A stage ending in a sigmoid, producing membership grades in `[0, 1]`.
    #[must_use]
    pub const fn sigmoid(in_channels: usize, out_channels: usize) -> Self {
        Self {
            stage: Stage::new(in_channels, out_channels),
            activation: Activation::Sigmoid,
        }
    }
}

/// Kernel geometry shared by a group of convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSpec {
    /// Square kernel size.
    pub size: usize,
    /// Zero padding on every side.
    pub padding: usize,
    /// Kernel dilation.
    pub dilation: usize,
}

impl KernelSpec {
    /// Creates a kernel spec with dilation 1.
    #[must_use]
    pub const fn new(size: usize, padding: usize) -> Self {
        Self {
            size,
            padding,
            dilation: 1,
        }
    }

    /// Whether a stride-1 convolution with this kernel keeps height and width.
    #[must_use]
    pub const fn preserves_size(&self) -> bool {
        self.size > 0 && 2 * self.padding == self.dilation * (self.size - 1)
    }
}

/// Full channel table of the network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Channels of the input image (3 for RGB).
    pub input_channels: usize,
    /// Downsampling stages, finest scale first.
    pub encoder: Vec<Stage>,
    /// Kernel of the encoder convolutions.
    pub encoder_kernel: KernelSpec,
    /// Width increment of the multi-scale fusion block.
    pub fusion_channels: usize,
    /// Upsampling stages, coarsest scale first.
    pub decoder: Vec<Stage>,
    /// Mask head, ending in a single sigmoid channel.
    pub mask_head: Vec<HeadStage>,
    /// Specular color head.
    pub color_head: Vec<HeadStage>,
    /// Kernel of both prediction heads.
    pub head_kernel: KernelSpec,
    /// Cascaded partial-convolution stages.
    pub refine: Vec<Stage>,
    /// Kernel of the partial convolutions.
    pub refine_kernel: KernelSpec,
    /// Epsilon of every batch-normalization layer.
    pub batch_norm_eps: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_channels: 3,
            encoder: vec![
                Stage::new(3, 4),
                Stage::new(4, 8),
                Stage::new(8, 16),
                Stage::new(16, 32),
                Stage::new(32, 64),
            ],
            encoder_kernel: KernelSpec::new(3, 1),
            fusion_channels: 3,
            decoder: vec![
                Stage::new(64, 32),
                Stage::new(64, 16),
                Stage::new(32, 8),
                Stage::new(16, 4),
                Stage::new(8, 1),
            ],
            mask_head: vec![
                HeadStage::relu(16, 8),
                HeadStage::relu(8, 4),
                HeadStage::sigmoid(4, 1),
            ],
            color_head: vec![HeadStage::relu(17, 8), HeadStage::relu(8, 3)],
            head_kernel: KernelSpec::new(3, 1),
            refine: vec![Stage::new(19, 13), Stage::new(13, 8), Stage::new(8, 3)],
            refine_kernel: KernelSpec::new(5, 2),
            batch_norm_eps: 1e-5,
        }
    }
}

impl NetworkConfig {
    /// Number of encoder scales.
    #[must_use]
    pub fn scales(&self) -> usize {
        self.encoder.len()
    }

    /// Input height and width must be a multiple of this value.
    #[must_use]
    pub fn size_multiple(&self) -> usize {
        SCALE_FACTOR.pow(u32::try_from(self.scales()).unwrap_or(u32::MAX))
    }

    /// Channels produced by the fusion block.
    #[must_use]
    pub fn fusion_out_channels(&self) -> usize {
        self.scales() * self.fusion_channels
    }

    /// Channels of the full-resolution decoder tensor fed to the heads.
    #[must_use]
    pub fn decoder_out_channels(&self) -> usize {
        self.decoder.last().map_or(0, |s| s.out_channels) + self.fusion_out_channels()
    }

    /// The 1x1 projections of the fusion block, coarsest first.
    ///
    /// Projection `j` consumes the previous projection (`j * channels` wide)
    /// concatenated with the next-finer encoder tensor and emits
    /// `(j + 1) * channels`.
    #[must_use]
    pub fn fusion_stages(&self) -> Vec<Stage> {
        let c = self.fusion_channels;
        self.encoder
            .iter()
            .rev()
            .enumerate()
            .map(|(j, enc)| Stage::new(enc.out_channels + j * c, (j + 1) * c))
            .collect()
    }

    /// Checks that every stage consumes exactly what the previous one produces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first inconsistent stage.
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 || self.fusion_channels == 0 {
            return Err(invalid("input and fusion channels must be non-zero"));
        }
        if self.encoder.is_empty() {
            return Err(invalid("encoder needs at least one scale"));
        }
        if self.decoder.len() != self.encoder.len() {
            return Err(invalid(format!(
                "decoder has {} stages for {} encoder scales",
                self.decoder.len(),
                self.encoder.len()
            )));
        }
        for (name, kernel) in [
            ("encoder", self.encoder_kernel),
            ("head", self.head_kernel),
            ("refine", self.refine_kernel),
        ] {
            if !kernel.preserves_size() {
                return Err(invalid(format!(
                    "{name} kernel {kernel:?} does not preserve spatial size"
                )));
            }
        }

        check_chain("encoder", self.input_channels, self.encoder.iter().copied())?;

        let scales = self.scales();
        let mut expected = self.encoder[scales - 1].out_channels;
        for (i, stage) in self.decoder.iter().enumerate() {
            if stage.in_channels != expected {
                return Err(invalid(format!(
                    "decoder stage {i} takes {} channels, expected {expected}",
                    stage.in_channels
                )));
            }
            let skip = if i + 1 < scales {
                self.encoder[scales - 2 - i].out_channels
            } else {
                self.fusion_out_channels()
            };
            expected = stage.out_channels + skip;
        }

        let features = self.decoder_out_channels();
        check_chain("mask head", features, self.mask_head.iter().map(|h| h.stage))?;
        check_tail("mask head", self.mask_head.last().map(|h| h.stage), 1)?;

        check_chain(
            "color head",
            features + 1,
            self.color_head.iter().map(|h| h.stage),
        )?;
        check_tail(
            "color head",
            self.color_head.last().map(|h| h.stage),
            self.input_channels,
        )?;

        check_chain(
            "refinement",
            features + self.input_channels,
            self.refine.iter().copied(),
        )?;
        check_tail("refinement", self.refine.last().copied(), self.input_channels)?;

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

fn check_chain(name: &str, first_in: usize, stages: impl Iterator<Item = Stage>) -> Result<()> {
    let mut expected = first_in;
    let mut count = 0;
    for (i, stage) in stages.enumerate() {
        if stage.in_channels != expected {
            return Err(invalid(format!(
                "{name} stage {i} takes {} channels, expected {expected}",
                stage.in_channels
            )));
        }
        expected = stage.out_channels;
        count += 1;
    }
    if count == 0 {
        return Err(invalid(format!("{name} has no stages")));
    }
    Ok(())
}

fn check_tail(name: &str, last: Option<Stage>, out_channels: usize) -> Result<()> {
    match last {
        Some(stage) if stage.out_channels == out_channels => Ok(()),
        Some(stage) => Err(invalid(format!(
            "{name} ends with {} channels, expected {out_channels}",
            stage.out_channels
        ))),
        None => Err(invalid(format!("{name} has no stages"))),
    }
}
