//! The highlight-removal network.
//!
//! One forward pass runs, in order: five downsampling blocks, multi-scale
//! fusion, five upsampling blocks with skip concatenation, the mask head, the
//! specular-color head, and a cascade of partial convolutions that inpaints the
//! highlight region of the first-pass estimate `I - M * S`.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use log::debug;

use crate::blocks::{ConvStack, DecoderBlock, EncoderBlock};
use crate::config::{NetworkConfig, SCALE_FACTOR};
use crate::error::Result;
use crate::fusion::FusionBlock;
use crate::partial_conv::PartialConvBlock;

/// The three predictions of one forward pass, all at the input resolution.
#[derive(Debug, Clone)]
pub struct NetOutput {
    /// Highlight membership `M` in `[0, 1]`, shape (N,1,H,W).
    pub mask: Tensor,
    /// Specular color `S`, shape (N,3,H,W).
    pub specular: Tensor,
    /// Highlight-free reconstruction `D`, shape (N,3,H,W).
    pub diffuse: Tensor,
}

/// Encoder-decoder with multi-scale fusion and a partial-convolution refinement cascade.
///
/// Learned parameters are immutable once built; one network can serve any
/// number of concurrent forward passes.
#[derive(Debug, Clone)]
pub struct SpecularNet {
    config: NetworkConfig,
    encoders: Vec<EncoderBlock>,
    fusion: FusionBlock,
    decoders: Vec<DecoderBlock>,
    mask_head: ConvStack,
    color_head: ConvStack,
    refine: Vec<PartialConvBlock>,
}

impl SpecularNet {
    /// Builds every block of `config`, reading learned parameters from `vb`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// channel table does not chain, or [`Error::Tensor`](crate::Error::Tensor)
    /// if a parameter is missing or mis-shaped.
    pub fn new(config: &NetworkConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let eps = config.batch_norm_eps;
        let scales = config.scales();

        let encoders = config
            .encoder
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                EncoderBlock::new(
                    *stage,
                    config.encoder_kernel,
                    eps,
                    vb.pp(format!("encoder{}", i + 1)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let fusion = FusionBlock::new(config, vb.pp("cdff"))?;

        // Decoders are numbered by the scale they start from, coarsest first.
        let decoders = config
            .decoder
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                DecoderBlock::new(
                    *stage,
                    SCALE_FACTOR,
                    eps,
                    vb.pp(format!("decoder{}", scales - i)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let mask_head =
            ConvStack::new(&config.mask_head, config.head_kernel, eps, vb.pp("M_conv"))?;
        let color_head =
            ConvStack::new(&config.color_head, config.head_kernel, eps, vb.pp("S_conv"))?;

        let refine = config
            .refine
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                PartialConvBlock::new(
                    *stage,
                    config.refine_kernel,
                    eps,
                    vb.pp(format!("D_conv{}", i + 1)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        debug!(
            "built network: {scales} scales, {} fused channels, {} refinement stages",
            config.fusion_out_channels(),
            refine.len()
        );

        Ok(Self {
            config: config.clone(),
            encoders,
            fusion,
            decoders,
            mask_head,
            color_head,
            refine,
        })
    }

    /// The channel table this network was built from.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Runs one forward pass on `image` (N,3,H,W) with samples in `[0, 1]`.
    ///
    /// Height and width must be multiples of [`NetworkConfig::size_multiple`].
    ///
    /// # Errors
    ///
    /// Fails if the input shape does not fit the network or the runtime runs
    /// out of resources; no partial result is returned.
    pub fn forward(&self, image: &Tensor) -> candle_core::Result<NetOutput> {
        let scales = self.encoders.len();

        let mut skips = Vec::with_capacity(scales);
        let mut x = image.clone();
        for encoder in &self.encoders {
            x = encoder.forward(&x)?;
            skips.push(x.clone());
        }

        let fused = self.fusion.forward(&skips)?;

        for (i, decoder) in self.decoders.iter().enumerate() {
            let skip = if i + 1 < scales {
                &skips[scales - 2 - i]
            } else {
                &fused
            };
            x = Tensor::cat(&[&decoder.forward(&x)?, skip], 1)?;
        }

        let mask = self.mask_head.forward(&x)?;
        let specular = self.color_head.forward(&Tensor::cat(&[&x, &mask], 1)?)?;

        let estimate = (image - mask.broadcast_mul(&specular)?)?;
        let mut diffuse = Tensor::cat(&[&x, &estimate], 1)?;
        let mut validity = mask.affine(-1.0, 1.0)?;
        for block in &self.refine {
            (diffuse, validity) = block.forward(&diffuse, &validity)?;
        }

        Ok(NetOutput {
            mask,
            specular,
            diffuse,
        })
    }
}
