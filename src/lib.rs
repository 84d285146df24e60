//! Detect and remove specular highlights with a mask-gated partial-convolution network.
//!
//! For an input color image the network predicts a highlight mask `M`, the
//! specular color `S` at those pixels, and a highlight-free reconstruction `D`.
//! A multi-scale encoder-decoder produces shared features; the reconstruction
//! inpaints the highlight region of `I - M * S` with a cascade of partial
//! convolutions that track which pixels are known.
//!
//! # Quick Start
//!
//! ```no_run
//! use specular_removal::{EngineOptions, SpecularEngine};
//!
//! let engine = SpecularEngine::load("weights.safetensors".as_ref(), EngineOptions::default())
//!     .expect("failed to load weights");
//! let img = image::open("photo.jpg").unwrap();
//! let prediction = engine.predict(&img).unwrap();
//! prediction.diffuse.save("cleaned.png").unwrap();
//! prediction.mask.save("mask.png").unwrap();
//! ```
//!
//! # Oversized inputs
//!
//! Inputs that exhaust memory surface as [`Error::ResourceExhausted`]; the
//! caller decides whether to abort or retry with a smaller image.
//!
//! ```no_run
//! use specular_removal::{EngineOptions, SpecularEngine};
//!
//! let opts = EngineOptions { max_pixels: Some(4096 * 4096), ..EngineOptions::default() };
//! let engine = SpecularEngine::load("weights.safetensors".as_ref(), opts).unwrap();
//! let img = image::open("huge.png").unwrap();
//! match engine.remove_specular(&img) {
//!     Ok(clean) => clean.save("clean.png").unwrap(),
//!     Err(e) if e.is_resource_exhausted() => eprintln!("{e}"),
//!     Err(e) => panic!("{e}"),
//! }
//! ```

#![deny(missing_docs)]

pub mod blocks;
pub mod config;
mod engine;
pub mod error;
pub mod fusion;
pub mod network;
pub mod partial_conv;
pub mod raster;

pub use config::NetworkConfig;
pub use engine::{
    default_output_path, is_supported_image, save_image, select_device, side_output_path,
    EngineOptions, Prediction, ProcessOptions, ProcessResult, SpecularEngine,
};
pub use error::{Error, Result};
pub use network::{NetOutput, SpecularNet};
