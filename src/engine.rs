//! Inference wrapper: padding, device dispatch, thresholding and file handling.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use log::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{is_out_of_memory, Error, Result};
use crate::network::{NetOutput, SpecularNet};
use crate::raster;

/// Options controlling how the engine runs the network.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Run on the CUDA device instead of the CPU.
    pub use_accelerator: bool,
    /// Mask scores at or above this value mark a highlight pixel.
    pub mask_threshold: f32,
    /// Refuse padded inputs with more pixels than this.
    pub max_pixels: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            use_accelerator: false,
            mask_threshold: 0.5,
            max_pixels: None,
        }
    }
}

/// Options controlling file processing behavior.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Also write the binary mask next to the output, as `{stem}_mask.png`.
    pub save_mask: bool,
    /// Also write the specular color next to the output, as `{stem}_specular.png`.
    pub save_specular: bool,
    /// Enable verbose logging.
    pub verbose: bool,
    /// Suppress non-error output.
    pub quiet: bool,
}

/// Result of processing a single image file.
#[derive(Debug)]
pub struct ProcessResult {
    /// Path of the processed file.
    pub path: PathBuf,
    /// Whether processing succeeded.
    pub success: bool,
    /// Whether the image was too large to process.
    pub resource_exhausted: bool,
    /// Files written for this input.
    pub outputs: Vec<PathBuf>,
    /// Human-readable status message.
    pub message: String,
}

impl ProcessResult {
    fn failed(path: &Path, message: String) -> Self {
        Self {
            path: path.to_path_buf(),
            success: false,
            resource_exhausted: false,
            outputs: Vec::new(),
            message,
        }
    }
}

/// Highlight predictions for one image, all at the input's width and height.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Binary highlight mask: 255 for highlight, 0 elsewhere.
    pub mask: GrayImage,
    /// Predicted specular color.
    pub specular: RgbImage,
    /// Highlight-free reconstruction.
    pub diffuse: RgbImage,
}

/// Chooses the compute device.
///
/// # Errors
///
/// Returns an error if an accelerator is requested but none is available (or
/// the crate was built without the `cuda` feature).
pub fn select_device(use_accelerator: bool) -> Result<Device> {
    if use_accelerator {
        let device = Device::new_cuda(0)?;
        debug!("running on CUDA device 0");
        Ok(device)
    } else {
        debug!("running on CPU");
        Ok(Device::Cpu)
    }
}

/// The highlight-removal engine holding a built network.
///
/// Create once and reuse for multiple images.
pub struct SpecularEngine {
    net: SpecularNet,
    device: Device,
    options: EngineOptions,
}

impl SpecularEngine {
    /// Loads learned parameters from a safetensors file onto the selected device.
    ///
    /// # Errors
    ///
    /// Fails if the device is unavailable, the file cannot be read, or a
    /// parameter is missing or mis-shaped.
    pub fn load(weights: &Path, options: EngineOptions) -> Result<Self> {
        let device = select_device(options.use_accelerator)?;
        let tensors = candle_core::safetensors::load(weights, &device)?;
        info!("loaded {} tensors from {}", tensors.len(), weights.display());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        Self::from_var_builder(vb, &NetworkConfig::default(), options)
    }

    /// Builds the engine from any parameter source.
    ///
    /// The engine runs on the device of `vb`.
    ///
    /// # Errors
    ///
    /// Fails if `config` is inconsistent or a parameter is missing or mis-shaped.
    pub fn from_var_builder(
        vb: VarBuilder,
        config: &NetworkConfig,
        options: EngineOptions,
    ) -> Result<Self> {
        let device = vb.device().clone();
        let net = SpecularNet::new(config, vb)?;
        Ok(Self {
            net,
            device,
            options,
        })
    }

    /// The options this engine was built with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The device the network runs on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Runs the raw forward pass on a (N,3,H,W) tensor already padded to a
    /// multiple of [`NetworkConfig::size_multiple`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the runtime runs out of memory.
    pub fn predict_tensors(&self, image: &Tensor) -> Result<NetOutput> {
        let (_, _, h, w) = image.dims4()?;
        let (w, h) = (
            u32::try_from(w).unwrap_or(u32::MAX),
            u32::try_from(h).unwrap_or(u32::MAX),
        );
        self.net.forward(image).map_err(|e| classify(e, w, h))
    }

    /// Predicts the highlight mask, specular color and highlight-free image.
    ///
    /// The image is converted to RGB, reflection-padded on the bottom and right
    /// to the network's size multiple, and every output is cropped back to the
    /// original size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyImage`] for zero-sized input and
    /// [`Error::ResourceExhausted`] when the image is too large to process.
    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        if w == 0 || h == 0 {
            return Err(Error::EmptyImage {
                width: w,
                height: h,
            });
        }

        let multiple = u32::try_from(self.net.config().size_multiple())
            .map_err(|_| Error::InvalidConfig("size multiple exceeds u32".into()))?;
        let (pw, ph) = (
            raster::padded_size(w, multiple),
            raster::padded_size(h, multiple),
        );
        self.check_budget(w, h, pw, ph)?;

        let padded;
        let source = if (pw, ph) == (w, h) {
            &rgb
        } else {
            debug!("padding {w}x{h} to {pw}x{ph}");
            padded = raster::reflect_pad(&rgb, pw, ph);
            &padded
        };

        let run = || -> candle_core::Result<Prediction> {
            let input = raster::rgb_to_tensor(source, &self.device)?;
            let out = self.net.forward(&input)?;
            let mask = raster::threshold_mask(&out.mask, self.options.mask_threshold)?;
            Ok(Prediction {
                mask: raster::tensor_to_mask(&mask, w, h)?,
                specular: raster::tensor_to_rgb(&out.specular, w, h)?,
                diffuse: raster::tensor_to_rgb(&out.diffuse, w, h)?,
            })
        };
        run().map_err(|e| classify(e, w, h))
    }

    /// Returns only the highlight-free image.
    ///
    /// # Errors
    ///
    /// Same as [`SpecularEngine::predict`].
    pub fn remove_specular(&self, image: &DynamicImage) -> Result<RgbImage> {
        Ok(self.predict(image)?.diffuse)
    }

    fn check_budget(&self, w: u32, h: u32, pw: u32, ph: u32) -> Result<()> {
        let Some(max) = self.options.max_pixels else {
            return Ok(());
        };
        let pixels = u64::from(pw) * u64::from(ph);
        if pixels > max {
            return Err(Error::ResourceExhausted {
                width: w,
                height: h,
                detail: format!("padded size {pw}x{ph} exceeds the {max}-pixel budget"),
            });
        }
        Ok(())
    }

    /// Process a single image file: load, predict, save.
    ///
    /// The highlight-free image goes to `output`; mask and specular side
    /// outputs are written next to it when requested.
    #[must_use]
    pub fn process_file(
        &self,
        input: &Path,
        output: &Path,
        opts: &ProcessOptions,
    ) -> ProcessResult {
        let mut result = ProcessResult::failed(input, String::new());

        let dyn_img = match image::open(input) {
            Ok(img) => img,
            Err(e) => {
                result.message = format!("Failed to load: {e}");
                return result;
            }
        };

        let prediction = match self.predict(&dyn_img) {
            Ok(p) => p,
            Err(e) => {
                result.resource_exhausted = e.is_resource_exhausted();
                result.message = format!("Failed to predict: {e}");
                return result;
            }
        };

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    result.message = format!("Failed to create output directory: {e}");
                    return result;
                }
            }
        }

        let mut outputs = vec![(
            output.to_path_buf(),
            DynamicImage::ImageRgb8(prediction.diffuse),
        )];
        if opts.save_mask {
            outputs.push((
                side_output_path(output, "mask"),
                DynamicImage::ImageLuma8(prediction.mask),
            ));
        }
        if opts.save_specular {
            outputs.push((
                side_output_path(output, "specular"),
                DynamicImage::ImageRgb8(prediction.specular),
            ));
        }

        for (path, img) in &outputs {
            if let Err(e) = save_image(img, path) {
                result.message = format!("Failed to save {}: {e}", path.display());
                return result;
            }
            result.outputs.push(path.clone());
        }

        result.success = true;
        result.message = "Highlights removed".to_string();
        result
    }

    /// Process all supported images in a directory.
    ///
    /// Uses parallel iteration when the `cli` feature is enabled (via rayon).
    /// Returns a [`ProcessResult`] for each image found.
    #[must_use]
    pub fn process_directory(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        opts: &ProcessOptions,
    ) -> Vec<ProcessResult> {
        let entries: Vec<PathBuf> = match std::fs::read_dir(input_dir) {
            Ok(rd) => rd
                .filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
                .map(|e| e.path())
                .filter(|p| is_supported_image(p))
                .collect(),
            Err(e) => {
                return vec![ProcessResult::failed(
                    input_dir,
                    format!("Failed to read directory: {e}"),
                )];
            }
        };

        if !output_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(output_dir) {
                return vec![ProcessResult::failed(
                    output_dir,
                    format!("Failed to create output directory: {e}"),
                )];
            }
        }

        let process = |input_path: &PathBuf| {
            let output_path = match input_path.file_name() {
                Some(name) => output_dir.join(name),
                None => return ProcessResult::failed(input_path, "No file name".to_string()),
            };
            let result = self.process_file(input_path, &output_path, opts);
            if !result.success {
                warn!("{}: {}", input_path.display(), result.message);
            }
            result
        };

        #[cfg(feature = "cli")]
        {
            use rayon::prelude::*;
            entries.par_iter().map(process).collect()
        }

        #[cfg(not(feature = "cli"))]
        {
            entries.iter().map(process).collect()
        }
    }
}

fn classify(err: candle_core::Error, width: u32, height: u32) -> Error {
    if is_out_of_memory(&err) {
        Error::ResourceExhausted {
            width,
            height,
            detail: err.to_string(),
        }
    } else {
        Error::Tensor(err)
    }
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tif" | "tiff"
        ),
        None => false,
    }
}

/// Save an image with format-specific quality settings.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &DynamicImage, path: &Path) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            let file = std::fs::File::create(path)?;
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 100);
            encoder.encode_image(img)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp | ImageFormat::Tiff => {
            img.save(path)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}

/// Generate a default output path from an input path.
///
/// Example: `"photo.jpg"` becomes `"photo_diffuse.jpg"`.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let ext = input.extension().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}_diffuse.{ext}"))
}

/// Path of a PNG side output next to `output`.
///
/// Example: `("out/photo.jpg", "mask")` becomes `"out/photo_mask.png"`.
#[must_use]
pub fn side_output_path(output: &Path, suffix: &str) -> PathBuf {
    let stem = output.file_stem().unwrap_or_default().to_string_lossy();
    let parent = output.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}_{suffix}.png"))
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;
    use image::Rgb;

    use super::*;

    fn random_engine(options: EngineOptions) -> SpecularEngine {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SpecularEngine::from_var_builder(vb, &NetworkConfig::default(), options).unwrap()
    }

    fn textured(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 5 % 256) as u8, (y * 3 % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    #[test]
    fn predict_preserves_size_for_any_input() {
        let engine = random_engine(EngineOptions::default());
        for (w, h) in [(65, 33), (64, 32), (33, 65), (1, 1), (50, 70)] {
            let prediction = engine.predict(&textured(w, h)).unwrap();
            assert_eq!(prediction.mask.dimensions(), (w, h));
            assert_eq!(prediction.specular.dimensions(), (w, h));
            assert_eq!(prediction.diffuse.dimensions(), (w, h));
        }
    }

    #[test]
    fn predicted_mask_is_binary() {
        let engine = random_engine(EngineOptions::default());
        let prediction = engine.predict(&textured(40, 24)).unwrap();
        assert!(prediction.mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn grayscale_input_is_accepted() {
        let engine = random_engine(EngineOptions::default());
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 10, image::Luma([90])));
        let diffuse = engine.remove_specular(&gray).unwrap();
        assert_eq!(diffuse.dimensions(), (20, 10));
    }

    #[test]
    fn empty_image_is_rejected() {
        let engine = random_engine(EngineOptions::default());
        let err = engine.predict(&textured(0, 5)).unwrap_err();
        assert!(matches!(err, Error::EmptyImage { width: 0, height: 5 }));
    }

    #[test]
    fn pixel_budget_reports_resource_exhaustion() {
        let engine = random_engine(EngineOptions {
            max_pixels: Some(64 * 64),
            ..EngineOptions::default()
        });
        assert!(engine.predict(&textured(64, 64)).is_ok());

        let err = engine.predict(&textured(65, 64)).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(err.to_string().contains("96x64"), "{err}");
    }

    #[test]
    fn predict_tensors_returns_raw_scores() {
        let engine = random_engine(EngineOptions::default());
        let input = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let out = engine.predict_tensors(&input).unwrap();
        assert_eq!(out.mask.dims(), &[1, 1, 32, 32]);
    }

    #[test]
    fn cpu_is_selected_without_accelerator() {
        assert!(select_device(false).unwrap().is_cpu());
    }

    #[test]
    fn default_output_path_appends_diffuse_suffix() {
        let p = default_output_path(Path::new("/tmp/photo.jpg"));
        assert_eq!(p, PathBuf::from("/tmp/photo_diffuse.jpg"));

        let p = default_output_path(Path::new("image.png"));
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "image_diffuse.png"
        );
    }

    #[test]
    fn side_outputs_are_png_next_to_output() {
        let p = side_output_path(Path::new("/out/photo.jpg"), "mask");
        assert_eq!(p, PathBuf::from("/out/photo_mask.png"));
    }

    #[test]
    fn is_supported_image_accepts_common_formats() {
        assert!(is_supported_image(Path::new("photo.jpg")));
        assert!(is_supported_image(Path::new("photo.JPEG")));
        assert!(is_supported_image(Path::new("photo.png")));
        assert!(is_supported_image(Path::new("photo.webp")));
        assert!(is_supported_image(Path::new("photo.tif")));
    }

    #[test]
    fn is_supported_image_rejects_unsupported_formats() {
        assert!(!is_supported_image(Path::new("photo.gif")));
        assert!(!is_supported_image(Path::new("photo.txt")));
        assert!(!is_supported_image(Path::new("photo")));
    }

    #[test]
    fn process_file_writes_requested_outputs() {
        let dir = std::env::temp_dir().join(format!("specular-engine-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("input.png");
        textured(36, 20).save(&input).unwrap();

        let engine = random_engine(EngineOptions::default());
        let output = dir.join("nested").join("input_diffuse.png");
        let opts = ProcessOptions {
            save_mask: true,
            ..ProcessOptions::default()
        };
        let result = engine.process_file(&input, &output, &opts);
        assert!(result.success, "{}", result.message);
        assert_eq!(result.outputs.len(), 2);
        let mask = image::open(dir.join("nested").join("input_diffuse_mask.png")).unwrap();
        assert_eq!((mask.width(), mask.height()), (36, 20));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn process_file_reports_unreadable_input() {
        let engine = random_engine(EngineOptions::default());
        let result = engine.process_file(
            Path::new("/nonexistent/photo.png"),
            Path::new("/tmp/out.png"),
            &ProcessOptions::default(),
        );
        assert!(!result.success);
        assert!(!result.resource_exhausted);
        assert!(result.message.starts_with("Failed to load"));
    }
}
