use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::{DynamicImage, Rgb, RgbImage};
use specular_removal::{EngineOptions, NetworkConfig, SpecularEngine, SpecularNet};

/// Hand-set parameters for the default network.
///
/// Starts from a neutral network: every convolution is zero and every batch
/// norm is the identity.
struct Weights {
    shapes: HashMap<String, Vec<usize>>,
    values: HashMap<String, Vec<f32>>,
}

impl Weights {
    fn neutral() -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SpecularNet::new(&NetworkConfig::default(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let mut shapes = HashMap::new();
        let mut values = HashMap::new();
        for (name, var) in data.iter() {
            let dims = var.dims().to_vec();
            let len = dims.iter().product();
            let is_unit = dims.len() == 1
                && (name.ends_with("running_var")
                    || name.ends_with(".1.weight")
                    || name.ends_with("bn.weight"));
            values.insert(name.clone(), vec![if is_unit { 1.0 } else { 0.0 }; len]);
            shapes.insert(name.clone(), dims);
        }
        Self { shapes, values }
    }

    fn set(&mut self, name: &str, index: &[usize], value: f32) {
        let dims = &self.shapes[name];
        assert_eq!(dims.len(), index.len(), "{name}");
        let mut flat = 0;
        for (i, d) in index.iter().zip(dims) {
            assert!(i < d, "{name}: index out of range");
            flat = flat * d + i;
        }
        self.values.get_mut(name).unwrap()[flat] = value;
    }

    fn engine(self) -> SpecularEngine {
        let tensors = self
            .values
            .into_iter()
            .map(|(name, v)| {
                let t = Tensor::from_vec(v, self.shapes[&name].clone(), &Device::Cpu).unwrap();
                (name, t)
            })
            .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        SpecularEngine::from_var_builder(vb, &NetworkConfig::default(), EngineOptions::default())
            .unwrap()
    }
}

/// Mask head that never fires; refinement cascade that copies `I - M * S`
/// through the center tap and undoes the count renormalization.
fn pass_through_weights() -> Weights {
    let mut w = Weights::neutral();
    w.set("M_conv.2.features.0.bias", &[0], -10.0);
    for c in 0..3 {
        w.set("D_conv1.conv_I.weight", &[c, 16 + c, 2, 2], 1.0);
        w.set("D_conv2.conv_I.weight", &[c, c, 2, 2], 1.0);
        w.set("D_conv3.conv_I.weight", &[c, c, 2, 2], 1.0);
        for block in 1..=3 {
            w.set(&format!("D_conv{block}.bn.weight"), &[c], 25.0);
        }
    }
    w
}

/// Mask head that fires on bright pixels: mean intensity is routed from the
/// first encoder through the finest fusion projection into the mask head.
fn brightness_weights() -> Weights {
    let mut w = Weights::neutral();
    for c in 0..3 {
        w.set("encoder1.features.0.weight", &[0, c, 1, 1], 1.0 / 3.0);
    }
    // Channel 12 of the last fusion input is the first encoder's channel 0.
    w.set("cdff.conv1.weight", &[0, 12, 0, 0], 1.0);
    // Channel 1 of the decoder output is the first fused channel.
    w.set("M_conv.0.features.0.weight", &[0, 1, 1, 1], 1.0);
    w.set("M_conv.1.features.0.weight", &[0, 0, 1, 1], 1.0);
    w.set("M_conv.2.features.0.weight", &[0, 0, 1, 1], 20.0);
    w.set("M_conv.2.features.0.bias", &[0], -18.0);
    w
}

fn gray(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

fn with_white_patch(mut image: RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> RgbImage {
    for y in ys {
        for x in xs.clone() {
            image.put_pixel(x, y, Rgb([255, 255, 255]));
        }
    }
    image
}

#[test]
fn uniform_gray_image_has_no_highlight_and_is_reconstructed() {
    let engine = pass_through_weights().engine();
    let image = gray(70, 50);
    let prediction = engine.predict(&DynamicImage::ImageRgb8(image.clone())).unwrap();

    assert_eq!(prediction.mask.dimensions(), (70, 50));
    assert!(prediction.mask.pixels().all(|p| p[0] == 0));

    // Zero padding of the 5x5 partial convolutions only disturbs the first six
    // rows and columns; the bottom and right edges sit inside the padded input.
    for y in 6..50 {
        for x in 6..70 {
            assert_eq!(
                prediction.diffuse.get_pixel(x, y),
                image.get_pixel(x, y),
                "pixel ({x},{y})"
            );
        }
    }
}

#[test]
fn saturated_region_is_masked() {
    let engine = brightness_weights().engine();
    let image = with_white_patch(gray(70, 50), 20..40, 16..32);
    let mask = engine.predict(&DynamicImage::ImageRgb8(image)).unwrap().mask;

    for y in 18..30 {
        for x in 22..38 {
            assert_eq!(mask.get_pixel(x, y)[0], 255, "inside ({x},{y})");
        }
    }
    for (x, y, px) in mask.enumerate_pixels() {
        let far = !(14..46).contains(&x) || !(10..38).contains(&y);
        if far {
            assert_eq!(px[0], 0, "outside ({x},{y})");
        }
    }
}

#[test]
fn outputs_match_input_size_around_multiples_of_32() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let engine =
        SpecularEngine::from_var_builder(vb, &NetworkConfig::default(), EngineOptions::default())
            .unwrap();

    for (w, h) in [(32, 32), (33, 32), (65, 33), (96, 64), (97, 1)] {
        let prediction = engine.predict(&DynamicImage::ImageRgb8(gray(w, h))).unwrap();
        assert_eq!(prediction.mask.dimensions(), (w, h));
        assert_eq!(prediction.specular.dimensions(), (w, h));
        assert_eq!(prediction.diffuse.dimensions(), (w, h));
        assert!(prediction.mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }
}

#[test]
fn raw_mask_scores_lie_in_unit_interval() {
    let engine = brightness_weights().engine();
    let image = with_white_patch(gray(64, 32), 8..24, 8..24);
    let tensor = specular_removal::raster::rgb_to_tensor(&image, &Device::Cpu).unwrap();
    let out = engine.predict_tensors(&tensor).unwrap();
    let scores = out.mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(scores.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(scores.iter().any(|v| *v > 0.5));
    assert!(scores.iter().any(|v| *v < 0.5));
}

/// Runs against trained weights: `SPECULAR_WEIGHTS=path cargo test -- --ignored`.
#[test]
#[ignore = "needs trained weights in SPECULAR_WEIGHTS"]
fn trained_network_separates_highlight_from_flat_gray() {
    let path = std::env::var("SPECULAR_WEIGHTS").expect("SPECULAR_WEIGHTS not set");
    let engine = SpecularEngine::load(path.as_ref(), EngineOptions::default()).unwrap();

    let flat = engine
        .predict(&DynamicImage::ImageRgb8(gray(70, 50)))
        .unwrap();
    let flagged = flat.mask.pixels().filter(|p| p[0] > 0).count();
    assert!(flagged * 20 < 70 * 50, "{flagged} pixels flagged on flat gray");

    let image = with_white_patch(gray(70, 50), 20..40, 16..32);
    let mask = engine.predict(&DynamicImage::ImageRgb8(image)).unwrap().mask;
    let covered = (16..32)
        .flat_map(|y| (20..40).map(move |x| (x, y)))
        .filter(|&(x, y)| mask.get_pixel(x, y)[0] > 0)
        .count();
    assert!(covered * 2 > 20 * 16, "only {covered} patch pixels flagged");
}
