//! Remove specular highlights from a single image.
//!
//! Usage:
//! ```sh
//! cargo run --example remove_specular -- weights.safetensors input.jpg output.png
//! ```

use std::env;
use std::process;

use specular_removal::{EngineOptions, SpecularEngine};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: {} <weights> <input> <output>", args[0]);
        process::exit(1);
    }

    let engine = SpecularEngine::load(args[1].as_ref(), EngineOptions::default())
        .expect("failed to initialize engine");
    let image = image::open(&args[2]).expect("failed to open input");

    match engine.predict(&image) {
        Ok(prediction) => {
            let highlighted = prediction.mask.pixels().filter(|p| p[0] > 0).count();
            println!(
                "{highlighted} highlight pixels of {}",
                prediction.mask.width() * prediction.mask.height()
            );
            prediction.diffuse.save(&args[3]).expect("failed to save output");
        }
        Err(e) if e.is_resource_exhausted() => {
            eprintln!("{e}");
            process::exit(2);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
