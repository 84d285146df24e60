use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use log::LevelFilter;

use specular_removal::{
    default_output_path, EngineOptions, ProcessOptions, ProcessResult, SpecularEngine,
};

/// Exit status when an image is too large to process.
const EXIT_RESOURCE_EXHAUSTED: i32 = 2;

#[derive(Parser)]
#[command(
    name = "specular-removal",
    about = "Detect and remove specular highlights from photos",
    version,
    after_help = "Simple usage: specular-removal <image> -w weights.safetensors\n\n\
                  Writes {name}_diffuse.{ext} next to the input unless -o is given."
)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Input image file or directory
    input: String,

    /// Network weights (safetensors)
    #[arg(short, long)]
    weights: PathBuf,

    /// Output file or directory (default: {name}_diffuse.{ext})
    #[arg(short, long)]
    output: Option<String>,

    /// Run on the CUDA device instead of the CPU
    #[arg(long)]
    gpu: bool,

    /// Mask score threshold (0.0-1.0)
    #[arg(short, long, default_value = "0.5")]
    threshold: f32,

    /// Refuse images whose padded size exceeds this many pixels
    #[arg(long)]
    max_pixels: Option<u64>,

    /// Also write the binary highlight mask as {name}_mask.png
    #[arg(long)]
    save_mask: bool,

    /// Also write the specular color as {name}_specular.png
    #[arg(long)]
    save_specular: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(cli: &Cli) {
    let default_filter = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if !(0.0..=1.0).contains(&cli.threshold) {
        eprintln!("Error: Threshold must be between 0.0 and 1.0");
        process::exit(1);
    }

    let engine_opts = EngineOptions {
        use_accelerator: cli.gpu,
        mask_threshold: cli.threshold,
        max_pixels: cli.max_pixels,
    };
    let opts = ProcessOptions {
        save_mask: cli.save_mask,
        save_specular: cli.save_specular,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    let input_path = Path::new(&cli.input);
    if !input_path.exists() {
        eprintln!("Error: Input path does not exist: {}", cli.input);
        process::exit(1);
    }

    let engine = match SpecularEngine::load(&cli.weights, engine_opts) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Fatal: Failed to initialize engine: {e}");
            process::exit(1);
        }
    };

    if !opts.quiet {
        eprintln!(
            "Running on {} (mask threshold: {:.2})",
            if cli.gpu { "GPU" } else { "CPU" },
            cli.threshold
        );
        eprintln!();
    }

    let results = if input_path.is_dir() {
        let output_dir = if let Some(o) = &cli.output {
            PathBuf::from(o)
        } else {
            eprintln!("Error: Output directory is required for batch processing");
            eprintln!("Usage: specular-removal <input_dir> -w <weights> -o <output_dir>");
            process::exit(1);
        };
        engine.process_directory(input_path, &output_dir, &opts)
    } else {
        let output_path = match &cli.output {
            Some(o) => PathBuf::from(o),
            None => default_output_path(input_path),
        };
        vec![engine.process_file(input_path, &output_path, &opts)]
    };

    let mut success_count = 0u32;
    let mut fail_count = 0u32;
    let mut exhausted_count = 0u32;

    for r in &results {
        print_result(r, &opts);
        if r.success {
            success_count += 1;
        } else {
            fail_count += 1;
            if r.resource_exhausted {
                exhausted_count += 1;
            }
        }
    }

    if results.len() > 1 && !opts.quiet {
        eprintln!();
        eprint!("[Summary] Processed: {success_count}");
        if fail_count > 0 {
            eprint!(", Failed: {fail_count}");
        }
        eprintln!(" (Total: {})", results.len());
    }

    if exhausted_count > 0 {
        eprintln!("Image too large: shrink it and try again.");
        process::exit(EXIT_RESOURCE_EXHAUSTED);
    }
    if fail_count > 0 {
        process::exit(1);
    }
}

fn print_result(result: &ProcessResult, opts: &ProcessOptions) {
    if opts.quiet && result.success {
        return;
    }

    let filename = result.path.file_name().map_or_else(
        || result.path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    );

    if result.success {
        if !opts.quiet {
            eprintln!("[OK] {filename}");
        }
    } else {
        eprintln!("[FAIL] {filename}: {}", result.message);
    }

    if opts.verbose {
        for output in &result.outputs {
            eprintln!("  -> {}", output.display());
        }
    }
}
