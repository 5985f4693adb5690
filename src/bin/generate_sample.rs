use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mnist_prep::data::model::{MnistArchive, RawSplit, IMAGE_FEATURES, NUM_CLASSES};
use mnist_prep::save_json_gz;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Write a small synthetic archive in the `.json.gz` format.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Output path
    #[arg(short, long, default_value = "data/sample.json.gz")]
    output: PathBuf,

    /// Training samples; validation and test get a fifth each
    #[arg(short, long, default_value_t = 500)]
    samples: usize,

    /// Seed for the pixel and label generator
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// A blurry vertical stroke whose position depends on the digit, plus noise,
/// so classes are separable but not trivial.
fn generate_split(n: usize, rng: &mut StdRng) -> RawSplit {
    let labels: Vec<i64> = (0..n).map(|_| rng.gen_range(0..NUM_CLASSES as i64)).collect();

    let mut images = Array2::<f64>::zeros((n, IMAGE_FEATURES));
    for (mut row, &label) in images.outer_iter_mut().zip(&labels) {
        let stroke = 4.0 + 2.0 * label as f64;
        for (pixel, value) in row.iter_mut().enumerate() {
            let col = (pixel % 28) as f64;
            let signal = (-(col - stroke).powi(2) / 4.0).exp();
            let noise: f64 = rng.gen_range(0.0..0.2);
            *value = (signal + noise).min(1.0);
        }
    }

    RawSplit { images, labels }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let held_out = (args.samples / 5).max(1);
    let archive = MnistArchive {
        training: generate_split(args.samples, &mut rng),
        validation: generate_split(held_out, &mut rng),
        test: generate_split(held_out, &mut rng),
    };

    if let Some(dir) = args.output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    save_json_gz(&archive, &args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    println!(
        "Wrote {} / {} / {} samples to {}",
        archive.training.len(),
        archive.validation.len(),
        archive.test.len(),
        args.output.display()
    );
    Ok(())
}
