use anyhow::Context;
use burn::{backend::{ndarray::NdArrayDevice, wgpu::{AutoGraphicsApi, WgpuDevice}, NdArray, Wgpu}, data::dataset::Dataset, tensor::backend::Backend};
use clap::{Parser, Subcommand};
use log::info;

use crate::{data::{CompatibilityDataset, IMAGE_SIZE}, evaluation::CompatibilityConfig, model::FullBiLstmConfig};

mod data;
mod error;
mod evaluation;
mod inference;
mod model;
mod score;

type AcceleratedBackend = Wgpu<AutoGraphicsApi, f32, i32>;
type CpuBackend = NdArray<f32>;

const ARTIFACT_DIR: &str = "./bilstm/model";
const IMAGE_DIR: &str = "./bilstm/data/images";
const LABELS: &str = "./bilstm/data/label/fashion_compatibility_prediction.txt";

#[derive(Parser)]
#[command(about = "Outfit compatibility scoring with a CNN + bidirectional LSTM")]
struct Args {
    /// Run on the CPU backend instead of the GPU.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config and an untrained model to the artifact directory.
    Init {
        #[arg(long, default_value = ARTIFACT_DIR)]
        artifact_dir: String,
        #[arg(long, default_value_t = IMAGE_SIZE)]
        image_size: usize,
    },
    /// Print the compatibility loss of one outfit.
    Score {
        #[arg(long, default_value = ARTIFACT_DIR)]
        artifact_dir: String,
        #[arg(long, default_value = IMAGE_DIR)]
        image_dir: String,
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Score a labelled compatibility file and report the summary.
    Evaluate {
        #[arg(long, default_value = ARTIFACT_DIR)]
        artifact_dir: String,
        #[arg(long, default_value = IMAGE_DIR)]
        image_dir: String,
        #[arg(long, default_value = LABELS)]
        labels: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn run<B: Backend>(command: Command, device: B::Device) -> anyhow::Result<()> {
    match command {
        Command::Init { artifact_dir, image_size } => {
            let config = CompatibilityConfig::new(FullBiLstmConfig::new()).with_image_size(image_size);
            inference::init_artifacts::<B>(&artifact_dir, &config, &device)
                .with_context(|| format!("initialising {artifact_dir}"))?;
        }
        Command::Score { artifact_dir, image_dir, items } => {
            let evaluator = inference::load_evaluator::<B>(&artifact_dir, &image_dir, device)?;
            let score = evaluator
                .compatibility(items.as_slice())
                .context("scoring outfit")?;
            println!("{score}");
        }
        Command::Evaluate { artifact_dir, image_dir, labels, limit } => {
            let evaluator = inference::load_evaluator::<B>(&artifact_dir, &image_dir, device)?;
            let dataset = CompatibilityDataset::from_file(&labels)
                .with_context(|| format!("reading {labels}"))?;
            info!("loaded {} outfits from {labels}", dataset.len());

            let summary = inference::evaluate(&evaluator, &dataset, limit)?;
            println!("{summary}");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.cpu {
        run::<CpuBackend>(args.command, NdArrayDevice::Cpu)
    } else {
        run::<AcceleratedBackend>(args.command, WgpuDevice::BestAvailable)
    }
}
