use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use semantic_cyclegan::data::UnalignedDataset;
use semantic_cyclegan::{create_model, ModelKind, TrainConfig};

#[derive(Parser, Debug)]
#[command(name = "semantic-cyclegan")]
#[command(about = "Train mask-aware CycleGAN models")]
struct Args {
    /// JSON training options; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dataset root holding trainA, trainB and their _label folders.
    #[arg(long)]
    dataroot: PathBuf,

    #[arg(long, value_enum, default_value = "semantic-sty2")]
    model: ModelKind,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    #[arg(long, default_value = "checkpoints")]
    checkpoints_dir: PathBuf,

    /// Log losses every this many iterations.
    #[arg(long, default_value_t = 100)]
    print_freq: usize,

    #[arg(long, default_value_t = 5)]
    save_epoch_freq: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    info!("options: {}", serde_json::to_string(&config)?);

    let dataset = UnalignedDataset::open(&args.dataroot, "train", config.crop_size)
        .context("opening training set")?;
    let mut model = create_model(args.model, &config)?;
    info!("training {} on {} images per epoch", model.name(), dataset.len());

    let mut total_iters = 0;
    for epoch in 1..=args.epochs {
        let epoch_start = Instant::now();
        for batch in dataset.batches(config.batch_size as usize, true) {
            model.set_input(batch?)?;
            model.optimize_parameters()?;
            total_iters += 1;

            if total_iters % args.print_freq.max(1) == 0 {
                let losses = model
                    .current_losses()
                    .iter()
                    .map(|(name, value)| format!("{}: {:.3}", name, value))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("(epoch: {}, iters: {}) {}", epoch, total_iters, losses);
            }
        }

        model.save_networks(&args.checkpoints_dir, "latest")?;
        if epoch % args.save_epoch_freq.max(1) == 0 {
            let written = model.save_networks(&args.checkpoints_dir, &epoch.to_string())?;
            info!("saved {} networks at the end of epoch {}", written.len(), epoch);
        }
        info!(
            "end of epoch {} / {} \t time taken: {:.1} s",
            epoch,
            args.epochs,
            epoch_start.elapsed().as_secs_f64()
        );
    }
    Ok(())
}
