mod cli;
mod error;
mod mnist_loader;
mod network;
mod pickle;
mod reporter;
mod trainer;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, TrainConfig};
use network::{Sda, SdaSteps};
use reporter::ConsoleReporter;
use trainer::BatchCounts;

/// Element type of every dataset and parameter matrix.
pub type Float = f32;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mnist_sda=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TrainConfig::from(cli.train);
    config.validate().context("invalid training configuration")?;

    let data = mnist_loader::load_data(&cli.dataset)
        .with_context(|| format!("failed to load dataset from {}", cli.dataset.display()))?;

    let batches = BatchCounts {
        train: data.train.n_batches(config.batch_size),
        valid: data.valid.n_batches(config.batch_size),
        test: data.test.n_batches(config.batch_size),
    };
    let n_ins = data.train.n_features();
    info!(n_ins, hidden = ?config.hidden_layers, n_outs = config.n_outs, "building the model");
    let mut sda = Sda::new(config.seed, n_ins, &config.hidden_layers, config.n_outs);
    let finetune_lr = config.finetune_lr as Float;
    let mut steps = SdaSteps::new(&mut sda, &data, config.batch_size, finetune_lr);
    let mut reporter = ConsoleReporter;

    info!(n_train_batches = batches.train, "pre-training the model");
    let pretrain = config.pretrain();
    let pretrained = trainer::pretrain_layers(&mut steps, &pretrain, batches.train, &mut reporter)
        .context("pre-training failed")?;
    let final_costs: Vec<f64> = pretrained
        .epoch_costs
        .iter()
        .filter_map(|costs| costs.last().copied())
        .collect();
    info!(?final_costs, elapsed = ?pretrained.elapsed, "pre-training finished");

    info!(?batches, "fine-tuning the model");
    let early_stopping = config.early_stopping();
    let report = trainer::fine_tune(&mut steps, &early_stopping, batches, &mut reporter)
        .context("fine-tuning failed")?;
    info!(
        best_iter = report.best_iter + 1,
        stopped_early = report.stopped_early,
        patience = report.patience,
        "training finished"
    );
    Ok(())
}
