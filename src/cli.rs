use std::path::PathBuf;

use clap::{Args, Parser};

use crate::error::ConfigError;
use crate::trainer::{EarlyStoppingConfig, PretrainConfig};

/// Pretrains a stacked denoising autoencoder on MNIST, then fine-tunes it
/// with early stopping.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "mnist-sda")]
#[command(version)]
pub struct Cli {
    /// Gzipped pickle of the three splits (mnist.pkl.gz) or an MNIST IDX directory
    #[arg(value_name = "DATASET")]
    pub dataset: PathBuf,

    #[command(flatten)]
    pub train: TrainArgs,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// Learning rate of the supervised fine-tuning steps
    #[arg(long, default_value_t = 0.1)]
    pub finetune_lr: f64,

    /// Learning rate of the denoising steps
    #[arg(long, default_value_t = 0.001)]
    pub pretrain_lr: f64,

    #[arg(long, default_value_t = 15)]
    pub pretraining_epochs: usize,

    /// Upper bound on fine-tuning epochs
    #[arg(long, default_value_t = 15)]
    pub training_epochs: usize,

    #[arg(long, default_value_t = 20)]
    pub batch_size: usize,

    /// Hidden layer sizes, lowest first
    #[arg(long, value_delimiter = ',', default_values_t = [1000, 1000, 1000])]
    pub hidden_layers: Vec<usize>,

    /// Input corruption probability of each layer's autoencoder
    #[arg(long, value_delimiter = ',', default_values_t = [0.1, 0.2, 0.3])]
    pub corruption_levels: Vec<f32>,

    /// Number of output classes
    #[arg(long, default_value_t = 10)]
    pub n_outs: usize,

    /// Seed for weight initialization and corruption masks
    #[arg(long, default_value_t = 89677)]
    pub seed: u64,

    /// Minibatch iterations to look at regardless of progress
    #[arg(long, default_value_t = 10000)]
    pub patience: usize,

    #[arg(long, default_value_t = 2)]
    pub patience_increase: usize,

    /// Relative validation improvement that extends patience
    #[arg(long, default_value_t = 0.995)]
    pub improvement_threshold: f64,

    /// Iterations between validation checkpoints [default: min(train batches, patience / 2)]
    #[arg(long)]
    pub validation_frequency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub finetune_lr: f64,
    pub pretrain_lr: f64,
    pub pretraining_epochs: usize,
    pub training_epochs: usize,
    pub batch_size: usize,
    pub hidden_layers: Vec<usize>,
    pub corruption_levels: Vec<f32>,
    pub n_outs: usize,
    pub seed: u64,
    pub patience: usize,
    pub patience_increase: usize,
    pub improvement_threshold: f64,
    pub validation_frequency: Option<usize>,
}

impl From<TrainArgs> for TrainConfig {
    fn from(args: TrainArgs) -> Self {
        TrainConfig {
            finetune_lr: args.finetune_lr,
            pretrain_lr: args.pretrain_lr,
            pretraining_epochs: args.pretraining_epochs,
            training_epochs: args.training_epochs,
            batch_size: args.batch_size,
            hidden_layers: args.hidden_layers,
            corruption_levels: args.corruption_levels,
            n_outs: args.n_outs,
            seed: args.seed,
            patience: args.patience,
            patience_increase: args.patience_increase,
            improvement_threshold: args.improvement_threshold,
            validation_frequency: args.validation_frequency,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden_layers.is_empty() {
            return Err(ConfigError::NoHiddenLayers);
        }
        if self.corruption_levels.len() != self.hidden_layers.len() {
            return Err(ConfigError::CorruptionLevelCount {
                layers: self.hidden_layers.len(),
                levels: self.corruption_levels.len(),
            });
        }
        let levels = &self.corruption_levels;
        if let Some(&level) = levels.iter().find(|l| !(0. ..1.).contains(*l)) {
            return Err(ConfigError::CorruptionLevelRange(level));
        }
        let counts = [
            ("batch-size", self.batch_size),
            ("n-outs", self.n_outs),
            ("patience", self.patience),
            ("validation-frequency", self.validation_frequency.unwrap_or(1)),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, n)| *n == 0) {
            return Err(ConfigError::NotPositive(*name));
        }
        if self.hidden_layers.contains(&0) {
            return Err(ConfigError::NotPositive("hidden layer size"));
        }
        let rates = [
            ("finetune-lr", self.finetune_lr),
            ("pretrain-lr", self.pretrain_lr),
        ];
        if let Some((name, _)) = rates.iter().find(|(_, r)| !(*r > 0.)) {
            return Err(ConfigError::NotPositive(*name));
        }
        Ok(())
    }

    pub fn pretrain(&self) -> PretrainConfig {
        PretrainConfig {
            epochs: self.pretraining_epochs,
            learning_rate: self.pretrain_lr,
            corruption_levels: self
                .corruption_levels
                .iter()
                .map(|&l| f64::from(l))
                .collect(),
        }
    }

    pub fn early_stopping(&self) -> EarlyStoppingConfig {
        EarlyStoppingConfig {
            max_epochs: self.training_epochs,
            patience: self.patience,
            patience_increase: self.patience_increase,
            improvement_threshold: self.improvement_threshold,
            validation_frequency: self.validation_frequency,
        }
    }
}
