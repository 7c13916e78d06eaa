use std::time::{Duration, Instant};

use crate::error::TrainError;
use crate::reporter::TrainingObserver;

// each step addresses a minibatch by index and returns its cost
pub trait PretrainStep {
    fn n_layers(&self) -> usize;

    fn pretrain_step(
        &mut self,
        layer: usize,
        index: usize,
        corruption: f64,
        lr: f64,
    ) -> Result<f64, TrainError>;
}

pub trait TrainStep {
    fn train_step(&mut self, index: usize) -> Result<f64, TrainError>;
}

pub trait ValidateStep {
    fn validate_step(&self, index: usize) -> Result<f64, TrainError>;
}

pub trait TestStep {
    fn test_step(&self, index: usize) -> Result<f64, TrainError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PretrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    // one per layer
    pub corruption_levels: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PretrainReport {
    /// `epoch_costs[layer][epoch]` is the mean minibatch cost of that epoch.
    pub epoch_costs: Vec<Vec<f64>>,
    pub elapsed: Duration,
}

/// Pretrains every layer in turn, lowest first, for `config.epochs` passes
/// over the training minibatches in index order.
pub fn pretrain_layers<M, O>(
    model: &mut M,
    config: &PretrainConfig,
    n_train_batches: usize,
    observer: &mut O,
) -> Result<PretrainReport, TrainError>
where
    M: PretrainStep + ?Sized,
    O: TrainingObserver + ?Sized,
{
    let n_layers = model.n_layers();
    if config.corruption_levels.len() != n_layers {
        return Err(TrainError::CorruptionLevels {
            layers: n_layers,
            levels: config.corruption_levels.len(),
        });
    }
    if n_train_batches == 0 {
        return Err(TrainError::EmptySplit("train"));
    }

    let start_time = Instant::now();
    let mut epoch_costs = Vec::with_capacity(n_layers);
    for (layer, &corruption) in config.corruption_levels.iter().enumerate() {
        tracing::debug!(layer, corruption, "pre-training layer");
        let mut layer_costs = Vec::with_capacity(config.epochs);
        for epoch in 0..config.epochs {
            let mut c = Vec::with_capacity(n_train_batches);
            for batch_index in 0..n_train_batches {
                let cost =
                    model.pretrain_step(layer, batch_index, corruption, config.learning_rate)?;
                c.push(cost);
            }
            let cost = mean(&c);
            observer.on_pretrain_epoch(layer, epoch, cost);
            layer_costs.push(cost);
        }
        epoch_costs.push(layer_costs);
    }

    let elapsed = start_time.elapsed();
    observer.on_pretrain_complete(elapsed);
    Ok(PretrainReport { epoch_costs, elapsed })
}

#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStoppingConfig {
    pub max_epochs: usize,
    pub patience: usize,
    pub patience_increase: usize,
    pub improvement_threshold: f64,
    // min(n_train_batches, patience / 2) when unset
    pub validation_frequency: Option<usize>,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        EarlyStoppingConfig {
            max_epochs: 15,
            patience: 10000,
            patience_increase: 2,
            improvement_threshold: 0.995,
            validation_frequency: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCounts {
    pub train: usize,
    pub valid: usize,
    pub test: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    NoImprovement,
    NewBest { patience_extended: bool },
}

/// Where in training a checkpoint happened; `minibatch` counts from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPosition {
    pub epoch: usize,
    pub minibatch: usize,
    pub n_train_batches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    pub epoch: usize,
    pub iter: usize,
    pub best_validation_loss: f64,
    pub best_iter: usize,
    pub test_score: f64,
    pub patience: usize,
    pub validation_frequency: usize,
    pub state: LoopState,
    patience_increase: usize,
    improvement_threshold: f64,
}

impl TrainingProgress {
    pub fn new(config: &EarlyStoppingConfig, n_train_batches: usize) -> Self {
        let validation_frequency = config
            .validation_frequency
            .unwrap_or_else(|| n_train_batches.min(config.patience / 2))
            .max(1);
        TrainingProgress {
            epoch: 0,
            iter: 0,
            best_validation_loss: f64::INFINITY,
            best_iter: 0,
            test_score: 0.,
            patience: config.patience,
            validation_frequency,
            state: LoopState::Running,
            patience_increase: config.patience_increase,
            improvement_threshold: config.improvement_threshold,
        }
    }

    pub fn should_continue(&self, max_epochs: usize) -> bool {
        self.state == LoopState::Running && self.epoch < max_epochs
    }

    pub fn is_checkpoint(&self, iter: usize) -> bool {
        (iter + 1) % self.validation_frequency == 0
    }

    /// A new best leaves `test_score` stale until [`Self::record_test_score`].
    pub fn record_checkpoint(&mut self, iter: usize, validation_loss: f64) -> Checkpoint {
        if !(validation_loss < self.best_validation_loss) {
            return Checkpoint::NoImprovement;
        }

        let mut patience_extended = false;
        if validation_loss < self.best_validation_loss * self.improvement_threshold {
            let extended = iter.saturating_mul(self.patience_increase);
            if extended > self.patience {
                tracing::debug!(
                    iter,
                    from = self.patience,
                    to = extended,
                    "patience extended"
                );
                self.patience = extended;
                patience_extended = true;
            }
        }

        self.best_validation_loss = validation_loss;
        self.best_iter = iter;
        Checkpoint::NewBest { patience_extended }
    }

    pub fn record_test_score(&mut self, test_score: f64) {
        self.test_score = test_score;
    }

    pub fn finish_epoch(&mut self) -> LoopState {
        if self.patience <= self.iter {
            self.state = LoopState::Stopped;
        }
        self.state
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FineTuneReport {
    pub best_validation_loss: f64,
    pub test_score: f64,
    pub best_iter: usize,
    pub epochs: usize,
    pub elapsed: Duration,
    pub stopped_early: bool,
    pub patience: usize,
}

impl FineTuneReport {
    fn new(progress: TrainingProgress, elapsed: Duration) -> Self {
        FineTuneReport {
            best_validation_loss: progress.best_validation_loss,
            test_score: progress.test_score,
            best_iter: progress.best_iter,
            epochs: progress.epoch,
            elapsed,
            stopped_early: progress.state == LoopState::Stopped,
            patience: progress.patience,
        }
    }

    pub fn epochs_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0. {
            self.epochs as f64 / secs
        } else {
            f64::INFINITY
        }
    }
}

/// Supervised training with early stopping. Runs until patience is exhausted
/// at the end of an epoch or `config.max_epochs` epochs have completed.
pub fn fine_tune<M, O>(
    model: &mut M,
    config: &EarlyStoppingConfig,
    batches: BatchCounts,
    observer: &mut O,
) -> Result<FineTuneReport, TrainError>
where
    M: TrainStep + ValidateStep + TestStep + ?Sized,
    O: TrainingObserver + ?Sized,
{
    if batches.train == 0 {
        return Err(TrainError::EmptySplit("train"));
    }
    if batches.valid == 0 {
        return Err(TrainError::EmptySplit("valid"));
    }
    if batches.test == 0 {
        return Err(TrainError::EmptySplit("test"));
    }

    let mut progress = TrainingProgress::new(config, batches.train);
    tracing::debug!(
        patience = progress.patience,
        validation_frequency = progress.validation_frequency,
        "starting fine-tuning"
    );

    let start_time = Instant::now();
    while progress.should_continue(config.max_epochs) {
        progress = run_epoch(model, progress, batches, observer)?;
    }
    let report = FineTuneReport::new(progress, start_time.elapsed());
    observer.on_training_complete(&report);
    Ok(report)
}

fn run_epoch<M, O>(
    model: &mut M,
    mut progress: TrainingProgress,
    batches: BatchCounts,
    observer: &mut O,
) -> Result<TrainingProgress, TrainError>
where
    M: TrainStep + ValidateStep + TestStep + ?Sized,
    O: TrainingObserver + ?Sized,
{
    progress.epoch += 1;
    for minibatch_index in 0..batches.train {
        let minibatch_avg_cost = model.train_step(minibatch_index)?;
        let iter = (progress.epoch - 1) * batches.train + minibatch_index;
        progress.iter = iter;
        tracing::trace!(iter, cost = minibatch_avg_cost, "trained minibatch");

        if !progress.is_checkpoint(iter) {
            continue;
        }

        let at = CheckpointPosition {
            epoch: progress.epoch,
            minibatch: minibatch_index + 1,
            n_train_batches: batches.train,
        };
        let this_validation_loss = mean_loss(batches.valid, |i| model.validate_step(i))?;
        observer.on_validation(&at, this_validation_loss);

        let checkpoint = progress.record_checkpoint(iter, this_validation_loss);
        if let Checkpoint::NewBest { patience_extended } = checkpoint {
            tracing::debug!(
                iter,
                patience_extended,
                patience = progress.patience,
                "new best validation loss"
            );
            let test_score = mean_loss(batches.test, |i| model.test_step(i))?;
            progress.record_test_score(test_score);
            observer.on_new_best(&at, test_score);
        }
    }
    if progress.finish_epoch() == LoopState::Stopped {
        tracing::info!(
            epoch = progress.epoch,
            iter = progress.iter,
            "patience exhausted, stopping early"
        );
    }
    Ok(progress)
}

fn mean_loss(
    n_batches: usize,
    step: impl FnMut(usize) -> Result<f64, TrainError>,
) -> Result<f64, TrainError> {
    let losses = (0..n_batches).map(step).collect::<Result<Vec<f64>, _>>()?;
    Ok(mean(&losses))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
