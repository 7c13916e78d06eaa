use std::time::Duration;

use crate::trainer::{CheckpointPosition, FineTuneReport};

/// Receives training progress from [`crate::trainer::pretrain_layers`] and
/// [`crate::trainer::fine_tune`]. Every method defaults to doing nothing.
pub trait TrainingObserver {
    /// called once per layer and pretraining epoch with the mean minibatch cost.
    fn on_pretrain_epoch(&mut self, _layer: usize, _epoch: usize, _cost: f64) {}

    fn on_pretrain_complete(&mut self, _elapsed: Duration) {}

    /// called at every validation checkpoint.
    fn on_validation(&mut self, _at: &CheckpointPosition, _validation_loss: f64) {}

    /// called after a checkpoint that improved on the best validation loss, with
    /// the test score measured at that point.
    fn on_new_best(&mut self, _at: &CheckpointPosition, _test_score: f64) {}

    fn on_training_complete(&mut self, _report: &FineTuneReport) {}
}

/// Prints progress lines to stdout.
pub struct ConsoleReporter;

impl TrainingObserver for ConsoleReporter {
    fn on_pretrain_epoch(&mut self, layer: usize, epoch: usize, cost: f64) {
        println!("{}", pretrain_epoch_line(layer, epoch, cost));
    }

    fn on_pretrain_complete(&mut self, elapsed: Duration) {
        println!("The pretraining code ran for {}", minutes(elapsed));
    }

    fn on_validation(&mut self, at: &CheckpointPosition, validation_loss: f64) {
        println!("{}", validation_line(at, validation_loss));
    }

    fn on_new_best(&mut self, at: &CheckpointPosition, test_score: f64) {
        println!("{}", best_test_line(at, test_score));
    }

    fn on_training_complete(&mut self, report: &FineTuneReport) {
        for line in summary_lines(report) {
            println!("{line}");
        }
    }
}

fn minutes(elapsed: Duration) -> String {
    format!("{:.2}m", elapsed.as_secs_f64() / 60.)
}

pub fn pretrain_epoch_line(layer: usize, epoch: usize, cost: f64) -> String {
    format!("Pre-training layer {layer}, epoch {epoch}, cost {cost:.6}")
}

pub fn validation_line(at: &CheckpointPosition, validation_loss: f64) -> String {
    format!(
        "epoch {}, minibatch {}/{}, validation error {:.6} %",
        at.epoch,
        at.minibatch,
        at.n_train_batches,
        validation_loss * 100.
    )
}

pub fn best_test_line(at: &CheckpointPosition, test_score: f64) -> String {
    format!(
        "epoch {}, minibatch {}/{}, test error of best model {:.6} %",
        at.epoch,
        at.minibatch,
        at.n_train_batches,
        test_score * 100.
    )
}

pub fn summary_lines(report: &FineTuneReport) -> [String; 3] {
    [
        format!(
            "Optimization complete with best validation error of {:.6} %, with test error of {:.6} %",
            report.best_validation_loss * 100.,
            report.test_score * 100.
        ),
        format!(
            "The code ran for {} epochs, with {:.6} epochs/sec",
            report.epochs,
            report.epochs_per_second()
        ),
        format!("The fine-tuning code ran for {}", minutes(report.elapsed)),
    ]
}
