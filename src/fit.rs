//! # Epoch loop
//!
//! Alternates a training pass and a validation pass over the data, and runs
//! the callbacks (checkpointing, metrics logging) at the end of each epoch.
use crate::loader::DataLoader;
use crate::trainer::Trainer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::nn::Module;

/// The metrics of a single epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: f64,
}

#[derive(Debug, Clone, Default)]
pub struct History {
    pub epochs: Vec<EpochLogs>,
}

impl History {
    pub fn train_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.val_loss).collect()
    }
}

/// Mean of per-batch losses weighted by the batch sizes.
#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    sum: f64,
    count: f64,
}

impl RunningMean {
    fn add(&mut self, value: f64, weight: i64) {
        self.sum += value * weight as f64;
        self.count += weight as f64;
    }

    fn value(&self) -> f64 {
        if self.count > 0. {
            self.sum / self.count
        } else {
            f64::NAN
        }
    }
}

pub trait Callback {
    fn on_epoch_end(&mut self, logs: &EpochLogs, trainer: &Trainer) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Monitor {
    Loss,
    ValLoss,
}

impl Monitor {
    fn value(&self, logs: &EpochLogs) -> f64 {
        match self {
            Self::Loss => logs.loss,
            Self::ValLoss => logs.val_loss,
        }
    }
}

/// Saves the fine-tuned weights at the end of each epoch. With
/// `save_best_only` set, only when the monitored loss improves on the best
/// value seen so far. A `{epoch}` placeholder in the path is replaced by
/// the 1-based epoch number.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: String,
    monitor: Monitor,
    save_best_only: bool,
    best: Option<f64>,
}

impl ModelCheckpoint {
    pub fn new<S: Into<String>>(path: S, monitor: Monitor, save_best_only: bool) -> Self {
        Self { path: path.into(), monitor, save_best_only, best: None }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn filepath(&self, epoch: usize) -> PathBuf {
        PathBuf::from(self.path.replace("{epoch}", &format!("{:02}", epoch + 1)))
    }

    /// Records the monitored value and returns whether to save.
    fn should_save(&mut self, logs: &EpochLogs) -> bool {
        let value = self.monitor.value(logs);
        let improved = value.is_finite() && self.best.map_or(true, |best| value < best);
        if improved {
            self.best = Some(value)
        }
        improved || !self.save_best_only
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, logs: &EpochLogs, trainer: &Trainer) -> anyhow::Result<()> {
        let previous = self.best;
        if self.should_save(logs) {
            let path = self.filepath(logs.epoch);
            if let (Some(previous), Some(best)) = (previous, self.best) {
                if best < previous {
                    tracing::info!("{:?} improved from {previous:.5} to {best:.5}", self.monitor);
                }
            }
            trainer.save_weights(path)?;
        } else {
            tracing::info!(
                "{:?} did not improve from {:.5}",
                self.monitor,
                self.best.unwrap_or(f64::NAN)
            );
        }
        Ok(())
    }
}

/// Streams the epoch metrics to a csv file, the file is truncated when the
/// logger is created.
pub struct CsvLogger {
    path: PathBuf,
    writer: csv::Writer<std::fs::File>,
}

impl CsvLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        crate::utils::create_parent_dir(&path)?;
        let writer = csv::Writer::from_path(path.as_ref())?;
        Ok(Self { path: path.as_ref().to_path_buf(), writer })
    }
}

impl Callback for CsvLogger {
    fn on_epoch_end(&mut self, logs: &EpochLogs, _trainer: &Trainer) -> anyhow::Result<()> {
        self.writer.serialize(logs)?;
        self.writer.flush()?;
        tracing::debug!("appended epoch {} to {:?}", logs.epoch, self.path);
        Ok(())
    }
}

fn run_epoch<M: Module>(
    trainer: &mut Trainer,
    text_encoder: &M,
    loader: &mut DataLoader,
    training: bool,
) -> anyhow::Result<f64> {
    let device = trainer.device();
    let num_batches = loader.num_batches();
    let mut mean = RunningMean::default();
    for (index, batch) in loader.epoch().enumerate() {
        let batch = batch?.into_batch(text_encoder, device);
        let loss =
            if training { trainer.train_step(&batch)? } else { trainer.test_step(&batch) };
        mean.add(loss, batch.size());
        tracing::debug!(
            "{} batch {}/{num_batches}: loss {loss:.5}, mean {:.5}",
            if training { "train" } else { "val" },
            index + 1,
            mean.value()
        );
    }
    if let (true, Some(scaler)) = (training, trainer.loss_scaler()) {
        tracing::debug!("loss scale {}", scaler.scale());
    }
    Ok(mean.value())
}

/// Trains for `epochs` epochs, each one followed by a validation pass.
pub fn fit<M: Module>(
    trainer: &mut Trainer,
    text_encoder: &M,
    train_loader: &mut DataLoader,
    val_loader: &mut DataLoader,
    epochs: usize,
    callbacks: &mut [Box<dyn Callback>],
) -> anyhow::Result<History> {
    let mut history = History::default();
    for epoch in 0..epochs {
        let start = std::time::Instant::now();
        let loss = run_epoch(trainer, text_encoder, train_loader, true)?;
        let val_loss = run_epoch(trainer, text_encoder, val_loader, false)?;
        let logs = EpochLogs { epoch, loss, val_loss };
        tracing::info!(
            "Epoch {}: Training Loss = {loss}, Validation Loss = {val_loss} ({:.1}s)",
            epoch + 1,
            start.elapsed().as_secs_f64()
        );
        for callback in callbacks.iter_mut() {
            callback.on_epoch_end(&logs, trainer)?;
        }
        history.epochs.push(logs);
    }
    Ok(history)
}
