/* ------------------------------------------------------------------ */
/* Hyperparameter defaults and typed run configuration                */
/* ------------------------------------------------------------------ */
//
// Every default the drivers fall back to lives here. The CLI layer
// (cli.rs) only decides which of these a user overrode; the library
// never reads flags by name.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::schedule::SchedulePolicy;

// ── Optimizer ─────────────────────────────────────────────────────────────

pub const MOMENTUM: f64 = 0.9;
pub const DEFAULT_CLIPGRAD: f64 = 10.0;
// L2 coefficient on convolution and dense kernels, added to the loss.
pub const L2_PENALTY: f64 = 5e-4;

// ── Data loading ──────────────────────────────────────────────────────────

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_PREFETCH: usize = 100;
pub const DEFAULT_SEED: u64 = 42;
// Zero padding (pixels per side) before the random training crop.
pub const CROP_PADDING: usize = 4;

// ── Schedules ─────────────────────────────────────────────────────────────

// Plateau decay (SGD)
pub const SGD_LR: f64 = 0.1;
pub const SGD_PATIENCE: usize = 10;
pub const SGD_MIN_LR: f64 = 1e-4;
pub const SGD_EPOCHS: usize = 200;
pub const PLATEAU_FACTOR: f64 = 0.5;
pub const PLATEAU_MIN_DELTA: f64 = 1e-4;

// Cosine warm restarts (SGDR)
pub const SGDR_BASE_LEN: usize = 12;
pub const SGDR_MUL: usize = 2;
pub const SGDR_MAX_LR: f64 = 0.1;
pub const SGDR_MIN_LR: f64 = 1e-6;
pub const SGDR_CYCLES: usize = 5;

// Cyclical triangular (CLR)
pub const CLR_STEP_LEN: usize = 12;
pub const CLR_MIN_LR: f64 = 1e-5;
pub const CLR_MAX_LR: f64 = 0.1;
pub const CLR_CYCLES: usize = 4;

// ── Progress ──────────────────────────────────────────────────────────────

pub const PROGRESS_INTERVAL: usize = 50;

/* ------------------------------------------------------------------ */
/* Schedule configuration                                             */
/* ------------------------------------------------------------------ */

/// Sub-parameters of every schedule policy. `None` means "use the
/// policy default"; only the fields of the selected policy are read.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub policy: SchedulePolicy,
    pub sgd_lr: f64,
    pub sgd_patience: Option<usize>,
    pub sgd_min_lr: Option<f64>,
    pub sgdr_base_len: Option<usize>,
    pub sgdr_mul: Option<usize>,
    pub sgdr_max_lr: Option<f64>,
    pub sgdr_cycles: Option<usize>,
    pub clr_step_len: Option<usize>,
    pub clr_min_lr: Option<f64>,
    pub clr_max_lr: Option<f64>,
    pub clr_cycles: Option<usize>,
}

impl ScheduleConfig {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self {
            policy,
            sgd_lr: SGD_LR,
            sgd_patience: None,
            sgd_min_lr: None,
            sgdr_base_len: None,
            sgdr_mul: None,
            sgdr_max_lr: None,
            sgdr_cycles: None,
            clr_step_len: None,
            clr_min_lr: None,
            clr_max_lr: None,
            clr_cycles: None,
        }
    }
}

/* ------------------------------------------------------------------ */
/* Training driver configuration                                      */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub val_batch_size: usize,
    /// Overrides the epoch count derived from the schedule.
    pub epochs: Option<usize>,
    /// Overrides the epoch recorded in a resumed snapshot.
    pub initial_epoch: Option<usize>,
    pub devices: usize,
    pub clipgrad: f64,
    pub max_decay: f64,
    pub snapshot: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub workers: usize,
    pub prefetch: usize,
    pub seed: u64,
    pub progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            val_batch_size: DEFAULT_BATCH_SIZE,
            epochs: None,
            initial_epoch: None,
            devices: 1,
            clipgrad: DEFAULT_CLIPGRAD,
            max_decay: 0.0,
            snapshot: None,
            log_dir: None,
            workers: DEFAULT_WORKERS,
            prefetch: DEFAULT_PREFETCH,
            seed: DEFAULT_SEED,
            progress: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.val_batch_size == 0 {
            return Err(Error::config("batch sizes must be positive"));
        }
        if self.devices == 0 {
            return Err(Error::config("at least one device is required"));
        }
        if self.workers == 0 {
            return Err(Error::config("at least one data loading worker is required"));
        }
        if !(self.clipgrad > 0.0) {
            return Err(Error::config(format!(
                "gradient clipping norm must be positive, got {}",
                self.clipgrad
            )));
        }
        if !(0.0..1.0).contains(&self.max_decay) {
            return Err(Error::config(format!(
                "max decay must lie in [0, 1), got {}",
                self.max_decay
            )));
        }
        if self.epochs == Some(0) {
            return Err(Error::config("epoch count must be positive"));
        }
        Ok(())
    }

    /// Time-based decay factor that scales the learning rate down to
    /// `max_decay` of its value by the last iteration of the run.
    pub fn time_decay(&self, num_train: usize, total_epochs: usize) -> f64 {
        let steps = (num_train / self.batch_size) * total_epochs;
        if self.max_decay > 0.0 && steps > 0 {
            (1.0 / self.max_decay - 1.0) / steps as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = TrainConfig { batch_size: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn time_decay_reaches_max_decay_at_the_end() {
        let config = TrainConfig { batch_size: 10, max_decay: 0.1, ..Default::default() };
        let decay = config.time_decay(100, 5);
        // 10 steps per epoch * 5 epochs; lr / (1 + decay * 50) == lr * 0.1
        let factor = 1.0 / (1.0 + decay * 50.0);
        assert!((factor - 0.1).abs() < 1e-12);
        assert_eq!(TrainConfig::default().time_decay(100, 5), 0.0);
    }
}
