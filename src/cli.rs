/* ------------------------------------------------------------------ */
/* Command-line argument groups shared by both drivers                */
/* ------------------------------------------------------------------ */
//
// Identifiers (dataset, architecture, schedule) are taken as strings and
// parsed in the `to_*` conversions, so a bad name surfaces as the same
// configuration error a library caller would get.

use std::path::PathBuf;

use clap::Args;

use crate::config::{
    ScheduleConfig, TrainConfig, DEFAULT_BATCH_SIZE, DEFAULT_CLIPGRAD, DEFAULT_PREFETCH,
    DEFAULT_SEED, DEFAULT_WORKERS, SGD_LR,
};
use crate::dataset::DatasetKind;
use crate::error::Result;
use crate::network::Architecture;
use crate::schedule::{LrSchedule, SchedulePolicy};

#[derive(Debug, Clone, Args)]
#[command(next_help_heading = "Data parameters")]
pub struct DataArgs {
    /// Training dataset: CIFAR-10 or CIFAR-100.
    #[arg(long)]
    pub dataset: String,

    /// Root directory of the dataset.
    #[arg(long)]
    pub data_root: PathBuf,
}

impl DataArgs {
    pub fn kind(&self) -> Result<DatasetKind> {
        self.dataset.parse()
    }
}

#[derive(Debug, Clone, Args)]
#[command(next_help_heading = "Training parameters")]
pub struct TrainArgs {
    /// Network architecture: simple, resnet-<depth> or wrn-<depth>-<width>.
    #[arg(long, default_value = "simple")]
    pub architecture: String,

    /// Gradient norm clipping.
    #[arg(long, default_value_t = DEFAULT_CLIPGRAD)]
    pub clipgrad: f64,

    /// Learning rate decay reached at the end of training (0 disables).
    #[arg(long, default_value_t = 0.0)]
    pub max_decay: f64,

    /// Number of training epochs; derived from the schedule if omitted.
    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Validation batch size; defaults to the training batch size.
    #[arg(long)]
    pub val_batch_size: Option<usize>,

    /// Snapshot written after every epoch; resumed from if it exists.
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Epoch to resume at; defaults to the one stored in the snapshot.
    #[arg(long)]
    pub initial_epoch: Option<usize>,

    /// Number of devices to train on.
    #[arg(long = "gpus", visible_alias = "devices", default_value_t = 1)]
    pub devices: usize,

    /// Data loading threads.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Batches buffered ahead of the training step.
    #[arg(long, default_value_t = DEFAULT_PREFETCH)]
    pub prefetch: usize,

    /// Seed for shuffling and augmentation.
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

impl TrainArgs {
    pub fn architecture(&self) -> Result<Architecture> {
        self.architecture.parse()
    }

    pub fn to_config(&self, output: &OutputArgs) -> TrainConfig {
        TrainConfig {
            batch_size: self.batch_size,
            val_batch_size: self.val_batch_size.unwrap_or(self.batch_size),
            epochs: self.epochs,
            initial_epoch: self.initial_epoch,
            devices: self.devices,
            clipgrad: self.clipgrad,
            max_decay: self.max_decay,
            snapshot: self.snapshot.clone(),
            log_dir: output.log_dir.clone(),
            workers: self.workers,
            prefetch: self.prefetch,
            seed: self.seed,
            progress: !output.no_progress,
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(next_help_heading = "Learning rate schedule")]
pub struct ScheduleArgs {
    /// Schedule policy: SGD, SGDR or CLR.
    #[arg(long, default_value = "SGDR")]
    pub lr_schedule: String,

    /// [SGD] Patience of learning rate reduction in epochs.
    #[arg(long)]
    pub sgd_patience: Option<usize>,

    /// [SGD] Initial learning rate.
    #[arg(long, default_value_t = SGD_LR)]
    pub sgd_lr: f64,

    /// [SGD] Minimum learning rate.
    #[arg(long)]
    pub sgd_min_lr: Option<f64>,

    /// [SGDR] Length of the first cycle in epochs.
    #[arg(long)]
    pub sgdr_base_len: Option<usize>,

    /// [SGDR] Multiplier for the cycle length after each cycle.
    #[arg(long)]
    pub sgdr_mul: Option<usize>,

    /// [SGDR] Maximum learning rate.
    #[arg(long)]
    pub sgdr_max_lr: Option<f64>,

    /// [SGDR] Number of cycles.
    #[arg(long)]
    pub sgdr_cycles: Option<usize>,

    /// [CLR] Length of each step in epochs.
    #[arg(long)]
    pub clr_step_len: Option<usize>,

    /// [CLR] Minimum learning rate.
    #[arg(long)]
    pub clr_min_lr: Option<f64>,

    /// [CLR] Maximum learning rate.
    #[arg(long)]
    pub clr_max_lr: Option<f64>,

    /// [CLR] Number of full cycles.
    #[arg(long)]
    pub clr_cycles: Option<usize>,
}

impl ScheduleArgs {
    pub fn to_config(&self) -> Result<ScheduleConfig> {
        let policy: SchedulePolicy = self.lr_schedule.parse()?;
        Ok(ScheduleConfig {
            policy,
            sgd_lr: self.sgd_lr,
            sgd_patience: self.sgd_patience,
            sgd_min_lr: self.sgd_min_lr,
            sgdr_base_len: self.sgdr_base_len,
            sgdr_mul: self.sgdr_mul,
            sgdr_max_lr: self.sgdr_max_lr,
            sgdr_cycles: self.sgdr_cycles,
            clr_step_len: self.clr_step_len,
            clr_min_lr: self.clr_min_lr,
            clr_max_lr: self.clr_max_lr,
            clr_cycles: self.clr_cycles,
        })
    }

    pub fn to_schedule(&self) -> Result<LrSchedule> {
        LrSchedule::from_config(&self.to_config()?)
    }
}

#[derive(Debug, Clone, Args)]
#[command(next_help_heading = "Output parameters")]
pub struct OutputArgs {
    /// Where the model descriptor and weights are written.
    #[arg(long)]
    pub model_dump: Option<PathBuf>,

    /// Where the model weights are written (no descriptor).
    #[arg(long)]
    pub weight_dump: Option<PathBuf>,

    /// Where the features of the test images are written (JSON).
    #[arg(long)]
    pub feature_dump: Option<PathBuf>,

    /// Directory for the per-epoch log; cleared at start.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Only report the final performance.
    #[arg(long)]
    pub no_progress: bool,
}
