/* ------------------------------------------------------------------ */
/* Training driver: fit / evaluate / predict                          */
/* ------------------------------------------------------------------ */

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{self, SnapshotState};
use crate::config::{TrainConfig, PROGRESS_INTERVAL};
use crate::dataset::{BatchTransform, DataGenerator, Split};
use crate::device::select_devices;
use crate::embedding::ClassEmbedding;
use crate::error::{Error, Result};
use crate::logging::EpochLog;
use crate::loss::{self, EmbeddingLoss, HeadObjective, LossConfig};
use crate::model::{HeadKind, HeadSpec, ModelDescriptor};
use crate::optimizer::SgdConfig;
use crate::parallel::{DataParallel, StepStats};
use crate::prefetch::{flow, FlowOptions};
use crate::schedule::LrSchedule;

/* ------------------------------------------------------------------ */
/* Records                                                            */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Serialize)]
pub struct HeadRecord {
    pub name: String,
    pub metric: &'static str,
    pub loss: f64,
    pub value: f64,
    pub val_loss: f64,
    pub val_value: f64,
}

/// One line of the epoch log.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    /// 1-based, i.e. the number of completed epochs.
    pub epoch: usize,
    pub lr: f64,
    pub loss: f64,
    pub val_loss: f64,
    pub heads: Vec<HeadRecord>,
    pub seconds: f64,
}

impl EpochRecord {
    fn new(
        epoch: usize,
        lr: f64,
        objectives: &[HeadObjective],
        train: &StepStats,
        val: &StepStats,
        seconds: f64,
    ) -> Self {
        let at = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(f64::NAN);
        let heads = objectives
            .iter()
            .enumerate()
            .map(|(i, o)| HeadRecord {
                name: o.name.clone(),
                metric: o.metric.name(),
                loss: at(&train.head_losses, i),
                value: at(&train.head_metrics, i),
                val_loss: at(&val.head_losses, i),
                val_value: at(&val.head_metrics, i),
            })
            .collect();
        Self { epoch, lr, loss: train.loss, val_loss: val.loss, heads, seconds }
    }
}

impl fmt::Display for EpochRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch {:3} | Loss: {:.4} | Val: {:.4} | LR: {:.6}",
            self.epoch, self.loss, self.val_loss, self.lr
        )?;
        for h in &self.heads {
            write!(f, " | {}_{}: {:.4}/{:.4}", h.name, h.metric, h.value, h.val_value)?;
        }
        write!(f, " | {:.1}s", self.seconds)
    }
}

/// Losses and metrics of one pass over a split.
#[derive(Debug, Clone)]
pub struct SplitMetrics {
    pub split: Split,
    pub stats: StepStats,
    /// (head name, metric name), in head order.
    pub heads: Vec<(String, &'static str)>,
}

impl SplitMetrics {
    /// Metric value of the named head.
    pub fn metric(&self, head: &str) -> Option<f64> {
        let i = self.heads.iter().position(|(n, _)| n == head)?;
        self.stats.head_metrics.get(i).copied()
    }
}

impl fmt::Display for SplitMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (loss, samples) = (self.stats.loss, self.stats.samples);
        writeln!(f, "{} loss: {loss:.4} ({samples} samples)", self.split)?;
        for (i, (name, metric)) in self.heads.iter().enumerate() {
            let loss = self.stats.head_losses.get(i).copied().unwrap_or(f64::NAN);
            let value = self.stats.head_metrics.get(i).copied().unwrap_or(f64::NAN);
            writeln!(f, "  {name:<10} loss {loss:.4}  {metric} {value:.4}")?;
        }
        Ok(())
    }
}

/* ------------------------------------------------------------------ */
/* Trainer                                                            */
/* ------------------------------------------------------------------ */

/// Check the head layout against the class tables and the dataset.
fn check_heads(heads: &[HeadSpec], tables: &[ClassEmbedding], num_classes: usize) -> Result<()> {
    for head in heads {
        match head.kind {
            HeadKind::Classification { num_classes: k, .. } if k != num_classes => {
                return Err(Error::config(format!(
                    "head {} predicts {k} classes, dataset has {num_classes}",
                    head.name
                )));
            }
            HeadKind::Embedding { table, dim } => {
                let t = tables.get(table).ok_or_else(|| {
                    Error::config(format!("head {} needs embedding table #{table}", head.name))
                })?;
                if t.dim() != dim {
                    return Err(Error::config(format!(
                        "head {} outputs {dim} dimensions, table #{table} has {}",
                        head.name,
                        t.dim()
                    )));
                }
                if t.num_classes() != num_classes {
                    return Err(Error::config(format!(
                        "table #{table} has {} classes, dataset has {num_classes}",
                        t.num_classes()
                    )));
                }
            }
            HeadKind::Classification { .. } => {}
        }
    }
    Ok(())
}

pub struct Trainer {
    engine: DataParallel,
    data: Arc<dyn DataGenerator>,
    tables: Arc<Vec<ClassEmbedding>>,
    schedule: LrSchedule,
    config: TrainConfig,
    initial_epoch: usize,
    total_epochs: usize,
    epoch_log: Option<EpochLog>,
    history: Vec<EpochRecord>,
}

impl Trainer {
    pub fn new(
        descriptor: ModelDescriptor,
        data: Arc<dyn DataGenerator>,
        tables: Vec<ClassEmbedding>,
        loss_config: &LossConfig,
        mut schedule: LrSchedule,
        config: TrainConfig,
    ) -> Result<Self> {
        config.validate()?;

        let snapshot = match &config.snapshot {
            Some(path) if path.exists() => {
                info!("Resuming from snapshot {}", path.display());
                Some(checkpoint::load_snapshot(path, &Device::Cpu)?)
            }
            _ => None,
        };
        let descriptor = match &snapshot {
            Some(snap) => {
                if snap.descriptor != descriptor {
                    warn!("snapshot model differs from the requested one, using the snapshot's");
                }
                snap.descriptor.clone()
            }
            None => descriptor,
        };
        descriptor.validate()?;

        // The embedding loss follows the model's output normalization, which
        // for a resumed model is the snapshot's.
        let mut loss_config = loss_config.clone();
        if descriptor.l2_normalize() != loss_config.embedding_loss.normalizes_output() {
            let embedding_loss = EmbeddingLoss::for_output(descriptor.l2_normalize());
            warn!(
                "model {} normalized embeddings, training with {embedding_loss} instead of {}",
                if descriptor.l2_normalize() { "has" } else { "does not have" },
                loss_config.embedding_loss
            );
            loss_config.embedding_loss = embedding_loss;
        }

        let heads = descriptor.head_specs();
        check_heads(&heads, &tables, data.num_classes())?;
        let objectives = loss::compose(&heads, &loss_config);

        let total_epochs = config.epochs.unwrap_or_else(|| schedule.total_epochs());
        let steps_per_epoch = data.num_batches(Split::Train, config.batch_size);
        let decay = config.time_decay(data.num_samples(Split::Train), total_epochs);
        let sgd = SgdConfig::new(schedule.learning_rate(0, 0.0), config.clipgrad, decay);

        let devices = select_devices(config.devices);
        let mut engine = DataParallel::new(&descriptor, &devices, &tables, objectives, sgd)?;

        let initial_epoch = match snapshot {
            Some(snap) => {
                engine.restore(&snap.tensors)?;
                if let Some(saved) = &snap.schedule {
                    if !schedule.restore_state(saved) {
                        warn!(
                            "snapshot was taken with the {} schedule, continuing with {}",
                            saved.policy(),
                            schedule.policy()
                        );
                    }
                }
                let epoch = config.initial_epoch.unwrap_or(snap.epoch);
                let iterations = if config.initial_epoch.is_some() {
                    epoch * steps_per_epoch
                } else {
                    snap.iterations
                };
                engine.optimizer_mut().set_iterations(iterations);
                epoch
            }
            None => {
                let epoch = config.initial_epoch.unwrap_or(0);
                engine.optimizer_mut().set_iterations(epoch * steps_per_epoch);
                epoch
            }
        };

        let epoch_log = config.log_dir.as_deref().map(EpochLog::create).transpose()?;

        Ok(Self {
            engine,
            data,
            tables: Arc::new(tables),
            schedule,
            config,
            initial_epoch,
            total_epochs,
            epoch_log,
            history: Vec::new(),
        })
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        self.engine.descriptor()
    }

    pub fn objectives(&self) -> &[HeadObjective] {
        self.engine.objectives()
    }

    pub fn initial_epoch(&self) -> usize {
        self.initial_epoch
    }

    pub fn total_epochs(&self) -> usize {
        self.total_epochs
    }

    fn transform(&self) -> BatchTransform {
        loss::target_transform(self.engine.objectives(), Arc::clone(&self.tables))
    }

    fn flow_options(&self, batch_size: usize, train: bool) -> FlowOptions {
        FlowOptions {
            batch_size,
            shuffle: train,
            augment: train,
            seed: self.config.seed,
            workers: self.config.workers,
            prefetch: self.config.prefetch,
            transform: Some(self.transform()),
        }
    }

    /// Human-readable model overview.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let descriptor = serde_json::to_string(self.descriptor()).unwrap_or_default();
        out.push_str(&format!("Model: {descriptor}\n"));
        out.push_str(&format!("Feature dim: {}\n", self.descriptor().feature_dim()));
        for o in self.engine.objectives() {
            out.push_str(&format!(
                "  head {:<8} weight {:<6} metric {}\n",
                o.name,
                o.weight,
                o.metric.name()
            ));
        }
        out.push_str(&format!(
            "Schedule: {} (epochs {} -> {})\n",
            self.schedule.policy(),
            self.initial_epoch(),
            self.total_epochs()
        ));
        out.push_str(&format!(
            "Parameters: ~{:.2}M\nReplicas: {}\n",
            self.engine.parameter_count() as f64 / 1_000_000.0,
            self.engine.num_replicas()
        ));
        out
    }

    /// Train from `initial_epoch` to `total_epochs`, validating after
    /// every epoch.
    pub fn fit(&mut self) -> Result<&[EpochRecord]> {
        let opts = self.flow_options(self.config.batch_size, true);
        let progress = self.config.progress;

        if progress {
            println!("=== Training ===");
            if self.initial_epoch > 0 {
                println!("Resuming at epoch {}", self.initial_epoch);
            }
            println!("Epochs: {} → {}", self.initial_epoch, self.total_epochs);
            println!("Batch size: {}", self.config.batch_size);
            println!("Schedule: {}", self.schedule.policy());
            println!("Replicas: {}", self.engine.num_replicas());
            println!();
        }
        info!(
            from = self.initial_epoch,
            to = self.total_epochs,
            schedule = %self.schedule.policy(),
            "training started"
        );

        for epoch in self.initial_epoch..self.total_epochs {
            let start = Instant::now();
            let epoch_lr = self.schedule.learning_rate(epoch, 0.0);
            let stream = flow(Arc::clone(&self.data), Split::Train, epoch, &opts);
            let steps = stream.num_batches();

            let mut train = StepStats::default();
            for (step, batch) in stream.enumerate() {
                let batch = batch?;
                let lr = self.schedule.learning_rate(epoch, step as f64 / steps as f64);
                self.engine.set_learning_rate(lr);
                let stats = self.engine.train_step(&batch)?;
                debug!(epoch, step, loss = stats.loss, "batch");
                train.merge(&stats);

                if progress && (step % PROGRESS_INTERVAL == 0 || step + 1 == steps) {
                    println!(
                        "Epoch {:3}/{} | Batch {:4}/{} | Loss: {:.4} | LR: {:.6}",
                        epoch + 1,
                        self.total_epochs,
                        step + 1,
                        steps,
                        train.loss,
                        self.engine.optimizer().effective_learning_rate()
                    );
                }
            }

            let val = self.evaluate(Split::Validation)?;
            if let Some(lr) = self.schedule.on_epoch_end(val.stats.loss) {
                info!(epoch = epoch + 1, lr, "validation loss stalled, learning rate reduced");
            }

            let record = EpochRecord::new(
                epoch + 1,
                epoch_lr,
                self.engine.objectives(),
                &train,
                &val.stats,
                start.elapsed().as_secs_f64(),
            );
            if progress {
                println!("{record}");
            }
            if let Some(log) = &self.epoch_log {
                log.append(&record)
                    .unwrap_or_else(|e| warn!("could not write {}: {e}", log.path().display()));
            }
            self.history.push(record);

            if let Some(path) = &self.config.snapshot {
                self.save_snapshot(path, epoch + 1)
                    .unwrap_or_else(|e| warn!("An error occurred while saving the snapshot: {e}"));
            }
        }

        if progress {
            println!();
            println!("Training complete!");
        }
        info!(epochs = self.history.len(), "training finished");
        Ok(&self.history)
    }

    /// Loss and metrics over one split, without augmentation.
    pub fn evaluate(&self, split: Split) -> Result<SplitMetrics> {
        let opts = self.flow_options(self.config.val_batch_size, false);
        let mut stats = StepStats::default();
        for batch in flow(Arc::clone(&self.data), split, 0, &opts) {
            stats.merge(&self.engine.eval_step(&batch?)?);
        }
        let heads = self
            .engine
            .objectives()
            .iter()
            .map(|o| (o.name.clone(), o.metric.name()))
            .collect();
        Ok(SplitMetrics { split, stats, heads })
    }

    /// Feature vector of every sample in `split`, keyed by sample index.
    pub fn predict_features(&self, split: Split) -> Result<Vec<(usize, Vec<f32>)>> {
        let mut opts = self.flow_options(self.config.val_batch_size, false);
        opts.transform = None;
        let mut out = Vec::with_capacity(self.data.num_samples(split));
        for batch in flow(Arc::clone(&self.data), split, 0, &opts) {
            let batch = batch?;
            let rows = self.engine.predict_features(&batch)?.to_vec2::<f32>()?;
            out.extend(batch.indices.iter().copied().zip(rows));
        }
        Ok(out)
    }

    fn save_snapshot(&self, path: &Path, epoch: usize) -> Result<()> {
        let state = SnapshotState {
            epoch,
            iterations: self.engine.optimizer().iterations(),
            schedule: &self.schedule,
        };
        checkpoint::save_snapshot(self.engine.varmap(), self.descriptor(), state, path)?;
        debug!(epoch, path = %path.display(), "snapshot written");
        Ok(())
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        checkpoint::save_weights(self.engine.varmap(), path)
    }

    pub fn save_model(&self, path: &Path) -> Result<()> {
        checkpoint::save_model(self.engine.varmap(), self.descriptor(), path)
    }
}
