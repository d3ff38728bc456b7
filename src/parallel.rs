/* ------------------------------------------------------------------ */
/* Data-parallel replicas with synchronous gradient aggregation       */
/* ------------------------------------------------------------------ */
//
// One canonical model owns the optimizer. With a single device it also
// does the computing. With several, it lives on the CPU and every
// device holds a replica:
//
//   batch ─split rows─► replica_i: forward + backward        (rayon)
//         ─► grads to CPU, weighted by shard size, summed
//         ─► one optimizer step on the canonical variables
//         ─► batch-norm statistics averaged over replicas
//         ─► all variables broadcast back to the replicas

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use rayon::prelude::*;
use serde::Serialize;

use crate::checkpoint;
use crate::dataset::Batch;
use crate::device::canonical_device;
use crate::embedding::ClassEmbedding;
use crate::error::{Error, Result};
use crate::loss::{self, HeadObjective, LossBreakdown};
use crate::model::{ModelDescriptor, ModelOutputs, MultiHeadModel};
use crate::optimizer::{MomentumSgd, SgdConfig};

/// Sample-weighted losses and metrics over one or more batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepStats {
    pub samples: usize,
    pub loss: f64,
    pub head_losses: Vec<f64>,
    pub head_metrics: Vec<f64>,
}

impl StepStats {
    pub fn merge(&mut self, other: &StepStats) {
        if other.samples == 0 {
            return;
        }
        if self.samples == 0 {
            *self = other.clone();
            return;
        }
        let n = (self.samples + other.samples) as f64;
        let (wa, wb) = (self.samples as f64 / n, other.samples as f64 / n);
        let mix = |a: &mut Vec<f64>, b: &[f64]| {
            a.iter_mut().zip(b).for_each(|(x, y)| *x = *x * wa + y * wb);
        };
        self.loss = self.loss * wa + other.loss * wb;
        mix(&mut self.head_losses, &other.head_losses);
        mix(&mut self.head_metrics, &other.head_metrics);
        self.samples += other.samples;
    }
}

struct ShardResult {
    stats: StepStats,
    grads: Vec<Option<Tensor>>,
}

/* ------------------------------------------------------------------ */
/* Replica                                                            */
/* ------------------------------------------------------------------ */

pub struct Replica {
    device: Device,
    varmap: VarMap,
    model: Box<dyn MultiHeadModel>,
    /// Sorted by name; index i is the same variable on every replica.
    names: Vec<String>,
    vars: Vec<Var>,
    /// Class tables `[K, D]` on this device, for nearest-neighbour metrics.
    tables: Vec<Tensor>,
}

impl Replica {
    pub fn build(
        descriptor: &ModelDescriptor,
        device: &Device,
        tables: &[ClassEmbedding],
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = descriptor.build(vb)?;

        let (names, vars) = {
            let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<(String, Var)> =
                data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries.into_iter().unzip()
        };
        let tables = tables.iter().map(|t| t.to_tensor(device)).collect::<Result<Vec<_>>>()?;

        Ok(Self { device: device.clone(), varmap, model, names, vars, tables })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, batch: &Batch, train: bool) -> Result<(Batch, ModelOutputs)> {
        let batch = batch.to_device(&self.device)?;
        let outputs = self.model.forward_t(&batch.images, train)?;
        Ok((batch, outputs))
    }

    fn stats(
        &self,
        objectives: &[HeadObjective],
        batch: &Batch,
        outputs: &ModelOutputs,
        losses: &LossBreakdown,
    ) -> Result<StepStats> {
        let head_metrics = objectives
            .iter()
            .zip(&outputs.heads)
            .map(|(o, h)| {
                loss::head_metric(&o.metric, &h.value.detach(), &batch.labels, &self.tables)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(StepStats {
            samples: batch.len(),
            loss: loss::scalar(&losses.total)?,
            head_losses: losses.heads.iter().map(loss::scalar).collect::<Result<_>>()?,
            head_metrics,
        })
    }

    fn grad_step(&self, batch: &Batch, objectives: &[HeadObjective]) -> Result<ShardResult> {
        let (batch, outputs) = self.forward(batch, true)?;
        let penalty = self.model.penalty()?;
        let losses = loss::total_loss(objectives, &outputs, &batch.targets, penalty.as_ref())?;
        let store = losses.total.backward()?;
        let grads = self.vars.iter().map(|v| store.get(v.as_tensor()).cloned()).collect();
        let stats = self.stats(objectives, &batch, &outputs, &losses)?;
        Ok(ShardResult { stats, grads })
    }

    fn eval_step(&self, batch: &Batch, objectives: &[HeadObjective]) -> Result<StepStats> {
        let (batch, outputs) = self.forward(batch, false)?;
        let penalty = self.model.penalty()?;
        let losses = loss::total_loss(objectives, &outputs, &batch.targets, penalty.as_ref())?;
        self.stats(objectives, &batch, &outputs, &losses)
    }

    fn features(&self, batch: &Batch) -> Result<Tensor> {
        let (_, outputs) = self.forward(batch, false)?;
        Ok(outputs.features.to_device(&Device::Cpu)?)
    }
}

/* ------------------------------------------------------------------ */
/* Data-parallel engine                                               */
/* ------------------------------------------------------------------ */

pub struct DataParallel {
    canonical: Replica,
    workers: Vec<Replica>,
    optimizer: MomentumSgd,
    objectives: Vec<HeadObjective>,
}

impl DataParallel {
    pub fn new(
        descriptor: &ModelDescriptor,
        devices: &[Device],
        tables: &[ClassEmbedding],
        objectives: Vec<HeadObjective>,
        sgd: SgdConfig,
    ) -> Result<Self> {
        let canonical = Replica::build(descriptor, &canonical_device(devices), tables)?;
        let workers = if devices.len() > 1 {
            devices
                .iter()
                .map(|d| Replica::build(descriptor, d, tables))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        if workers.iter().any(|w| w.names != canonical.names) {
            return Err(Error::Checkpoint("replica variables do not line up".into()));
        }
        let optimizer = MomentumSgd::new(canonical.vars.clone(), sgd)?;

        let engine = Self { canonical, workers, optimizer, objectives };
        engine.broadcast()?;
        Ok(engine)
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        self.canonical.model.descriptor()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.canonical.varmap
    }

    pub fn objectives(&self) -> &[HeadObjective] {
        &self.objectives
    }

    pub fn num_replicas(&self) -> usize {
        self.workers.len().max(1)
    }

    pub fn parameter_count(&self) -> usize {
        self.canonical.vars.iter().map(|v| v.elem_count()).sum()
    }

    pub fn optimizer(&self) -> &MomentumSgd {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut MomentumSgd {
        &mut self.optimizer
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Load checkpoint tensors into the canonical model and the replicas.
    pub fn restore(&mut self, tensors: &std::collections::HashMap<String, Tensor>) -> Result<()> {
        checkpoint::restore_vars(&self.canonical.varmap, tensors)?;
        self.broadcast()
    }

    fn broadcast(&self) -> Result<()> {
        for worker in &self.workers {
            for (src, dst) in self.canonical.vars.iter().zip(&worker.vars) {
                dst.set(&src.as_tensor().to_device(&worker.device)?)?;
            }
        }
        Ok(())
    }

    fn shards(&self, batch: &Batch) -> Result<Vec<Batch>> {
        let n = batch.len();
        let chunk = n.div_ceil(self.workers.len().max(1)).max(1);
        (0..n)
            .step_by(chunk)
            .map(|start| batch.narrow(start, chunk.min(n - start)))
            .collect()
    }

    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        if self.workers.is_empty() {
            let result = self.canonical.grad_step(batch, &self.objectives)?;
            self.optimizer.apply(&result.grads)?;
            return Ok(result.stats);
        }

        let shards = self.shards(batch)?;
        let objectives = &self.objectives;
        let results: Vec<ShardResult> = self
            .workers
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| replica.grad_step(shard, objectives))
            .collect::<Result<Vec<_>>>()?;

        let total: usize = results.iter().map(|r| r.stats.samples).sum();
        let weights: Vec<f64> =
            results.iter().map(|r| r.stats.samples as f64 / total as f64).collect();
        let cpu = &self.canonical.device;

        let mut grads = Vec::with_capacity(self.canonical.vars.len());
        for i in 0..self.canonical.vars.len() {
            let mut acc: Option<Tensor> = None;
            for (result, &w) in results.iter().zip(&weights) {
                if let Some(g) = &result.grads[i] {
                    let g = g.to_device(cpu)?.affine(w, 0.0)?;
                    acc = Some(match acc {
                        Some(a) => a.add(&g)?,
                        None => g,
                    });
                }
            }
            grads.push(acc);
        }
        self.optimizer.apply(&grads)?;

        // Variables without gradients are forward-updated state.
        for (i, var) in self.canonical.vars.iter().enumerate() {
            if grads[i].is_some() {
                continue;
            }
            let mut acc: Option<Tensor> = None;
            for (worker, &w) in self.workers.iter().zip(&weights) {
                let v = worker.vars[i].as_tensor().to_device(cpu)?.affine(w, 0.0)?;
                acc = Some(match acc {
                    Some(a) => a.add(&v)?,
                    None => v,
                });
            }
            if let Some(mean) = acc {
                var.set(&mean)?;
            }
        }
        self.broadcast()?;

        let mut stats = StepStats::default();
        results.iter().for_each(|r| stats.merge(&r.stats));
        Ok(stats)
    }

    pub fn eval_step(&self, batch: &Batch) -> Result<StepStats> {
        if self.workers.is_empty() {
            return self.canonical.eval_step(batch, &self.objectives);
        }
        let shards = self.shards(batch)?;
        let objectives = &self.objectives;
        let results: Vec<StepStats> = self
            .workers
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| replica.eval_step(shard, objectives))
            .collect::<Result<Vec<_>>>()?;
        let mut stats = StepStats::default();
        results.iter().for_each(|r| stats.merge(r));
        Ok(stats)
    }

    /// Feature rows for `batch`, in batch order, on the CPU.
    pub fn predict_features(&self, batch: &Batch) -> Result<Tensor> {
        if self.workers.is_empty() {
            return self.canonical.features(batch);
        }
        let shards = self.shards(batch)?;
        let parts: Vec<Tensor> = self
            .workers
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| replica.features(shard))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 0)?)
    }
}
