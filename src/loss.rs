/* ------------------------------------------------------------------ */
/* Per-head losses, weights, metrics and batch targets                */
/* ------------------------------------------------------------------ */

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::dataset::{Batch, BatchTransform};
use crate::embedding::{ClassEmbedding, Similarity};
use crate::error::{Error, Result};
use crate::model::{HeadKind, HeadSpec, ModelOutputs};
use crate::ops;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingLoss {
    /// `mse`: Σ (t - p)² per sample.
    SquaredDistance,
    /// `inv_corr`: 1 - t·p per sample, on L2-normalized outputs.
    InvCorrelation,
}

impl EmbeddingLoss {
    /// Nearest-neighbour rule that matches the loss.
    pub fn similarity(&self) -> Similarity {
        match self {
            Self::SquaredDistance => Similarity::Euclidean,
            Self::InvCorrelation => Similarity::DotProduct,
        }
    }

    pub fn normalizes_output(&self) -> bool {
        matches!(self, Self::InvCorrelation)
    }

    /// Loss that trains a model whose embedding outputs are (or are not)
    /// L2-normalized.
    pub fn for_output(l2_normalized: bool) -> Self {
        if l2_normalized {
            Self::InvCorrelation
        } else {
            Self::SquaredDistance
        }
    }

    /// Batch mean of the per-sample loss.
    pub fn compute(&self, target: &Tensor, pred: &Tensor) -> candle_core::Result<Tensor> {
        let per_sample = match self {
            Self::SquaredDistance => ops::squared_distance(target, pred)?,
            Self::InvCorrelation => ops::inv_correlation(target, pred)?,
        };
        per_sample.mean_all()
    }
}

impl FromStr for EmbeddingLoss {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mse" => Ok(Self::SquaredDistance),
            "inv_corr" => Ok(Self::InvCorrelation),
            other => Err(Error::config(format!(
                "unknown embedding loss {other:?} (expected \"mse\" or \"inv_corr\")"
            ))),
        }
    }
}

impl fmt::Display for EmbeddingLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SquaredDistance => "mse",
            Self::InvCorrelation => "inv_corr",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossConfig {
    pub embedding_loss: EmbeddingLoss,
    /// Weight of the primary classification head.
    pub cls_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadLoss {
    CrossEntropy,
    Embedding { kind: EmbeddingLoss, table: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadMetric {
    Accuracy,
    NearestNeighbor { table: usize, similarity: Similarity },
}

impl HeadMetric {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accuracy => "acc",
            Self::NearestNeighbor { .. } => "nn_acc",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadObjective {
    pub name: String,
    pub loss: HeadLoss,
    pub weight: f64,
    pub metric: HeadMetric,
}

/// One loss/metric pair per output head, in head order.
pub fn compose(heads: &[HeadSpec], cfg: &LossConfig) -> Vec<HeadObjective> {
    heads
        .iter()
        .map(|head| match head.kind {
            HeadKind::Classification { primary, .. } => HeadObjective {
                name: head.name.clone(),
                loss: HeadLoss::CrossEntropy,
                weight: if primary { cfg.cls_weight } else { 1.0 },
                metric: HeadMetric::Accuracy,
            },
            HeadKind::Embedding { table, .. } => HeadObjective {
                name: head.name.clone(),
                loss: HeadLoss::Embedding { kind: cfg.embedding_loss, table },
                weight: 1.0,
                metric: HeadMetric::NearestNeighbor {
                    table,
                    similarity: cfg.embedding_loss.similarity(),
                },
            },
        })
        .collect()
}

/* ------------------------------------------------------------------ */
/* Targets                                                            */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone)]
pub enum HeadTarget {
    /// Class indices `[B]` (u32).
    Classes(Tensor),
    /// Table rows `[B, D]`.
    Embeddings(Tensor),
}

impl HeadTarget {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Classes(t) | Self::Embeddings(t) => t,
        }
    }

    pub fn map(&self, f: impl Fn(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        Ok(match self {
            Self::Classes(t) => Self::Classes(f(t)?),
            Self::Embeddings(t) => Self::Embeddings(f(t)?),
        })
    }
}

/// Batch hook that attaches one target per head, built from the labels.
pub fn target_transform(
    objectives: &[HeadObjective],
    tables: Arc<Vec<ClassEmbedding>>,
) -> BatchTransform {
    let losses: Vec<HeadLoss> = objectives.iter().map(|o| o.loss).collect();
    Arc::new(move |batch: &mut Batch| {
        batch.targets = losses
            .iter()
            .map(|loss| match *loss {
                HeadLoss::CrossEntropy => {
                    Ok(HeadTarget::Classes(Tensor::new(batch.labels.as_slice(), &Device::Cpu)?))
                }
                HeadLoss::Embedding { table, .. } => {
                    let table = tables.get(table).ok_or_else(|| {
                        Error::Dataset(format!("no embedding table #{table}"))
                    })?;
                    Ok(HeadTarget::Embeddings(table.gather(&batch.labels, &Device::Cpu)?))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    })
}

/* ------------------------------------------------------------------ */
/* Loss and metric evaluation                                         */
/* ------------------------------------------------------------------ */

pub struct LossBreakdown {
    /// Σ weight·loss + penalty, scalar.
    pub total: Tensor,
    /// Unweighted per-head losses, scalars.
    pub heads: Vec<Tensor>,
}

pub fn total_loss(
    objectives: &[HeadObjective],
    outputs: &ModelOutputs,
    targets: &[HeadTarget],
    penalty: Option<&Tensor>,
) -> Result<LossBreakdown> {
    if outputs.heads.len() != objectives.len() || targets.len() != objectives.len() {
        return Err(Error::config(format!(
            "{} objectives for {} outputs and {} targets",
            objectives.len(),
            outputs.heads.len(),
            targets.len()
        )));
    }

    let mut heads = Vec::with_capacity(objectives.len());
    let mut total: Option<Tensor> = penalty.cloned();
    for ((objective, output), target) in objectives.iter().zip(&outputs.heads).zip(targets) {
        let loss = match (objective.loss, target) {
            (HeadLoss::CrossEntropy, HeadTarget::Classes(classes)) => {
                let logits = output.logits.as_ref().ok_or_else(|| {
                    Error::config(format!("head {} has no logits", objective.name))
                })?;
                candle_nn::loss::cross_entropy(logits, classes)?
            }
            (HeadLoss::Embedding { kind, .. }, HeadTarget::Embeddings(rows)) => {
                kind.compute(rows, &output.value)?
            }
            _ => {
                return Err(Error::config(format!(
                    "target kind does not match the loss of head {}",
                    objective.name
                )))
            }
        };
        let weighted = loss.affine(objective.weight, 0.0)?;
        total = Some(match total {
            Some(acc) => acc.add(&weighted)?,
            None => weighted,
        });
        heads.push(loss);
    }

    let total = match total {
        Some(t) => t,
        None => Tensor::zeros((), DType::F32, outputs.features.device())?,
    };
    Ok(LossBreakdown { total, heads })
}

/// Fraction of predictions whose nearest table row is the true class.
/// `table` is the `[K, D]` class table on the prediction's device.
pub fn nn_accuracy(
    pred: &Tensor,
    labels: &[u32],
    table: &Tensor,
    similarity: Similarity,
) -> Result<f64> {
    let scores = match similarity {
        Similarity::Euclidean => ops::pairwise_sq_distances(pred, table)?.neg()?,
        Similarity::DotProduct => pred.matmul(&table.t()?)?,
    };
    Ok(ops::accuracy(&scores, labels)?)
}

/// Metric value of one head on one batch.
pub fn head_metric(
    metric: &HeadMetric,
    value: &Tensor,
    labels: &[u32],
    tables: &[Tensor],
) -> Result<f64> {
    match metric {
        HeadMetric::Accuracy => Ok(ops::accuracy(value, labels)?),
        HeadMetric::NearestNeighbor { table, similarity } => {
            let table = tables
                .get(*table)
                .ok_or_else(|| Error::config(format!("no embedding table #{table}")))?;
            nn_accuracy(value, labels, table, *similarity)
        }
    }
}

/// Scalar tensor → f64.
pub fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ClassLabel;
    use crate::model::HeadOutput;

    fn one_hot_table() -> ClassEmbedding {
        ClassEmbedding::from_rows(
            (0..3).map(ClassLabel::Index).collect(),
            vec![
                vec![1.0, 0.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0, 0.0],
            ],
        )
        .unwrap()
    }

    fn ensemble_heads() -> Vec<HeadSpec> {
        let classification = |name: &str, primary| HeadSpec {
            name: name.into(),
            kind: HeadKind::Classification { num_classes: 3, primary },
        };
        vec![
            classification("prob", true),
            classification("cnn0", false),
            HeadSpec { name: "cnn1".into(), kind: HeadKind::Embedding { table: 0, dim: 4 } },
        ]
    }

    #[test]
    fn compose_weights_primary_head_by_cls_weight() {
        let cfg = LossConfig { embedding_loss: EmbeddingLoss::SquaredDistance, cls_weight: 0.1 };
        let objectives = compose(&ensemble_heads(), &cfg);
        let weights: Vec<f64> = objectives.iter().map(|o| o.weight).collect();
        assert_eq!(weights, vec![0.1, 1.0, 1.0]);
        assert_eq!(objectives[0].loss, HeadLoss::CrossEntropy);
        assert_eq!(
            objectives[2].metric,
            HeadMetric::NearestNeighbor { table: 0, similarity: Similarity::Euclidean }
        );
    }

    #[test]
    fn nearest_neighbour_scenario() {
        let table = one_hot_table().to_tensor(&Device::Cpu).unwrap();
        let pred = Tensor::new(&[[0.9f32, 0.1, 0.0, 0.0]], &Device::Cpu).unwrap();
        for sim in [Similarity::Euclidean, Similarity::DotProduct] {
            assert_eq!(nn_accuracy(&pred, &[0], &table, sim).unwrap(), 1.0);
            assert_eq!(nn_accuracy(&pred, &[1], &table, sim).unwrap(), 0.0);
        }

        let rows = [[0.1f32, 0.2, 0.7, 0.0], [0.0, 0.6, 0.5, 0.0]];
        let pred = Tensor::new(&rows, &Device::Cpu).unwrap();
        assert_eq!(nn_accuracy(&pred, &[2, 2], &table, Similarity::Euclidean).unwrap(), 0.5);
        assert_eq!(nn_accuracy(&pred, &[2, 1], &table, Similarity::DotProduct).unwrap(), 1.0);
    }

    #[test]
    fn exact_table_rows_score_perfectly() {
        let embedding = ClassEmbedding::from_rows(
            (0..4).map(ClassLabel::Index).collect(),
            vec![
                vec![0.3, -1.2, 0.5],
                vec![2.0, 0.1, 0.0],
                vec![-0.7, 0.4, 1.1],
                vec![0.0, 0.0, -2.0],
            ],
        )
        .unwrap();
        let table = embedding.to_tensor(&Device::Cpu).unwrap();
        let labels = [2u32, 0, 3, 1, 1];
        let pred = embedding.gather(&labels, &Device::Cpu).unwrap();
        assert_eq!(nn_accuracy(&pred, &labels, &table, Similarity::Euclidean).unwrap(), 1.0);
        assert_eq!(nn_accuracy(&pred, &labels, &table, Similarity::DotProduct).unwrap(), 1.0);
    }

    #[test]
    fn transform_and_total_loss_agree_with_head_layout() {
        let cfg = LossConfig { embedding_loss: EmbeddingLoss::SquaredDistance, cls_weight: 0.5 };
        let objectives = compose(&ensemble_heads(), &cfg);
        let transform = target_transform(&objectives, Arc::new(vec![one_hot_table()]));

        let mut batch = Batch::new(
            Tensor::zeros((2, 3, 1, 1), DType::F32, &Device::Cpu).unwrap(),
            vec![0, 2],
            vec![10, 11],
        );
        transform(&mut batch).unwrap();
        assert_eq!(batch.targets.len(), 3);
        assert!(matches!(batch.targets[0], HeadTarget::Classes(_)));
        assert_eq!(batch.targets[2].tensor().dims(), &[2, 4]);

        // uniform logits: CE = ln 3 per classification head
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let probs = candle_nn::ops::softmax_last_dim(&logits).unwrap();
        let rows = [[1.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]];
        let embedding = Tensor::new(&rows, &Device::Cpu).unwrap();
        let outputs = ModelOutputs {
            heads: vec![
                HeadOutput { value: probs.clone(), logits: Some(logits.clone()) },
                HeadOutput { value: probs, logits: Some(logits) },
                HeadOutput { value: embedding.clone(), logits: None },
            ],
            features: embedding,
        };
        let breakdown = total_loss(&objectives, &outputs, &batch.targets, None).unwrap();
        let ln3 = 3f64.ln();
        // squared distances: 0 and 1 → mean 0.5
        let expected = 0.5 * ln3 + ln3 + 0.5;
        assert!((scalar(&breakdown.total).unwrap() - expected).abs() < 1e-5);
        assert!((scalar(&breakdown.heads[2]).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn loss_names_parse() {
        assert_eq!("mse".parse::<EmbeddingLoss>().unwrap(), EmbeddingLoss::SquaredDistance);
        assert_eq!("INV_CORR".parse::<EmbeddingLoss>().unwrap(), EmbeddingLoss::InvCorrelation);
        assert!(matches!("l1".parse::<EmbeddingLoss>(), Err(Error::Config(_))));
    }
}
