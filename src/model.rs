/* ------------------------------------------------------------------ */
/* Model descriptors, head layout and the embedding model             */
/* ------------------------------------------------------------------ */
//
// A model is an ordered list of output heads plus one "feature" tensor
// (what the feature dump writes). The descriptor is the serializable
// recipe: it is stored in every checkpoint so a run can be rebuilt.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::L2_PENALTY;
use crate::ensemble::Ensemble;
use crate::error::{Error, Result};
use crate::network::{Architecture, FeatureTap, Network, OutputMode};
use crate::ops;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierHead {
    pub num_classes: usize,
    pub base: FeatureTap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelDescriptor {
    /// One network mapping images onto class embeddings, optionally with
    /// an auxiliary softmax head.
    Embedding {
        architecture: Architecture,
        embedding_dim: usize,
        l2_normalize: bool,
        classifier: Option<ClassifierHead>,
    },
    /// Classification network `cnn0` plus embedding networks `cnn1..N`
    /// fused by a softmax over their concatenation.
    Ensemble {
        architecture: Architecture,
        num_classes: usize,
        embedding_dims: Vec<usize>,
        l2_normalize: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeadKind {
    /// Class probabilities. The primary head's loss is weighted by
    /// `cls_weight`, every other classification head by 1.
    Classification { num_classes: usize, primary: bool },
    /// Embedding regression against class table `table`.
    Embedding { table: usize, dim: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadSpec {
    pub name: String,
    pub kind: HeadKind,
}

pub struct HeadOutput {
    /// Probabilities (classification) or the predicted embedding.
    pub value: Tensor,
    /// Pre-softmax scores for classification heads.
    pub logits: Option<Tensor>,
}

pub struct ModelOutputs {
    pub heads: Vec<HeadOutput>,
    pub features: Tensor,
}

pub trait MultiHeadModel: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    fn forward_t(&self, images: &Tensor, train: bool) -> Result<ModelOutputs>;

    /// Kernels carrying the L2 penalty.
    fn regularized_weights(&self) -> Vec<Tensor>;

    fn penalty(&self) -> Result<Option<Tensor>> {
        Ok(ops::l2_penalty(&self.regularized_weights(), L2_PENALTY)?)
    }
}

impl ModelDescriptor {
    pub fn architecture(&self) -> Architecture {
        match self {
            Self::Embedding { architecture, .. } | Self::Ensemble { architecture, .. } => {
                *architecture
            }
        }
    }

    pub fn l2_normalize(&self) -> bool {
        match self {
            Self::Embedding { l2_normalize, .. } | Self::Ensemble { l2_normalize, .. } => {
                *l2_normalize
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Embedding { embedding_dim, classifier, .. } => {
                if *embedding_dim == 0 {
                    return Err(Error::config("embedding dimensionality must be positive"));
                }
                if classifier.as_ref().is_some_and(|c| c.num_classes < 2) {
                    return Err(Error::config("a classifier needs at least two classes"));
                }
            }
            Self::Ensemble { num_classes, embedding_dims, .. } => {
                if *num_classes < 2 {
                    return Err(Error::config("the ensemble needs at least two classes"));
                }
                if embedding_dims.is_empty() {
                    return Err(Error::config("the ensemble needs at least one embedding"));
                }
                if embedding_dims.contains(&0) {
                    return Err(Error::config("embedding dimensionality must be positive"));
                }
            }
        }
        Ok(())
    }

    /// Output heads in model order.
    pub fn head_specs(&self) -> Vec<HeadSpec> {
        match self {
            Self::Embedding { embedding_dim, l2_normalize, classifier, .. } => {
                let name = if *l2_normalize { "l2norm" } else { "embedding" };
                let mut heads = vec![HeadSpec {
                    name: name.into(),
                    kind: HeadKind::Embedding { table: 0, dim: *embedding_dim },
                }];
                if let Some(c) = classifier {
                    heads.push(HeadSpec {
                        name: "prob".into(),
                        kind: HeadKind::Classification {
                            num_classes: c.num_classes,
                            primary: true,
                        },
                    });
                }
                heads
            }
            Self::Ensemble { num_classes, embedding_dims, .. } => {
                let mut heads = vec![
                    HeadSpec {
                        name: "prob".into(),
                        kind: HeadKind::Classification {
                            num_classes: *num_classes,
                            primary: true,
                        },
                    },
                    HeadSpec {
                        name: "cnn0".into(),
                        kind: HeadKind::Classification {
                            num_classes: *num_classes,
                            primary: false,
                        },
                    },
                ];
                heads.extend(embedding_dims.iter().enumerate().map(|(i, &dim)| HeadSpec {
                    name: format!("cnn{}", i + 1),
                    kind: HeadKind::Embedding { table: i, dim },
                }));
                heads
            }
        }
    }

    /// Width of the feature tensor the model exposes for dumping.
    pub fn feature_dim(&self) -> usize {
        match self {
            Self::Embedding { embedding_dim, .. } => *embedding_dim,
            Self::Ensemble { architecture, embedding_dims, .. } => {
                architecture.feature_dim() + embedding_dims.iter().sum::<usize>()
            }
        }
    }

    /// Instantiate the model with variables created through `vb`.
    pub fn build(&self, vb: VarBuilder) -> Result<Box<dyn MultiHeadModel>> {
        self.validate()?;
        match self {
            Self::Embedding { .. } => Ok(Box::new(EmbeddingModel::new(self.clone(), vb)?)),
            Self::Ensemble { .. } => Ok(Box::new(Ensemble::new(self.clone(), vb)?)),
        }
    }
}

/* ------------------------------------------------------------------ */
/* Embedding model                                                    */
/* ------------------------------------------------------------------ */

// relu → batch norm → dense → softmax, on top of the chosen tap
struct AuxClassifier {
    base: FeatureTap,
    norm: BatchNorm,
    dense: Linear,
}

pub struct EmbeddingModel {
    descriptor: ModelDescriptor,
    network: Network,
    l2_normalize: bool,
    classifier: Option<AuxClassifier>,
}

impl EmbeddingModel {
    pub fn new(descriptor: ModelDescriptor, vb: VarBuilder) -> Result<Self> {
        let ModelDescriptor::Embedding { architecture, embedding_dim, l2_normalize, classifier } =
            &descriptor
        else {
            return Err(Error::config("not an embedding model descriptor"));
        };

        let network =
            Network::build(*architecture, *embedding_dim, OutputMode::Embedding, vb.clone())?;
        let classifier = match classifier {
            Some(head) => {
                let in_dim = match head.base {
                    FeatureTap::Embedding => *embedding_dim,
                    FeatureTap::Features => architecture.feature_dim(),
                };
                let vb = vb.pp("prob");
                Some(AuxClassifier {
                    base: head.base,
                    norm: batch_norm(in_dim, candle_nn::BatchNormConfig::default(), vb.pp("bn"))?,
                    dense: linear(in_dim, head.num_classes, vb.pp("dense"))?,
                })
            }
            None => None,
        };
        let l2_normalize = *l2_normalize;

        Ok(Self { descriptor, network, l2_normalize, classifier })
    }
}

impl MultiHeadModel for EmbeddingModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> Result<ModelOutputs> {
        let out = self.network.forward_t(images, train)?;
        let embedding = if self.l2_normalize {
            ops::l2_normalize(&out.output)?
        } else {
            out.output
        };

        let mut heads = vec![HeadOutput { value: embedding.clone(), logits: None }];
        if let Some(aux) = &self.classifier {
            let base = match aux.base {
                FeatureTap::Embedding => &embedding,
                FeatureTap::Features => &out.features,
            };
            let h = aux.norm.forward_t(&base.relu()?, train)?;
            let logits = aux.dense.forward(&h)?;
            let prob = candle_nn::ops::softmax_last_dim(&logits)?;
            heads.push(HeadOutput { value: prob, logits: Some(logits) });
        }

        Ok(ModelOutputs { heads, features: embedding })
    }

    fn regularized_weights(&self) -> Vec<Tensor> {
        let mut weights = self.network.regularized_weights();
        if let Some(aux) = &self.classifier {
            weights.push(aux.dense.weight().clone());
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn descriptor(classifier: Option<ClassifierHead>, l2_normalize: bool) -> ModelDescriptor {
        ModelDescriptor::Embedding {
            architecture: Architecture::ResNet { depth: 8 },
            embedding_dim: 6,
            l2_normalize,
            classifier,
        }
    }

    fn run(desc: &ModelDescriptor) -> ModelOutputs {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = desc.build(vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 3, 8, 8), &Device::Cpu).unwrap();
        model.forward_t(&x, true).unwrap()
    }

    #[test]
    fn plain_embedding_model_has_one_head() {
        let desc = descriptor(None, false);
        assert_eq!(desc.head_specs().len(), 1);
        let out = run(&desc);
        assert_eq!(out.heads.len(), 1);
        assert_eq!(out.heads[0].value.dims(), &[3, 6]);
        assert_eq!(out.features.dims(), &[3, 6]);
    }

    #[test]
    fn auxiliary_classifier_emits_probabilities() {
        for base in [FeatureTap::Embedding, FeatureTap::Features] {
            let desc = descriptor(Some(ClassifierHead { num_classes: 4, base }), true);
            let specs = desc.head_specs();
            assert_eq!(specs[0].name, "l2norm");
            assert_eq!(specs[1].kind, HeadKind::Classification { num_classes: 4, primary: true });

            let out = run(&desc);
            assert_eq!(out.heads[1].value.dims(), &[3, 4]);
            let sums: Vec<f32> = out.heads[1].value.sum(1).unwrap().to_vec1().unwrap();
            assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
            let norms: Vec<f32> =
            out.heads[0].value.sqr().unwrap().sum(1).unwrap().to_vec1().unwrap();
            assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4));
        }
    }

    #[test]
    fn descriptor_round_trips_through_json() {
        let head = ClassifierHead { num_classes: 10, base: FeatureTap::Features };
        let desc = descriptor(Some(head), false);
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"kind\":\"embedding\""));
        assert!(json.contains("\"resnet-8\""));
        assert_eq!(serde_json::from_str::<ModelDescriptor>(&json).unwrap(), desc);
    }

    #[test]
    fn zero_sized_embedding_is_rejected() {
        let desc = ModelDescriptor::Embedding {
            architecture: Architecture::Simple,
            embedding_dim: 0,
            l2_normalize: false,
            classifier: None,
        };
        assert!(matches!(desc.validate(), Err(Error::Config(_))));
    }
}
