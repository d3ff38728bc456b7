/* ------------------------------------------------------------------ */
/* Ensemble: one classifier + N embedding networks, fused by softmax  */
/* ------------------------------------------------------------------ */
//
//   image ─┬─ cnn0 ──► (features, logits) ──► cnn0 prob
//          ├─ cnn1 ──► e1
//          ├─ ...
//          └─ cnnN ──► eN
//   concat[features, e1..eN] ─► batch norm ─► dense ─► softmax ("prob")
//
// Outputs, in order: [prob, cnn0, cnn1, .., cnnN]. The concatenation is
// the model's feature tensor.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Linear, VarBuilder};

use crate::error::{Error, Result};
use crate::model::{HeadOutput, ModelDescriptor, ModelOutputs, MultiHeadModel};
use crate::network::{Network, OutputMode};
use crate::ops;

pub struct Ensemble {
    descriptor: ModelDescriptor,
    classifier: Network,
    embedders: Vec<Network>,
    l2_normalize: bool,
    fuse_norm: BatchNorm,
    fuse_dense: Linear,
}

impl Ensemble {
    pub fn new(descriptor: ModelDescriptor, vb: VarBuilder) -> Result<Self> {
        let ModelDescriptor::Ensemble { architecture, num_classes, embedding_dims, l2_normalize } =
            &descriptor
        else {
            return Err(Error::config("not an ensemble descriptor"));
        };

        let classifier =
            Network::build(*architecture, *num_classes, OutputMode::Classification, vb.pp("cnn0"))?;
        let embedders = embedding_dims
            .iter()
            .enumerate()
            .map(|(i, &dim)| {
                let vb = vb.pp(format!("cnn{}", i + 1));
                Network::build(*architecture, dim, OutputMode::Embedding, vb)
            })
            .collect::<Result<Vec<_>>>()?;

        let concat_dim = descriptor.feature_dim();
        let fuse_norm =
            batch_norm(concat_dim, candle_nn::BatchNormConfig::default(), vb.pp("concat_bn"))?;
        let fuse_dense = linear(concat_dim, *num_classes, vb.pp("prob"))?;
        let l2_normalize = *l2_normalize;

        Ok(Self { descriptor, classifier, embedders, l2_normalize, fuse_norm, fuse_dense })
    }
}

impl MultiHeadModel for Ensemble {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> Result<ModelOutputs> {
        let cls = self.classifier.forward_t(images, train)?;
        let cls_prob = candle_nn::ops::softmax_last_dim(&cls.output)?;

        let mut embeddings = Vec::with_capacity(self.embedders.len());
        for net in &self.embedders {
            let e = net.forward_t(images, train)?.output;
            embeddings.push(if self.l2_normalize { ops::l2_normalize(&e)? } else { e });
        }

        let mut parts = Vec::with_capacity(1 + embeddings.len());
        parts.push(cls.features);
        parts.extend(embeddings.iter().cloned());
        let concat = Tensor::cat(&parts, 1)?;

        let fused_logits = self.fuse_dense.forward(&self.fuse_norm.forward_t(&concat, train)?)?;
        let fused_prob = candle_nn::ops::softmax_last_dim(&fused_logits)?;

        let mut heads = Vec::with_capacity(2 + embeddings.len());
        heads.push(HeadOutput { value: fused_prob, logits: Some(fused_logits) });
        heads.push(HeadOutput { value: cls_prob, logits: Some(cls.output) });
        heads.extend(embeddings.into_iter().map(|value| HeadOutput { value, logits: None }));

        Ok(ModelOutputs { heads, features: concat })
    }

    fn regularized_weights(&self) -> Vec<Tensor> {
        let mut weights = self.classifier.regularized_weights();
        for net in &self.embedders {
            weights.extend(net.regularized_weights());
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeadKind;
    use crate::network::Architecture;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::Ensemble {
            architecture: Architecture::ResNet { depth: 8 },
            num_classes: 5,
            embedding_dims: vec![3, 7],
            l2_normalize: false,
        }
    }

    #[test]
    fn outputs_are_fused_then_classifier_then_embeddings() {
        let desc = descriptor();
        let names: Vec<String> = desc.head_specs().into_iter().map(|h| h.name).collect();
        assert_eq!(names, ["prob", "cnn0", "cnn1", "cnn2"]);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = desc.build(vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let out = model.forward_t(&x, true).unwrap();

        assert_eq!(out.heads.len(), 4);
        assert_eq!(out.heads[0].value.dims(), &[2, 5]);
        assert_eq!(out.heads[1].value.dims(), &[2, 5]);
        assert_eq!(out.heads[2].value.dims(), &[2, 3]);
        assert_eq!(out.heads[3].value.dims(), &[2, 7]);
        assert!(out.heads[0].logits.is_some() && out.heads[1].logits.is_some());
        assert!(out.heads[2].logits.is_none() && out.heads[3].logits.is_none());
        // 64 pooled classifier features + 3 + 7
        assert_eq!(out.features.dims(), &[2, 74]);
    }

    #[test]
    fn embedding_heads_point_at_their_tables() {
        let specs = descriptor().head_specs();
        assert_eq!(specs[0].kind, HeadKind::Classification { num_classes: 5, primary: true });
        assert_eq!(specs[1].kind, HeadKind::Classification { num_classes: 5, primary: false });
        assert_eq!(specs[2].kind, HeadKind::Embedding { table: 0, dim: 3 });
        assert_eq!(specs[3].kind, HeadKind::Embedding { table: 1, dim: 7 });
    }

    #[test]
    fn sub_networks_get_their_own_variables() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        descriptor().build(vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for prefix in ["cnn0.", "cnn1.", "cnn2.", "concat_bn.", "prob."] {
            assert!(data.keys().any(|k| k.starts_with(prefix)), "{prefix}");
        }
    }
}
