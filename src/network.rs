/* ------------------------------------------------------------------ */
/* Convolutional backbones and the network builder                    */
/* ------------------------------------------------------------------ */
//
// Identifiers (case-insensitive):
//   simple                  4 × (conv3x3-BN-ReLU), 2x2 max pool between stages
//   resnet-<d>              (d-2)%6 == 0, CIFAR basic blocks, 16/32/64 channels
//   wrn-<d>-<w>             (d-4)%6 == 0, pre-activation, 16w/32w/64w channels
//
// Every backbone ends in global average pooling (the "feature" layer)
// followed by a dense projection to the requested output size.

use std::fmt;
use std::str::FromStr;

use candle_core::{Module, ModuleT, Result as CandleResult, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ARCHITECTURES: &[&str] = &["simple", "resnet-32", "resnet-110", "wrn-28-10"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Architecture {
    Simple,
    ResNet { depth: usize },
    WideResNet { depth: usize, width: usize },
}

impl Architecture {
    /// Size of the pooled feature vector in front of the final projection.
    pub fn feature_dim(&self) -> usize {
        match self {
            Self::Simple => 512,
            Self::ResNet { .. } => 64,
            Self::WideResNet { width, .. } => 64 * width,
        }
    }
}

fn bad_architecture(s: &str) -> Error {
    Error::config(format!(
        "unknown architecture {s:?} (e.g. {})",
        ARCHITECTURES.join(", ")
    ))
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let parts: Vec<&str> = lower.split('-').collect();
        let num = |p: &str| p.parse::<usize>().map_err(|_| bad_architecture(s));

        match parts.as_slice() {
            ["simple"] => Ok(Self::Simple),
            ["resnet", depth] => {
                let depth = num(*depth)?;
                if depth < 8 || (depth - 2) % 6 != 0 {
                    return Err(Error::config(format!(
                        "resnet depth must be 6n+2 with n >= 1, got {depth}"
                    )));
                }
                Ok(Self::ResNet { depth })
            }
            ["wrn", depth, width] => {
                let (depth, width) = (num(*depth)?, num(*width)?);
                if depth < 10 || (depth - 4) % 6 != 0 {
                    return Err(Error::config(format!(
                        "wide resnet depth must be 6n+4 with n >= 1, got {depth}"
                    )));
                }
                if width == 0 {
                    return Err(Error::config("wide resnet width must be positive"));
                }
                Ok(Self::WideResNet { depth, width })
            }
            _ => Err(bad_architecture(s)),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::ResNet { depth } => write!(f, "resnet-{depth}"),
            Self::WideResNet { depth, width } => write!(f, "wrn-{depth}-{width}"),
        }
    }
}

impl TryFrom<String> for Architecture {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Architecture> for String {
    fn from(a: Architecture) -> String {
        a.to_string()
    }
}

/// Which layer an auxiliary classifier reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureTap {
    /// The final embedding output.
    #[default]
    Embedding,
    /// The architecture's pooled feature layer.
    Features,
}

impl FromStr for FeatureTap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedding" | "l2norm" => Ok(Self::Embedding),
            "features" | "feature" | "pool4" | "global_pool" => Ok(Self::Features),
            other => Err(Error::config(format!(
                "unknown classifier base layer {other:?} (expected \"embedding\" or \"features\")"
            ))),
        }
    }
}

impl fmt::Display for FeatureTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Embedding => "embedding",
            Self::Features => "features",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Output is the raw projection (an embedding vector).
    Embedding,
    /// Output is class logits; probabilities are their softmax.
    Classification,
}

pub struct NetworkOutput {
    /// Pooled feature vector `[B, feature_dim]`.
    pub features: Tensor,
    /// Final projection `[B, out_dim]`.
    pub output: Tensor,
}

/* ------------------------------------------------------------------ */
/* Building blocks                                                    */
/* ------------------------------------------------------------------ */

fn conv3x3(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> CandleResult<Conv2d> {
    let cfg = Conv2dConfig { padding: 1, stride, ..Default::default() };
    conv2d_no_bias(c_in, c_out, 3, cfg, vb)
}

fn conv1x1(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> CandleResult<Conv2d> {
    let cfg = Conv2dConfig { stride, ..Default::default() };
    conv2d_no_bias(c_in, c_out, 1, cfg, vb)
}

fn bn(channels: usize, vb: VarBuilder) -> CandleResult<BatchNorm> {
    batch_norm(channels, candle_nn::BatchNormConfig::default(), vb)
}

fn global_pool(x: &Tensor) -> CandleResult<Tensor> {
    x.mean((2, 3))
}

trait Backbone: Send + Sync {
    /// Image batch `[B, 3, H, W]` → pooled features `[B, F]`.
    fn features(&self, x: &Tensor, train: bool) -> CandleResult<Tensor>;
    /// Convolution kernels subject to weight decay.
    fn kernels(&self, out: &mut Vec<Tensor>);
}

// ── simple ────────────────────────────────────────────────────────────────

struct SimpleNet {
    stages: Vec<(Conv2d, BatchNorm)>,
}

impl SimpleNet {
    const CHANNELS: [usize; 4] = [64, 128, 256, 512];

    fn new(vb: VarBuilder) -> CandleResult<Self> {
        let mut stages = Vec::with_capacity(Self::CHANNELS.len());
        let mut c_in = 3;
        for (i, &c_out) in Self::CHANNELS.iter().enumerate() {
            let vb = vb.pp(format!("conv{}", i + 1));
            stages.push((conv3x3(c_in, c_out, 1, vb.pp("conv"))?, bn(c_out, vb.pp("bn"))?));
            c_in = c_out;
        }
        Ok(Self { stages })
    }
}

impl Backbone for SimpleNet {
    fn features(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mut h = x.clone();
        for (i, (conv, norm)) in self.stages.iter().enumerate() {
            if i > 0 {
                h = h.max_pool2d(2)?;
            }
            h = norm.forward_t(&conv.forward(&h)?, train)?.relu()?;
        }
        global_pool(&h)
    }

    fn kernels(&self, out: &mut Vec<Tensor>) {
        out.extend(self.stages.iter().map(|(conv, _)| conv.weight().clone()));
    }
}

// ── resnet-<d> ────────────────────────────────────────────────────────────

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    shortcut: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> CandleResult<Self> {
        let shortcut = if stride != 1 || c_in != c_out {
            let conv = conv1x1(c_in, c_out, stride, vb.pp("shortcut"))?;
            Some((conv, bn(c_out, vb.pp("shortcut_bn"))?))
        } else {
            None
        };
        Ok(Self {
            conv1: conv3x3(c_in, c_out, stride, vb.pp("conv1"))?,
            bn1: bn(c_out, vb.pp("bn1"))?,
            conv2: conv3x3(c_out, c_out, 1, vb.pp("conv2"))?,
            bn2: bn(c_out, vb.pp("bn2"))?,
            shortcut,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let h = self.bn1.forward_t(&self.conv1.forward(x)?, train)?.relu()?;
        let h = self.bn2.forward_t(&self.conv2.forward(&h)?, train)?;
        let skip = match &self.shortcut {
            Some((conv, norm)) => norm.forward_t(&conv.forward(x)?, train)?,
            None => x.clone(),
        };
        (h + skip)?.relu()
    }

    fn kernels(&self, out: &mut Vec<Tensor>) {
        out.push(self.conv1.weight().clone());
        out.push(self.conv2.weight().clone());
        if let Some((conv, _)) = &self.shortcut {
            out.push(conv.weight().clone());
        }
    }
}

struct ResNet {
    stem: Conv2d,
    stem_bn: BatchNorm,
    blocks: Vec<BasicBlock>,
}

impl ResNet {
    fn new(depth: usize, vb: VarBuilder) -> CandleResult<Self> {
        let n = (depth - 2) / 6;
        let mut blocks = Vec::with_capacity(3 * n);
        let mut c_in = 16;
        for (stage, c_out) in [16usize, 32, 64].into_iter().enumerate() {
            for b in 0..n {
                let stride = if stage > 0 && b == 0 { 2 } else { 1 };
                let vb = vb.pp(format!("stage{}", stage + 1)).pp(format!("block{}", b + 1));
                blocks.push(BasicBlock::new(c_in, c_out, stride, vb)?);
                c_in = c_out;
            }
        }
        let stem = conv3x3(3, 16, 1, vb.pp("stem"))?;
        Ok(Self { stem, stem_bn: bn(16, vb.pp("stem_bn"))?, blocks })
    }
}

impl Backbone for ResNet {
    fn features(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mut h = self.stem_bn.forward_t(&self.stem.forward(x)?, train)?.relu()?;
        for block in &self.blocks {
            h = block.forward_t(&h, train)?;
        }
        global_pool(&h)
    }

    fn kernels(&self, out: &mut Vec<Tensor>) {
        out.push(self.stem.weight().clone());
        self.blocks.iter().for_each(|b| b.kernels(out));
    }
}

// ── wrn-<d>-<w> ───────────────────────────────────────────────────────────

struct PreActBlock {
    bn1: BatchNorm,
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
}

impl PreActBlock {
    fn new(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> CandleResult<Self> {
        let shortcut = if stride != 1 || c_in != c_out {
            Some(conv1x1(c_in, c_out, stride, vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            bn1: bn(c_in, vb.pp("bn1"))?,
            conv1: conv3x3(c_in, c_out, stride, vb.pp("conv1"))?,
            bn2: bn(c_out, vb.pp("bn2"))?,
            conv2: conv3x3(c_out, c_out, 1, vb.pp("conv2"))?,
            shortcut,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let pre = self.bn1.forward_t(x, train)?.relu()?;
        let h = self.conv1.forward(&pre)?;
        let h = self.conv2.forward(&self.bn2.forward_t(&h, train)?.relu()?)?;
        // Projection shortcuts read the pre-activated input.
        let skip = match &self.shortcut {
            Some(conv) => conv.forward(&pre)?,
            None => x.clone(),
        };
        h + skip
    }

    fn kernels(&self, out: &mut Vec<Tensor>) {
        out.push(self.conv1.weight().clone());
        out.push(self.conv2.weight().clone());
        if let Some(conv) = &self.shortcut {
            out.push(conv.weight().clone());
        }
    }
}

struct WideResNet {
    stem: Conv2d,
    blocks: Vec<PreActBlock>,
    final_bn: BatchNorm,
}

impl WideResNet {
    fn new(depth: usize, width: usize, vb: VarBuilder) -> CandleResult<Self> {
        let n = (depth - 4) / 6;
        let mut blocks = Vec::with_capacity(3 * n);
        let mut c_in = 16;
        for (stage, base) in [16usize, 32, 64].into_iter().enumerate() {
            let c_out = base * width;
            for b in 0..n {
                let stride = if stage > 0 && b == 0 { 2 } else { 1 };
                let vb = vb.pp(format!("stage{}", stage + 1)).pp(format!("block{}", b + 1));
                blocks.push(PreActBlock::new(c_in, c_out, stride, vb)?);
                c_in = c_out;
            }
        }
        Ok(Self {
            stem: conv3x3(3, 16, 1, vb.pp("stem"))?,
            blocks,
            final_bn: bn(c_in, vb.pp("final_bn"))?,
        })
    }
}

impl Backbone for WideResNet {
    fn features(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mut h = self.stem.forward(x)?;
        for block in &self.blocks {
            h = block.forward_t(&h, train)?;
        }
        global_pool(&self.final_bn.forward_t(&h, train)?.relu()?)
    }

    fn kernels(&self, out: &mut Vec<Tensor>) {
        out.push(self.stem.weight().clone());
        self.blocks.iter().for_each(|b| b.kernels(out));
    }
}

/* ------------------------------------------------------------------ */
/* Network                                                            */
/* ------------------------------------------------------------------ */

pub struct Network {
    backbone: Box<dyn Backbone>,
    head: Linear,
}

impl Network {
    /// Assemble `architecture` with a final projection to `out_dim`.
    /// Variables live under `vb`'s prefix.
    pub fn build(
        architecture: Architecture,
        out_dim: usize,
        mode: OutputMode,
        vb: VarBuilder,
    ) -> Result<Self> {
        if out_dim == 0 {
            return Err(Error::config("network output dimensionality must be positive"));
        }
        let backbone: Box<dyn Backbone> = match architecture {
            Architecture::Simple => Box::new(SimpleNet::new(vb.pp("backbone"))?),
            Architecture::ResNet { depth } => Box::new(ResNet::new(depth, vb.pp("backbone"))?),
            Architecture::WideResNet { depth, width } => {
                Box::new(WideResNet::new(depth, width, vb.pp("backbone"))?)
            }
        };
        let name = match mode {
            OutputMode::Embedding => "embedding",
            OutputMode::Classification => "logits",
        };
        let head = linear(architecture.feature_dim(), out_dim, vb.pp(name))?;
        Ok(Self { backbone, head })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> CandleResult<NetworkOutput> {
        let features = self.backbone.features(x, train)?;
        let output = self.head.forward(&features)?;
        Ok(NetworkOutput { features, output })
    }

    /// Convolution and dense kernels that carry the L2 penalty.
    pub fn regularized_weights(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.backbone.kernels(&mut out);
        out.push(self.head.weight().clone());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn output_shape(arch: &str, out_dim: usize, mode: OutputMode) -> (Vec<usize>, Vec<usize>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = Network::build(arch.parse().unwrap(), out_dim, mode, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let out = net.forward_t(&x, true).unwrap();
        (out.features.dims().to_vec(), out.output.dims().to_vec())
    }

    #[test]
    fn output_dims_match_request() {
        assert_eq!(output_shape("simple", 5, OutputMode::Embedding), (vec![2, 512], vec![2, 5]));
        assert_eq!(
            output_shape("resnet-8", 7, OutputMode::Classification),
            (vec![2, 64], vec![2, 7])
        );
        assert_eq!(output_shape("WRN-10-1", 3, OutputMode::Embedding), (vec![2, 64], vec![2, 3]));
    }

    #[test]
    fn identifiers_parse_and_print() {
        for name in ARCHITECTURES {
            let arch: Architecture = name.parse().unwrap();
            assert_eq!(arch.to_string(), *name);
        }
        assert_eq!("wrn-28-10".parse::<Architecture>().unwrap().feature_dim(), 640);
    }

    #[test]
    fn bad_identifiers_are_config_errors() {
        for name in ["vgg", "resnet-33", "resnet", "wrn-28", "wrn-27-2", "wrn-28-0", "resnet-x"] {
            assert!(matches!(name.parse::<Architecture>(), Err(Error::Config(_))), "{name}");
        }
        assert!(matches!("conv3".parse::<FeatureTap>(), Err(Error::Config(_))));
    }

    #[test]
    fn regularized_weights_cover_every_kernel() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let arch = Architecture::ResNet { depth: 8 };
        let net = Network::build(arch, 4, OutputMode::Embedding, vb).unwrap();
        // stem + 3 blocks × 2 convs + 2 projection shortcuts + dense
        assert_eq!(net.regularized_weights().len(), 1 + 6 + 2 + 1);
    }

    #[test]
    fn architecture_round_trips_through_serde() {
        let arch = Architecture::WideResNet { depth: 16, width: 4 };
        let json = serde_json::to_string(&arch).unwrap();
        assert_eq!(json, "\"wrn-16-4\"");
        assert_eq!(serde_json::from_str::<Architecture>(&json).unwrap(), arch);
    }
}
