/* ------------------------------------------------------------------ */
/* Class embedding table: loading and nearest-neighbour lookup        */
/* ------------------------------------------------------------------ */
//
// File format (JSON):
//   {
//     "ind2label": { "0": <label>, "1": <label>, ... },
//     "embedding": [[f32; D], [f32; D], ...]        // row i ↔ class index i
//   }
//
// A label is either an integer (the dataset's native class index) or a
// string (the dataset's class name). Indices must cover 0..K exactly.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassLabel {
    Index(u64),
    Name(String),
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLabel::Index(i) => write!(f, "{i}"),
            ClassLabel::Name(s) => f.write_str(s),
        }
    }
}

/// How predicted embeddings are compared against table rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Similarity {
    /// Closest row by squared Euclidean distance.
    Euclidean,
    /// Row with the largest dot product.
    DotProduct,
}

#[derive(Deserialize)]
struct EmbeddingRecord {
    ind2label: BTreeMap<String, ClassLabel>,
    embedding: Vec<Vec<f32>>,
}

/// Immutable class → vector table. Row `i` belongs to class index `i`.
#[derive(Debug, Clone)]
pub struct ClassEmbedding {
    labels: Vec<ClassLabel>,
    rows: Vec<f32>,
    dim: usize,
}

impl ClassEmbedding {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Deserialize {
            path: path.to_path_buf(),
            source: serde_json::Error::io(e),
        })?;
        let record: EmbeddingRecord =
            serde_json::from_str(&raw).map_err(|source| Error::Deserialize {
                path: path.to_path_buf(),
                source,
            })?;

        let n = record.ind2label.len();
        let mut labels: Vec<Option<ClassLabel>> = vec![None; n];
        for (key, label) in record.ind2label {
            let idx: usize = key.trim().parse().map_err(|_| Error::Embedding {
                path: path.to_path_buf(),
                reason: format!("class index {key:?} is not a non-negative integer"),
            })?;
            let slot = labels.get_mut(idx).ok_or_else(|| Error::Embedding {
                path: path.to_path_buf(),
                reason: format!("class index {idx} out of range for {n} labels"),
            })?;
            if slot.replace(label).is_some() {
                return Err(Error::Embedding {
                    path: path.to_path_buf(),
                    reason: format!("class index {idx} appears twice"),
                });
            }
        }
        // n distinct indices, all below n: every slot is filled.
        let labels: Vec<ClassLabel> = labels.into_iter().flatten().collect();

        Self::from_rows(labels, record.embedding).map_err(|e| match e {
            Error::Embedding { reason, .. } => {
                Error::Embedding { path: path.to_path_buf(), reason }
            }
            other => other,
        })
    }

    pub fn from_rows(labels: Vec<ClassLabel>, rows: Vec<Vec<f32>>) -> Result<Self> {
        let malformed = |reason: String| Error::Embedding { path: Default::default(), reason };

        if labels.is_empty() {
            return Err(malformed("table has no classes".into()));
        }
        if labels.len() != rows.len() {
            return Err(malformed(format!(
                "{} labels but {} embedding rows",
                labels.len(),
                rows.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = labels.iter().find(|l| !seen.insert(*l)) {
            return Err(malformed(format!("label {dup} appears twice")));
        }
        let dim = rows[0].len();
        if dim == 0 {
            return Err(malformed("embedding rows are empty".into()));
        }
        if let Some(i) = rows.iter().position(|r| r.len() != dim) {
            return Err(malformed(format!(
                "row {i} has {} values, expected {dim}",
                rows[i].len()
            )));
        }
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(malformed("table contains non-finite values".into()));
        }

        Ok(Self { labels, rows: rows.concat(), dim })
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn labels(&self) -> &[ClassLabel] {
        &self.labels
    }

    pub fn row(&self, class: usize) -> &[f32] {
        &self.rows[class * self.dim..(class + 1) * self.dim]
    }

    /// Whole table as a `[K, D]` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.rows, (self.num_classes(), self.dim), device)?)
    }

    /// Rows for the given class indices as a `[B, D]` tensor.
    pub fn gather(&self, classes: &[u32], device: &Device) -> Result<Tensor> {
        let mut out = Vec::with_capacity(classes.len() * self.dim);
        for &c in classes {
            let c = c as usize;
            if c >= self.num_classes() {
                return Err(Error::Dataset(format!(
                    "label {c} has no embedding ({} classes)",
                    self.num_classes()
                )));
            }
            out.extend_from_slice(self.row(c));
        }
        Ok(Tensor::from_vec(out, (classes.len(), self.dim), device)?)
    }
}
