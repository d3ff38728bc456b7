/* ------------------------------------------------------------------ */
/* Tensor primitives: embedding losses, distances, clipping           */
/* ------------------------------------------------------------------ */

use candle_core::{Result, Tensor, D};

const L2_EPS: f64 = 1e-12;

// Rows scaled to unit L2 norm: x / sqrt(|x|² + eps)
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let sq = x.sqr()?.sum_keepdim(D::Minus1)?;
    let norm = sq.affine(1.0, L2_EPS)?.sqrt()?;
    x.broadcast_div(&norm)
}

// Per-sample squared Euclidean distance: Σ_j (t_j - p_j)²  → [B]
pub fn squared_distance(target: &Tensor, pred: &Tensor) -> Result<Tensor> {
    target.sub(pred)?.sqr()?.sum(D::Minus1)
}

// Per-sample negated similarity: 1 - Σ_j t_j p_j  → [B]
pub fn inv_correlation(target: &Tensor, pred: &Tensor) -> Result<Tensor> {
    target.mul(pred)?.sum(D::Minus1)?.affine(-1.0, 1.0)
}

// Pairwise squared distances between predictions [B, D] and table rows
// [K, D]:  |p|² + |t|² - 2 p·tᵀ  → [B, K]
pub fn pairwise_sq_distances(pred: &Tensor, table: &Tensor) -> Result<Tensor> {
    let p_norm = pred.sqr()?.sum_keepdim(1)?;
    let t_norm = table.sqr()?.sum(1)?.unsqueeze(0)?;
    let dot = pred.matmul(&table.t()?)?;
    p_norm.broadcast_add(&t_norm)?.sub(&dot.affine(2.0, 0.0)?)
}

// Fraction of rows whose argmax matches the label.
pub fn accuracy(scores: &Tensor, labels: &[u32]) -> Result<f64> {
    let preds: Vec<u32> = scores.argmax(D::Minus1)?.to_vec1()?;
    Ok(match_fraction(&preds, labels))
}

pub fn match_fraction(preds: &[u32], labels: &[u32]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let hits = preds.iter().zip(labels).filter(|(p, l)| p == l).count();
    hits as f64 / labels.len() as f64
}

// Gradient clipping: L2 norm clip, one tensor at a time
pub fn clip_by_norm(grad: &Tensor, max_norm: f64) -> Result<Tensor> {
    let norm =
        grad.sqr()?.sum_all()?.sqrt()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    if norm > max_norm {
        grad.affine(max_norm / norm, 0.0)
    } else {
        Ok(grad.clone())
    }
}

// coeff · Σ_w Σ w²
pub fn l2_penalty(weights: &[Tensor], coeff: f64) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for w in weights {
        let term = w.sqr()?.sum_all()?;
        total = Some(match total {
            Some(acc) => acc.add(&term)?,
            None => term,
        });
    }
    total.map(|t| t.affine(coeff, 0.0)).transpose()
}
