/* ------------------------------------------------------------------ */
/* SGD with momentum, per-tensor clipping and time-based decay        */
/* ------------------------------------------------------------------ */

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

use crate::config::MOMENTUM;
use crate::ops::clip_by_norm;

#[derive(Debug, Clone)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    /// Per-tensor L2 norm clip applied before the update.
    pub clipnorm: f64,
    /// lr_t = lr / (1 + decay · iterations)
    pub decay: f64,
}

impl SgdConfig {
    pub fn new(lr: f64, clipnorm: f64, decay: f64) -> Self {
        Self { lr, momentum: MOMENTUM, clipnorm, decay }
    }
}

pub struct MomentumSgd {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    config: SgdConfig,
    iterations: usize,
}

impl MomentumSgd {
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Resume the decay clock, e.g. after loading a snapshot.
    pub fn set_iterations(&mut self, iterations: usize) {
        self.iterations = iterations;
    }

    pub fn effective_learning_rate(&self) -> f64 {
        self.config.lr / (1.0 + self.config.decay * self.iterations as f64)
    }

    /// One update with gradients aligned to the variable list. `None`
    /// entries (no gradient, e.g. batch-norm running statistics) are skipped.
    pub fn apply(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        let lr = self.effective_learning_rate();
        let momentum = self.config.momentum;

        for ((var, slot), grad) in self.vars.iter().zip(self.velocity.iter_mut()).zip(grads) {
            let Some(grad) = grad else { continue };
            let grad = clip_by_norm(grad, self.config.clipnorm)?;

            // v ← m·v − lr·g ;  w ← w + v
            let step = grad.affine(-lr, 0.0)?;
            let v = match slot.take() {
                Some(prev) => prev.affine(momentum, 0.0)?.add(&step)?,
                None => step,
            };
            var.set(&var.as_tensor().detach().add(&v)?)?;
            *slot = Some(v.detach());
        }
        self.iterations += 1;
        Ok(())
    }
}

impl candle_nn::Optimizer for MomentumSgd {
    type Config = SgdConfig;

    fn new(vars: Vec<Var>, config: SgdConfig) -> Result<Self> {
        let velocity = vec![None; vars.len()];
        Ok(Self { vars, velocity, config, iterations: 0 })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let aligned: Vec<Option<Tensor>> =
            self.vars.iter().map(|v| grads.get(v.as_tensor()).cloned()).collect();
        self.apply(&aligned)
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::Optimizer;

    #[test]
    fn momentum_accumulates_velocity() {
        let w = Var::new(&[1.0f32, 1.0], &Device::Cpu).unwrap();
        let mut opt = MomentumSgd::new(vec![w.clone()], SgdConfig::new(0.1, 100.0, 0.0)).unwrap();
        let g = Tensor::new(&[1.0f32, 0.0], &Device::Cpu).unwrap();

        opt.apply(&[Some(g.clone())]).unwrap();
        let after_one: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!((after_one[0] - 0.9).abs() < 1e-6);
        assert_eq!(after_one[1], 1.0);

        // v = 0.9·(−0.1) − 0.1 = −0.19
        opt.apply(&[Some(g)]).unwrap();
        let after_two: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!((after_two[0] - 0.71).abs() < 1e-6);
        assert_eq!(opt.iterations(), 2);
    }

    #[test]
    fn gradients_are_clipped_per_tensor() {
        let w = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
        let mut opt = MomentumSgd::new(vec![w.clone()], SgdConfig::new(1.0, 1.0, 0.0)).unwrap();
        opt.apply(&[Some(Tensor::new(&[30.0f32, 40.0], &Device::Cpu).unwrap())]).unwrap();
        let v: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!((v[0] + 0.6).abs() < 1e-6);
        assert!((v[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn time_decay_shrinks_the_step() {
        let mut opt = MomentumSgd::new(vec![], SgdConfig::new(0.1, 1.0, 0.5)).unwrap();
        assert!((opt.effective_learning_rate() - 0.1).abs() < 1e-12);
        opt.set_iterations(2);
        assert!((opt.effective_learning_rate() - 0.05).abs() < 1e-12);
        opt.set_learning_rate(0.2);
        assert!((opt.effective_learning_rate() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn missing_gradients_leave_variables_alone() {
        let w = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut opt = MomentumSgd::new(vec![w.clone()], SgdConfig::new(0.1, 1.0, 0.0)).unwrap();
        opt.apply(&[None]).unwrap();
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0]);
    }
}
