/* ------------------------------------------------------------------ */
/* Learning-rate schedules: plateau decay, SGDR, CLR                  */
/* ------------------------------------------------------------------ */
//
// Epochs are 0-based. `learning_rate(epoch, progress)` takes the fraction
// of the current epoch already processed (0.0 at the first batch) so the
// cyclical policy can move per batch. The other policies ignore it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::*;
use crate::error::{Error, Result};

pub const LR_SCHEDULES: &[&str] = &["SGD", "SGDR", "CLR"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePolicy {
    /// `SGD`: constant rate, halved when validation loss stalls.
    Plateau,
    /// `SGDR`: cosine annealing with warm restarts.
    CosineRestarts,
    /// `CLR`: triangular cyclical rate.
    Cyclical,
}

impl FromStr for SchedulePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SGD" => Ok(Self::Plateau),
            "SGDR" => Ok(Self::CosineRestarts),
            "CLR" => Ok(Self::Cyclical),
            other => Err(Error::config(format!(
                "unknown learning rate schedule {other:?} (expected one of {})",
                LR_SCHEDULES.join(", ")
            ))),
        }
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plateau => "SGD",
            Self::CosineRestarts => "SGDR",
            Self::Cyclical => "CLR",
        })
    }
}

// ── Plateau decay ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauDecay {
    pub lr: f64,
    pub min_lr: f64,
    pub patience: usize,
    pub factor: f64,
    pub min_delta: f64,
    /// Lowest monitored value so far; `None` until the first finite one.
    pub best: Option<f64>,
    /// Epochs since the last improvement.
    pub wait: usize,
}

impl PlateauDecay {
    /// Feed one monitored value. Returns the new rate when it was reduced.
    pub fn observe(&mut self, value: f64) -> Option<f64> {
        let improved = match self.best {
            None => value.is_finite(),
            Some(best) => value < best - self.min_delta,
        };
        if improved {
            self.best = Some(value);
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait >= self.patience && self.lr > self.min_lr {
            self.lr = (self.lr * self.factor).max(self.min_lr);
            self.wait = 0;
            return Some(self.lr);
        }
        None
    }
}

// ── Cosine warm restarts ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineRestarts {
    pub min_lr: f64,
    pub max_lr: f64,
    pub base_len: usize,
    pub mul: usize,
    pub cycles: usize,
}

impl CosineRestarts {
    /// (epochs into the current cycle, current cycle length)
    fn position(&self, epoch: usize) -> (usize, usize) {
        let mut start: usize = 0;
        let mut len = self.base_len;
        while epoch >= start.saturating_add(len) {
            start += len;
            len = len.saturating_mul(self.mul);
        }
        (epoch - start, len)
    }

    fn checked_total_epochs(&self) -> Option<usize> {
        let mut total = 0usize;
        let mut len = self.base_len;
        for i in 0..self.cycles {
            if i > 0 {
                len = len.checked_mul(self.mul)?;
            }
            total = total.checked_add(len)?;
        }
        Some(total)
    }

    pub fn total_epochs(&self) -> usize {
        self.checked_total_epochs().unwrap_or(usize::MAX)
    }

    pub fn learning_rate(&self, epoch: usize) -> f64 {
        let (t_cur, len) = self.position(epoch);
        let cos = (std::f64::consts::PI * t_cur as f64 / len as f64).cos();
        self.min_lr + 0.5 * (self.max_lr - self.min_lr) * (1.0 + cos)
    }
}

// ── Cyclical triangular ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cyclical {
    pub min_lr: f64,
    pub max_lr: f64,
    pub step_len: usize,
    pub cycles: usize,
}

impl Cyclical {
    fn checked_total_epochs(&self) -> Option<usize> {
        self.step_len.checked_mul(self.cycles)?.checked_mul(2)
    }

    pub fn total_epochs(&self) -> usize {
        self.checked_total_epochs().unwrap_or(usize::MAX)
    }

    // Starts at min_lr, peaks after step_len epochs, back at min_lr after 2·step_len.
    pub fn learning_rate(&self, epoch: usize, progress: f64) -> f64 {
        let x = (epoch as f64 + progress.clamp(0.0, 1.0)) / self.step_len as f64;
        let cycle = (1.0 + x / 2.0).floor();
        let scale = (1.0 - (x - 2.0 * cycle + 1.0).abs()).max(0.0);
        self.min_lr + (self.max_lr - self.min_lr) * scale
    }
}

/* ------------------------------------------------------------------ */
/* Schedule selector                                                  */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy")]
pub enum LrSchedule {
    Plateau(PlateauDecay),
    Cosine(CosineRestarts),
    Cyclical(Cyclical),
}

fn positive_rate(name: &str, v: f64) -> Result<f64> {
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(Error::config(format!("{name} must be a positive learning rate, got {v}")))
    }
}

fn positive_len(name: &str, v: usize) -> Result<usize> {
    if v > 0 {
        Ok(v)
    } else {
        Err(Error::config(format!("{name} must be positive")))
    }
}

impl LrSchedule {
    /// Fill unset sub-parameters with the policy defaults and validate.
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self> {
        match cfg.policy {
            SchedulePolicy::Plateau => {
                let lr = positive_rate("sgd_lr", cfg.sgd_lr)?;
                let min_lr = positive_rate("sgd_min_lr", cfg.sgd_min_lr.unwrap_or(SGD_MIN_LR))?;
                Ok(Self::Plateau(PlateauDecay {
                    lr,
                    min_lr,
                    patience: cfg.sgd_patience.unwrap_or(SGD_PATIENCE),
                    factor: PLATEAU_FACTOR,
                    min_delta: PLATEAU_MIN_DELTA,
                    best: None,
                    wait: 0,
                }))
            }
            SchedulePolicy::CosineRestarts => {
                let max_lr = positive_rate("sgdr_max_lr", cfg.sgdr_max_lr.unwrap_or(SGDR_MAX_LR))?;
                if max_lr < SGDR_MIN_LR {
                    return Err(Error::config(format!(
                        "sgdr_max_lr {max_lr} is below the annealing floor {SGDR_MIN_LR}"
                    )));
                }
                let base_len = cfg.sgdr_base_len.unwrap_or(SGDR_BASE_LEN);
                let s = CosineRestarts {
                    min_lr: SGDR_MIN_LR,
                    max_lr,
                    base_len: positive_len("sgdr_base_len", base_len)?,
                    mul: positive_len("sgdr_mul", cfg.sgdr_mul.unwrap_or(SGDR_MUL))?,
                    cycles: positive_len("sgdr_cycles", cfg.sgdr_cycles.unwrap_or(SGDR_CYCLES))?,
                };
                if s.checked_total_epochs().is_none() {
                    return Err(Error::config(format!(
                        "{} SGDR cycles of base length {} growing by {} overflow the epoch count",
                        s.cycles, s.base_len, s.mul
                    )));
                }
                Ok(Self::Cosine(s))
            }
            SchedulePolicy::Cyclical => {
                let min_lr = positive_rate("clr_min_lr", cfg.clr_min_lr.unwrap_or(CLR_MIN_LR))?;
                let max_lr = positive_rate("clr_max_lr", cfg.clr_max_lr.unwrap_or(CLR_MAX_LR))?;
                if min_lr > max_lr {
                    return Err(Error::config(format!(
                        "clr_min_lr {min_lr} exceeds clr_max_lr {max_lr}"
                    )));
                }
                let step_len = cfg.clr_step_len.unwrap_or(CLR_STEP_LEN);
                let s = Cyclical {
                    min_lr,
                    max_lr,
                    step_len: positive_len("clr_step_len", step_len)?,
                    cycles: positive_len("clr_cycles", cfg.clr_cycles.unwrap_or(CLR_CYCLES))?,
                };
                if s.checked_total_epochs().is_none() {
                    return Err(Error::config(format!(
                        "{} CLR cycles of step length {} overflow the epoch count",
                        s.cycles, s.step_len
                    )));
                }
                Ok(Self::Cyclical(s))
            }
        }
    }

    pub fn policy(&self) -> SchedulePolicy {
        match self {
            Self::Plateau(_) => SchedulePolicy::Plateau,
            Self::Cosine(_) => SchedulePolicy::CosineRestarts,
            Self::Cyclical(_) => SchedulePolicy::Cyclical,
        }
    }

    /// Epoch count the policy implies when the caller gives none.
    pub fn total_epochs(&self) -> usize {
        match self {
            Self::Plateau(_) => SGD_EPOCHS,
            Self::Cosine(s) => s.total_epochs(),
            Self::Cyclical(s) => s.total_epochs(),
        }
    }

    pub fn learning_rate(&self, epoch: usize, progress: f64) -> f64 {
        match self {
            Self::Plateau(s) => s.lr,
            Self::Cosine(s) => s.learning_rate(epoch),
            Self::Cyclical(s) => s.learning_rate(epoch, progress),
        }
    }

    /// End-of-epoch hook with the validation loss. Only the plateau
    /// policy reacts; returns the reduced rate when it changed.
    pub fn on_epoch_end(&mut self, val_loss: f64) -> Option<f64> {
        match self {
            Self::Plateau(s) => s.observe(val_loss),
            _ => None,
        }
    }

    /// Adopt the reactive state of a schedule saved in a snapshot. The
    /// configured parameters win; only plateau progress carries over.
    /// Returns false when the saved policy differs.
    pub fn restore_state(&mut self, saved: &LrSchedule) -> bool {
        match (self, saved) {
            (Self::Plateau(cur), Self::Plateau(old)) => {
                cur.lr = old.lr.max(cur.min_lr);
                cur.best = old.best;
                cur.wait = old.wait;
                true
            }
            (cur, old) => cur.policy() == old.policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(policy: SchedulePolicy) -> LrSchedule {
        LrSchedule::from_config(&ScheduleConfig::new(policy)).unwrap()
    }

    #[test]
    fn policy_names_parse_case_insensitively() {
        assert_eq!("sgdr".parse::<SchedulePolicy>().unwrap(), SchedulePolicy::CosineRestarts);
        assert_eq!("CLR".parse::<SchedulePolicy>().unwrap(), SchedulePolicy::Cyclical);
        assert_eq!("Sgd".parse::<SchedulePolicy>().unwrap(), SchedulePolicy::Plateau);
        assert!(matches!("adam".parse::<SchedulePolicy>(), Err(Error::Config(_))));
    }

    #[test]
    fn plateau_halves_after_patience_and_respects_floor() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::Plateau);
        cfg.sgd_patience = Some(2);
        cfg.sgd_lr = 0.1;
        cfg.sgd_min_lr = Some(0.02);
        let mut s = LrSchedule::from_config(&cfg).unwrap();

        // first value sets the baseline, then the loss never improves
        let mut rates = vec![s.learning_rate(0, 0.0)];
        assert_eq!(s.on_epoch_end(1.0), None);
        for epoch in 1..12 {
            let before = s.learning_rate(epoch, 0.0);
            if let Some(after) = s.on_epoch_end(1.0) {
                assert!(after == before * 0.5 || after == 0.02, "{before} -> {after}");
            }
            rates.push(s.learning_rate(epoch + 1, 0.0));
        }
        assert!(rates.windows(2).all(|w| w[1] <= w[0]));
        assert!(rates.iter().all(|&r| r >= 0.02));
        assert_eq!(*rates.last().unwrap(), 0.02);
        assert!(rates.contains(&0.05));
        assert!(rates.contains(&0.025));
    }

    #[test]
    fn plateau_improvement_needs_min_delta() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::Plateau);
        cfg.sgd_patience = Some(1);
        let mut s = LrSchedule::from_config(&cfg).unwrap();
        s.on_epoch_end(1.0);
        // 5e-5 below the best is not an improvement
        assert_eq!(s.on_epoch_end(1.0 - 5e-5), Some(0.05));
        assert_eq!(s.on_epoch_end(0.5), None);
    }

    #[test]
    fn sgdr_total_epochs_is_sum_of_cycles() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::CosineRestarts);
        cfg.sgdr_base_len = Some(3);
        cfg.sgdr_mul = Some(2);
        cfg.sgdr_cycles = Some(4);
        let s = LrSchedule::from_config(&cfg).unwrap();
        assert_eq!(s.total_epochs(), 3 + 6 + 12 + 24);
        assert_eq!(schedule(SchedulePolicy::CosineRestarts).total_epochs(), 12 * 31);
    }

    #[test]
    fn oversized_cycle_counts_are_config_errors() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::CosineRestarts);
        cfg.sgdr_cycles = Some(70);
        assert!(matches!(LrSchedule::from_config(&cfg), Err(Error::Config(_))));

        let mut cfg = ScheduleConfig::new(SchedulePolicy::Cyclical);
        cfg.clr_step_len = Some(usize::MAX / 2);
        assert!(matches!(LrSchedule::from_config(&cfg), Err(Error::Config(_))));

        // mul = 1 never grows, so many cycles stay representable
        let mut cfg = ScheduleConfig::new(SchedulePolicy::CosineRestarts);
        cfg.sgdr_mul = Some(1);
        cfg.sgdr_cycles = Some(70);
        let s = LrSchedule::from_config(&cfg).unwrap();
        assert_eq!(s.total_epochs(), 70 * SGDR_BASE_LEN);
        assert!((s.learning_rate(SGDR_BASE_LEN * 69, 0.0) - SGDR_MAX_LR).abs() < 1e-12);
    }

    #[test]
    fn sgdr_restarts_at_max_and_decays_within_cycle() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::CosineRestarts);
        cfg.sgdr_base_len = Some(3);
        cfg.sgdr_mul = Some(2);
        cfg.sgdr_max_lr = Some(0.2);
        let s = LrSchedule::from_config(&cfg).unwrap();
        for start in [0, 3, 9, 21] {
            assert!((s.learning_rate(start, 0.0) - 0.2).abs() < 1e-12);
        }
        let cycle: Vec<f64> = (3..9).map(|e| s.learning_rate(e, 0.0)).collect();
        assert!(cycle.windows(2).all(|w| w[1] < w[0]));
        assert!(cycle.iter().all(|&r| r > SGDR_MIN_LR));
    }

    #[test]
    fn clr_triangle_peaks_after_one_step() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::Cyclical);
        cfg.clr_step_len = Some(2);
        cfg.clr_min_lr = Some(0.01);
        cfg.clr_max_lr = Some(0.11);
        let s = LrSchedule::from_config(&cfg).unwrap();
        assert_eq!(s.total_epochs(), 2 * 2 * CLR_CYCLES);
        assert!((s.learning_rate(0, 0.0) - 0.01).abs() < 1e-12);
        assert!((s.learning_rate(1, 0.0) - 0.06).abs() < 1e-12);
        assert!((s.learning_rate(2, 0.0) - 0.11).abs() < 1e-12);
        assert!((s.learning_rate(3, 0.0) - 0.06).abs() < 1e-12);
        assert!((s.learning_rate(4, 0.0) - 0.01).abs() < 1e-12);
        // per-batch movement inside an epoch
        assert!((s.learning_rate(0, 0.5) - 0.035).abs() < 1e-12);
    }

    #[test]
    fn invalid_sub_parameters_fail_fast() {
        let mut cfg = ScheduleConfig::new(SchedulePolicy::Cyclical);
        cfg.clr_min_lr = Some(0.5);
        cfg.clr_max_lr = Some(0.1);
        assert!(matches!(LrSchedule::from_config(&cfg), Err(Error::Config(_))));

        let mut cfg = ScheduleConfig::new(SchedulePolicy::CosineRestarts);
        cfg.sgdr_mul = Some(0);
        assert!(LrSchedule::from_config(&cfg).is_err());
    }

    #[test]
    fn plateau_state_survives_serialization() {
        let mut s = schedule(SchedulePolicy::Plateau);
        s.on_epoch_end(2.0);
        s.on_epoch_end(2.5);
        let json = serde_json::to_string(&s).unwrap();
        let saved: LrSchedule = serde_json::from_str(&json).unwrap();

        let mut fresh = schedule(SchedulePolicy::Plateau);
        assert!(fresh.restore_state(&saved));
        assert_eq!(fresh, s);
        assert!(!fresh.restore_state(&schedule(SchedulePolicy::Cyclical)));
    }
}
