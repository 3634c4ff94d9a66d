//! Per-epoch learning-rate schedules.

use crate::error::BackdoorError;
use crate::training::optimizer::Optimizer;
use crate::training::state::Stateful;
use crate::training::variant::VariantConfig;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Scheduler selection. Absence of a scheduler is `Option::None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerConfig {
    MultiStep(MultiStepOptions),
    CosineAnnealing(CosineAnnealingOptions),
}

impl VariantConfig for SchedulerConfig {
    const KIND: &'static str = "learning rate scheduler";
    const VARIANTS: &'static [&'static str] = &["multi_step", "cosine_annealing"];
}

impl SchedulerConfig {
    /// `null` means no scheduler.
    pub fn from_optional_value(value: &serde_json::Value) -> Result<Option<Self>, BackdoorError> {
        if value.is_null() {
            return Ok(None);
        }
        Self::from_value(value).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepOptions {
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealingOptions {
    #[serde(alias = "T_max")]
    pub t_max: usize,
    #[serde(default)]
    pub eta_min: f64,
}

fn default_gamma() -> f64 {
    0.1
}

pub trait Scheduler: Stateful + Send {
    fn name(&self) -> &'static str;

    /// Epochs stepped so far.
    fn last_epoch(&self) -> usize;

    /// Learning rate this schedule assigns to `epoch`.
    fn lr_at(&self, epoch: usize) -> f64;

    /// Advance one epoch and write the new rate into the optimizer.
    fn step(&mut self, optimizer: &mut dyn Optimizer);
}

/// Build a scheduler driving `optimizer`, or none when unconfigured. The
/// optimizer's current rate becomes the base rate.
pub fn build_scheduler(
    optimizer: &dyn Optimizer,
    config: Option<&SchedulerConfig>,
) -> Result<Option<Box<dyn Scheduler>>, BackdoorError> {
    let Some(config) = config else {
        return Ok(None);
    };
    let base_lr = optimizer.lr();
    let scheduler: Box<dyn Scheduler> = match config {
        SchedulerConfig::MultiStep(options) => Box::new(MultiStepLr::new(base_lr, options.clone())),
        SchedulerConfig::CosineAnnealing(options) => {
            if options.t_max == 0 {
                return Err(BackdoorError::config("cosine_annealing requires t_max > 0"));
            }
            Box::new(CosineAnnealingLr::new(base_lr, options.clone()))
        }
    };
    Ok(Some(scheduler))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleSnapshot<O> {
    base_lr: f64,
    last_epoch: usize,
    options: O,
}

/// Decays the rate by `gamma` at every milestone epoch.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    last_epoch: usize,
    options: MultiStepOptions,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, mut options: MultiStepOptions) -> Self {
        options.milestones.sort_unstable();
        Self {
            base_lr,
            last_epoch: 0,
            options,
        }
    }
}

impl Scheduler for MultiStepLr {
    fn name(&self) -> &'static str {
        "multi_step"
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.options.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.options.gamma.powi(passed as i32)
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_lr(self.lr_at(self.last_epoch));
    }
}

impl Stateful for MultiStepLr {
    fn state_dict(&self) -> Result<serde_json::Value, BackdoorError> {
        Ok(serde_json::to_value(ScheduleSnapshot {
            base_lr: self.base_lr,
            last_epoch: self.last_epoch,
            options: self.options.clone(),
        })?)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), BackdoorError> {
        let snapshot: ScheduleSnapshot<MultiStepOptions> = serde_json::from_value(state)?;
        self.base_lr = snapshot.base_lr;
        self.last_epoch = snapshot.last_epoch;
        self.options = snapshot.options;
        Ok(())
    }
}

/// Half-cosine from the base rate down to `eta_min` over `t_max` epochs.
#[derive(Debug, Clone)]
pub struct CosineAnnealingLr {
    base_lr: f64,
    last_epoch: usize,
    options: CosineAnnealingOptions,
}

impl CosineAnnealingLr {
    pub fn new(base_lr: f64, options: CosineAnnealingOptions) -> Self {
        Self {
            base_lr,
            last_epoch: 0,
            options,
        }
    }
}

impl Scheduler for CosineAnnealingLr {
    fn name(&self) -> &'static str {
        "cosine_annealing"
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    fn lr_at(&self, epoch: usize) -> f64 {
        let eta_min = self.options.eta_min;
        let progress = epoch as f64 / self.options.t_max as f64;
        eta_min + (self.base_lr - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_lr(self.lr_at(self.last_epoch));
    }
}

impl Stateful for CosineAnnealingLr {
    fn state_dict(&self) -> Result<serde_json::Value, BackdoorError> {
        Ok(serde_json::to_value(ScheduleSnapshot {
            base_lr: self.base_lr,
            last_epoch: self.last_epoch,
            options: self.options.clone(),
        })?)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), BackdoorError> {
        let snapshot: ScheduleSnapshot<CosineAnnealingOptions> = serde_json::from_value(state)?;
        self.base_lr = snapshot.base_lr;
        self.last_epoch = snapshot.last_epoch;
        self.options = snapshot.options;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::{Sgd, SgdOptions};

    fn sgd(lr: f64) -> Sgd {
        Sgd::new(
            vec!["w".into()],
            SgdOptions {
                lr,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_multi_step_decays_at_milestones() {
        let mut opt = sgd(0.1);
        let config = SchedulerConfig::MultiStep(MultiStepOptions {
            milestones: vec![3, 1],
            gamma: 0.1,
        });
        let mut sched = build_scheduler(&opt, Some(&config)).unwrap().unwrap();

        sched.step(&mut opt);
        assert!((opt.lr() - 0.01).abs() < 1e-12);
        sched.step(&mut opt);
        assert!((opt.lr() - 0.01).abs() < 1e-12);
        sched.step(&mut opt);
        assert!((opt.lr() - 0.001).abs() < 1e-12);
        assert_eq!(sched.last_epoch(), 3);
    }

    #[test]
    fn test_cosine_endpoints() {
        let sched = CosineAnnealingLr::new(
            0.1,
            CosineAnnealingOptions {
                t_max: 10,
                eta_min: 0.001,
            },
        );
        assert!((sched.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((sched.lr_at(5) - 0.0505).abs() < 1e-12);
        assert!((sched.lr_at(10) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_zero_t_max_rejected() {
        let config = SchedulerConfig::CosineAnnealing(CosineAnnealingOptions {
            t_max: 0,
            eta_min: 0.0,
        });
        assert!(build_scheduler(&sgd(0.1), Some(&config)).is_err());
    }

    #[test]
    fn test_no_scheduler() {
        assert!(build_scheduler(&sgd(0.1), None).unwrap().is_none());
        assert!(SchedulerConfig::from_optional_value(&serde_json::Value::Null)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_capitalized_t_max() {
        let cfg = SchedulerConfig::from_value(&serde_json::json!({
            "cosine_annealing": {"T_max": 100}
        }))
        .unwrap();
        assert_eq!(
            cfg,
            SchedulerConfig::CosineAnnealing(CosineAnnealingOptions {
                t_max: 100,
                eta_min: 0.0
            })
        );
    }

    #[test]
    fn test_state_round_trip_keeps_epoch() {
        let mut opt = sgd(0.1);
        let mut sched = MultiStepLr::new(
            0.1,
            MultiStepOptions {
                milestones: vec![2],
                gamma: 0.5,
            },
        );
        sched.step(&mut opt);
        sched.step(&mut opt);

        let mut resumed = MultiStepLr::new(0.1, MultiStepOptions { milestones: vec![], gamma: 0.1 });
        resumed.load_state_dict(sched.state_dict().unwrap()).unwrap();
        assert_eq!(resumed.last_epoch(), 2);
        assert!((resumed.lr_at(2) - 0.05).abs() < 1e-12);
    }
}
