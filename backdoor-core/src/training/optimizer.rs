//! SGD and Adam over a network's trainable parameters.

use crate::error::BackdoorError;
use crate::training::network::Network;
use crate::training::state::{StateDict, Stateful, Tensor};
use crate::training::variant::VariantConfig;
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Optimizer selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    #[serde(rename = "Adam")]
    Adam(AdamOptions),
    #[serde(rename = "SGD")]
    Sgd(SgdOptions),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Sgd(SgdOptions {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
            ..Default::default()
        })
    }
}

impl VariantConfig for OptimizerConfig {
    const KIND: &'static str = "optimizer";
    const VARIANTS: &'static [&'static str] = &["Adam", "SGD"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdOptions {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub nesterov: bool,
}

impl Default for SgdOptions {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamOptions {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_betas")]
    pub betas: [f64; 2],
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub amsgrad: bool,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

fn default_lr() -> f64 {
    1e-3
}

fn default_betas() -> [f64; 2] {
    [0.9, 0.999]
}

fn default_eps() -> f64 {
    1e-8
}

/// Parameter update rule.
pub trait Optimizer: Stateful + Send {
    fn name(&self) -> &'static str;

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    /// Names of the parameters this optimizer updates.
    fn params(&self) -> &[String];

    /// Apply one update. Parameters without an entry in `grads` are skipped.
    fn step(&mut self, model: &mut dyn Network, grads: &StateDict) -> Result<(), BackdoorError>;
}

/// Build an optimizer over the model's trainable parameters.
pub fn build_optimizer(
    model: &dyn Network,
    config: &OptimizerConfig,
) -> Result<Box<dyn Optimizer>, BackdoorError> {
    let params = model.trainable_parameters();
    if params.is_empty() {
        return Err(BackdoorError::config(format!(
            "network `{}` has no trainable parameters",
            model.name()
        )));
    }
    match config {
        OptimizerConfig::Sgd(options) => {
            if options.nesterov && (options.momentum <= 0.0 || options.dampening != 0.0) {
                return Err(BackdoorError::config(
                    "Nesterov momentum requires a momentum and zero dampening",
                ));
            }
            Ok(Box::new(Sgd::new(params, options.clone())))
        }
        OptimizerConfig::Adam(options) => Ok(Box::new(Adam::new(params, options.clone()))),
    }
}

fn param_and_grad<'a>(
    model: &'a mut dyn Network,
    grads: &'a StateDict,
    name: &str,
) -> Result<Option<(&'a mut Tensor, &'a Tensor)>, BackdoorError> {
    let Some(grad) = grads.get(name) else {
        return Ok(None);
    };
    let param = model
        .parameter_mut(name)
        .ok_or_else(|| BackdoorError::invalid_input(format!("model has no parameter `{name}`")))?;
    if param.shape() != grad.shape() {
        return Err(BackdoorError::invalid_input(format!(
            "gradient for `{name}` has shape {:?}, parameter has {:?}",
            grad.shape(),
            param.shape()
        )));
    }
    Ok(Some((param, grad)))
}

fn check_params(expected: &[String], found: &[String]) -> Result<(), BackdoorError> {
    if expected != found {
        return Err(BackdoorError::checkpoint(format!(
            "optimizer state covers {} parameter(s) but this optimizer has {}",
            found.len(),
            expected.len()
        )));
    }
    Ok(())
}

/// Stochastic gradient descent with optional momentum.
pub struct Sgd {
    params: Vec<String>,
    options: SgdOptions,
    momentum_buffer: BTreeMap<String, Tensor>,
}

#[derive(Serialize, Deserialize)]
struct SgdSnapshot {
    params: Vec<String>,
    options: SgdOptions,
    momentum_buffer: BTreeMap<String, Tensor>,
}

impl Sgd {
    pub fn new(params: Vec<String>, options: SgdOptions) -> Self {
        Self {
            params,
            options,
            momentum_buffer: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &SgdOptions {
        &self.options
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "SGD"
    }

    fn lr(&self) -> f64 {
        self.options.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.options.lr = lr;
    }

    fn params(&self) -> &[String] {
        &self.params
    }

    fn step(&mut self, model: &mut dyn Network, grads: &StateDict) -> Result<(), BackdoorError> {
        let lr = self.options.lr as f32;
        let momentum = self.options.momentum as f32;
        let dampening = self.options.dampening as f32;
        let weight_decay = self.options.weight_decay as f32;

        for name in &self.params {
            let Some((param, grad)) = param_and_grad(model, grads, name)? else {
                continue;
            };
            let mut d_p = grad.clone();
            if weight_decay != 0.0 {
                d_p.scaled_add(weight_decay, param);
            }
            if momentum != 0.0 {
                let buf = match self.momentum_buffer.entry(name.clone()) {
                    Entry::Occupied(entry) => {
                        let buf = entry.into_mut();
                        *buf *= momentum;
                        buf.scaled_add(1.0 - dampening, &d_p);
                        buf
                    }
                    Entry::Vacant(entry) => entry.insert(d_p.clone()),
                };
                if self.options.nesterov {
                    d_p.scaled_add(momentum, buf);
                } else {
                    d_p.assign(buf);
                }
            }
            param.scaled_add(-lr, &d_p);
        }
        Ok(())
    }
}

impl Stateful for Sgd {
    fn state_dict(&self) -> Result<serde_json::Value, BackdoorError> {
        Ok(serde_json::to_value(SgdSnapshot {
            params: self.params.clone(),
            options: self.options.clone(),
            momentum_buffer: self.momentum_buffer.clone(),
        })?)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), BackdoorError> {
        let snapshot: SgdSnapshot = serde_json::from_value(state)?;
        check_params(&self.params, &snapshot.params)?;
        self.options = snapshot.options;
        self.momentum_buffer = snapshot.momentum_buffer;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdamMoments {
    step: u64,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_exp_avg_sq: Option<Tensor>,
}

/// Adam with bias-corrected moment estimates.
pub struct Adam {
    params: Vec<String>,
    options: AdamOptions,
    moments: BTreeMap<String, AdamMoments>,
}

#[derive(Serialize, Deserialize)]
struct AdamSnapshot {
    params: Vec<String>,
    options: AdamOptions,
    moments: BTreeMap<String, AdamMoments>,
}

impl Adam {
    pub fn new(params: Vec<String>, options: AdamOptions) -> Self {
        Self {
            params,
            options,
            moments: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &AdamOptions {
        &self.options
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "Adam"
    }

    fn lr(&self) -> f64 {
        self.options.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.options.lr = lr;
    }

    fn params(&self) -> &[String] {
        &self.params
    }

    fn step(&mut self, model: &mut dyn Network, grads: &StateDict) -> Result<(), BackdoorError> {
        let [beta1, beta2] = self.options.betas;
        let eps = self.options.eps as f32;
        let weight_decay = self.options.weight_decay as f32;
        let amsgrad = self.options.amsgrad;

        for name in &self.params {
            let Some((param, grad)) = param_and_grad(model, grads, name)? else {
                continue;
            };
            let state = self
                .moments
                .entry(name.clone())
                .or_insert_with(|| AdamMoments {
                    step: 0,
                    exp_avg: Tensor::zeros(param.raw_dim()),
                    exp_avg_sq: Tensor::zeros(param.raw_dim()),
                    max_exp_avg_sq: amsgrad.then(|| Tensor::zeros(param.raw_dim())),
                });
            state.step += 1;

            let bias_correction1 = 1.0 - beta1.powi(state.step as i32);
            let bias_correction2_sqrt = (1.0 - beta2.powi(state.step as i32)).sqrt() as f32;
            let step_size = (self.options.lr / bias_correction1) as f32;
            let (beta1, beta2) = (beta1 as f32, beta2 as f32);

            let mut g = grad.clone();
            if weight_decay != 0.0 {
                g.scaled_add(weight_decay, param);
            }

            Zip::from(&mut state.exp_avg)
                .and(&mut state.exp_avg_sq)
                .and(&g)
                .for_each(|m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                });

            let second = match state.max_exp_avg_sq.as_mut() {
                Some(max_sq) => {
                    Zip::from(&mut *max_sq)
                        .and(&state.exp_avg_sq)
                        .for_each(|max, &v| *max = max.max(v));
                    &*max_sq
                }
                None => &state.exp_avg_sq,
            };

            Zip::from(param)
                .and(&state.exp_avg)
                .and(second)
                .for_each(|p, &m, &v| {
                    let denom = v.sqrt() / bias_correction2_sqrt + eps;
                    *p -= step_size * m / denom;
                });
        }
        Ok(())
    }
}

impl Stateful for Adam {
    fn state_dict(&self) -> Result<serde_json::Value, BackdoorError> {
        Ok(serde_json::to_value(AdamSnapshot {
            params: self.params.clone(),
            options: self.options.clone(),
            moments: self.moments.clone(),
        })?)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), BackdoorError> {
        let snapshot: AdamSnapshot = serde_json::from_value(state)?;
        check_params(&self.params, &snapshot.params)?;
        self.options = snapshot.options;
        self.moments = snapshot.moments;
        Ok(())
    }
}
