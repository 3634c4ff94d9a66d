//! Network parameter layouts and the multi-device wrapper.

use crate::error::BackdoorError;
use crate::training::state::{
    PARALLEL_PREFIX, ParameterStore, StateDict, Tensor, strip_parallel_prefix,
};
use crate::training::variant::VariantConfig;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A trainable model as seen by the optimizer and the checkpoint layer.
pub trait Network: Send {
    fn name(&self) -> &str;

    fn state_dict(&self) -> StateDict;

    /// Strict load: key sets and shapes must match exactly.
    fn load_state_dict(&mut self, state: StateDict) -> Result<(), BackdoorError>;

    /// Names of the tensors an optimizer updates.
    fn trainable_parameters(&self) -> Vec<String>;

    fn parameter(&self, name: &str) -> Option<&Tensor>;

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor>;

    /// Whether the model is wrapped for multi-device execution. Wrapped
    /// models expose `module.`-prefixed keys and load checkpoints verbatim.
    fn data_parallel(&self) -> bool {
        false
    }

    fn num_parameters(&self) -> usize {
        self.trainable_parameters()
            .iter()
            .filter_map(|name| self.parameter(name))
            .map(|t| t.len())
            .sum()
    }
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn state_dict(&self) -> StateDict {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), BackdoorError> {
        (**self).load_state_dict(state)
    }

    fn trainable_parameters(&self) -> Vec<String> {
        (**self).trainable_parameters()
    }

    fn parameter(&self, name: &str) -> Option<&Tensor> {
        (**self).parameter(name)
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        (**self).parameter_mut(name)
    }

    fn data_parallel(&self) -> bool {
        (**self).data_parallel()
    }
}

/// Network selection, one key per architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkConfig {
    #[serde(rename = "resnet18_cifar")]
    ResNet18Cifar(ResNetCifarOptions),
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::ResNet18Cifar(ResNetCifarOptions::default())
    }
}

impl VariantConfig for NetworkConfig {
    const KIND: &'static str = "network";
    const VARIANTS: &'static [&'static str] = &["resnet18_cifar"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetCifarOptions {
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_in_channels", alias = "in_channel")]
    pub in_channels: usize,
    /// Seed for parameter initialisation; random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ResNetCifarOptions {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            in_channels: default_in_channels(),
            seed: None,
        }
    }
}

fn default_num_classes() -> usize {
    10
}

fn default_in_channels() -> usize {
    3
}

const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];

/// Residual network for 32×32 inputs: 3×3 stem without pooling, four
/// stages of BasicBlocks, global pooling, then `linear`.
#[derive(Debug, Clone)]
pub struct ResNetCifar {
    name: String,
    options: ResNetCifarOptions,
    store: ParameterStore,
}

impl ResNetCifar {
    pub fn resnet18(options: ResNetCifarOptions) -> Self {
        Self::new("resnet18_cifar", [2, 2, 2, 2], options)
    }

    pub fn new(name: &str, num_blocks: [usize; 4], options: ResNetCifarOptions) -> Self {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut store = ParameterStore::new();

        conv(&mut store, &mut rng, "conv1", 64, options.in_channels, 3);
        batch_norm(&mut store, "bn1", 64);

        let mut in_planes = 64;
        for (stage, (&planes, &blocks)) in STAGE_WIDTHS.iter().zip(num_blocks.iter()).enumerate() {
            for block in 0..blocks {
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                let prefix = format!("layer{}.{}", stage + 1, block);
                conv(&mut store, &mut rng, &format!("{prefix}.conv1"), planes, in_planes, 3);
                batch_norm(&mut store, &format!("{prefix}.bn1"), planes);
                conv(&mut store, &mut rng, &format!("{prefix}.conv2"), planes, planes, 3);
                batch_norm(&mut store, &format!("{prefix}.bn2"), planes);
                if stride != 1 || in_planes != planes {
                    conv(&mut store, &mut rng, &format!("{prefix}.shortcut.0"), planes, in_planes, 1);
                    batch_norm(&mut store, &format!("{prefix}.shortcut.1"), planes);
                }
                in_planes = planes;
            }
        }

        let bound = 1.0 / (in_planes as f32).sqrt();
        store.register_parameter(
            "linear.weight",
            uniform(&mut rng, &[options.num_classes, in_planes], bound),
        );
        store.register_parameter("linear.bias", uniform(&mut rng, &[options.num_classes], bound));

        Self {
            name: name.to_string(),
            options,
            store,
        }
    }

    pub fn options(&self) -> &ResNetCifarOptions {
        &self.options
    }
}

impl Network for ResNetCifar {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_dict(&self) -> StateDict {
        self.store.state_dict()
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), BackdoorError> {
        self.store.load_strict(state)
    }

    fn trainable_parameters(&self) -> Vec<String> {
        self.store.trainable().to_vec()
    }

    fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.store.get(name)
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.store.get_mut(name)
    }
}

fn uniform(rng: &mut StdRng, shape: &[usize], bound: f32) -> Tensor {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-bound..=bound))
}

fn conv(store: &mut ParameterStore, rng: &mut StdRng, name: &str, out: usize, inp: usize, k: usize) {
    let fan_in = inp * k * k;
    let bound = 1.0 / (fan_in as f32).sqrt();
    store.register_parameter(format!("{name}.weight"), uniform(rng, &[out, inp, k, k], bound));
}

fn batch_norm(store: &mut ParameterStore, name: &str, features: usize) {
    store.register_parameter(format!("{name}.weight"), ArrayD::ones(IxDyn(&[features])));
    store.register_parameter(format!("{name}.bias"), ArrayD::zeros(IxDyn(&[features])));
    store.register_buffer(format!("{name}.running_mean"), ArrayD::zeros(IxDyn(&[features])));
    store.register_buffer(format!("{name}.running_var"), ArrayD::ones(IxDyn(&[features])));
    store.register_buffer(format!("{name}.num_batches_tracked"), ArrayD::zeros(IxDyn(&[])));
}

/// Multi-device wrapper. Every key of the inner network is exposed with a
/// `module.` prefix, and checkpoints are loaded without stripping it.
#[derive(Debug, Clone)]
pub struct DataParallel<N> {
    module: N,
}

impl<N: Network> DataParallel<N> {
    pub fn new(module: N) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &N {
        &self.module
    }

    pub fn into_inner(self) -> N {
        self.module
    }
}

impl<N: Network> Network for DataParallel<N> {
    fn name(&self) -> &str {
        self.module.name()
    }

    fn state_dict(&self) -> StateDict {
        self.module
            .state_dict()
            .into_iter()
            .map(|(k, v)| (format!("{PARALLEL_PREFIX}{k}"), v))
            .collect()
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), BackdoorError> {
        if let Some(key) = state.keys().find(|k| !k.starts_with(PARALLEL_PREFIX)) {
            return Err(BackdoorError::checkpoint(format!(
                "error loading state dict: unexpected key(s): {key}"
            )));
        }
        self.module.load_state_dict(strip_parallel_prefix(state))
    }

    fn trainable_parameters(&self) -> Vec<String> {
        self.module
            .trainable_parameters()
            .into_iter()
            .map(|k| format!("{PARALLEL_PREFIX}{k}"))
            .collect()
    }

    fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.module.parameter(name.strip_prefix(PARALLEL_PREFIX)?)
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.module.parameter_mut(name.strip_prefix(PARALLEL_PREFIX)?)
    }

    fn data_parallel(&self) -> bool {
        true
    }
}
