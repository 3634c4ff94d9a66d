//! Config-driven construction of the training components.
//!
//! Each factory matches its configuration enum exhaustively; parsing an
//! untyped mapping into one of those enums (see [`VariantConfig`]) is where
//! an unknown variant is reported.
//!
//! [`VariantConfig`]: crate::training::variant::VariantConfig

use crate::error::BackdoorError;
use crate::training::criterion::{Criterion, CriterionConfig, build_criterion};
use crate::training::network::{Network, NetworkConfig, ResNetCifar};
use crate::training::optimizer::{Optimizer, OptimizerConfig, build_optimizer};
use crate::training::scheduler::{Scheduler, SchedulerConfig, build_scheduler};

pub fn get_network(config: &NetworkConfig) -> Box<dyn Network> {
    let model = match config {
        NetworkConfig::ResNet18Cifar(options) => ResNetCifar::resnet18(options.clone()),
    };
    tracing::debug!(
        network = model.name(),
        parameters = model.num_parameters(),
        "Built network"
    );
    Box::new(model)
}

pub fn get_criterion(config: &CriterionConfig) -> Result<Box<dyn Criterion>, BackdoorError> {
    build_criterion(config)
}

pub fn get_optimizer(
    model: &dyn Network,
    config: &OptimizerConfig,
) -> Result<Box<dyn Optimizer>, BackdoorError> {
    build_optimizer(model, config)
}

pub fn get_scheduler(
    optimizer: &dyn Optimizer,
    config: Option<&SchedulerConfig>,
) -> Result<Option<Box<dyn Scheduler>>, BackdoorError> {
    build_scheduler(optimizer, config)
}
