//! Training-state lifecycle: component factories, checkpoints, and the
//! checkpoint-epoch policy.

pub mod checkpoint;
mod container;
pub mod criterion;
pub mod factory;
pub mod network;
pub mod optimizer;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod variant;

pub use checkpoint::{BestAccuracy, CheckpointManager, CheckpointRecord, Resume, ResumedState};
pub use criterion::{Criterion, CriterionConfig, LossInput};
pub use factory::{get_criterion, get_network, get_optimizer, get_scheduler};
pub use network::{DataParallel, Network, NetworkConfig, ResNetCifar};
pub use optimizer::{Optimizer, OptimizerConfig};
pub use schedule::{SavePolicy, saved_epochs};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use state::{ParameterStore, StateDict, Stateful, Tensor};
pub use variant::VariantConfig;
