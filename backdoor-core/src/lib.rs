//! # backdoor-core: backdoor-attack research toolkit
//!
//! Two independent facilities for experiments on poisoned image classifiers:
//! 1. **Trigger injection**: transforms that stamp (BadNets) or blend (Blend)
//!    a trigger image into a training sample.
//! 2. **Training-state lifecycle**: config-driven factories for the network,
//!    criterion, optimizer and learning-rate scheduler; checkpoint
//!    save/resume; the policy selecting which epochs keep a checkpoint.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

pub mod training;
pub mod trigger;

pub use config::{BackdoorConfig, ConfigSource, TrainingConfig, load_config};
pub use error::BackdoorError;
pub use training::{
    CheckpointManager, CheckpointRecord, Resume, ResumedState, saved_epochs,
};
pub use trigger::{BadNets, Blend, Sample, TriggerConfig, TriggerTransform};
