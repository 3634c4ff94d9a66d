//! Layered experiment configuration.
//!
//! Sources, lowest priority first:
//! 1. built-in training defaults
//! 2. user config (`~/.config/backdoor/config.toml` via `directories`)
//! 3. an explicit file (`.toml` or `.json`)
//! 4. `BACKDOOR_`-prefixed environment variables, `__` separating levels
//!    (`BACKDOOR_TRAINING__NUM_EPOCHS=300`)
//!
//! The factory sections (`trigger`, `network`, `criterion`, `optimizer`,
//! `lr_scheduler`) are single-key mappings. They are extracted untyped and
//! parsed with [`VariantConfig::from_value`], so an unknown key surfaces as
//! `UnsupportedVariant` rather than a generic deserialization error.

use crate::error::BackdoorError;
use crate::training::checkpoint::Resume;
use crate::training::criterion::CriterionConfig;
use crate::training::network::NetworkConfig;
use crate::training::optimizer::OptimizerConfig;
use crate::training::schedule::SavePolicy;
use crate::training::scheduler::SchedulerConfig;
use crate::training::variant::VariantConfig;
use crate::trigger::TriggerConfig;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "BACKDOOR_";

/// Fully parsed experiment configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackdoorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,
    pub network: NetworkConfig,
    pub criterion: CriterionConfig,
    pub optimizer: OptimizerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lr_scheduler: Option<SchedulerConfig>,
    pub training: TrainingConfig,
}

/// Training-loop settings that drive checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_ckpt_dir")]
    pub ckpt_dir: PathBuf,
    #[serde(default)]
    pub resume: Resume,
    #[serde(default = "default_track_best")]
    pub track_best: bool,
    #[serde(default)]
    pub save: SavePolicy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            ckpt_dir: default_ckpt_dir(),
            resume: Resume::default(),
            track_best: default_track_best(),
            save: SavePolicy::default(),
        }
    }
}

fn default_num_epochs() -> usize {
    200
}

fn default_ckpt_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_track_best() -> bool {
    true
}

impl TrainingConfig {
    /// Epochs that get an `epoch{N}.pt` file for this run.
    pub fn saved_epochs(&self) -> Result<BTreeSet<usize>, BackdoorError> {
        self.save.epochs(self.num_epochs)
    }
}

/// What figment extracts before the factory sections are parsed.
#[derive(Debug, Deserialize)]
struct RawConfig {
    trigger: Option<Value>,
    network: Option<Value>,
    criterion: Option<Value>,
    optimizer: Option<Value>,
    lr_scheduler: Option<Value>,
    #[serde(default)]
    training: TrainingConfig,
}

impl TryFrom<RawConfig> for BackdoorConfig {
    type Error = BackdoorError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let trigger = raw
            .trigger
            .map(|v| TriggerConfig::from_value(&v))
            .transpose()?;
        let lr_scheduler = match raw.lr_scheduler {
            Some(v) => SchedulerConfig::from_optional_value(&v)?,
            None => None,
        };
        Ok(Self {
            trigger,
            network: parse_or_default(raw.network)?,
            criterion: parse_or_default(raw.criterion)?,
            optimizer: parse_or_default(raw.optimizer)?,
            lr_scheduler,
            training: raw.training,
        })
    }
}

fn parse_or_default<C: VariantConfig + Default>(value: Option<Value>) -> Result<C, BackdoorError> {
    value.map_or_else(|| Ok(C::default()), |v| C::from_value(&v))
}

/// `config.toml` in the platform config directory, if one can be resolved.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "backdoor", "backdoor")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// The layers merged over the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    /// Merged only when the file exists.
    pub user_config: Option<PathBuf>,
    /// Must exist when given.
    pub file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

impl ConfigSource {
    /// User config, `file`, then `BACKDOOR_*` environment variables.
    pub fn standard(file: Option<PathBuf>) -> Self {
        Self {
            user_config: user_config_path(),
            file,
            env_prefix: Some(ENV_PREFIX.to_string()),
        }
    }

    /// Only `file` over the defaults; nothing is read from the host.
    pub fn isolated(file: Option<PathBuf>) -> Self {
        Self {
            user_config: None,
            file,
            env_prefix: None,
        }
    }

    pub fn load(&self) -> Result<BackdoorConfig, BackdoorError> {
        let mut figment =
            Figment::from(Serialized::default("training", TrainingConfig::default()));

        if let Some(user_config) = self.user_config.as_deref().filter(|p| p.exists()) {
            figment = figment.merge(Toml::file(user_config));
        }

        if let Some(path) = self.file.as_deref() {
            if !path.exists() {
                return Err(BackdoorError::config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        if let Some(prefix) = &self.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split("__"));
        }

        let raw: RawConfig = figment
            .extract()
            .map_err(|e| BackdoorError::config(e.to_string()))?;
        BackdoorConfig::try_from(raw)
    }
}

/// Load configuration from every standard layer. An explicit `config_file`
/// must exist.
pub fn load_config(config_file: Option<&Path>) -> Result<BackdoorConfig, BackdoorError> {
    ConfigSource::standard(config_file.map(Path::to_path_buf)).load()
}
