//! Checkpoint records, the save side of the training loop, and resume.

use crate::error::BackdoorError;
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use crate::training::container;
use crate::training::network::Network;
use crate::training::optimizer::Optimizer;
use crate::training::scheduler::Scheduler;
use crate::training::state::{StateDict, Stateful, strip_parallel_prefix};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const LATEST_CHECKPOINT: &str = "latest_model.pt";
pub const BEST_CHECKPOINT: &str = "best_model.pt";
pub const MANIFEST_FILE: &str = "checkpoints.json";

const SCRATCH_SENTINEL: &str = "False";

pub fn epoch_checkpoint_name(epoch: usize) -> String {
    format!("epoch{epoch}.pt")
}

/// Where training state comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Resume {
    /// Written as `"False"`: train from scratch.
    #[default]
    Scratch,
    /// Written as `""`: the directory's `latest_model.pt`.
    Latest,
    /// Any other string: that file inside the checkpoint directory.
    Named(String),
}

impl From<&str> for Resume {
    fn from(value: &str) -> Self {
        match value {
            SCRATCH_SENTINEL => Resume::Scratch,
            "" => Resume::Latest,
            name => Resume::Named(name.to_string()),
        }
    }
}

impl From<String> for Resume {
    fn from(value: String) -> Self {
        Resume::from(value.as_str())
    }
}

impl From<Resume> for String {
    fn from(value: Resume) -> Self {
        value.to_string()
    }
}

impl FromStr for Resume {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Resume::from(s))
    }
}

impl fmt::Display for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resume::Scratch => f.write_str(SCRATCH_SENTINEL),
            Resume::Latest => Ok(()),
            Resume::Named(name) => f.write_str(name),
        }
    }
}

/// Best test accuracy seen so far and the epoch that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestAccuracy {
    pub acc: f64,
    pub epoch: usize,
}

/// Outcome of [`CheckpointManager::load_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedState {
    /// 0 when training from scratch.
    pub epoch: usize,
    /// Present only when best-accuracy tracking was requested.
    pub best: Option<BestAccuracy>,
    /// The checkpoint restored from; `None` when training from scratch.
    pub resumed_from: Option<PathBuf>,
}

impl ResumedState {
    /// True only for a scratch run. A restored epoch-0 checkpoint is not fresh.
    pub fn is_fresh(&self) -> bool {
        self.resumed_from.is_none()
    }
}

const MODEL_STATE_KEY: &str = "model_state_dict";

/// A persisted training snapshot.
///
/// The model weights are held as tensors; everything else is an untyped
/// JSON object so that a malformed file fails at the first access of a
/// missing key rather than at parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    fields: Map<String, Value>,
    model_state: Option<StateDict>,
}

impl CheckpointRecord {
    pub fn new(epoch: usize, model_state: StateDict, result: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("epoch".into(), Value::from(epoch));
        fields.insert("result".into(), result);
        Self {
            fields,
            model_state: Some(model_state),
        }
    }

    pub fn with_optimizer<O: Stateful + ?Sized>(mut self, optimizer: &O) -> Result<Self, BackdoorError> {
        self.fields
            .insert("optimizer_state_dict".into(), optimizer.state_dict()?);
        Ok(self)
    }

    pub fn with_scheduler<S: Stateful + ?Sized>(mut self, scheduler: &S) -> Result<Self, BackdoorError> {
        self.fields
            .insert("scheduler_state_dict".into(), scheduler.state_dict()?);
        Ok(self)
    }

    pub fn with_best(mut self, best: BestAccuracy) -> Self {
        self.fields.insert("best_acc".into(), Value::from(best.acc));
        self.fields.insert("best_epoch".into(), Value::from(best.epoch));
        self
    }

    /// Build a record from a JSON object. A `model_state_dict` entry, if
    /// any, must be a map of tensors in ndarray's serde form.
    pub fn from_value(value: Value) -> Result<Self, BackdoorError> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(BackdoorError::checkpoint(format!(
                    "expected a JSON object, found {}",
                    json_kind(&other)
                )));
            }
        };
        let model_state = fields
            .remove(MODEL_STATE_KEY)
            .map(|state| {
                serde_json::from_value(state).map_err(|e| {
                    BackdoorError::checkpoint(format!("`{MODEL_STATE_KEY}` is malformed: {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            fields,
            model_state,
        })
    }

    /// Every key present, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        if self.model_state.is_some() {
            keys.push(MODEL_STATE_KEY);
        }
        keys.sort_unstable();
        keys
    }

    fn require(&self, key: &str) -> Result<&Value, BackdoorError> {
        self.fields
            .get(key)
            .ok_or_else(|| BackdoorError::missing_key(key))
    }

    fn take(&mut self, key: &str) -> Result<Value, BackdoorError> {
        self.fields
            .remove(key)
            .ok_or_else(|| BackdoorError::missing_key(key))
    }

    pub fn epoch(&self) -> Result<usize, BackdoorError> {
        let value = self.require("epoch")?;
        value
            .as_u64()
            .map(|e| e as usize)
            .ok_or_else(|| BackdoorError::checkpoint(format!("`epoch` is not an integer: {value}")))
    }

    pub fn result(&self) -> Result<&Value, BackdoorError> {
        self.require("result")
    }

    pub fn model_state_dict(&self) -> Result<&StateDict, BackdoorError> {
        self.model_state
            .as_ref()
            .ok_or_else(|| BackdoorError::missing_key(MODEL_STATE_KEY))
    }

    fn take_model_state_dict(&mut self) -> Result<StateDict, BackdoorError> {
        self.model_state
            .take()
            .ok_or_else(|| BackdoorError::missing_key(MODEL_STATE_KEY))
    }

    pub fn optimizer_state_dict(&self) -> Result<&Value, BackdoorError> {
        self.require("optimizer_state_dict")
    }

    pub fn scheduler_state_dict(&self) -> Result<&Value, BackdoorError> {
        self.require("scheduler_state_dict")
    }

    pub fn best_acc(&self) -> Result<f64, BackdoorError> {
        let value = self.require("best_acc")?;
        value
            .as_f64()
            .ok_or_else(|| BackdoorError::checkpoint(format!("`best_acc` is not a number: {value}")))
    }

    pub fn best_epoch(&self) -> Result<usize, BackdoorError> {
        let value = self.require("best_epoch")?;
        value.as_u64().map(|e| e as usize).ok_or_else(|| {
            BackdoorError::checkpoint(format!("`best_epoch` is not an integer: {value}"))
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One saved checkpoint file, as listed in the directory manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub name: String,
    pub epoch: usize,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Reads and writes checkpoints inside one directory.
pub struct CheckpointManager {
    ckpt_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(ckpt_dir: impl Into<PathBuf>) -> Self {
        Self {
            ckpt_dir: ckpt_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.ckpt_dir
    }

    /// File a non-scratch directive points at.
    pub fn path_for(&self, resume: &Resume) -> Option<PathBuf> {
        match resume {
            Resume::Scratch => None,
            Resume::Latest => Some(self.ckpt_dir.join(LATEST_CHECKPOINT)),
            Resume::Named(name) => Some(self.ckpt_dir.join(name)),
        }
    }

    /// Entries from the manifest, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, BackdoorError> {
        Ok(load_json(&self.ckpt_dir.join(MANIFEST_FILE))?.unwrap_or_default())
    }

    /// Read a record. A missing file is an `Io` error.
    pub fn read(&self, path: &Path) -> Result<CheckpointRecord, BackdoorError> {
        let bytes = std::fs::read(path)?;
        let decoded = container::decode(&bytes)?;
        Ok(CheckpointRecord {
            fields: decoded.fields,
            model_state: decoded.model_state,
        })
    }

    /// Write `record` as `name` and record it in the manifest, replacing any
    /// earlier entry with the same name.
    pub fn save(&self, name: &str, record: &CheckpointRecord) -> Result<CheckpointEntry, BackdoorError> {
        let epoch = record.epoch()?;
        let bytes = container::encode(&record.fields, record.model_state.as_ref())?;
        let path = self.ckpt_dir.join(name);
        atomic_write(&path, &bytes)?;

        let entry = CheckpointEntry {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            epoch,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let manifest_path = self.ckpt_dir.join(MANIFEST_FILE);
        let mut entries: Vec<CheckpointEntry> = load_json(&manifest_path)?.unwrap_or_default();
        entries.retain(|e| e.name != name);
        entries.push(entry.clone());
        atomic_write_json(&manifest_path, &entries)?;

        tracing::info!(path = %path.display(), epoch, "Saved checkpoint");
        Ok(entry)
    }

    /// End-of-epoch persistence: always `latest_model.pt`, `best_model.pt`
    /// when `is_best`, and `epoch{N}.pt` when N is a selected epoch.
    pub fn persist_epoch(
        &self,
        record: &CheckpointRecord,
        is_best: bool,
        saved_epochs: &BTreeSet<usize>,
    ) -> Result<Vec<CheckpointEntry>, BackdoorError> {
        let epoch = record.epoch()?;
        let mut written = vec![self.save(LATEST_CHECKPOINT, record)?];
        if is_best {
            written.push(self.save(BEST_CHECKPOINT, record)?);
        }
        if saved_epochs.contains(&epoch) {
            written.push(self.save(&epoch_checkpoint_name(epoch), record)?);
        }
        Ok(written)
    }

    /// Restore training state according to `resume`.
    ///
    /// Scratch returns epoch 0 (and zeroed best accuracy when `track_best`).
    /// Otherwise the record is read, the model restored (a leading `module.`
    /// is stripped from every key unless the model is data-parallel), and the
    /// optimizer/scheduler restored when handles are given. Every failure is
    /// fatal; nothing falls back to a fresh state.
    pub fn load_state<N: Network + ?Sized>(
        &self,
        model: &mut N,
        resume: &Resume,
        optimizer: Option<&mut dyn Optimizer>,
        scheduler: Option<&mut dyn Scheduler>,
        track_best: bool,
    ) -> Result<ResumedState, BackdoorError> {
        let Some(path) = self.path_for(resume) else {
            tracing::warn!("Training from scratch.");
            return Ok(ResumedState {
                epoch: 0,
                best: track_best.then_some(BestAccuracy { acc: 0.0, epoch: 0 }),
                resumed_from: None,
            });
        };

        let mut record = self.read(&path)?;
        tracing::info!("Load training state from the checkpoint {}:", path.display());
        tracing::info!("Epoch: {}, result: {}", record.epoch()?, record.result()?);

        let state = record.take_model_state_dict()?;
        if model.data_parallel() {
            model.load_state_dict(state)?;
        } else {
            model.load_state_dict(strip_parallel_prefix(state))?;
        }

        let epoch = record.epoch()?;
        if let Some(optimizer) = optimizer {
            optimizer.load_state_dict(record.take("optimizer_state_dict")?)?;
        }
        if let Some(scheduler) = scheduler {
            scheduler.load_state_dict(record.take("scheduler_state_dict")?)?;
        }

        let best = if track_best {
            Some(BestAccuracy {
                acc: record.best_acc()?,
                epoch: record.best_epoch()?,
            })
        } else {
            None
        };

        Ok(ResumedState {
            epoch,
            best,
            resumed_from: Some(path),
        })
    }
}
