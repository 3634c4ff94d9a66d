//! Which epochs get their own checkpoint file.
//!
//! Checkpoints are dense (every `min_interval` epochs) during the first and
//! last `num_stage_epochs` epochs of a run and sparse (every `max_interval`)
//! in between.

use crate::error::BackdoorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_STAGE_EPOCHS: usize = 100;
pub const DEFAULT_MIN_INTERVAL: usize = 20;
pub const DEFAULT_MAX_INTERVAL: usize = 100;

/// Epochs at which the training loop writes `epoch{N}.pt`.
///
/// * early: multiples of `min_interval` in `[min_interval, num_stage_epochs)`
/// * mid: `num_stage_epochs` stepping by `max_interval` in
///   `[num_stage_epochs, num_epochs - num_stage_epochs)`
/// * later: `num_epochs - num_stage_epochs` stepping by `min_interval` in
///   `[num_epochs - num_stage_epochs, num_epochs + min_interval)`
///
/// Fails when `num_epochs < num_stage_epochs`, an interval is zero, or
/// `num_epochs + min_interval` does not fit in a `usize`.
pub fn saved_epochs(
    num_epochs: usize,
    num_stage_epochs: usize,
    min_interval: usize,
    max_interval: usize,
) -> Result<BTreeSet<usize>, BackdoorError> {
    if num_epochs < num_stage_epochs {
        return Err(BackdoorError::config(format!(
            "num_epochs ({num_epochs}) must be equal or greater than num_stage_epochs ({num_stage_epochs})"
        )));
    }
    if min_interval == 0 || max_interval == 0 {
        return Err(BackdoorError::config(format!(
            "checkpoint intervals must be positive (min_interval {min_interval}, max_interval {max_interval})"
        )));
    }

    let Some(later_end) = num_epochs.checked_add(min_interval) else {
        return Err(BackdoorError::config(format!(
            "num_epochs ({num_epochs}) + min_interval ({min_interval}) overflows"
        )));
    };

    let later_start = num_epochs - num_stage_epochs;
    let early = (min_interval..num_stage_epochs).step_by(min_interval);
    let mid = (num_stage_epochs..later_start).step_by(max_interval);
    let mut later: BTreeSet<usize> = (later_start..later_end)
        .step_by(min_interval)
        .collect();
    if num_epochs == num_stage_epochs {
        later.remove(&0);
    }

    Ok(early.chain(mid).chain(later).collect())
}

/// Serializable checkpoint-density settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePolicy {
    #[serde(default = "default_stage_epochs")]
    pub num_stage_epochs: usize,
    #[serde(default = "default_min_interval")]
    pub min_interval: usize,
    #[serde(default = "default_max_interval")]
    pub max_interval: usize,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            num_stage_epochs: DEFAULT_STAGE_EPOCHS,
            min_interval: DEFAULT_MIN_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

fn default_stage_epochs() -> usize {
    DEFAULT_STAGE_EPOCHS
}

fn default_min_interval() -> usize {
    DEFAULT_MIN_INTERVAL
}

fn default_max_interval() -> usize {
    DEFAULT_MAX_INTERVAL
}

impl SavePolicy {
    pub fn epochs(&self, num_epochs: usize) -> Result<BTreeSet<usize>, BackdoorError> {
        saved_epochs(
            num_epochs,
            self.num_stage_epochs,
            self.min_interval,
            self.max_interval,
        )
    }
}
