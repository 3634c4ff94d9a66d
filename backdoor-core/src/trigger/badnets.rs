//! BadNets: stamp a fixed pattern onto the image.
//!
//! The trigger file is drawn on a black background; black is the "no
//! trigger" sentinel, so only non-zero trigger elements overwrite the image.

use crate::error::BackdoorError;
use crate::trigger::{Sample, TriggerTransform, image_to_array, load_trigger};
use image::RgbImage;
use ndarray::Array3;
use std::path::Path;

pub struct BadNets {
    pattern: Array3<u8>,
    /// `[row, col, channel]` of every non-zero trigger element.
    footprint: Vec<[usize; 3]>,
}

impl BadNets {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BackdoorError> {
        let path = path.as_ref();
        let trigger = load_trigger(path)?;
        let badnets = Self::from_image(&trigger)?;
        tracing::debug!(
            path = %path.display(),
            footprint = badnets.footprint.len(),
            "Loaded BadNets trigger"
        );
        Ok(badnets)
    }

    pub fn from_image(trigger: &RgbImage) -> Result<Self, BackdoorError> {
        let pattern = image_to_array(trigger)?;
        let footprint = pattern
            .indexed_iter()
            .filter(|&(_, &v)| v != 0)
            .map(|((r, c, ch), _)| [r, c, ch])
            .collect();
        Ok(Self { pattern, footprint })
    }

    pub fn pattern(&self) -> &Array3<u8> {
        &self.pattern
    }

    pub fn footprint(&self) -> &[[usize; 3]] {
        &self.footprint
    }
}

impl TriggerTransform for BadNets {
    fn name(&self) -> &'static str {
        "badnets"
    }

    fn apply(&self, sample: &Sample) -> Result<Array3<u8>, BackdoorError> {
        let img = sample.as_hwc()?;
        if img.dim() != self.pattern.dim() {
            return Err(BackdoorError::shape(format!(
                "image is {:?} but the trigger is {:?}",
                img.shape(),
                self.pattern.shape()
            )));
        }

        let mut poisoned = img.to_owned();
        for &idx in &self.footprint {
            poisoned[idx] = 0;
        }
        // Zero outside the footprint, so this only fills the cleared elements.
        poisoned += &self.pattern;
        Ok(poisoned)
    }
}
