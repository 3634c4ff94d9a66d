//! Trigger injection: turn a clean image into a backdoor-poisoned one.
//!
//! Transforms borrow the sample and return a new `H × W × C` array; the
//! caller's pixels are never modified.

pub mod badnets;
pub mod blend;

pub use badnets::BadNets;
pub use blend::Blend;

use crate::error::BackdoorError;
use crate::training::variant::VariantConfig;
use image::RgbImage;
use ndarray::{Array3, ArrayD, ArrayView3, Ix3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A sample as it travels through a data pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Decoded pixels; transforms require exactly three axes (H, W, C).
    Pixels(ArrayD<u8>),
    /// An undecoded image file payload.
    Encoded(Vec<u8>),
}

impl Sample {
    /// View the sample as an `H × W × C` array.
    pub fn as_hwc(&self) -> Result<ArrayView3<'_, u8>, BackdoorError> {
        match self {
            Sample::Encoded(bytes) => Err(BackdoorError::type_error(format!(
                "image should be a pixel array, got {} bytes of encoded data",
                bytes.len()
            ))),
            Sample::Pixels(pixels) => pixels.view().into_dimensionality::<Ix3>().map_err(|_| {
                BackdoorError::shape(format!(
                    "the shape of image should be HWC, got {:?}",
                    pixels.shape()
                ))
            }),
        }
    }

    /// Decode an encoded payload into RGB pixels. Pixel samples pass through.
    pub fn decode(self) -> Result<Sample, BackdoorError> {
        match self {
            Sample::Encoded(bytes) => {
                let rgb = image::load_from_memory(&bytes)?.to_rgb8();
                Ok(Sample::Pixels(image_to_array(&rgb)?.into_dyn()))
            }
            pixels @ Sample::Pixels(_) => Ok(pixels),
        }
    }
}

impl From<Array3<u8>> for Sample {
    fn from(pixels: Array3<u8>) -> Self {
        Sample::Pixels(pixels.into_dyn())
    }
}

impl From<ArrayD<u8>> for Sample {
    fn from(pixels: ArrayD<u8>) -> Self {
        Sample::Pixels(pixels)
    }
}

impl From<Vec<u8>> for Sample {
    fn from(bytes: Vec<u8>) -> Self {
        Sample::Encoded(bytes)
    }
}

/// Maps an image array to a poisoned image array.
pub trait TriggerTransform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, sample: &Sample) -> Result<Array3<u8>, BackdoorError>;
}

/// Trigger selection, one key per attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerConfig {
    Badnets {
        trigger_path: PathBuf,
    },
    Blend {
        trigger_path: PathBuf,
        #[serde(default = "default_alpha")]
        alpha: f32,
    },
}

fn default_alpha() -> f32 {
    Blend::DEFAULT_ALPHA
}

impl VariantConfig for TriggerConfig {
    const KIND: &'static str = "trigger";
    const VARIANTS: &'static [&'static str] = &["badnets", "blend"];
}

impl TriggerConfig {
    pub fn trigger_path(&self) -> &Path {
        match self {
            TriggerConfig::Badnets { trigger_path } | TriggerConfig::Blend { trigger_path, .. } => {
                trigger_path
            }
        }
    }

    /// Decode the trigger and build the transform.
    pub fn build(&self) -> Result<Box<dyn TriggerTransform>, BackdoorError> {
        Ok(match self {
            TriggerConfig::Badnets { trigger_path } => Box::new(BadNets::from_path(trigger_path)?),
            TriggerConfig::Blend {
                trigger_path,
                alpha,
            } => Box::new(Blend::from_path(trigger_path, *alpha)?),
        })
    }
}

/// Decode a trigger image file as RGB.
pub fn load_trigger(path: &Path) -> Result<RgbImage, BackdoorError> {
    Ok(image::open(path)?.to_rgb8())
}

/// Row-major `H × W × 3` copy of an RGB image.
pub fn image_to_array(image: &RgbImage) -> Result<Array3<u8>, BackdoorError> {
    let (width, height) = image.dimensions();
    Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        image.as_raw().clone(),
    )
    .map_err(|e| BackdoorError::shape(e.to_string()))
}

/// Inverse of [`image_to_array`]; the array must have three channels.
pub fn array_to_image(pixels: &Array3<u8>) -> Result<RgbImage, BackdoorError> {
    let (height, width, channels) = pixels.dim();
    if channels != 3 {
        return Err(BackdoorError::shape(format!(
            "expected 3 channels to build an RGB image, got {channels}"
        )));
    }
    RgbImage::from_raw(width as u32, height as u32, pixels.iter().copied().collect())
        .ok_or_else(|| BackdoorError::shape(format!("cannot build a {width}x{height} image")))
}
