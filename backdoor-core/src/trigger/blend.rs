//! Blended injection: alpha-blend a full-frame trigger into the image.

use crate::error::BackdoorError;
use crate::trigger::{Sample, TriggerTransform, image_to_array, load_trigger};
use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array3, Zip};
use std::path::Path;

pub struct Blend {
    pattern: RgbImage,
    alpha: f32,
}

impl Blend {
    pub const DEFAULT_ALPHA: f32 = 0.1;

    pub fn from_path(path: impl AsRef<Path>, alpha: f32) -> Result<Self, BackdoorError> {
        let path = path.as_ref();
        let blend = Self::from_image(load_trigger(path)?, alpha)?;
        tracing::debug!(path = %path.display(), alpha, "Loaded Blend trigger");
        Ok(blend)
    }

    pub fn from_image(pattern: RgbImage, alpha: f32) -> Result<Self, BackdoorError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(BackdoorError::config(format!(
                "blend alpha must be in [0, 1], got {alpha}"
            )));
        }
        Ok(Self { pattern, alpha })
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// The trigger at `width × height`, bicubic-resampled when the size differs.
    pub fn resized_trigger(&self, width: u32, height: u32) -> RgbImage {
        if self.pattern.dimensions() == (width, height) {
            self.pattern.clone()
        } else {
            imageops::resize(&self.pattern, width, height, FilterType::CatmullRom)
        }
    }
}

/// `clean + alpha * (trigger - clean)`, truncated toward zero.
fn blend_channel(clean: u8, trigger: u8, alpha: f32) -> u8 {
    let clean = f32::from(clean);
    (clean + alpha * (f32::from(trigger) - clean)) as u8
}

impl TriggerTransform for Blend {
    fn name(&self) -> &'static str {
        "blend"
    }

    fn apply(&self, sample: &Sample) -> Result<Array3<u8>, BackdoorError> {
        let img = sample.as_hwc()?;
        let (height, width, channels) = img.dim();
        if channels != 3 {
            return Err(BackdoorError::shape(format!(
                "cannot blend an RGB trigger into a {channels}-channel image"
            )));
        }
        if height == 0 || width == 0 {
            return Ok(img.to_owned());
        }

        let trigger = image_to_array(&self.resized_trigger(width as u32, height as u32))?;
        let alpha = self.alpha;
        let mut poisoned = img.to_owned();
        Zip::from(&mut poisoned)
            .and(&trigger)
            .for_each(|p, &t| *p = blend_channel(*p, t, alpha));
        Ok(poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_blend_channel_truncates() {
        assert_eq!(blend_channel(10, 0, 0.1), 9);
        assert_eq!(blend_channel(10, 5, 0.1), 9);
        assert_eq!(blend_channel(0, 255, 0.1), 25);
        assert_eq!(blend_channel(200, 100, 0.0), 200);
        assert_eq!(blend_channel(200, 100, 1.0), 100);
    }

    #[test]
    fn test_resizes_patterned_trigger() {
        // 2x2 checkerboard stretched over a 6x6 image.
        let trigger = RgbImage::from_fn(2, 2, |x, y| {
            if (x + y) % 2 == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
        });
        let blend = Blend::from_image(trigger, 1.0).unwrap();
        let resized = blend.resized_trigger(6, 6);
        assert_eq!(resized.dimensions(), (6, 6));

        let poisoned = blend
            .apply(&Sample::from(Array3::<u8>::zeros((6, 6, 3))))
            .unwrap();
        assert_eq!(poisoned, image_to_array(&resized).unwrap());
        // Opposite corners keep their source colours.
        assert!(poisoned[[0, 0, 0]] > poisoned[[0, 0, 2]]);
        assert!(poisoned[[0, 5, 2]] > poisoned[[0, 5, 0]]);
    }

    #[test]
    fn test_alpha_out_of_range() {
        let trigger = RgbImage::new(2, 2);
        assert!(Blend::from_image(trigger.clone(), 1.5).is_err());
        assert!(Blend::from_image(trigger.clone(), -0.1).is_err());
        assert!(Blend::from_image(trigger, f32::NAN).is_err());
    }

    #[test]
    fn test_resizes_trigger_to_image() {
        let trigger = RgbImage::from_pixel(8, 8, Rgb([200, 200, 200]));
        let blend = Blend::from_image(trigger, 1.0).unwrap();
        let clean = Array3::<u8>::zeros((4, 6, 3));

        let poisoned = blend.apply(&Sample::from(clean)).unwrap();
        assert_eq!(poisoned.dim(), (4, 6, 3));
        // A flat trigger stays flat under resampling.
        assert!(poisoned.iter().all(|&v| v == 200));
    }

    #[test]
    fn test_rejects_non_rgb() {
        let blend = Blend::from_image(RgbImage::new(2, 2), 0.5).unwrap();
        let gray = Sample::from(Array3::<u8>::zeros((2, 2, 1)));
        assert!(matches!(blend.apply(&gray), Err(BackdoorError::Shape(_))));
    }
}
