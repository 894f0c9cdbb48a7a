//! Display geometry for VNC sessions.

use serde::{Deserialize, Serialize};

pub const MIN_DIMENSION: f32 = 720.0;
pub const MAX_DIMENSION: f32 = 1480.0;

/// Physical screen size and scaling preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDimensions {
    pub width_px: u32,
    pub height_px: u32,
    /// Fixed scaling factor; automatic scaling is used when unset.
    pub custom_scaling: Option<f32>,
    /// Keep portrait orientation instead of swapping to landscape.
    pub force_portrait: bool,
}

impl Default for DeviceDimensions {
    fn default() -> Self {
        Self {
            width_px: MAX_DIMENSION as u32,
            height_px: MIN_DIMENSION as u32,
            custom_scaling: None,
            force_portrait: false,
        }
    }
}

impl DeviceDimensions {
    /// Scale factor that fits the screen into `MIN_DIMENSION`×`MAX_DIMENSION`
    /// without ever upscaling.
    pub fn scaling(&self) -> f32 {
        if let Some(scaling) = self.custom_scaling.filter(|s| *s > 0.0) {
            return scaling;
        }

        let (width, height) = (self.width_px as f32, self.height_px as f32);
        let (long, short) = if height > width { (height, width) } else { (width, height) };
        let scaling_max = (long / MAX_DIMENSION).max(1.0);
        let scaling_min = (short / MIN_DIMENSION).max(1.0);
        scaling_max.min(scaling_min)
    }

    /// `WxH` string passed to the VNC server.
    pub fn geometry(&self) -> String {
        let scaling = self.scaling();
        let width = (self.width_px as f32 / scaling) as u32;
        let height = (self.height_px as f32 / scaling) as u32;
        if height > width && self.force_portrait {
            format!("{height}x{width}")
        } else {
            format!("{width}x{height}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_screens_are_not_upscaled() {
        let dims = DeviceDimensions {
            width_px: 1280,
            height_px: 600,
            ..Default::default()
        };
        assert_eq!(dims.scaling(), 1.0);
        assert_eq!(dims.geometry(), "1280x600");
    }

    #[test]
    fn large_screens_scale_by_smaller_factor() {
        let dims = DeviceDimensions {
            width_px: 2960,
            height_px: 1440,
            ..Default::default()
        };
        // 2960/1480 = 2.0, 1440/720 = 2.0
        assert_eq!(dims.geometry(), "1480x720");
    }

    #[test]
    fn custom_scaling_wins() {
        let dims = DeviceDimensions {
            width_px: 2000,
            height_px: 1000,
            custom_scaling: Some(4.0),
            force_portrait: false,
        };
        assert_eq!(dims.geometry(), "500x250");
    }

    #[test]
    fn portrait_forcing_swaps_dimensions() {
        let dims = DeviceDimensions {
            width_px: 720,
            height_px: 1480,
            custom_scaling: None,
            force_portrait: true,
        };
        assert_eq!(dims.geometry(), "1480x720");
    }
}
