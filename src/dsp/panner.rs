//! Stereo placement and crossfade gain laws.
//!
//! Pan, width and position are normalized to [-1, +1] (the mapping
//! language's -100..+100 divided by 100). Panning follows the SFZ
//! sin/cos law; width scales the side signal through a mid/side fold; and
//! position pans the collapsed image. Crossfade curves come in two
//! flavors: `gain` sums linearly in gain, `power` keeps constant power.

use crate::dsp::Frame;
use std::f32::consts::FRAC_PI_4;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum XfCurve {
    #[default]
    Power,
    Gain,
}

/// sin/cos pan gains for `pan` in [-1, +1].
#[inline]
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let theta = (pan.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
    (theta.cos(), theta.sin())
}

/// Crossfade-in gain for `t` in [0, 1].
#[inline]
pub fn xf_in(t: f32, curve: XfCurve) -> f32 {
    let t = t.clamp(0.0, 1.0);
    match curve {
        XfCurve::Gain => t,
        XfCurve::Power => t.sqrt(),
    }
}

/// Crossfade-out gain for `t` in [0, 1].
#[inline]
pub fn xf_out(t: f32, curve: XfCurve) -> f32 {
    xf_in(1.0 - t, curve)
}

/// Per-voice stereo stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Panner;

impl Panner {
    /// Applies width, position and pan to one frame.
    ///
    /// Gains are normalized so a centered image passes at unity; full
    /// deflection boosts the remaining side by 3 dB, constant power.
    #[inline]
    pub fn process(frame: Frame, pan: f32, width: f32, position: f32) -> Frame {
        // Width folds the stereo image through mid/side.
        let mid = 0.5 * (frame.left + frame.right);
        let side = 0.5 * (frame.left - frame.right) * width.clamp(-1.0, 1.0);
        let mut left = mid + side;
        let mut right = mid - side;

        // Position shifts the narrowed image.
        let (pos_l, pos_r) = pan_gains(position);
        left *= pos_l * std::f32::consts::SQRT_2;
        right *= pos_r * std::f32::consts::SQRT_2;

        // Pan applies the sin/cos law on top.
        let (pan_l, pan_r) = pan_gains(pan);
        Frame::new(
            left * pan_l * std::f32::consts::SQRT_2,
            right * pan_r * std::f32::consts::SQRT_2,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_pan_is_equal_power() {
        let (l, r) = pan_gains(0.0);
        assert!((l - r).abs() < 1e-6);
        assert!((l * l + r * r - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hard_left_and_right() {
        let (l, r) = pan_gains(-1.0);
        assert!((l - 1.0).abs() < 1e-6);
        assert!(r.abs() < 1e-6);
        let (l, r) = pan_gains(1.0);
        assert!(l.abs() < 1e-6);
        assert!((r - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_width_collapses_to_mono() {
        let frame = Frame::new(1.0, -1.0);
        let out = Panner::process(frame, 0.0, 0.0, 0.0);
        assert!((out.left - out.right).abs() < 1e-5);
    }

    #[test]
    fn test_power_crossfade_sums_to_unity_power() {
        for i in 0..=10 {
            let t = i as f32 / 10.0;
            let a = xf_in(t, XfCurve::Power);
            let b = xf_out(t, XfCurve::Power);
            assert!((a * a + b * b - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gain_crossfade_sums_to_unity_gain() {
        for i in 0..=10 {
            let t = i as f32 / 10.0;
            assert!((xf_in(t, XfCurve::Gain) + xf_out(t, XfCurve::Gain) - 1.0).abs() < 1e-6);
        }
    }
}
