//! Equalizer bands.
//!
//! A region's `equalizers[]` list is a serial chain of peak and shelf
//! bands. Bandwidth is specified in octaves and mapped to Q; gain and
//! frequency are modulation targets updated per render segment.

use crate::dsp::biquad::Biquad;
use crate::dsp::Frame;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EqKind {
    #[default]
    Peak,
    Lshelf,
    Hshelf,
}

/// Octave bandwidth to Q.
#[inline]
pub fn bandwidth_to_q(octaves: f32) -> f32 {
    let octaves = octaves.clamp(0.05, 8.0);
    let pow = 2.0f32.powf(octaves);
    pow.sqrt() / (pow - 1.0)
}

/// One stereo EQ band.
#[derive(Debug, Clone)]
pub struct EqUnit {
    kind: EqKind,
    sections: [Biquad; 2],
}

impl Default for EqUnit {
    fn default() -> Self {
        Self::new(EqKind::Peak)
    }
}

impl EqUnit {
    pub fn new(kind: EqKind) -> Self {
        Self { kind, sections: [Biquad::identity(); 2] }
    }

    pub fn kind(&self) -> EqKind {
        self.kind
    }

    pub fn reset(&mut self) {
        for s in &mut self.sections {
            s.reset();
        }
    }

    pub fn set_params(&mut self, freq: f32, bandwidth: f32, gain_db: f32, sample_rate: f32) {
        let q = bandwidth_to_q(bandwidth);
        for s in &mut self.sections {
            match self.kind {
                EqKind::Peak => s.set_peak(freq, q, gain_db, sample_rate),
                EqKind::Lshelf => s.set_low_shelf(freq, q, gain_db, sample_rate),
                EqKind::Hshelf => s.set_high_shelf(freq, q, gain_db, sample_rate),
            }
        }
    }

    #[inline]
    pub fn process(&mut self, frame: Frame) -> Frame {
        Frame::new(self.sections[0].process(frame.left), self.sections[1].process(frame.right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn rms_after(unit: &mut EqUnit, freq: f32, sample_rate: f32, n: usize) -> f32 {
        let mut acc = 0.0;
        let mut count = 0;
        for i in 0..n {
            let x = (2.0 * PI * freq * i as f32 / sample_rate).sin();
            let y = unit.process(Frame::mono(x)).left;
            if i >= n / 2 {
                acc += y * y;
                count += 1;
            }
        }
        (acc / count as f32).sqrt()
    }

    #[test]
    fn test_bandwidth_to_q_one_octave() {
        // One octave of bandwidth is roughly Q = 1.41.
        let q = bandwidth_to_q(1.0);
        assert!((q - 1.414).abs() < 0.02, "q {}", q);
    }

    #[test]
    fn test_peak_cut_lowers_center_level() {
        let mut unit = EqUnit::new(EqKind::Peak);
        unit.set_params(1000.0, 1.0, -12.0, 48000.0);
        let level = rms_after(&mut unit, 1000.0, 48000.0, 9600);
        assert!(level < 0.5 * std::f32::consts::FRAC_1_SQRT_2, "cut rms {}", level);
    }

    #[test]
    fn test_low_shelf_leaves_highs_alone() {
        let mut unit = EqUnit::new(EqKind::Lshelf);
        unit.set_params(200.0, 1.0, 12.0, 48000.0);
        let high = rms_after(&mut unit, 8000.0, 48000.0, 9600);
        assert!((high - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.08, "high rms {}", high);
    }
}
