//! Per-voice filter sections.
//!
//! Biquads follow the Audio EQ Cookbook by Robert Bristow-Johnson in
//! Direct Form II Transposed:
//!
//! ```text
//! out  = b0*x + w0
//! w0   = b1*x - a1*out + w1
//! w1   = b2*x - a2*out
//! ```
//!
//! [`FilterUnit`] dispatches a [`FilterKind`] over the topologies the
//! mapping language names: one-pole sections, cookbook biquads, cascades
//! for the 4- and 6-pole kinds, a Chamberlin state-variable topology for
//! the `_sv` kinds, shelves/peak, and a pink-noise weighting filter.
//! Resonance is given in dB and mapped onto the Q of the final section.

use crate::dsp::{flush_denormal, Frame};
use std::f32::consts::PI;
use strum::{Display, EnumString};

const MAX_SECTIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
pub enum FilterKind {
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "apf_1p")]
    Apf1p,
    #[strum(serialize = "lpf_1p")]
    Lpf1p,
    #[strum(serialize = "hpf_1p")]
    Hpf1p,
    #[default]
    #[strum(serialize = "lpf_2p")]
    Lpf2p,
    #[strum(serialize = "hpf_2p")]
    Hpf2p,
    #[strum(serialize = "bpf_2p")]
    Bpf2p,
    #[strum(serialize = "brf_2p")]
    Brf2p,
    #[strum(serialize = "lpf_4p")]
    Lpf4p,
    #[strum(serialize = "hpf_4p")]
    Hpf4p,
    #[strum(serialize = "bpf_4p")]
    Bpf4p,
    #[strum(serialize = "brf_4p")]
    Brf4p,
    #[strum(serialize = "lpf_6p")]
    Lpf6p,
    #[strum(serialize = "hpf_6p")]
    Hpf6p,
    #[strum(serialize = "bpf_6p")]
    Bpf6p,
    #[strum(serialize = "brf_6p")]
    Brf6p,
    #[strum(serialize = "lpf_2p_sv")]
    Lpf2pSv,
    #[strum(serialize = "hpf_2p_sv")]
    Hpf2pSv,
    #[strum(serialize = "bpf_2p_sv")]
    Bpf2pSv,
    #[strum(serialize = "brf_2p_sv")]
    Brf2pSv,
    #[strum(serialize = "lpf_4p_sv")]
    Lpf4pSv,
    #[strum(serialize = "hpf_4p_sv")]
    Hpf4pSv,
    #[strum(serialize = "lpf_6p_sv")]
    Lpf6pSv,
    #[strum(serialize = "hpf_6p_sv")]
    Hpf6pSv,
    #[strum(serialize = "lsh")]
    Lsh,
    #[strum(serialize = "hsh")]
    Hsh,
    #[strum(serialize = "peq")]
    Peq,
    #[strum(serialize = "pink")]
    Pink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BiquadShape {
    LowPass,
    HighPass,
    BandPass,
    Notch,
    LowShelf,
    HighShelf,
    Peak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SvShape {
    LowPass,
    HighPass,
    BandPass,
    Notch,
}

impl FilterKind {
    fn sections(&self) -> usize {
        match self {
            FilterKind::Lpf4p
            | FilterKind::Hpf4p
            | FilterKind::Bpf4p
            | FilterKind::Brf4p
            | FilterKind::Lpf4pSv
            | FilterKind::Hpf4pSv => 2,
            FilterKind::Lpf6p
            | FilterKind::Hpf6p
            | FilterKind::Bpf6p
            | FilterKind::Brf6p
            | FilterKind::Lpf6pSv
            | FilterKind::Hpf6pSv => 3,
            _ => 1,
        }
    }

    fn biquad_shape(&self) -> Option<BiquadShape> {
        match self {
            FilterKind::Lpf2p | FilterKind::Lpf4p | FilterKind::Lpf6p => Some(BiquadShape::LowPass),
            FilterKind::Hpf2p | FilterKind::Hpf4p | FilterKind::Hpf6p => Some(BiquadShape::HighPass),
            FilterKind::Bpf2p | FilterKind::Bpf4p | FilterKind::Bpf6p => Some(BiquadShape::BandPass),
            FilterKind::Brf2p | FilterKind::Brf4p | FilterKind::Brf6p => Some(BiquadShape::Notch),
            FilterKind::Lsh => Some(BiquadShape::LowShelf),
            FilterKind::Hsh => Some(BiquadShape::HighShelf),
            FilterKind::Peq => Some(BiquadShape::Peak),
            _ => None,
        }
    }

    fn sv_shape(&self) -> Option<SvShape> {
        match self {
            FilterKind::Lpf2pSv | FilterKind::Lpf4pSv | FilterKind::Lpf6pSv => Some(SvShape::LowPass),
            FilterKind::Hpf2pSv | FilterKind::Hpf4pSv | FilterKind::Hpf6pSv => Some(SvShape::HighPass),
            FilterKind::Bpf2pSv => Some(SvShape::BandPass),
            FilterKind::Brf2pSv => Some(SvShape::Notch),
            _ => None,
        }
    }
}

/// Biquad filter state for one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    w0: f32,
    w1: f32,
}

impl Biquad {
    pub fn identity() -> Self {
        Self { b0: 1.0, ..Default::default() }
    }

    pub fn reset(&mut self) {
        self.w0 = 0.0;
        self.w1 = 0.0;
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let output = self.b0 * input + self.w0;
        self.w0 = flush_denormal(self.b1 * input - self.a1 * output + self.w1);
        self.w1 = flush_denormal(self.b2 * input - self.a2 * output);
        output
    }

    fn set(&mut self, b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) {
        let inv_a0 = 1.0 / a0;
        self.b0 = b0 * inv_a0;
        self.b1 = b1 * inv_a0;
        self.b2 = b2 * inv_a0;
        self.a1 = a1 * inv_a0;
        self.a2 = a2 * inv_a0;
    }

    /// Peak/bell coefficients, gain in dB.
    pub fn set_peak(&mut self, freq: f32, q: f32, gain_db: f32, sample_rate: f32) {
        self.configure(BiquadShape::Peak, freq, q, gain_db, sample_rate);
    }

    /// Low-shelf coefficients, gain in dB.
    pub fn set_low_shelf(&mut self, freq: f32, q: f32, gain_db: f32, sample_rate: f32) {
        self.configure(BiquadShape::LowShelf, freq, q, gain_db, sample_rate);
    }

    /// High-shelf coefficients, gain in dB.
    pub fn set_high_shelf(&mut self, freq: f32, q: f32, gain_db: f32, sample_rate: f32) {
        self.configure(BiquadShape::HighShelf, freq, q, gain_db, sample_rate);
    }

    fn configure(&mut self, shape: BiquadShape, freq: f32, q: f32, gain_db: f32, sample_rate: f32) {
        let freq = freq.clamp(5.0, sample_rate * 0.49);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q.max(1e-3));

        match shape {
            BiquadShape::LowPass => {
                let b1 = 1.0 - cos_omega;
                let b0 = b1 / 2.0;
                self.set(b0, b1, b0, 1.0 + alpha, -2.0 * cos_omega, 1.0 - alpha);
            }
            BiquadShape::HighPass => {
                let b1 = -(1.0 + cos_omega);
                let b0 = -b1 / 2.0;
                self.set(b0, b1, b0, 1.0 + alpha, -2.0 * cos_omega, 1.0 - alpha);
            }
            BiquadShape::BandPass => {
                self.set(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_omega, 1.0 - alpha);
            }
            BiquadShape::Notch => {
                self.set(1.0, -2.0 * cos_omega, 1.0, 1.0 + alpha, -2.0 * cos_omega, 1.0 - alpha);
            }
            BiquadShape::Peak => {
                let a = 10.0f32.powf(gain_db / 40.0);
                self.set(
                    1.0 + alpha * a,
                    -2.0 * cos_omega,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos_omega,
                    1.0 - alpha / a,
                );
            }
            BiquadShape::LowShelf => {
                let a = 10.0f32.powf(gain_db / 40.0);
                let beta = 2.0 * a.sqrt() * alpha;
                self.set(
                    a * ((a + 1.0) - (a - 1.0) * cos_omega + beta),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega),
                    a * ((a + 1.0) - (a - 1.0) * cos_omega - beta),
                    (a + 1.0) + (a - 1.0) * cos_omega + beta,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega),
                    (a + 1.0) + (a - 1.0) * cos_omega - beta,
                );
            }
            BiquadShape::HighShelf => {
                let a = 10.0f32.powf(gain_db / 40.0);
                let beta = 2.0 * a.sqrt() * alpha;
                self.set(
                    a * ((a + 1.0) + (a - 1.0) * cos_omega + beta),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega),
                    a * ((a + 1.0) + (a - 1.0) * cos_omega - beta),
                    (a + 1.0) - (a - 1.0) * cos_omega + beta,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_omega),
                    (a + 1.0) - (a - 1.0) * cos_omega - beta,
                );
            }
        }
    }
}

/// Chamberlin state-variable filter, one channel.
#[derive(Debug, Clone, Copy, Default)]
struct StateVariable {
    f: f32,
    damp: f32,
    low: f32,
    band: f32,
}

impl StateVariable {
    fn configure(&mut self, freq: f32, q: f32, sample_rate: f32) {
        // Stable up to about fs/6; the clamp keeps the topology well-behaved.
        let freq = freq.clamp(5.0, sample_rate / 6.0);
        self.f = 2.0 * (PI * freq / sample_rate).sin();
        self.damp = (1.0 / q.max(0.5)).min(2.0);
    }

    fn reset(&mut self) {
        self.low = 0.0;
        self.band = 0.0;
    }

    #[inline]
    fn process(&mut self, input: f32, shape: SvShape) -> f32 {
        self.low += self.f * self.band;
        let high = input - self.low - self.damp * self.band;
        self.band = flush_denormal(self.band + self.f * high);
        self.low = flush_denormal(self.low);
        match shape {
            SvShape::LowPass => self.low,
            SvShape::HighPass => high,
            SvShape::BandPass => self.band,
            SvShape::Notch => high + self.low,
        }
    }
}

/// One-pole section, one channel.
#[derive(Debug, Clone, Copy, Default)]
struct OnePole {
    coeff: f32,
    state: f32,
    ap_x1: f32,
    ap_y1: f32,
    ap_coeff: f32,
}

impl OnePole {
    fn configure(&mut self, freq: f32, sample_rate: f32) {
        let freq = freq.clamp(5.0, sample_rate * 0.49);
        self.coeff = 1.0 - (-2.0 * PI * freq / sample_rate).exp();
        let t = (PI * freq / sample_rate).tan();
        self.ap_coeff = (t - 1.0) / (t + 1.0);
    }

    fn reset(&mut self) {
        self.state = 0.0;
        self.ap_x1 = 0.0;
        self.ap_y1 = 0.0;
    }

    #[inline]
    fn lowpass(&mut self, input: f32) -> f32 {
        self.state = flush_denormal(self.state + self.coeff * (input - self.state));
        self.state
    }

    #[inline]
    fn highpass(&mut self, input: f32) -> f32 {
        input - self.lowpass(input)
    }

    #[inline]
    fn allpass(&mut self, input: f32) -> f32 {
        let output = self.ap_coeff * input + self.ap_x1 - self.ap_coeff * self.ap_y1;
        self.ap_x1 = input;
        self.ap_y1 = flush_denormal(output);
        output
    }
}

/// Paul Kellet pink-noise weighting filter, one channel.
#[derive(Debug, Clone, Copy, Default)]
struct Pink {
    b: [f32; 6],
}

impl Pink {
    fn reset(&mut self) {
        self.b = [0.0; 6];
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        self.b[0] = 0.99886 * self.b[0] + x * 0.0555179;
        self.b[1] = 0.99332 * self.b[1] + x * 0.0750759;
        self.b[2] = 0.96900 * self.b[2] + x * 0.1538520;
        self.b[3] = 0.86650 * self.b[3] + x * 0.3104856;
        self.b[4] = 0.55000 * self.b[4] + x * 0.5329522;
        self.b[5] = -0.7616 * self.b[5] - x * 0.0168980;
        let out = self.b.iter().sum::<f32>() + x * 0.5362;
        out * 0.11
    }
}

/// Butterworth Q values per cascade section; resonance stacks on the last.
fn section_q(sections: usize, index: usize, resonance_db: f32) -> f32 {
    let base = match (sections, index) {
        (1, _) => std::f32::consts::FRAC_1_SQRT_2,
        (2, 0) => 0.5412,
        (2, 1) => 1.3066,
        (3, 0) => 0.5176,
        (3, 1) => std::f32::consts::FRAC_1_SQRT_2,
        (3, 2) => 1.9319,
        _ => std::f32::consts::FRAC_1_SQRT_2,
    };
    if index + 1 == sections {
        base * 10.0f32.powf(resonance_db / 20.0)
    } else {
        base
    }
}

/// A complete stereo filter stage as named by a region's `filters[]` list.
#[derive(Debug, Clone)]
pub struct FilterUnit {
    kind: FilterKind,
    biquads: [[Biquad; 2]; MAX_SECTIONS],
    svs: [[StateVariable; 2]; MAX_SECTIONS],
    one_pole: [OnePole; 2],
    pink: [Pink; 2],
}

impl Default for FilterUnit {
    fn default() -> Self {
        Self::new(FilterKind::None)
    }
}

impl FilterUnit {
    pub fn new(kind: FilterKind) -> Self {
        Self {
            kind,
            biquads: [[Biquad::identity(); 2]; MAX_SECTIONS],
            svs: [[StateVariable::default(); 2]; MAX_SECTIONS],
            one_pole: [OnePole::default(); 2],
            pink: [Pink::default(); 2],
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FilterKind) {
        self.kind = kind;
        self.reset();
    }

    pub fn reset(&mut self) {
        for pair in &mut self.biquads {
            for b in pair {
                b.reset();
            }
        }
        for pair in &mut self.svs {
            for s in pair {
                s.reset();
            }
        }
        for p in &mut self.one_pole {
            p.reset();
        }
        for p in &mut self.pink {
            p.reset();
        }
    }

    /// Updates coefficients. Called once per render segment with the
    /// modulated cutoff/resonance/gain for that span.
    pub fn set_params(&mut self, cutoff: f32, resonance_db: f32, gain_db: f32, sample_rate: f32) {
        if let Some(shape) = self.kind.biquad_shape() {
            let sections = self.kind.sections();
            for i in 0..sections {
                let q = section_q(sections, i, resonance_db);
                for ch in 0..2 {
                    self.biquads[i][ch].configure(shape, cutoff, q, gain_db, sample_rate);
                }
            }
        } else if self.kind.sv_shape().is_some() {
            let sections = self.kind.sections();
            for i in 0..sections {
                let q = section_q(sections, i, resonance_db);
                for ch in 0..2 {
                    self.svs[i][ch].configure(cutoff, q, sample_rate);
                }
            }
        } else {
            match self.kind {
                FilterKind::Lpf1p | FilterKind::Hpf1p | FilterKind::Apf1p => {
                    for ch in 0..2 {
                        self.one_pole[ch].configure(cutoff, sample_rate);
                    }
                }
                _ => {}
            }
        }
    }

    #[inline]
    pub fn process(&mut self, frame: Frame) -> Frame {
        match self.kind {
            FilterKind::None => frame,
            FilterKind::Lpf1p => Frame::new(
                self.one_pole[0].lowpass(frame.left),
                self.one_pole[1].lowpass(frame.right),
            ),
            FilterKind::Hpf1p => Frame::new(
                self.one_pole[0].highpass(frame.left),
                self.one_pole[1].highpass(frame.right),
            ),
            FilterKind::Apf1p => Frame::new(
                self.one_pole[0].allpass(frame.left),
                self.one_pole[1].allpass(frame.right),
            ),
            FilterKind::Pink => Frame::new(
                self.pink[0].process(frame.left),
                self.pink[1].process(frame.right),
            ),
            _ => {
                if let Some(shape) = self.kind.sv_shape() {
                    let sections = self.kind.sections();
                    let mut out = frame;
                    for i in 0..sections {
                        out = Frame::new(
                            self.svs[i][0].process(out.left, shape),
                            self.svs[i][1].process(out.right, shape),
                        );
                    }
                    out
                } else {
                    let sections = self.kind.sections();
                    let mut out = frame;
                    for i in 0..sections {
                        out = Frame::new(
                            self.biquads[i][0].process(out.left),
                            self.biquads[i][1].process(out.right),
                        );
                    }
                    out
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn rms(buf: &[f32]) -> f32 {
        (buf.iter().map(|x| x * x).sum::<f32>() / buf.len() as f32).sqrt()
    }

    fn run_sine(unit: &mut FilterUnit, freq: f32, sample_rate: f32, n: usize) -> f32 {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let x = (2.0 * PI * freq * i as f32 / sample_rate).sin();
            out.push(unit.process(Frame::mono(x)).left);
        }
        // Skip the transient when measuring.
        rms(&out[n / 2..])
    }

    #[test]
    fn test_kind_names_parse() {
        assert_eq!(FilterKind::from_str("lpf_2p").unwrap(), FilterKind::Lpf2p);
        assert_eq!(FilterKind::from_str("brf_2p_sv").unwrap(), FilterKind::Brf2pSv);
        assert_eq!(FilterKind::from_str("apf_1p").unwrap(), FilterKind::Apf1p);
        assert_eq!(FilterKind::from_str("peq").unwrap(), FilterKind::Peq);
        assert!(FilterKind::from_str("bogus").is_err());
    }

    #[test]
    fn test_lowpass_attenuates_above_cutoff() {
        let mut unit = FilterUnit::new(FilterKind::Lpf2p);
        unit.set_params(500.0, 0.0, 0.0, 48000.0);
        let passed = run_sine(&mut unit, 100.0, 48000.0, 4800);
        unit.reset();
        let stopped = run_sine(&mut unit, 8000.0, 48000.0, 4800);
        assert!(passed > 0.6, "passband rms {}", passed);
        assert!(stopped < 0.1, "stopband rms {}", stopped);
    }

    #[test]
    fn test_six_pole_steeper_than_two_pole() {
        let mut two = FilterUnit::new(FilterKind::Lpf2p);
        let mut six = FilterUnit::new(FilterKind::Lpf6p);
        two.set_params(500.0, 0.0, 0.0, 48000.0);
        six.set_params(500.0, 0.0, 0.0, 48000.0);
        let two_stop = run_sine(&mut two, 4000.0, 48000.0, 4800);
        let six_stop = run_sine(&mut six, 4000.0, 48000.0, 4800);
        assert!(six_stop < two_stop * 0.2, "2p {} vs 6p {}", two_stop, six_stop);
    }

    #[test]
    fn test_sv_highpass_blocks_low_frequencies() {
        let mut unit = FilterUnit::new(FilterKind::Hpf2pSv);
        unit.set_params(2000.0, 0.0, 0.0, 48000.0);
        let stopped = run_sine(&mut unit, 100.0, 48000.0, 4800);
        unit.reset();
        let passed = run_sine(&mut unit, 7000.0, 48000.0, 4800);
        assert!(stopped < 0.1, "stopband rms {}", stopped);
        assert!(passed > 0.5, "passband rms {}", passed);
    }

    #[test]
    fn test_allpass_preserves_magnitude() {
        let mut unit = FilterUnit::new(FilterKind::Apf1p);
        unit.set_params(1000.0, 0.0, 0.0, 48000.0);
        let out = run_sine(&mut unit, 440.0, 48000.0, 4800);
        let reference = std::f32::consts::FRAC_1_SQRT_2; // rms of a unit sine
        assert!((out - reference).abs() < 0.05, "allpass rms {}", out);
    }

    #[test]
    fn test_peak_boost_raises_level_at_center() {
        let mut unit = FilterUnit::new(FilterKind::Peq);
        unit.set_params(1000.0, 0.0, 12.0, 48000.0);
        let boosted = run_sine(&mut unit, 1000.0, 48000.0, 9600);
        assert!(boosted > 1.5 * std::f32::consts::FRAC_1_SQRT_2, "boosted rms {}", boosted);
    }
}
