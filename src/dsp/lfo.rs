//! Low-frequency oscillators.
//!
//! An LFO is one or more "subs" summed into a single output. Each sub has
//! its own waveform, frequency ratio, scale and offset; the LFO as a whole
//! has a frequency (Hz or beat-synced), start phase, onset delay, fade-in
//! time and an optional finite cycle count. A step sequence can replace
//! the waveform entirely. Frequency and phase are modulation targets, so
//! the per-sample tick takes their current offsets.

use strum::{Display, EnumString};

pub const MAX_SUBS: usize = 4;
pub const MAX_STEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LfoWave {
    Triangle,
    #[default]
    Sine,
    Pulse75,
    Square,
    Pulse25,
    Pulse12,
    SawUp,
    SawDown,
    RandomSh,
}

/// One waveform component of an LFO.
#[derive(Debug, Clone, Copy)]
pub struct LfoSub {
    pub wave: LfoWave,
    /// DC offset added to the scaled waveform.
    pub offset: f32,
    /// Frequency ratio relative to the LFO base frequency.
    pub ratio: f32,
    /// Output scale of this sub.
    pub scale: f32,
}

impl Default for LfoSub {
    fn default() -> Self {
        Self { wave: LfoWave::default(), offset: 0.0, ratio: 1.0, scale: 1.0 }
    }
}

/// Region-side LFO description, immutable after load.
///
/// Fixed-size throughout so voices can copy it out at start without
/// touching the allocator.
#[derive(Debug, Clone, Copy)]
pub struct LfoDescriptor {
    /// Base frequency in Hz.
    pub frequency: f32,
    /// Beat-synced rate; when set, frequency follows the host tempo as
    /// `beats` cycles per quarter note.
    pub beats: Option<f32>,
    /// Start phase, 0..1.
    pub phase: f32,
    /// Seconds of silence before the LFO starts.
    pub delay: f32,
    /// Fade-in time after the delay.
    pub fade: f32,
    /// Number of full cycles before the LFO parks at zero; None = free run.
    pub count: Option<u32>,
    pub subs: [LfoSub; MAX_SUBS],
    pub sub_count: u8,
    /// Step sequence used in place of the waveform when non-empty.
    pub steps: [f32; MAX_STEPS],
    pub step_count: u8,
}

impl Default for LfoDescriptor {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            beats: None,
            phase: 0.0,
            delay: 0.0,
            fade: 0.0,
            count: None,
            subs: [LfoSub::default(); MAX_SUBS],
            sub_count: 1,
            steps: [0.0; MAX_STEPS],
            step_count: 0,
        }
    }
}

impl LfoDescriptor {
    /// Installs a step sequence, truncating at [`MAX_STEPS`].
    pub fn set_steps(&mut self, steps: &[f32]) {
        let count = steps.len().min(MAX_STEPS);
        self.steps[..count].copy_from_slice(&steps[..count]);
        self.step_count = count as u8;
    }

    /// Installs sub-oscillators, truncating at [`MAX_SUBS`].
    pub fn set_subs(&mut self, subs: &[LfoSub]) {
        let count = subs.len().min(MAX_SUBS).max(1);
        for (dst, src) in self.subs.iter_mut().zip(subs.iter()) {
            *dst = *src;
        }
        self.sub_count = count as u8;
    }
}

/// Per-voice LFO state.
#[derive(Debug, Clone, Copy)]
pub struct LfoState {
    phase: f32,
    elapsed: f32,
    cycles: u32,
    sh_value: f32,
    sh_phase: f32,
    rng_state: u32,
}

impl Default for LfoState {
    fn default() -> Self {
        Self { phase: 0.0, elapsed: 0.0, cycles: 0, sh_value: 0.0, sh_phase: 1.0, rng_state: 1 }
    }
}

impl LfoState {
    pub fn trigger(&mut self, desc: &LfoDescriptor, seed: u32) {
        self.phase = desc.phase.rem_euclid(1.0);
        self.elapsed = 0.0;
        self.cycles = 0;
        self.sh_value = 0.0;
        self.sh_phase = 1.0;
        self.rng_state = seed | 1;
    }

    /// Advances one sample.
    ///
    /// `freq_mod` is an additive Hz offset and `phase_mod` an additive phase
    /// offset, both produced by the modulation matrix. `bpm` resolves
    /// beat-synced rates.
    pub fn tick(&mut self, desc: &LfoDescriptor, dt: f32, freq_mod: f32, phase_mod: f32, bpm: f32) -> f32 {
        self.elapsed += dt;
        if self.elapsed < desc.delay {
            return 0.0;
        }
        if let Some(count) = desc.count {
            if self.cycles >= count {
                return 0.0;
            }
        }

        let base_freq = match desc.beats {
            Some(beats) => beats * bpm / 60.0,
            None => desc.frequency,
        };
        let freq = (base_freq + freq_mod).max(0.0);

        let phase = (self.phase + phase_mod).rem_euclid(1.0);

        let value = if desc.step_count == 0 {
            let mut sum = 0.0;
            for sub in desc.subs.iter().take(desc.sub_count as usize) {
                let sub_phase = (phase * sub.ratio).rem_euclid(1.0);
                sum += self.waveform(sub.wave, sub_phase) * sub.scale + sub.offset;
            }
            sum
        } else {
            let steps = desc.step_count as usize;
            let idx = ((phase * steps as f32) as usize).min(steps - 1);
            desc.steps[idx]
        };

        self.phase += freq * dt;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
            self.cycles = self.cycles.saturating_add(1);
        }

        value * self.fade_gain(desc)
    }

    #[inline]
    fn fade_gain(&self, desc: &LfoDescriptor) -> f32 {
        if desc.fade <= 0.0 {
            return 1.0;
        }
        ((self.elapsed - desc.delay) / desc.fade).clamp(0.0, 1.0)
    }

    #[inline]
    fn waveform(&mut self, wave: LfoWave, phase: f32) -> f32 {
        match wave {
            LfoWave::Triangle => 4.0 * ((phase + 0.75).rem_euclid(1.0) - 0.5).abs() - 1.0,
            LfoWave::Sine => (phase * std::f32::consts::TAU).sin(),
            LfoWave::Pulse75 => {
                if phase < 0.75 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Pulse25 => {
                if phase < 0.25 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Pulse12 => {
                if phase < 0.125 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::SawUp => 2.0 * phase - 1.0,
            LfoWave::SawDown => 1.0 - 2.0 * phase,
            LfoWave::RandomSh => {
                // New random value each time the phase wraps past the
                // previously seen position.
                if phase < self.sh_phase {
                    self.rng_state = self.rng_state.wrapping_mul(1103515245).wrapping_add(12345);
                    self.sh_value = ((self.rng_state >> 16) as f32 / 32768.0) - 1.0;
                }
                self.sh_phase = phase;
                self.sh_value
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_desc(freq: f32) -> LfoDescriptor {
        LfoDescriptor { frequency: freq, ..Default::default() }
    }

    #[test]
    fn test_sine_starts_at_zero_and_peaks() {
        let desc = sine_desc(1.0);
        let mut state = LfoState::default();
        state.trigger(&desc, 42);

        let dt = 1.0 / 1000.0;
        let first = state.tick(&desc, dt, 0.0, 0.0, 120.0);
        assert!(first.abs() < 1e-2);

        let mut peak: f32 = 0.0;
        for _ in 0..1000 {
            peak = peak.max(state.tick(&desc, dt, 0.0, 0.0, 120.0));
        }
        assert!((peak - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_delay_silences_onset() {
        let desc = LfoDescriptor { frequency: 10.0, delay: 0.5, ..Default::default() };
        let mut state = LfoState::default();
        state.trigger(&desc, 1);
        let dt = 1.0 / 100.0;
        for _ in 0..49 {
            assert_eq!(state.tick(&desc, dt, 0.0, 0.0, 120.0), 0.0);
        }
    }

    #[test]
    fn test_count_limits_cycles() {
        let desc = LfoDescriptor { frequency: 10.0, count: Some(1), ..Default::default() };
        let mut state = LfoState::default();
        state.trigger(&desc, 1);
        let dt = 1.0 / 100.0;
        let mut values = Vec::new();
        for _ in 0..25 {
            values.push(state.tick(&desc, dt, 0.0, 0.0, 120.0));
        }
        // One full cycle is 10 ticks at these settings; later ticks are parked.
        assert!(values[22].abs() < 1e-6);
    }

    #[test]
    fn test_steps_replace_waveform() {
        let mut desc = LfoDescriptor { frequency: 1.0, ..Default::default() };
        desc.set_steps(&[-1.0, 1.0]);
        let mut state = LfoState::default();
        state.trigger(&desc, 1);
        let dt = 1.0 / 100.0;
        let first = state.tick(&desc, dt, 0.0, 0.0, 120.0);
        assert_eq!(first, -1.0);
        for _ in 0..60 {
            state.tick(&desc, dt, 0.0, 0.0, 120.0);
        }
        assert_eq!(state.tick(&desc, dt, 0.0, 0.0, 120.0), 1.0);
    }

    #[test]
    fn test_beat_sync_follows_bpm() {
        let desc = LfoDescriptor { frequency: 0.0, beats: Some(1.0), ..Default::default() };
        let mut state = LfoState::default();
        state.trigger(&desc, 1);
        // At 60 BPM one beat per second: a quarter second reaches phase 0.25.
        let dt = 1.0 / 100.0;
        let mut last = 0.0;
        for _ in 0..25 {
            last = state.tick(&desc, dt, 0.0, 0.0, 60.0);
        }
        assert!(last > 0.9, "sine near its quarter-cycle peak, got {}", last);
    }
}
