//! Classic DAHDSR envelope generator.
//!
//! Regions carry an [`EgDescriptor`] per envelope (amplitude always, pitch
//! and filter optionally). At voice start the descriptor is resolved
//! against the trigger velocity and current controller values into flat
//! [`EgParams`]; the per-voice [`EgState`] then runs sample-accurately.
//!
//! The amplitude EG is the gating signal for the voice: release decays
//! exponentially (-60 dB over the release time) and `is_finished` reports
//! once the level drops below the engine silence threshold.

use crate::constants::{EG_RELEASE_FLOOR, SILENCE_THRESHOLD};

/// Per-stage controller deltas, `(cc, seconds-or-level per unit value)`.
pub type CcDeltas = Vec<(u16, f32)>;

/// Region-side envelope description, immutable after load.
#[derive(Debug, Clone, Default)]
pub struct EgDescriptor {
    pub delay: f32,
    pub start: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    /// Sustain level, normalized 0..1.
    pub sustain: f32,
    pub release: f32,
    /// Output scaling for pitch/filter EGs, in cents. Unused by the amp EG.
    pub depth: f32,

    // Velocity-to-stage deltas, applied at voice start.
    pub vel_to_delay: f32,
    pub vel_to_attack: f32,
    pub vel_to_hold: f32,
    pub vel_to_decay: f32,
    pub vel_to_sustain: f32,
    pub vel_to_release: f32,
    pub vel_to_depth: f32,

    // Controller deltas per stage, applied at voice start (or per block for
    // the sustain level when `dynamic` is set).
    pub delay_cc: CcDeltas,
    pub attack_cc: CcDeltas,
    pub hold_cc: CcDeltas,
    pub decay_cc: CcDeltas,
    pub sustain_cc: CcDeltas,
    pub release_cc: CcDeltas,

    /// Recompute the sustain level from controllers while sustaining.
    pub dynamic: bool,
}

impl EgDescriptor {
    /// A gate-like amp EG: full level, instant attack, short release.
    pub fn amp_default() -> Self {
        Self { sustain: 1.0, release: 0.001, ..Default::default() }
    }

    /// Resolves the descriptor into flat parameters for one voice.
    pub fn resolve(&self, velocity: f32, cc: &dyn Fn(u16) -> f32) -> EgParams {
        let sum = |base: f32, vel_delta: f32, deltas: &CcDeltas| -> f32 {
            let mut v = base + vel_delta * velocity;
            for &(num, delta) in deltas {
                v += delta * cc(num);
            }
            v
        };

        EgParams {
            delay: sum(self.delay, self.vel_to_delay, &self.delay_cc).max(0.0),
            start: self.start.clamp(0.0, 1.0),
            attack: sum(self.attack, self.vel_to_attack, &self.attack_cc).max(0.0),
            hold: sum(self.hold, self.vel_to_hold, &self.hold_cc).max(0.0),
            decay: sum(self.decay, self.vel_to_decay, &self.decay_cc).max(0.0),
            sustain: sum(self.sustain, self.vel_to_sustain, &self.sustain_cc).clamp(0.0, 1.0),
            release: sum(self.release, self.vel_to_release, &self.release_cc).max(0.0),
            depth: self.depth + self.vel_to_depth * velocity,
        }
    }

    /// Recomputes just the sustain level, for `dynamic` envelopes.
    pub fn resolve_sustain(&self, velocity: f32, cc: &dyn Fn(u16) -> f32) -> f32 {
        let mut v = self.sustain + self.vel_to_sustain * velocity;
        for &(num, delta) in &self.sustain_cc {
            v += delta * cc(num);
        }
        v.clamp(0.0, 1.0)
    }
}

/// Flat per-voice envelope parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EgParams {
    pub delay: f32,
    pub start: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgStage {
    Delay,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct EgState {
    pub stage: EgStage,
    level: f32,
    stage_time: f32,
    release_start: f32,
}

impl Default for EgState {
    fn default() -> Self {
        Self { stage: EgStage::Done, level: 0.0, stage_time: 0.0, release_start: 0.0 }
    }
}

impl EgState {
    #[inline]
    pub fn trigger(&mut self, params: &EgParams) {
        self.stage = if params.delay > 0.0 { EgStage::Delay } else { EgStage::Attack };
        self.level = if self.stage == EgStage::Attack { params.start } else { 0.0 };
        self.stage_time = 0.0;
        self.release_start = 0.0;
    }

    #[inline]
    pub fn release(&mut self) {
        if !matches!(self.stage, EgStage::Release | EgStage::Done) {
            self.release_start = self.level;
            self.stage = EgStage::Release;
            self.stage_time = 0.0;
        }
    }

    /// Cut the envelope dead, skipping the release tail.
    #[inline]
    pub fn kill(&mut self) {
        self.stage = EgStage::Done;
        self.level = 0.0;
    }

    /// Pulls a releasing envelope back to its sustain stage, for
    /// `sustain_cancels_release` behavior when the pedal goes down mid-tail.
    #[inline]
    pub fn cancel_release(&mut self) {
        if matches!(self.stage, EgStage::Release) {
            self.stage = EgStage::Sustain;
            self.stage_time = 0.0;
        }
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        matches!(self.stage, EgStage::Release | EgStage::Done)
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.stage, EgStage::Done)
            || (matches!(self.stage, EgStage::Release) && self.level <= SILENCE_THRESHOLD)
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Advances one sample and returns the new level.
    #[inline]
    pub fn tick(&mut self, params: &EgParams, dt: f32) -> f32 {
        self.stage_time += dt;

        match self.stage {
            EgStage::Done => {
                self.level = 0.0;
            }
            EgStage::Delay => {
                self.level = 0.0;
                if self.stage_time >= params.delay {
                    self.enter(EgStage::Attack);
                    self.level = params.start;
                }
            }
            EgStage::Attack => {
                if params.attack <= 0.0 {
                    self.level = 1.0;
                    self.enter(EgStage::Hold);
                } else {
                    let t = (self.stage_time / params.attack).min(1.0);
                    self.level = params.start + (1.0 - params.start) * t;
                    if t >= 1.0 {
                        self.enter(EgStage::Hold);
                    }
                }
            }
            EgStage::Hold => {
                self.level = 1.0;
                if self.stage_time >= params.hold {
                    self.enter(EgStage::Decay);
                }
            }
            EgStage::Decay => {
                if params.decay <= 0.0 {
                    self.level = params.sustain;
                    self.enter(EgStage::Sustain);
                } else {
                    // Exponential approach to the sustain level.
                    let t = (self.stage_time / params.decay).min(1.0);
                    let floor = params.sustain.max(EG_RELEASE_FLOOR);
                    self.level = floor.powf(t) * (1.0 - t) + params.sustain * t;
                    self.level = self.level.max(params.sustain);
                    if t >= 1.0 {
                        self.level = params.sustain;
                        self.enter(EgStage::Sustain);
                    }
                }
            }
            EgStage::Sustain => {
                self.level = params.sustain;
                if self.level <= SILENCE_THRESHOLD {
                    // A zero sustain behaves like a finished one-shot decay.
                    self.stage = EgStage::Done;
                }
            }
            EgStage::Release => {
                if params.release <= 0.0 {
                    self.level = 0.0;
                    self.stage = EgStage::Done;
                } else {
                    let t = self.stage_time / params.release;
                    if t >= 1.0 {
                        self.level = 0.0;
                        self.stage = EgStage::Done;
                    } else {
                        self.level = self.release_start * EG_RELEASE_FLOOR.powf(t);
                    }
                }
            }
        }

        self.level
    }

    /// Fills `out` with one level per sample.
    pub fn process_block(&mut self, params: &EgParams, out: &mut [f32], sample_rate: f32) {
        let dt = 1.0 / sample_rate;
        for sample in out.iter_mut() {
            *sample = self.tick(params, dt);
        }
    }

    #[inline]
    fn enter(&mut self, stage: EgStage) {
        self.stage = stage;
        self.stage_time = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(attack: f32, decay: f32, sustain: f32, release: f32) -> EgParams {
        EgParams { attack, decay, sustain, release, ..Default::default() }
    }

    #[test]
    fn test_instant_attack_reaches_full_level() {
        let p = params(0.0, 0.0, 1.0, 0.1);
        let mut state = EgState::default();
        state.trigger(&p);
        let level = state.tick(&p, 1.0 / 48000.0);
        assert!((level - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_attack_ramp_is_linear() {
        let p = params(0.1, 0.0, 1.0, 0.1);
        let mut state = EgState::default();
        state.trigger(&p);
        let mut buf = vec![0.0; 2400]; // half the attack at 48 kHz
        state.process_block(&p, &mut buf, 48000.0);
        let mid = buf[2399];
        assert!((mid - 0.5).abs() < 0.01, "mid-attack level {}", mid);
    }

    #[test]
    fn test_release_decays_exponentially() {
        let p = params(0.0, 0.0, 1.0, 0.01);
        let mut state = EgState::default();
        state.trigger(&p);
        state.tick(&p, 1.0 / 48000.0);
        state.release();
        let mut buf = vec![0.0; 480]; // the full release
        state.process_block(&p, &mut buf, 48000.0);
        assert!(state.is_finished());
        assert!(buf[240] < buf[0]);
        assert!(*buf.last().unwrap() <= SILENCE_THRESHOLD);
    }

    #[test]
    fn test_descriptor_resolution_applies_velocity() {
        let desc = EgDescriptor {
            attack: 0.1,
            vel_to_attack: -0.05,
            sustain: 1.0,
            ..Default::default()
        };
        let cc = |_: u16| 0.0;
        let p = desc.resolve(1.0, &cc);
        assert!((p.attack - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_descriptor_resolution_applies_cc_delta() {
        let desc = EgDescriptor {
            release: 0.1,
            release_cc: vec![(20, 0.4)],
            sustain: 1.0,
            ..Default::default()
        };
        let cc = |num: u16| if num == 20 { 0.5 } else { 0.0 };
        let p = desc.resolve(0.0, &cc);
        assert!((p.release - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_zero_sustain_finishes_after_decay() {
        let p = params(0.0, 0.001, 0.0, 0.1);
        let mut state = EgState::default();
        state.trigger(&p);
        let mut buf = vec![0.0; 96];
        state.process_block(&p, &mut buf, 48000.0);
        assert!(state.is_finished());
    }
}
