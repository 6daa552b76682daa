//! The modulation matrix.
//!
//! Regions carry a list of [`Connection`] edges from sources (controllers,
//! envelopes, LFOs, aftertouch) to targets (amplitude, pitch, cutoff, pan
//! and friends). Each voice copies its region's edges at start and
//! evaluates them once per render segment into a dense per-target array;
//! contributions to the same target add onto the region's base value.
//!
//! Controller-class sources pass through a transform pipeline in a fixed
//! order: curve table lookup, then step quantization, then one-pole
//! smoothing. The smoother state is per connection and per voice.

use crate::constants::{MAX_CONNECTIONS_PER_REGION, MAX_EQS_PER_REGION, MAX_FILTERS_PER_REGION, MAX_LFOS_PER_REGION};
use crate::curve::CurveTable;
use crate::dsp::smoother::OnePoleSmoother;
use crate::midi_state::MidiState;

pub const MAX_FLEX_SOURCES: usize = crate::constants::MAX_FLEX_EGS_PER_REGION;

/// Address of a point in the modulation graph.
///
/// The curve/smooth/step transform of a controller source lives on the
/// [`Connection`] rather than in the key, so key identity is exactly the
/// `(source, target)` pair the at-most-one-edge invariant speaks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModKey {
    // -- sources ---------------------------------------------------------
    /// Channel controller (MIDI or extended slot).
    Controller(u16),
    /// Per-note controller stream of the voice's own note, merged
    /// additively with the channel stream.
    PerVoiceController(u16),
    AmpEg,
    PitchEg,
    FilEg,
    AmpLfo,
    PitchLfo,
    FilLfo,
    /// Numbered flex LFO.
    Lfo(u8),
    /// Numbered flex EG.
    FlexEg(u8),
    ChannelAftertouch,
    /// Polyphonic aftertouch of the voice's own note.
    PolyAftertouch,

    // -- targets ---------------------------------------------------------
    /// dB additive.
    Volume,
    /// Normalized additive.
    Amplitude,
    Pan,
    Position,
    Width,
    /// Cents additive.
    Pitch,
    FilCutoff(u8),
    FilResonance(u8),
    FilGain(u8),
    EqGain(u8),
    EqFreq(u8),
    EqBandwidth(u8),
    OscillatorDetune,
    OscillatorModDepth,
    LfoFrequency(u8),
    LfoBeats(u8),
    LfoPhase(u8),
    AmpLfoDepth,
    PitchLfoDepth,
    FilLfoDepth,
}

// Target slot layout. Indexed targets get a fixed stride so the whole
// space stays a flat array.
const SLOT_VOLUME: usize = 0;
const SLOT_AMPLITUDE: usize = 1;
const SLOT_PAN: usize = 2;
const SLOT_POSITION: usize = 3;
const SLOT_WIDTH: usize = 4;
const SLOT_PITCH: usize = 5;
const SLOT_OSC_DETUNE: usize = 6;
const SLOT_OSC_MOD_DEPTH: usize = 7;
const SLOT_AMP_LFO_DEPTH: usize = 8;
const SLOT_PITCH_LFO_DEPTH: usize = 9;
const SLOT_FIL_LFO_DEPTH: usize = 10;
const SLOT_FIL_CUTOFF: usize = 11;
const SLOT_FIL_RESONANCE: usize = SLOT_FIL_CUTOFF + MAX_FILTERS_PER_REGION;
const SLOT_FIL_GAIN: usize = SLOT_FIL_RESONANCE + MAX_FILTERS_PER_REGION;
const SLOT_EQ_GAIN: usize = SLOT_FIL_GAIN + MAX_FILTERS_PER_REGION;
const SLOT_EQ_FREQ: usize = SLOT_EQ_GAIN + MAX_EQS_PER_REGION;
const SLOT_EQ_BANDWIDTH: usize = SLOT_EQ_FREQ + MAX_EQS_PER_REGION;
const SLOT_LFO_FREQ: usize = SLOT_EQ_BANDWIDTH + MAX_EQS_PER_REGION;
const SLOT_LFO_BEATS: usize = SLOT_LFO_FREQ + MAX_LFOS_PER_REGION;
const SLOT_LFO_PHASE: usize = SLOT_LFO_BEATS + MAX_LFOS_PER_REGION;

/// Total size of the per-voice target array.
pub const TARGET_SLOTS: usize = SLOT_LFO_PHASE + MAX_LFOS_PER_REGION;

impl ModKey {
    /// Dense slot index for target keys; None for source keys or indices
    /// beyond the per-region caps.
    pub fn target_slot(&self) -> Option<usize> {
        let filt = |i: &u8| (*i as usize) < MAX_FILTERS_PER_REGION;
        let eq = |i: &u8| (*i as usize) < MAX_EQS_PER_REGION;
        let lfo = |i: &u8| (*i as usize) < MAX_LFOS_PER_REGION;
        match self {
            ModKey::Volume => Some(SLOT_VOLUME),
            ModKey::Amplitude => Some(SLOT_AMPLITUDE),
            ModKey::Pan => Some(SLOT_PAN),
            ModKey::Position => Some(SLOT_POSITION),
            ModKey::Width => Some(SLOT_WIDTH),
            ModKey::Pitch => Some(SLOT_PITCH),
            ModKey::OscillatorDetune => Some(SLOT_OSC_DETUNE),
            ModKey::OscillatorModDepth => Some(SLOT_OSC_MOD_DEPTH),
            ModKey::AmpLfoDepth => Some(SLOT_AMP_LFO_DEPTH),
            ModKey::PitchLfoDepth => Some(SLOT_PITCH_LFO_DEPTH),
            ModKey::FilLfoDepth => Some(SLOT_FIL_LFO_DEPTH),
            ModKey::FilCutoff(i) if filt(i) => Some(SLOT_FIL_CUTOFF + *i as usize),
            ModKey::FilResonance(i) if filt(i) => Some(SLOT_FIL_RESONANCE + *i as usize),
            ModKey::FilGain(i) if filt(i) => Some(SLOT_FIL_GAIN + *i as usize),
            ModKey::EqGain(i) if eq(i) => Some(SLOT_EQ_GAIN + *i as usize),
            ModKey::EqFreq(i) if eq(i) => Some(SLOT_EQ_FREQ + *i as usize),
            ModKey::EqBandwidth(i) if eq(i) => Some(SLOT_EQ_BANDWIDTH + *i as usize),
            ModKey::LfoFrequency(i) if lfo(i) => Some(SLOT_LFO_FREQ + *i as usize),
            ModKey::LfoBeats(i) if lfo(i) => Some(SLOT_LFO_BEATS + *i as usize),
            ModKey::LfoPhase(i) if lfo(i) => Some(SLOT_LFO_PHASE + *i as usize),
            _ => None,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self,
            ModKey::Controller(_)
                | ModKey::PerVoiceController(_)
                | ModKey::AmpEg
                | ModKey::PitchEg
                | ModKey::FilEg
                | ModKey::AmpLfo
                | ModKey::PitchLfo
                | ModKey::FilLfo
                | ModKey::Lfo(_)
                | ModKey::FlexEg(_)
                | ModKey::ChannelAftertouch
                | ModKey::PolyAftertouch
        )
    }
}

/// One edge of the modulation graph.
///
/// Invariant: at most one connection exists for a `(source, target)` pair
/// within a region. When `depth_mod` is set, the effective depth is the
/// static depth scaled by the depth modulator's current value, so a mod
/// wheel at zero silences the edge entirely.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub source: ModKey,
    pub target: ModKey,
    pub depth: f32,
    pub vel_to_depth: f32,
    pub depth_mod: Option<ModKey>,
    /// Curve table slot applied to controller-class sources.
    pub curve: u8,
    /// One-pole smoothing time in milliseconds, 0 = off.
    pub smooth_ms: f32,
    /// Quantization step in source units, 0 = off. Applied before smoothing.
    pub step: f32,
}

impl Connection {
    pub fn new(source: ModKey, target: ModKey, depth: f32) -> Self {
        Self {
            source,
            target,
            depth,
            vel_to_depth: 0.0,
            depth_mod: None,
            curve: 0,
            smooth_ms: 0.0,
            step: 0.0,
        }
    }
}

/// Generator outputs sampled at the current render segment, produced by
/// the voice before matrix evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratorValues {
    pub amp_eg: f32,
    pub pitch_eg: f32,
    pub fil_eg: f32,
    pub amp_lfo: f32,
    pub pitch_lfo: f32,
    pub fil_lfo: f32,
    pub lfo: [f32; MAX_LFOS_PER_REGION],
    pub flex_eg: [f32; MAX_FLEX_SOURCES],
}

/// Everything a matrix evaluation needs to resolve sources.
pub struct MatrixContext<'a> {
    pub midi: &'a MidiState,
    pub curves: &'a CurveTable,
    /// The voice's trigger note, for per-note sources.
    pub note: u8,
    /// The voice's trigger velocity, for `vel_to_depth`.
    pub velocity: f32,
    pub generators: GeneratorValues,
}

/// Per-voice matrix state: the copied edges, their smoothers and the
/// output target array.
#[derive(Debug, Clone)]
pub struct VoiceMatrix {
    connections: [Connection; MAX_CONNECTIONS_PER_REGION],
    count: usize,
    smoothers: [OnePoleSmoother; MAX_CONNECTIONS_PER_REGION],
    pub targets: [f32; TARGET_SLOTS],
}

impl Default for VoiceMatrix {
    fn default() -> Self {
        Self {
            connections: [Connection::new(ModKey::Controller(0), ModKey::Volume, 0.0);
                MAX_CONNECTIONS_PER_REGION],
            count: 0,
            smoothers: [OnePoleSmoother::default(); MAX_CONNECTIONS_PER_REGION],
            targets: [0.0; TARGET_SLOTS],
        }
    }
}

impl VoiceMatrix {
    /// Copies a region's edges in at voice start. Smoothers are primed
    /// with the current transformed source value so a freshly started
    /// voice does not glide in from zero.
    pub fn load(&mut self, connections: &[Connection], ctx: &MatrixContext, sample_rate: f32) {
        self.count = connections.len().min(MAX_CONNECTIONS_PER_REGION);
        self.connections[..self.count].copy_from_slice(&connections[..self.count]);
        for i in 0..self.count {
            let conn = self.connections[i];
            self.smoothers[i].set_time(conn.smooth_ms, sample_rate);
            let primed = self.shaped_source(&conn, ctx, 0);
            self.smoothers[i].reset(primed);
        }
        self.targets = [0.0; TARGET_SLOTS];
    }

    pub fn connection_count(&self) -> usize {
        self.count
    }

    /// Evaluates all edges for a segment starting `delay` samples into the
    /// block and lasting `steps` samples, filling `targets` with summed
    /// contributions.
    pub fn evaluate(&mut self, ctx: &MatrixContext, delay: u32, steps: u32) {
        self.targets = [0.0; TARGET_SLOTS];

        for i in 0..self.count {
            let conn = self.connections[i];
            let Some(slot) = conn.target.target_slot() else {
                continue;
            };

            let shaped = self.shaped_source(&conn, ctx, delay);
            let value = if conn.smooth_ms > 0.0 {
                self.smoothers[i].advance(shaped, steps)
            } else {
                shaped
            };

            let mut depth = conn.depth + conn.vel_to_depth * ctx.velocity;
            if let Some(mod_key) = conn.depth_mod {
                depth *= Self::raw_source(&mod_key, ctx, delay);
            }

            self.targets[slot] += value * depth;
        }
    }

    /// Contribution sum for one target slot.
    #[inline]
    pub fn target(&self, key: ModKey) -> f32 {
        key.target_slot().map(|s| self.targets[s]).unwrap_or(0.0)
    }

    /// Curve, then step quantization. Smoothing happens in `evaluate` so
    /// the per-connection state stays here.
    fn shaped_source(&self, conn: &Connection, ctx: &MatrixContext, delay: u32) -> f32 {
        let raw = Self::raw_source(&conn.source, ctx, delay);
        let mut value = match conn.source {
            ModKey::Controller(_) | ModKey::PerVoiceController(_) => ctx.curves.apply(conn.curve, raw),
            _ => raw,
        };
        if conn.step > 0.0 {
            value = (value / conn.step).round() * conn.step;
        }
        value
    }

    fn raw_source(key: &ModKey, ctx: &MatrixContext, delay: u32) -> f32 {
        match key {
            ModKey::Controller(cc) => ctx.midi.cc_value_at(*cc, delay),
            ModKey::PerVoiceController(cc) => ctx.midi.merged_cc_at(ctx.note, *cc, delay),
            ModKey::ChannelAftertouch => ctx.midi.cc_value_at(
                crate::constants::EXT_CC_CHANNEL_AFTERTOUCH,
                delay,
            ),
            ModKey::PolyAftertouch => ctx.midi.poly_aftertouch_at(ctx.note, delay),
            ModKey::AmpEg => ctx.generators.amp_eg,
            ModKey::PitchEg => ctx.generators.pitch_eg,
            ModKey::FilEg => ctx.generators.fil_eg,
            ModKey::AmpLfo => ctx.generators.amp_lfo,
            ModKey::PitchLfo => ctx.generators.pitch_lfo,
            ModKey::FilLfo => ctx.generators.fil_lfo,
            ModKey::Lfo(i) => ctx
                .generators
                .lfo
                .get(*i as usize)
                .copied()
                .unwrap_or(0.0),
            ModKey::FlexEg(i) => ctx
                .generators
                .flex_eg
                .get(*i as usize)
                .copied()
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveTable;
    use crate::midi_state::MidiState;

    fn ctx<'a>(midi: &'a MidiState, curves: &'a CurveTable) -> MatrixContext<'a> {
        MatrixContext {
            midi,
            curves,
            note: 60,
            velocity: 1.0,
            generators: GeneratorValues::default(),
        }
    }

    #[test]
    fn test_linear_unsmoothes_unstepped_is_identity() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 1, 0.65);
        let curves = CurveTable::new();
        let ctx = ctx(&midi, &curves);

        let conns = [Connection::new(ModKey::Controller(1), ModKey::Amplitude, 1.0)];
        let mut matrix = VoiceMatrix::default();
        matrix.load(&conns, &ctx, 48000.0);
        matrix.evaluate(&ctx, 0, 64);
        assert!((matrix.target(ModKey::Amplitude) - 0.65).abs() < 1e-6);
    }

    #[test]
    fn test_contributions_add_per_target() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 1, 0.5);
        midi.cc_event(0, 2, 0.5);
        let curves = CurveTable::new();
        let ctx = ctx(&midi, &curves);

        let conns = [
            Connection::new(ModKey::Controller(1), ModKey::Pitch, 100.0),
            Connection::new(ModKey::Controller(2), ModKey::Pitch, 200.0),
        ];
        let mut matrix = VoiceMatrix::default();
        matrix.load(&conns, &ctx, 48000.0);
        matrix.evaluate(&ctx, 0, 64);
        assert!((matrix.target(ModKey::Pitch) - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_step_quantizes_before_use() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 1, 0.63);
        let curves = CurveTable::new();
        let ctx = ctx(&midi, &curves);

        let mut conn = Connection::new(ModKey::Controller(1), ModKey::Amplitude, 1.0);
        conn.step = 0.25;
        let mut matrix = VoiceMatrix::default();
        matrix.load(&[conn], &ctx, 48000.0);
        matrix.evaluate(&ctx, 0, 64);
        // 0.63 quantized to the nearest multiple of 0.25.
        assert!((matrix.target(ModKey::Amplitude) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_smoothing_lags_toward_target() {
        let mut midi = MidiState::new(48000.0);
        let curves = CurveTable::new();

        let mut conn = Connection::new(ModKey::Controller(1), ModKey::Amplitude, 1.0);
        conn.smooth_ms = 50.0;
        let mut matrix = VoiceMatrix::default();
        {
            let ctx = ctx(&midi, &curves);
            matrix.load(&[conn], &ctx, 48000.0);
        }

        midi.cc_event(0, 1, 1.0);
        let ctx = ctx(&midi, &curves);
        matrix.evaluate(&ctx, 0, 64);
        let first = matrix.target(ModKey::Amplitude);
        assert!(first > 0.0 && first < 0.5, "smoothed value {}", first);

        for _ in 0..200 {
            matrix.evaluate(&ctx, 0, 512);
        }
        assert!((matrix.target(ModKey::Amplitude) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_depth_mod_scales_static_depth() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 1, 1.0);
        midi.cc_event(0, 11, 0.5);
        let curves = CurveTable::new();
        let ctx = ctx(&midi, &curves);

        let mut conn = Connection::new(ModKey::Controller(1), ModKey::Pitch, 1200.0);
        conn.depth_mod = Some(ModKey::Controller(11));
        let mut matrix = VoiceMatrix::default();
        matrix.load(&[conn], &ctx, 48000.0);
        matrix.evaluate(&ctx, 0, 64);
        assert!((matrix.target(ModKey::Pitch) - 600.0).abs() < 1e-3);
    }

    #[test]
    fn test_generator_sources_flow_through() {
        let midi = MidiState::new(48000.0);
        let curves = CurveTable::new();
        let mut context = ctx(&midi, &curves);
        context.generators.pitch_eg = 0.5;

        let conns = [Connection::new(ModKey::PitchEg, ModKey::Pitch, 2400.0)];
        let mut matrix = VoiceMatrix::default();
        matrix.load(&conns, &context, 48000.0);
        matrix.evaluate(&context, 0, 64);
        assert!((matrix.target(ModKey::Pitch) - 1200.0).abs() < 1e-3);
    }

    #[test]
    fn test_per_voice_controller_merges_streams() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 20, 0.25);
        midi.note_cc_event(0, 60, 20, 0.25);
        let curves = CurveTable::new();
        let ctx = ctx(&midi, &curves);

        let conns = [Connection::new(ModKey::PerVoiceController(20), ModKey::Amplitude, 1.0)];
        let mut matrix = VoiceMatrix::default();
        matrix.load(&conns, &ctx, 48000.0);
        matrix.evaluate(&ctx, 0, 64);
        assert!((matrix.target(ModKey::Amplitude) - 0.5).abs() < 1e-6);
    }
}
