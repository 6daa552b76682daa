//! The per-voice renderer.
//!
//! A voice is one activation of a region. At start it copies every
//! performance parameter it needs out of the region (the region table can
//! be swapped while it plays; only the sample buffer is kept alive through
//! its `Arc`). Rendering walks the block in segments bounded by controller
//! events so block-precise modulation lands on the right sample, then runs
//! the per-sample pipeline inside each segment:
//!
//! sample read -> filter chain -> EQ chain -> amplifier -> panner -> buses
//!
//! The amplitude gate (classic amp EG, or a flex EG nominated `ampeg`) is
//! rendered per sample and decides when the voice frees.

use crate::constants::{
    EXT_CC_PITCH_BEND, FAST_OFF_TIME, HERMITE_QUALITY, MAX_EFFECT_BUSES, MAX_EQS_PER_REGION,
    MAX_FILTERS_PER_REGION, MAX_FLEX_EGS_PER_REGION, MAX_LFOS_PER_REGION,
};
use crate::curve::CurveTable;
use crate::dsp::adsr::{EgDescriptor, EgParams, EgState};
use crate::dsp::biquad::FilterUnit;
use crate::dsp::eq::EqUnit;
use crate::dsp::flex_eg::FlexEgState;
use crate::dsp::lfo::{LfoDescriptor, LfoState};
use crate::dsp::panner::Panner;
use crate::dsp::smoother::BlockRamp;
use crate::dsp::{cents_to_ratio, db_to_gain, note_to_frequency, Frame};
use crate::memory::SampleData;
use crate::midi_state::MidiState;
use crate::mod_matrix::{GeneratorValues, MatrixContext, ModKey, VoiceMatrix};
use crate::region::{CcRange, EqDescriptor, FilterDescriptor, LoopMode, LoopSpec, OffMode, Region};
use crate::types::{GroupId, RegionId, TriggerEvent, TriggerKind, VoiceId};
use rand::rngs::SmallRng;
use rand::Rng;

const MAX_XF_CC: usize = 4;
const MAX_SUSTAIN_CC: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Free,
    Playing,
    /// Short terminal amplitude ramp after a steal or fast choke.
    FastOff,
}

/// Dynamic-sustain recompute data, copied from the EG descriptor when the
/// region asks for it.
#[derive(Debug, Clone, Copy, Default)]
struct DynamicSustain {
    base: f32,
    vel_delta: f32,
    cc: [(u16, f32); MAX_SUSTAIN_CC],
    cc_count: usize,
}

impl DynamicSustain {
    fn from_descriptor(desc: &EgDescriptor) -> Self {
        let mut dynamic = Self {
            base: desc.sustain,
            vel_delta: desc.vel_to_sustain,
            ..Default::default()
        };
        for &(num, delta) in desc.sustain_cc.iter().take(MAX_SUSTAIN_CC) {
            dynamic.cc[dynamic.cc_count] = (num, delta);
            dynamic.cc_count += 1;
        }
        dynamic
    }

    fn resolve(&self, velocity: f32, midi: &MidiState) -> f32 {
        let mut v = self.base + self.vel_delta * velocity;
        for &(num, delta) in &self.cc[..self.cc_count] {
            v += delta * midi.cc_value(num);
        }
        v.clamp(0.0, 1.0)
    }
}

pub struct Voice {
    // -- lifecycle -------------------------------------------------------
    pub id: VoiceId,
    state: VoiceState,
    /// Engine clock at start; smaller is older.
    pub age: u64,
    /// The voice that choked this one, when a group off did.
    pub off_source: Option<VoiceId>,
    /// Note-off arrived while the sustain pedal was down.
    pub sustained: bool,

    // -- identity --------------------------------------------------------
    region_id: RegionId,
    trigger: TriggerEvent,
    pub note: u8,
    pub velocity: f32,
    pub group: GroupId,
    pub off_by: Option<GroupId>,
    off_mode: OffMode,
    off_time: f32,
    pub note_selfmask: bool,
    pub note_polyphony: Option<u32>,
    pub region_polyphony: Option<u32>,

    // -- playback state --------------------------------------------------
    source_position: f64,
    remaining_delay: u32,
    sample: Option<std::sync::Arc<SampleData>>,
    sample_end: u64,
    loop_spec: LoopSpec,
    loops_done: u32,
    /// Pedal released a sustain loop; the cursor runs out to the end.
    sustain_loop_done: bool,
    reverse: bool,
    oscillator: bool,
    osc_detune: f32,
    osc_mod_depth: f32,
    /// Cursor of the second, detuned unison oscillator.
    osc2_position: f64,
    quality: u8,
    /// Sample-rate conversion factor between buffer and engine rates.
    rate_ratio: f64,
    pitch_keycenter: u8,
    base_pitch_cents: f32,
    bend_up: f32,
    bend_down: f32,
    bend_step: f32,

    // -- gains -----------------------------------------------------------
    base_volume_db: f32,
    base_amplitude: f32,
    velocity_gain: f32,
    /// Key/velocity crossfades are static per voice.
    static_xf_gain: f32,
    xfin_cc: [CcRange; MAX_XF_CC],
    xfin_cc_count: usize,
    xfout_cc: [CcRange; MAX_XF_CC],
    xfout_cc_count: usize,
    xf_cccurve: crate::dsp::panner::XfCurve,
    rt_decay_db: f32,
    random_gain_db: f32,
    pan: f32,
    position: f32,
    width: f32,
    gain_to_effect: [f32; 1 + MAX_EFFECT_BUSES],

    // -- generators ------------------------------------------------------
    amp_eg_params: EgParams,
    amp_eg: EgState,
    amp_dynamic: Option<DynamicSustain>,
    pitch_eg_params: Option<EgParams>,
    pitch_eg: EgState,
    pitch_dynamic: Option<DynamicSustain>,
    fil_eg_params: Option<EgParams>,
    fil_eg: EgState,
    fil_dynamic: Option<DynamicSustain>,
    amp_lfo: Option<LfoDescriptor>,
    amp_lfo_depth: f32,
    amp_lfo_state: LfoState,
    pitch_lfo: Option<LfoDescriptor>,
    pitch_lfo_depth: f32,
    pitch_lfo_state: LfoState,
    fil_lfo: Option<LfoDescriptor>,
    fil_lfo_depth: f32,
    fil_lfo_state: LfoState,
    lfo_descs: [LfoDescriptor; MAX_LFOS_PER_REGION],
    lfo_states: [LfoState; MAX_LFOS_PER_REGION],
    lfo_count: usize,
    flex_states: Vec<FlexEgState>,
    flex_count: usize,
    /// Flex EG index gating the amplitude instead of the classic EG.
    amp_gate_flex: Option<usize>,

    // -- matrix and chains -----------------------------------------------
    matrix: VoiceMatrix,
    filter_units: Vec<FilterUnit>,
    filter_descs: [FilterDescriptor; MAX_FILTERS_PER_REGION],
    /// Static keytrack/veltrack/random cutoff offset per filter, cents.
    filter_offset_cents: [f32; MAX_FILTERS_PER_REGION],
    filter_count: usize,
    eq_units: Vec<EqUnit>,
    eq_descs: [EqDescriptor; MAX_EQS_PER_REGION],
    eq_count: usize,

    // -- fast-off ramp ---------------------------------------------------
    off_gain: f32,
    off_step: f32,
    /// Samples until a timed choke starts its ramp.
    off_pending: u32,

    /// Block-smoothed voice gain; jumps on the first segment, ramps after.
    gain_ramp: BlockRamp,
    gain_primed: bool,

    // -- scratch ---------------------------------------------------------
    env_buf: Vec<f32>,
}

impl Voice {
    pub fn new(id: VoiceId, max_block: usize) -> Self {
        Self {
            id,
            state: VoiceState::Free,
            age: 0,
            off_source: None,
            sustained: false,
            region_id: 0,
            trigger: TriggerEvent::note_on(0, 0, 0.0),
            note: 0,
            velocity: 0.0,
            group: 0,
            off_by: None,
            off_mode: OffMode::Fast,
            off_time: 0.0,
            note_selfmask: false,
            note_polyphony: None,
            region_polyphony: None,
            source_position: 0.0,
            remaining_delay: 0,
            sample: None,
            sample_end: 0,
            loop_spec: LoopSpec::default(),
            loops_done: 0,
            sustain_loop_done: false,
            reverse: false,
            oscillator: false,
            osc_detune: 0.0,
            osc_mod_depth: 0.0,
            osc2_position: 0.0,
            quality: 2,
            rate_ratio: 1.0,
            pitch_keycenter: 60,
            base_pitch_cents: 0.0,
            bend_up: 200.0,
            bend_down: -200.0,
            bend_step: 0.0,
            base_volume_db: 0.0,
            base_amplitude: 1.0,
            velocity_gain: 1.0,
            static_xf_gain: 1.0,
            xfin_cc: [CcRange { cc: 0, lo: 0.0, hi: 0.0 }; MAX_XF_CC],
            xfin_cc_count: 0,
            xfout_cc: [CcRange { cc: 0, lo: 0.0, hi: 0.0 }; MAX_XF_CC],
            xfout_cc_count: 0,
            xf_cccurve: crate::dsp::panner::XfCurve::Power,
            rt_decay_db: 0.0,
            random_gain_db: 0.0,
            pan: 0.0,
            position: 0.0,
            width: 1.0,
            gain_to_effect: {
                let mut g = [0.0; 1 + MAX_EFFECT_BUSES];
                g[0] = 1.0;
                g
            },
            amp_eg_params: EgParams::default(),
            amp_eg: EgState::default(),
            amp_dynamic: None,
            pitch_eg_params: None,
            pitch_eg: EgState::default(),
            pitch_dynamic: None,
            fil_eg_params: None,
            fil_eg: EgState::default(),
            fil_dynamic: None,
            amp_lfo: None,
            amp_lfo_depth: 0.0,
            amp_lfo_state: LfoState::default(),
            pitch_lfo: None,
            pitch_lfo_depth: 0.0,
            pitch_lfo_state: LfoState::default(),
            fil_lfo: None,
            fil_lfo_depth: 0.0,
            fil_lfo_state: LfoState::default(),
            lfo_descs: [LfoDescriptor::default(); MAX_LFOS_PER_REGION],
            lfo_states: [LfoState::default(); MAX_LFOS_PER_REGION],
            lfo_count: 0,
            flex_states: vec![FlexEgState::default(); MAX_FLEX_EGS_PER_REGION],
            flex_count: 0,
            amp_gate_flex: None,
            matrix: VoiceMatrix::default(),
            filter_units: vec![FilterUnit::default(); MAX_FILTERS_PER_REGION],
            filter_descs: [FilterDescriptor::default(); MAX_FILTERS_PER_REGION],
            filter_offset_cents: [0.0; MAX_FILTERS_PER_REGION],
            filter_count: 0,
            eq_units: vec![EqUnit::default(); MAX_EQS_PER_REGION],
            eq_descs: [EqDescriptor::default(); MAX_EQS_PER_REGION],
            eq_count: 0,
            off_gain: 1.0,
            off_step: 0.0,
            off_pending: 0,
            gain_ramp: BlockRamp::new(0.0),
            gain_primed: false,
            env_buf: vec![0.0; max_block],
        }
    }

    // -- accessors -------------------------------------------------------

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == VoiceState::Free
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != VoiceState::Free
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn trigger_event(&self) -> &TriggerEvent {
        &self.trigger
    }

    pub fn remaining_delay(&self) -> u32 {
        self.remaining_delay
    }

    pub fn source_position(&self) -> f64 {
        self.source_position
    }

    pub fn is_releasing(&self) -> bool {
        match self.amp_gate_flex {
            Some(_) => self.state == VoiceState::FastOff,
            None => self.amp_eg.is_released(),
        }
    }

    /// Current gate level, the steal policy's "envelope level".
    pub fn gate_level(&self) -> f32 {
        let gate = match self.amp_gate_flex {
            Some(i) => self.flex_states[i].level(),
            None => self.amp_eg.level(),
        };
        gate * self.off_gain
    }

    // -- lifecycle -------------------------------------------------------

    /// Binds this voice to a region and primes every generator.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        region: &Region,
        curves: &CurveTable,
        midi: &MidiState,
        trigger: TriggerEvent,
        rng: &mut SmallRng,
        sample_rate: f32,
        engine_quality: u8,
        clock: u64,
    ) {
        let note = trigger.number;
        let velocity = trigger.value;

        self.state = VoiceState::Playing;
        self.age = clock + trigger.delay as u64;
        self.off_source = None;
        self.sustained = false;
        self.region_id = region.id;
        self.trigger = trigger;
        self.note = note;
        self.velocity = velocity;
        self.group = region.group;
        self.off_by = region.off_by;
        self.off_mode = region.off_mode;
        self.off_time = region.off_time;
        self.note_selfmask = region.note_selfmask;
        self.note_polyphony = region.note_polyphony;
        self.region_polyphony = region.polyphony;

        // Sample cursor.
        self.sample = region.sample.clone();
        self.sample_end = region.sample_end;
        self.loop_spec = region.loop_spec;
        if self.loop_spec.end == u64::MAX {
            self.loop_spec.end = self.sample_end;
        }
        self.loops_done = 0;
        self.sustain_loop_done = false;
        self.reverse = region.reverse;
        self.oscillator = region.oscillator;
        self.osc_detune = region.oscillator_detune;
        self.osc_mod_depth = region.oscillator_mod_depth;
        self.osc2_position = 0.0;
        self.quality = region.sample_quality.unwrap_or(engine_quality);
        self.rate_ratio = self
            .sample
            .as_ref()
            .map(|s| s.sample_rate() as f64 / sample_rate as f64)
            .unwrap_or(1.0);

        let offset = region.offset
            + if region.offset_random > 0 { rng.random_range(0..region.offset_random) } else { 0 };
        self.source_position = if self.reverse {
            self.sample_end.saturating_sub(1).min(self.sample_end) as f64
        } else {
            offset.min(self.sample_end) as f64
        };

        let delay_seconds =
            region.delay + if region.delay_random > 0.0 { rng.random_range(0.0..region.delay_random) } else { 0.0 };
        self.remaining_delay = trigger.delay + (delay_seconds * sample_rate) as u32;

        // Pitch.
        let note_pitch = midi.note_base_pitch(note);
        self.pitch_keycenter = region.pitch_keycenter;
        self.base_pitch_cents = region.base_pitch_cents(
            note_pitch,
            velocity,
            if region.pitch_random != 0.0 { rng.random_range(-1.0..1.0f32) } else { 0.0 },
        );
        self.bend_up = region.bend_up;
        self.bend_down = region.bend_down;
        self.bend_step = region.bend_step;

        // Gains.
        self.base_volume_db = region.base_volume_db(note);
        self.base_amplitude = region.base_amplitude();
        self.velocity_gain = region.velocity_gain(velocity, curves);
        self.static_xf_gain = region.key_vel_crossfade_gain(note, velocity);
        self.xfin_cc_count = region.xfin_cc.len().min(MAX_XF_CC);
        self.xfin_cc[..self.xfin_cc_count].copy_from_slice(&region.xfin_cc[..self.xfin_cc_count]);
        self.xfout_cc_count = region.xfout_cc.len().min(MAX_XF_CC);
        self.xfout_cc[..self.xfout_cc_count]
            .copy_from_slice(&region.xfout_cc[..self.xfout_cc_count]);
        self.xf_cccurve = region.xf_cccurve;
        self.random_gain_db =
            if region.amp_random > 0.0 { rng.random_range(0.0..region.amp_random) } else { 0.0 };
        self.rt_decay_db = if trigger.kind == TriggerKind::NoteOff {
            -region.rt_decay * midi.note_duration(note)
        } else {
            0.0
        };
        self.pan = region.pan;
        self.position = region.position;
        self.width = region.width;
        self.gain_to_effect = region.gain_to_effect;

        // Envelopes.
        let cc_read = |cc: u16| midi.cc_value(cc);
        self.amp_eg_params = region.amp_eg.resolve(velocity, &cc_read);
        self.amp_eg.trigger(&self.amp_eg_params);
        self.amp_dynamic =
            region.amp_eg.dynamic.then(|| DynamicSustain::from_descriptor(&region.amp_eg));
        self.pitch_eg_params = region.pitch_eg.as_ref().map(|d| d.resolve(velocity, &cc_read));
        if let Some(params) = &self.pitch_eg_params {
            self.pitch_eg.trigger(params);
        }
        self.pitch_dynamic = region
            .pitch_eg
            .as_ref()
            .filter(|d| d.dynamic)
            .map(DynamicSustain::from_descriptor);
        self.fil_eg_params = region.fil_eg.as_ref().map(|d| d.resolve(velocity, &cc_read));
        if let Some(params) = &self.fil_eg_params {
            self.fil_eg.trigger(params);
        }
        self.fil_dynamic = region
            .fil_eg
            .as_ref()
            .filter(|d| d.dynamic)
            .map(DynamicSustain::from_descriptor);

        // LFOs.
        self.amp_lfo = region.amp_lfo;
        self.amp_lfo_depth = region.amp_lfo_depth;
        self.pitch_lfo = region.pitch_lfo;
        self.pitch_lfo_depth = region.pitch_lfo_depth;
        self.fil_lfo = region.fil_lfo;
        self.fil_lfo_depth = region.fil_lfo_depth;
        if let Some(desc) = &self.amp_lfo {
            self.amp_lfo_state.trigger(desc, rng.random());
        }
        if let Some(desc) = &self.pitch_lfo {
            self.pitch_lfo_state.trigger(desc, rng.random());
        }
        if let Some(desc) = &self.fil_lfo {
            self.fil_lfo_state.trigger(desc, rng.random());
        }
        self.lfo_count = region.lfos.len().min(MAX_LFOS_PER_REGION);
        for i in 0..self.lfo_count {
            self.lfo_descs[i] = region.lfos[i];
            self.lfo_states[i].trigger(&self.lfo_descs[i], rng.random());
        }

        // Flex EGs.
        self.flex_count = region.flex_egs.len().min(MAX_FLEX_EGS_PER_REGION);
        self.amp_gate_flex = None;
        for i in 0..self.flex_count {
            let desc = &region.flex_egs[i];
            self.flex_states[i].trigger_from(desc, &cc_read);
            if desc.amp_gate {
                self.amp_gate_flex = Some(i);
            }
        }

        // Matrix.
        let ctx = MatrixContext {
            midi,
            curves,
            note,
            velocity,
            generators: GeneratorValues::default(),
        };
        self.matrix.load(&region.connections, &ctx, sample_rate);

        // Filter and EQ chains.
        self.filter_count = region.filters.len().min(MAX_FILTERS_PER_REGION);
        for i in 0..self.filter_count {
            let desc = region.filters[i];
            self.filter_descs[i] = desc;
            self.filter_units[i].set_kind(desc.kind);
            self.filter_offset_cents[i] = desc.keytrack * (note as f32 - desc.keycenter as f32)
                + desc.veltrack * velocity
                + if desc.random > 0.0 { rng.random_range(0.0..desc.random) } else { 0.0 };
        }
        self.eq_count = region.equalizers.len().min(MAX_EQS_PER_REGION);
        for i in 0..self.eq_count {
            self.eq_descs[i] = region.equalizers[i];
            self.eq_units[i].reset();
        }

        self.off_gain = 1.0;
        self.off_step = 0.0;
        self.off_pending = 0;
        self.gain_ramp.reset(0.0);
        self.gain_primed = false;
    }

    /// Begins the release phase of every generator.
    pub fn release(&mut self) {
        self.sustained = false;
        if self.loop_spec.mode == LoopMode::OneShot {
            // One-shots ignore note-off and run to their end.
            return;
        }
        self.amp_eg.release();
        self.pitch_eg.release();
        self.fil_eg.release();
        for state in self.flex_states[..self.flex_count].iter_mut() {
            state.release();
        }
    }

    /// Pedal went down while releasing, with `sustain_cancels_release` on.
    /// Mirrors `release`: every generator comes back from its tail.
    pub fn cancel_release(&mut self) {
        self.amp_eg.cancel_release();
        self.pitch_eg.cancel_release();
        self.fil_eg.cancel_release();
        for state in self.flex_states[..self.flex_count].iter_mut() {
            state.cancel_release();
        }
    }

    /// Pedal released: sustain loops run out to the sample end.
    pub fn exit_sustain_loop(&mut self) {
        if self.loop_spec.mode == LoopMode::LoopSustain {
            self.sustain_loop_done = true;
        }
    }

    /// Group choke or steal: silence the voice per its off mode.
    pub fn off(&mut self, fast: bool, sample_rate: f32, source: Option<VoiceId>) {
        if self.state == VoiceState::Free {
            return;
        }
        self.off_source = source;
        let mode = if fast { OffMode::Fast } else { self.off_mode };
        match mode {
            OffMode::Normal => self.release(),
            OffMode::Fast => self.enter_fast_off(FAST_OFF_TIME, sample_rate),
            OffMode::Time => {
                if self.off_time > 0.0 {
                    self.off_pending = (self.off_time * sample_rate) as u32;
                } else {
                    self.enter_fast_off(FAST_OFF_TIME, sample_rate);
                }
            }
        }
    }

    /// Steal ramp: ~5 ms, or `off_time` when the region says so.
    pub fn steal(&mut self, sample_rate: f32) {
        let time = if self.off_mode == OffMode::Time && self.off_time > 0.0 {
            self.off_time
        } else {
            FAST_OFF_TIME
        };
        self.enter_fast_off(time, sample_rate);
    }

    fn enter_fast_off(&mut self, time: f32, sample_rate: f32) {
        if self.state == VoiceState::FastOff {
            return;
        }
        self.state = VoiceState::FastOff;
        self.off_step = 1.0 / (time.max(1e-4) * sample_rate);
    }

    /// Immediate reset to the free pool.
    pub fn reset(&mut self) {
        self.state = VoiceState::Free;
        self.sample = None;
        self.amp_eg.kill();
        self.pitch_eg.kill();
        self.fil_eg.kill();
        self.off_gain = 1.0;
        self.off_step = 0.0;
        self.off_pending = 0;
        self.gain_ramp.reset(0.0);
        self.gain_primed = false;
        self.off_source = None;
        self.sustained = false;
        for unit in &mut self.filter_units {
            unit.reset();
        }
        for unit in &mut self.eq_units {
            unit.reset();
        }
    }

    // -- rendering -------------------------------------------------------

    /// Renders one block, accumulating into the output buses. `segments`
    /// holds mid-block controller boundaries (exclusive of 0 and the block
    /// length), sorted ascending.
    #[allow(clippy::too_many_arguments)]
    pub fn render_block(
        &mut self,
        buses: &mut [Vec<Frame>],
        block_len: usize,
        segments: &[u32],
        midi: &MidiState,
        curves: &CurveTable,
        bpm: f32,
        sample_rate: f32,
    ) {
        if self.state == VoiceState::Free {
            return;
        }

        let mut cursor = 0u32;
        let mut seg_iter = segments.iter().copied().filter(|&b| b > 0 && (b as usize) < block_len);
        let mut next_boundary = seg_iter.next();

        while (cursor as usize) < block_len {
            let end = next_boundary.unwrap_or(block_len as u32);
            if end <= cursor {
                next_boundary = seg_iter.next();
                continue;
            }
            let seg_len = (end - cursor) as usize;
            self.render_segment(buses, cursor, seg_len, midi, curves, bpm, sample_rate);
            cursor = end;
            if Some(end) == next_boundary {
                next_boundary = seg_iter.next();
            }
            if self.state == VoiceState::Free {
                return;
            }
        }

        // Gate exhaustion frees the voice at block granularity.
        let finished = match self.amp_gate_flex {
            Some(i) => self.flex_states[i].is_finished(),
            None => self.amp_eg.is_finished(),
        };
        if finished || (self.state == VoiceState::FastOff && self.off_gain <= 0.0) {
            self.reset();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_segment(
        &mut self,
        buses: &mut [Vec<Frame>],
        start: u32,
        mut seg_len: usize,
        midi: &MidiState,
        curves: &CurveTable,
        bpm: f32,
        sample_rate: f32,
    ) {
        // Onset delay consumes silence from the front of the segment.
        let mut write_offset = start as usize;
        if self.remaining_delay > 0 {
            let skip = (self.remaining_delay as usize).min(seg_len);
            self.remaining_delay -= skip as u32;
            write_offset += skip;
            seg_len -= skip;
            if seg_len == 0 {
                return;
            }
        }

        let dt = 1.0 / sample_rate;
        let seg_dt = seg_len as f32 * dt;

        // Timed chokes count down before the ramp starts.
        if self.off_pending > 0 {
            let pending = self.off_pending as usize;
            if pending <= seg_len {
                self.off_pending = 0;
                self.enter_fast_off(FAST_OFF_TIME, sample_rate);
            } else {
                self.off_pending -= seg_len as u32;
            }
        }

        // Dynamic sustain recomputes from live controllers.
        if let Some(dynamic) = &self.amp_dynamic {
            self.amp_eg_params.sustain = dynamic.resolve(self.velocity, midi);
        }
        if let (Some(dynamic), Some(params)) = (&self.pitch_dynamic, self.pitch_eg_params.as_mut())
        {
            params.sustain = dynamic.resolve(self.velocity, midi);
        }
        if let (Some(dynamic), Some(params)) = (&self.fil_dynamic, self.fil_eg_params.as_mut()) {
            params.sustain = dynamic.resolve(self.velocity, midi);
        }

        // Generator values at segment rate. Numbered-LFO rate and phase
        // targets use the previous evaluation, one segment behind.
        let mut generators = GeneratorValues {
            amp_eg: self.amp_eg.level(),
            pitch_eg: self.pitch_eg.level(),
            fil_eg: self.fil_eg.level(),
            ..Default::default()
        };
        for i in 0..self.lfo_count {
            let freq_mod = self.matrix.target(ModKey::LfoFrequency(i as u8))
                + self.matrix.target(ModKey::LfoBeats(i as u8)) * bpm / 60.0;
            let phase_mod = self.matrix.target(ModKey::LfoPhase(i as u8));
            generators.lfo[i] =
                self.lfo_states[i].tick(&self.lfo_descs[i], seg_dt, freq_mod, phase_mod, bpm);
        }
        for i in 0..self.flex_count {
            if Some(i) != self.amp_gate_flex {
                generators.flex_eg[i] = self.flex_states[i].tick(seg_dt);
            } else {
                generators.flex_eg[i] = self.flex_states[i].level();
            }
        }
        let amp_lfo_value = match &self.amp_lfo {
            Some(desc) => self.amp_lfo_state.tick(desc, seg_dt, 0.0, 0.0, bpm),
            None => 0.0,
        };
        let pitch_lfo_value = match &self.pitch_lfo {
            Some(desc) => self.pitch_lfo_state.tick(desc, seg_dt, 0.0, 0.0, bpm),
            None => 0.0,
        };
        let fil_lfo_value = match &self.fil_lfo {
            Some(desc) => self.fil_lfo_state.tick(desc, seg_dt, 0.0, 0.0, bpm),
            None => 0.0,
        };
        generators.amp_lfo = amp_lfo_value;
        generators.pitch_lfo = pitch_lfo_value;
        generators.fil_lfo = fil_lfo_value;

        let ctx = MatrixContext { midi, curves, note: self.note, velocity: self.velocity, generators };
        self.matrix.evaluate(&ctx, start, seg_len as u32);

        // -- resolve segment parameters ----------------------------------
        let volume_db = self.base_volume_db
            + self.matrix.target(ModKey::Volume)
            + self.rt_decay_db
            + self.random_gain_db
            + amp_lfo_value * (self.amp_lfo_depth + self.matrix.target(ModKey::AmpLfoDepth));
        let amplitude = (self.base_amplitude + self.matrix.target(ModKey::Amplitude)).max(0.0);
        let xf_cc_gain = self.cc_crossfade_gain(midi, start);
        let segment_gain = db_to_gain(volume_db)
            * amplitude
            * self.velocity_gain
            * self.static_xf_gain
            * xf_cc_gain;
        if self.gain_primed {
            self.gain_ramp.plan(segment_gain, seg_len);
        } else {
            self.gain_ramp.reset(segment_gain);
            self.gain_primed = true;
        }

        let pan = (self.pan + self.matrix.target(ModKey::Pan)).clamp(-1.0, 1.0);
        let position = (self.position + self.matrix.target(ModKey::Position)).clamp(-1.0, 1.0);
        let width = (self.width + self.matrix.target(ModKey::Width)).clamp(-1.0, 1.0);

        // Pitch in cents: base + bend + matrix + pitch EG/LFO.
        let bend = midi.cc_value_at(EXT_CC_PITCH_BEND, start) + midi.note_bend(self.note);
        let mut pitch_cents = self.base_pitch_cents
            + self.bend_cents(bend)
            + self.matrix.target(ModKey::Pitch)
            + pitch_lfo_value * (self.pitch_lfo_depth + self.matrix.target(ModKey::PitchLfoDepth));
        if let Some(params) = self.pitch_eg_params {
            pitch_cents += self.pitch_eg.level() * params.depth;
            self.pitch_eg.tick(&params, seg_dt);
        }

        let increment: f64 = if self.oscillator {
            // The buffer is one waveform cycle; cents are relative to the
            // keycenter's frequency.
            let frames = self.sample_end.max(1) as f64;
            let freq =
                note_to_frequency(self.pitch_keycenter as f32) as f64 * cents_to_ratio(pitch_cents) as f64;
            freq * frames / sample_rate as f64
        } else {
            cents_to_ratio(pitch_cents) as f64 * self.rate_ratio
        };

        // The second unison oscillator runs detuned against the first and
        // mixes in by the mod depth.
        let osc_mix = if self.oscillator {
            (self.osc_mod_depth + self.matrix.target(ModKey::OscillatorModDepth)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let osc2_increment = if osc_mix > 0.0 {
            let detune = self.osc_detune + self.matrix.target(ModKey::OscillatorDetune);
            increment * cents_to_ratio(detune) as f64
        } else {
            increment
        };
        let osc_norm = 1.0 / (1.0 + osc_mix);

        // Filter cutoffs move in cents around their base.
        let fil_eg_cents = match self.fil_eg_params {
            Some(params) => {
                let value = self.fil_eg.level() * params.depth;
                self.fil_eg.tick(&params, seg_dt);
                value
            }
            None => 0.0,
        };
        let fil_lfo_cents =
            fil_lfo_value * (self.fil_lfo_depth + self.matrix.target(ModKey::FilLfoDepth));
        for i in 0..self.filter_count {
            let desc = self.filter_descs[i];
            let cents = self.matrix.target(ModKey::FilCutoff(i as u8))
                + self.filter_offset_cents[i]
                + fil_eg_cents
                + fil_lfo_cents;
            let cutoff = desc.cutoff * cents_to_ratio(cents);
            let resonance = desc.resonance + self.matrix.target(ModKey::FilResonance(i as u8));
            let gain = desc.gain + self.matrix.target(ModKey::FilGain(i as u8));
            self.filter_units[i].set_params(cutoff, resonance, gain, sample_rate);
        }
        for i in 0..self.eq_count {
            let desc = self.eq_descs[i];
            let freq = desc.frequency
                + desc.vel_to_frequency * self.velocity
                + self.matrix.target(ModKey::EqFreq(i as u8));
            let bandwidth = desc.bandwidth + self.matrix.target(ModKey::EqBandwidth(i as u8));
            let gain = desc.gain
                + desc.vel_to_gain * self.velocity
                + self.matrix.target(ModKey::EqGain(i as u8));
            self.eq_units[i].set_params(freq, bandwidth, gain, sample_rate);
        }

        // Amplitude gate, per sample.
        match self.amp_gate_flex {
            Some(i) => {
                let state = &mut self.flex_states[i];
                for sample in self.env_buf[..seg_len].iter_mut() {
                    *sample = state.tick(dt);
                }
            }
            None => {
                self.amp_eg.process_block(&self.amp_eg_params, &mut self.env_buf[..seg_len], sample_rate);
            }
        }

        // -- per-sample loop ---------------------------------------------
        let bus_count = buses.len().min(self.gain_to_effect.len());
        for i in 0..seg_len {
            if self.state == VoiceState::Free {
                break;
            }

            let mut frame = self.read_frame();
            if osc_mix > 0.0 {
                let second = self.read_at(self.osc2_position);
                frame.left = (frame.left + second.left * osc_mix) * osc_norm;
                frame.right = (frame.right + second.right * osc_mix) * osc_norm;
                self.osc2_position += osc2_increment;
                let frames = self.sample_end.max(1) as f64;
                while self.osc2_position >= frames {
                    self.osc2_position -= frames;
                }
            }
            self.advance_cursor(increment);
            for f in 0..self.filter_count {
                frame = self.filter_units[f].process(frame);
            }
            for e in 0..self.eq_count {
                frame = self.eq_units[e].process(frame);
            }

            let mut gain = self.gain_ramp.next() * self.env_buf[i];
            if self.state == VoiceState::FastOff {
                self.off_gain = (self.off_gain - self.off_step).max(0.0);
                gain *= self.off_gain;
                if self.off_gain <= 0.0 {
                    self.reset();
                }
            }
            frame.mul_assign_scalar(gain);

            let placed = Panner::process(frame, pan, width, position);
            let out_index = write_offset + i;
            for (b, bus) in buses.iter_mut().enumerate().take(bus_count) {
                let send = self.gain_to_effect[b];
                if send != 0.0 {
                    bus[out_index].left += placed.left * send;
                    bus[out_index].right += placed.right * send;
                }
            }
        }
    }

    fn bend_cents(&self, bend: f32) -> f32 {
        let mut cents = if bend >= 0.0 { bend * self.bend_up } else { -bend * self.bend_down };
        if self.bend_step > 0.0 {
            cents = (cents / self.bend_step).round() * self.bend_step;
        }
        cents
    }

    fn cc_crossfade_gain(&self, midi: &MidiState, delay: u32) -> f32 {
        use crate::dsp::panner::{xf_in, xf_out};
        let mut gain = 1.0;
        for range in &self.xfin_cc[..self.xfin_cc_count] {
            if range.hi > range.lo {
                let t = (midi.cc_value_at(range.cc, delay) - range.lo) / (range.hi - range.lo);
                gain *= xf_in(t, self.xf_cccurve);
            }
        }
        for range in &self.xfout_cc[..self.xfout_cc_count] {
            if range.hi > range.lo {
                let t = (midi.cc_value_at(range.cc, delay) - range.lo) / (range.hi - range.lo);
                gain *= xf_out(t, self.xf_cccurve);
            }
        }
        gain
    }

    /// Interpolated read at an arbitrary cursor, for the unison oscillator.
    #[inline]
    fn read_at(&self, pos: f64) -> Frame {
        match &self.sample {
            Some(sample) => self.interpolate(sample, pos),
            None => Frame::ZERO,
        }
    }

    /// Interpolated stereo read at the current cursor, honoring the loop
    /// crossfade window.
    #[inline]
    fn read_frame(&self) -> Frame {
        let Some(sample) = &self.sample else {
            return Frame::ZERO;
        };

        let in_loop = self.in_loop();
        let pos = self.source_position;
        let mut frame = self.interpolate(sample, pos);

        // Crossfade the loop seam: blend in pre-loop-start material while
        // approaching the end point.
        if in_loop && self.loop_spec.crossfade > 0.0 && self.loop_spec.end > self.loop_spec.start {
            let xf_frames = (self.loop_spec.crossfade as f64 * sample.sample_rate() as f64)
                .min((self.loop_spec.end - self.loop_spec.start) as f64);
            let xf_start = self.loop_spec.end as f64 - xf_frames;
            if pos >= xf_start && xf_frames > 0.0 {
                let t = ((pos - xf_start) / xf_frames) as f32;
                let loop_len = (self.loop_spec.end - self.loop_spec.start) as f64;
                let shadow = self.interpolate(sample, pos - loop_len);
                frame.left = frame.left * (1.0 - t) + shadow.left * t;
                frame.right = frame.right * (1.0 - t) + shadow.right * t;
            }
        }

        frame
    }

    #[inline]
    fn interpolate(&self, sample: &SampleData, pos: f64) -> Frame {
        if pos < 0.0 {
            return Frame::ZERO;
        }
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;

        if self.quality >= HERMITE_QUALITY {
            // 4-point, 3rd-order Hermite.
            let (xm1_l, xm1_r) = sample.frame(idx.saturating_sub(1));
            let (x0_l, x0_r) = sample.frame(idx);
            let (x1_l, x1_r) = sample.frame(idx + 1);
            let (x2_l, x2_r) = sample.frame(idx + 2);
            Frame::new(
                hermite(xm1_l, x0_l, x1_l, x2_l, frac),
                hermite(xm1_r, x0_r, x1_r, x2_r, frac),
            )
        } else {
            let (l0, r0) = sample.frame(idx);
            let (l1, r1) = sample.frame(idx + 1);
            Frame::new(l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
        }
    }

    #[inline]
    fn in_loop(&self) -> bool {
        match self.loop_spec.mode {
            LoopMode::NoLoop | LoopMode::OneShot => false,
            LoopMode::LoopContinuous => {
                self.loop_spec.count.map(|c| self.loops_done < c).unwrap_or(true)
            }
            LoopMode::LoopSustain => {
                // Sustain loops run until release or the pedal lets go.
                !self.sustain_loop_done
                    && !self.is_releasing()
                    && self.loop_spec.count.map(|c| self.loops_done < c).unwrap_or(true)
            }
        }
    }

    #[inline]
    fn advance_cursor(&mut self, increment: f64) {
        if self.oscillator {
            self.source_position += increment;
            let frames = self.sample_end.max(1) as f64;
            while self.source_position >= frames {
                self.source_position -= frames;
            }
            return;
        }

        if self.reverse {
            self.source_position -= increment;
            if self.source_position <= 0.0 {
                self.reset();
            }
            return;
        }

        self.source_position += increment;

        if self.in_loop() {
            let end = self.loop_spec.end as f64;
            if self.source_position >= end {
                let len = (self.loop_spec.end - self.loop_spec.start) as f64;
                if len > 0.0 {
                    self.source_position -= len;
                    self.loops_done += 1;
                } else {
                    self.reset();
                }
            }
        } else if self.source_position >= self.sample_end as f64 {
            self.reset();
        }
    }
}

/// 4-point Hermite interpolation.
#[inline]
fn hermite(xm1: f32, x0: f32, x1: f32, x2: f32, t: f32) -> f32 {
    let c = (x1 - xm1) * 0.5;
    let v = x0 - x1;
    let w = c + v;
    let a = w + v + (x2 - x0) * 0.5;
    let b = w + a;
    (((a * t) - b) * t + c) * t + x0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveTable;
    use crate::region::Region;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn ramp_sample(frames: usize) -> Arc<SampleData> {
        let mono: Vec<f32> = (0..frames).map(|i| i as f32 / frames as f32).collect();
        Arc::new(SampleData::from_mono(&mono, 48000))
    }

    fn start_voice(region: &Region, velocity: f32) -> (Voice, MidiState, CurveTable) {
        let midi = MidiState::new(48000.0);
        let curves = CurveTable::new();
        let mut voice = Voice::new(0, 1024);
        let mut rng = SmallRng::seed_from_u64(7);
        voice.start(
            region,
            &curves,
            &midi,
            TriggerEvent::note_on(0, 60, velocity),
            &mut rng,
            48000.0,
            2,
            0,
        );
        (voice, midi, curves)
    }

    fn render(voice: &mut Voice, midi: &MidiState, curves: &CurveTable, n: usize) -> Vec<Frame> {
        let mut buses = vec![vec![Frame::ZERO; n]];
        voice.render_block(&mut buses, n, &[], midi, curves, 120.0, 48000.0);
        buses.remove(0)
    }

    fn flat_region(frames: usize) -> Region {
        let mut region = Region::with_sample(0, "ramp", ramp_sample(frames));
        region.set_key(60);
        region.amp_eg.attack = 0.0;
        region.amp_eg.release = 0.001;
        region.amp_veltrack = 0.0;
        region
    }

    #[test]
    fn test_unity_pitch_reads_straight_through() {
        let region = flat_region(1000);
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        let out = render(&mut voice, &midi, &curves, 64);
        // The ramp should come out linearly, one frame per sample.
        let expected = 10.0 / 1000.0;
        assert!((out[10].left - expected).abs() < 1e-3, "got {}", out[10].left);
        assert!((out[10].left - out[10].right).abs() < 1e-6);
    }

    #[test]
    fn test_transpose_doubles_increment() {
        let mut region = flat_region(1000);
        region.transpose = 12;
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        render(&mut voice, &midi, &curves, 64);
        assert!((voice.source_position() - 128.0).abs() < 1.0);
    }

    #[test]
    fn test_voice_frees_at_sample_end() {
        let region = flat_region(100);
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        render(&mut voice, &midi, &curves, 256);
        assert!(voice.is_free());
    }

    #[test]
    fn test_loop_continuous_wraps() {
        let mut region = flat_region(100);
        region.loop_spec.mode = LoopMode::LoopContinuous;
        region.loop_spec.start = 0;
        region.loop_spec.end = 100;
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        render(&mut voice, &midi, &curves, 512);
        assert!(voice.is_active());
        assert!(voice.source_position() < 100.0);
    }

    #[test]
    fn test_delay_outputs_silence_first() {
        let mut region = flat_region(1000);
        region.delay = 32.0 / 48000.0;
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        let out = render(&mut voice, &midi, &curves, 64);
        assert_eq!(out[10], Frame::ZERO);
        assert!(out[40].left > 0.0);
    }

    #[test]
    fn test_fast_off_silences_within_ramp() {
        let mut region = flat_region(48000);
        region.loop_spec.mode = LoopMode::LoopContinuous;
        region.loop_spec.end = 48000;
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        render(&mut voice, &midi, &curves, 64);
        voice.off(true, 48000.0, None);
        assert_eq!(voice.state(), VoiceState::FastOff);
        // 5 ms at 48 kHz is 240 samples; two blocks of 256 finish it.
        render(&mut voice, &midi, &curves, 256);
        render(&mut voice, &midi, &curves, 256);
        assert!(voice.is_free());
    }

    #[test]
    fn test_one_shot_ignores_release() {
        let mut region = flat_region(1000);
        region.loop_spec.mode = LoopMode::OneShot;
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        render(&mut voice, &midi, &curves, 64);
        voice.release();
        assert!(!voice.is_releasing());
        let out = render(&mut voice, &midi, &curves, 64);
        assert!(out[32].left != 0.0);
    }

    #[test]
    fn test_bus_split_scales_sends() {
        let mut region = flat_region(1000);
        region.gain_to_effect[0] = 1.0;
        region.gain_to_effect[1] = 0.5;
        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        let n = 32;
        let mut buses = vec![vec![Frame::ZERO; n], vec![Frame::ZERO; n]];
        voice.render_block(&mut buses, n, &[], &midi, &curves, 120.0, 48000.0);
        assert!(buses[0][20].left > 0.0);
        assert!((buses[1][20].left - buses[0][20].left * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_dynamic_pitch_sustain_follows_controllers() {
        let mut region = flat_region(48000);
        region.pitch_eg = Some(EgDescriptor {
            sustain: 0.0,
            sustain_cc: vec![(30, 1.0)],
            dynamic: true,
            depth: 1200.0,
            ..Default::default()
        });

        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 30, 0.5);
        let curves = CurveTable::new();
        let mut voice = Voice::new(0, 1024);
        let mut rng = SmallRng::seed_from_u64(7);
        voice.start(
            &region,
            &curves,
            &midi,
            TriggerEvent::note_on(0, 60, 1.0),
            &mut rng,
            48000.0,
            2,
            0,
        );

        // Let the pitch EG settle into its sustain stage.
        for _ in 0..8 {
            render(&mut voice, &midi, &curves, 64);
        }
        let before = voice.source_position();
        render(&mut voice, &midi, &curves, 64);
        let half_delta = voice.source_position() - before;
        // Half sustain of a 1200-cent depth reads sqrt(2) frames per sample.
        assert!((half_delta - 64.0 * 2.0f32.sqrt() as f64).abs() < 2.0, "delta {}", half_delta);

        // Raise the controller: the sustain level recomputes mid-note.
        midi.cc_event(0, 30, 1.0);
        render(&mut voice, &midi, &curves, 64);
        let before = voice.source_position();
        render(&mut voice, &midi, &curves, 64);
        let full_delta = voice.source_position() - before;
        assert!((full_delta - 128.0).abs() < 2.0, "delta {}", full_delta);
        assert!(full_delta > half_delta * 1.2);
    }

    #[test]
    fn test_oscillator_mode_wraps_its_cycle() {
        // One 100-frame sine cycle as a wavetable.
        let mono: Vec<f32> =
            (0..100).map(|i| (std::f32::consts::TAU * i as f32 / 100.0).sin()).collect();
        let mut region = Region::with_sample(0, "cycle", Arc::new(SampleData::from_mono(&mono, 48000)));
        region.set_key(60);
        region.oscillator = true;
        region.amp_eg.attack = 0.0;
        region.amp_veltrack = 0.0;

        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        let out = render(&mut voice, &midi, &curves, 1024);
        // A wavetable voice never runs off the end of its buffer.
        assert!(voice.is_active());
        assert!(voice.source_position() < 100.0);
        let peak = out.iter().map(|f| f.left.abs()).fold(0.0f32, f32::max);
        assert!(peak > 0.9, "peak {}", peak);
    }

    #[test]
    fn test_oscillator_unison_detune_beats() {
        let mono: Vec<f32> =
            (0..100).map(|i| (std::f32::consts::TAU * i as f32 / 100.0).sin()).collect();
        let mut region = Region::with_sample(0, "cycle", Arc::new(SampleData::from_mono(&mono, 48000)));
        region.set_key(60);
        region.oscillator = true;
        region.oscillator_detune = 50.0;
        region.oscillator_mod_depth = 1.0;
        region.amp_eg.attack = 0.0;
        region.amp_veltrack = 0.0;

        let (mut voice, midi, curves) = start_voice(&region, 1.0);
        let out = render(&mut voice, &midi, &curves, 2048);
        // Both cursors start aligned, so a detuned pair drifts out of
        // phase: the summed output cannot stay a constant-amplitude sine.
        let early = out[..64].iter().map(|f| f.left.abs()).fold(0.0f32, f32::max);
        let min_peak = out
            .chunks(256)
            .map(|c| c.iter().map(|f| f.left.abs()).fold(0.0f32, f32::max))
            .fold(f32::MAX, f32::min);
        assert!(early > 0.5);
        assert!(min_peak < early * 0.9, "no beating: {} vs {}", min_peak, early);
    }

    #[test]
    fn test_velocity_gain_shapes_output() {
        let mut region = flat_region(1000);
        region.amp_veltrack = 1.0;
        let (mut loud, midi, curves) = start_voice(&region, 1.0);
        let (mut soft, _, _) = start_voice(&region, 0.5);
        let out_loud = render(&mut loud, &midi, &curves, 64);
        let out_soft = render(&mut soft, &midi, &curves, 64);
        // Default velocity curve is the square law.
        let ratio = out_soft[32].left / out_loud[32].left;
        assert!((ratio - 0.25).abs() < 0.01, "ratio {}", ratio);
    }
}
