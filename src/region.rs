//! The region model.
//!
//! A region is the smallest playback unit: one sample plus the conditions
//! under which it sounds and the parameters shaping it. Regions are built
//! by the instrument loader (an external collaborator), flattened from the
//! global/master/group hierarchy, and are immutable during render except
//! through the dispatch surface, which runs on the audio thread.
//!
//! Voices reference regions by index and copy out the performance
//! parameters they need at start; the only thing a voice keeps alive is
//! its sample buffer (`Arc<SampleData>`).

use crate::constants::{
    CC_COUNT, DEFAULT_BEND_DOWN, DEFAULT_BEND_UP, DEFAULT_PITCH_KEYTRACK,
    MAX_CONNECTIONS_PER_REGION, MAX_EFFECT_BUSES, MAX_EQS_PER_REGION, MAX_FILTERS_PER_REGION,
    MAX_FLEX_EGS_PER_REGION, MAX_LFOS_PER_REGION,
};
use crate::curve::CurveTable;
use crate::dsp::adsr::EgDescriptor;
use crate::dsp::biquad::FilterKind;
use crate::dsp::eq::EqKind;
use crate::dsp::flex_eg::FlexEgDescriptor;
use crate::dsp::lfo::LfoDescriptor;
use crate::dsp::panner::{xf_in, xf_out, XfCurve};
use crate::memory::SampleData;
use crate::midi_state::MidiState;
use crate::mod_matrix::{Connection, ModKey};
use crate::types::{GroupId, RegionId};
use std::sync::Arc;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Trigger {
    #[default]
    Attack,
    Release,
    ReleaseKey,
    First,
    Legato,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum OffMode {
    #[default]
    Fast,
    Normal,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LoopMode {
    #[default]
    NoLoop,
    OneShot,
    LoopContinuous,
    LoopSustain,
}

/// Loop window in sample frames with a crossfade region before the end.
#[derive(Debug, Clone, Copy)]
pub struct LoopSpec {
    pub mode: LoopMode,
    pub start: u64,
    pub end: u64,
    /// Crossfade length in seconds around the loop point.
    pub crossfade: f32,
    /// Number of loop passes before continuing past the end; None = until
    /// release.
    pub count: Option<u32>,
}

impl Default for LoopSpec {
    fn default() -> Self {
        Self { mode: LoopMode::NoLoop, start: 0, end: u64::MAX, crossfade: 0.0, count: None }
    }
}

/// Inclusive controller range condition.
#[derive(Debug, Clone, Copy)]
pub struct CcRange {
    pub cc: u16,
    pub lo: f32,
    pub hi: f32,
}

/// Key-switch behavior of a region.
#[derive(Debug, Clone, Default)]
pub struct KeySwitch {
    /// Keys in this span select rather than play.
    pub lokey: u8,
    pub hikey: u8,
    /// Region plays only while this switch is the last one latched.
    pub last: Option<u8>,
    /// Region plays only while this key is physically down.
    pub down: Option<u8>,
    /// Region plays only while this key is up.
    pub up: Option<u8>,
    /// Region plays only when the previous note equals this key.
    pub previous: Option<u8>,
    /// Latched switch at load time.
    pub default: Option<u8>,
    pub label: Option<String>,
}

/// One entry of a region's filter chain.
#[derive(Debug, Clone, Copy)]
pub struct FilterDescriptor {
    pub kind: FilterKind,
    pub cutoff: f32,
    /// dB.
    pub resonance: f32,
    /// dB, for the shelving/peak kinds.
    pub gain: f32,
    /// Cents per key away from `keycenter`.
    pub keytrack: f32,
    pub keycenter: u8,
    /// Cents at full velocity.
    pub veltrack: f32,
    /// Random cents added per voice.
    pub random: f32,
}

impl Default for FilterDescriptor {
    fn default() -> Self {
        Self {
            kind: FilterKind::Lpf2p,
            cutoff: 20000.0,
            resonance: 0.0,
            gain: 0.0,
            keytrack: 0.0,
            keycenter: 60,
            veltrack: 0.0,
            random: 0.0,
        }
    }
}

/// One entry of a region's equalizer chain.
#[derive(Debug, Clone, Copy)]
pub struct EqDescriptor {
    pub kind: EqKind,
    pub frequency: f32,
    /// Octaves.
    pub bandwidth: f32,
    /// dB.
    pub gain: f32,
    /// dB at full velocity.
    pub vel_to_gain: f32,
    /// Hz at full velocity.
    pub vel_to_frequency: f32,
}

impl Default for EqDescriptor {
    fn default() -> Self {
        Self {
            kind: EqKind::Peak,
            frequency: 1000.0,
            bandwidth: 1.0,
            gain: 0.0,
            vel_to_gain: 0.0,
            vel_to_frequency: 0.0,
        }
    }
}

/// Crossfade span over a key or velocity axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct XfSpan {
    pub lo: f32,
    pub hi: f32,
}

impl XfSpan {
    pub fn active(&self) -> bool {
        self.hi > self.lo
    }
}

/// An immutable playback template.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,

    // -- sample ----------------------------------------------------------
    pub sample_name: String,
    pub sample: Option<Arc<SampleData>>,
    /// End frame of playable data; 0 marks the region disabled.
    pub sample_end: u64,
    /// Play the sample as a single-cycle wavetable instead of one-shot data.
    pub oscillator: bool,
    /// Detune of the second unison oscillator, cents.
    pub oscillator_detune: f32,
    /// Mix level of the second unison oscillator, 0..1.
    pub oscillator_mod_depth: f32,
    pub loop_spec: LoopSpec,
    pub reverse: bool,
    /// Start offset in frames, plus a random extra span.
    pub offset: u64,
    pub offset_random: u64,
    /// Onset delay in seconds, plus a random extra span.
    pub delay: f32,
    pub delay_random: f32,
    /// Region-specific resampling quality override.
    pub sample_quality: Option<u8>,

    // -- trigger conditions ----------------------------------------------
    pub trigger: Trigger,
    pub lokey: u8,
    pub hikey: u8,
    pub lovel: f32,
    pub hivel: f32,
    pub lobend: f32,
    pub hibend: f32,
    pub lochanaft: f32,
    pub hichanaft: f32,
    pub lopolyaft: f32,
    pub hipolyaft: f32,
    pub lobpm: f32,
    pub hibpm: f32,
    pub lorand: f32,
    pub hirand: f32,
    pub cc_conditions: Vec<CcRange>,
    /// Threshold spans that trigger this region from a CC change.
    pub start_cc: Vec<CcRange>,
    pub keyswitch: Option<KeySwitch>,
    pub sequence_length: u32,
    /// 1-based position within the sequence.
    pub sequence_position: u32,

    // -- pitch -----------------------------------------------------------
    pub pitch_keycenter: u8,
    /// Cents per key.
    pub pitch_keytrack: f32,
    /// Cents at full velocity.
    pub pitch_veltrack: f32,
    /// Random cents per voice.
    pub pitch_random: f32,
    pub transpose: i32,
    /// Fine tuning in cents.
    pub tune: f32,
    pub bend_up: f32,
    pub bend_down: f32,
    /// Bend quantization step in cents, 0 = continuous.
    pub bend_step: f32,

    // -- amplitude and placement -----------------------------------------
    /// dB.
    pub volume: f32,
    /// Normalized 0..1.
    pub amplitude: f32,
    pub global_volume: f32,
    pub master_volume: f32,
    pub group_volume: f32,
    pub global_amplitude: f32,
    pub master_amplitude: f32,
    pub group_amplitude: f32,
    pub pan: f32,
    pub position: f32,
    pub width: f32,
    /// dB per key away from `amp_keycenter`.
    pub amp_keytrack: f32,
    pub amp_keycenter: u8,
    /// Velocity sensitivity, -1..1.
    pub amp_veltrack: f32,
    /// Curve slot for the velocity response; None = the default power curve.
    pub amp_velcurve: Option<u8>,
    /// Random dB span per voice.
    pub amp_random: f32,
    /// dB per second of note duration, for release triggers.
    pub rt_decay: f32,

    // -- crossfades ------------------------------------------------------
    pub xfin_key: XfSpan,
    pub xfout_key: XfSpan,
    pub xfin_vel: XfSpan,
    pub xfout_vel: XfSpan,
    pub xfin_cc: Vec<CcRange>,
    pub xfout_cc: Vec<CcRange>,
    pub xf_keycurve: XfCurve,
    pub xf_velcurve: XfCurve,
    pub xf_cccurve: XfCurve,

    // -- generators ------------------------------------------------------
    pub amp_eg: EgDescriptor,
    pub pitch_eg: Option<EgDescriptor>,
    pub fil_eg: Option<EgDescriptor>,
    pub amp_lfo: Option<LfoDescriptor>,
    /// dB.
    pub amp_lfo_depth: f32,
    pub pitch_lfo: Option<LfoDescriptor>,
    /// Cents.
    pub pitch_lfo_depth: f32,
    pub fil_lfo: Option<LfoDescriptor>,
    /// Cents.
    pub fil_lfo_depth: f32,
    pub lfos: Vec<LfoDescriptor>,
    pub flex_egs: Vec<FlexEgDescriptor>,

    // -- chains ----------------------------------------------------------
    pub filters: Vec<FilterDescriptor>,
    pub equalizers: Vec<EqDescriptor>,

    // -- groups and polyphony --------------------------------------------
    pub group: GroupId,
    pub off_by: Option<GroupId>,
    pub off_mode: OffMode,
    /// Seconds, for `off_mode=time`.
    pub off_time: f32,
    pub polyphony: Option<u32>,
    pub note_polyphony: Option<u32>,
    pub note_selfmask: bool,

    // -- output ----------------------------------------------------------
    /// Send gains: slot 0 is the main bus.
    pub gain_to_effect: [f32; 1 + MAX_EFFECT_BUSES],

    // -- modulation ------------------------------------------------------
    pub connections: Vec<Connection>,
}

impl Default for Region {
    fn default() -> Self {
        let mut gain_to_effect = [0.0; 1 + MAX_EFFECT_BUSES];
        gain_to_effect[0] = 1.0;
        Self {
            id: 0,
            sample_name: String::new(),
            sample: None,
            sample_end: 0,
            oscillator: false,
            oscillator_detune: 0.0,
            oscillator_mod_depth: 0.0,
            loop_spec: LoopSpec::default(),
            reverse: false,
            offset: 0,
            offset_random: 0,
            delay: 0.0,
            delay_random: 0.0,
            sample_quality: None,
            trigger: Trigger::Attack,
            lokey: 0,
            hikey: 127,
            lovel: 0.0,
            hivel: 1.0,
            lobend: -1.0,
            hibend: 1.0,
            lochanaft: 0.0,
            hichanaft: 1.0,
            lopolyaft: 0.0,
            hipolyaft: 1.0,
            lobpm: 0.0,
            hibpm: 500.0,
            lorand: 0.0,
            hirand: 1.0,
            cc_conditions: Vec::new(),
            start_cc: Vec::new(),
            keyswitch: None,
            sequence_length: 1,
            sequence_position: 1,
            pitch_keycenter: 60,
            pitch_keytrack: DEFAULT_PITCH_KEYTRACK,
            pitch_veltrack: 0.0,
            pitch_random: 0.0,
            transpose: 0,
            tune: 0.0,
            bend_up: DEFAULT_BEND_UP,
            bend_down: DEFAULT_BEND_DOWN,
            bend_step: 0.0,
            volume: 0.0,
            amplitude: 1.0,
            global_volume: 0.0,
            master_volume: 0.0,
            group_volume: 0.0,
            global_amplitude: 1.0,
            master_amplitude: 1.0,
            group_amplitude: 1.0,
            pan: 0.0,
            position: 0.0,
            width: 1.0,
            amp_keytrack: 0.0,
            amp_keycenter: 60,
            amp_veltrack: 1.0,
            amp_velcurve: None,
            amp_random: 0.0,
            rt_decay: 0.0,
            xfin_key: XfSpan::default(),
            xfout_key: XfSpan::default(),
            xfin_vel: XfSpan::default(),
            xfout_vel: XfSpan::default(),
            xfin_cc: Vec::new(),
            xfout_cc: Vec::new(),
            xf_keycurve: XfCurve::Power,
            xf_velcurve: XfCurve::Power,
            xf_cccurve: XfCurve::Power,
            amp_eg: EgDescriptor::amp_default(),
            pitch_eg: None,
            fil_eg: None,
            amp_lfo: None,
            amp_lfo_depth: 0.0,
            pitch_lfo: None,
            pitch_lfo_depth: 0.0,
            fil_lfo: None,
            fil_lfo_depth: 0.0,
            lfos: Vec::new(),
            flex_egs: Vec::new(),
            filters: Vec::new(),
            equalizers: Vec::new(),
            group: 0,
            off_by: None,
            off_mode: OffMode::Fast,
            off_time: 0.0,
            polyphony: None,
            note_polyphony: None,
            note_selfmask: false,
            gain_to_effect,
            connections: Vec::new(),
        }
    }
}

/// Key-switch latch state owned by the voice manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchState {
    pub last: Option<u8>,
    pub previous_note: Option<u8>,
}

impl Region {
    /// Convenience constructor binding a sample; `sample_end` defaults to
    /// the full buffer.
    pub fn with_sample(id: RegionId, name: &str, sample: Arc<SampleData>) -> Self {
        let frames = sample.frames() as u64;
        Self {
            id,
            sample_name: name.to_string(),
            sample: Some(sample),
            sample_end: frames,
            ..Default::default()
        }
    }

    /// A region with a zeroed sample end never triggers.
    #[inline]
    pub fn disabled(&self) -> bool {
        self.sample_end == 0
    }

    /// Sets the `key` shorthand: lokey, hikey and keycenter together.
    pub fn set_key(&mut self, key: u8) {
        self.lokey = key;
        self.hikey = key;
        self.pitch_keycenter = key;
    }

    fn keyswitch_allows(&self, midi: &MidiState, switches: &SwitchState) -> bool {
        let Some(ks) = &self.keyswitch else {
            return true;
        };
        if let Some(last) = ks.last {
            let latched = switches.last.or(ks.default);
            if latched != Some(last) {
                return false;
            }
        }
        if let Some(down) = ks.down {
            if !midi.is_note_pressed(down) {
                return false;
            }
        }
        if let Some(up) = ks.up {
            if midi.is_note_pressed(up) {
                return false;
            }
        }
        if let Some(previous) = ks.previous {
            if switches.previous_note != Some(previous) {
                return false;
            }
        }
        true
    }

    fn ranges_allow(&self, midi: &MidiState, bpm: f32) -> bool {
        let bend = midi.pitch_bend();
        if bend < self.lobend || bend > self.hibend {
            return false;
        }
        let chanaft = midi.channel_aftertouch();
        if chanaft < self.lochanaft || chanaft > self.hichanaft {
            return false;
        }
        if bpm < self.lobpm || bpm > self.hibpm {
            return false;
        }
        for range in &self.cc_conditions {
            let value = midi.cc_value(range.cc);
            if value < range.lo || value > range.hi {
                return false;
            }
        }
        true
    }

    /// Note-on style condition check. `random` is a per-note draw in [0, 1);
    /// the sequence check lives in the voice manager.
    pub fn matches_note_on(
        &self,
        note: u8,
        velocity: f32,
        random: f32,
        midi: &MidiState,
        bpm: f32,
        switches: &SwitchState,
    ) -> bool {
        if self.disabled() {
            return false;
        }
        match self.trigger {
            Trigger::Attack => {}
            // `first` fires only with no other key held, `legato` only with
            // at least one. The incoming note is already registered.
            Trigger::First => {
                if midi.pressed_note_count() > 1 {
                    return false;
                }
            }
            Trigger::Legato => {
                if midi.pressed_note_count() <= 1 {
                    return false;
                }
            }
            Trigger::Release | Trigger::ReleaseKey => return false,
        }
        if note < self.lokey || note > self.hikey {
            return false;
        }
        if velocity < self.lovel || velocity > self.hivel {
            return false;
        }
        if random < self.lorand || (random >= self.hirand && self.hirand < 1.0) {
            return false;
        }
        let polyaft = midi.poly_aftertouch(note);
        if polyaft < self.lopolyaft || polyaft > self.hipolyaft {
            return false;
        }
        self.ranges_allow(midi, bpm) && self.keyswitch_allows(midi, switches)
    }

    /// Note-off (release trigger) condition check against the velocity the
    /// note was originally struck with.
    pub fn matches_note_off(
        &self,
        note: u8,
        on_velocity: f32,
        random: f32,
        midi: &MidiState,
        bpm: f32,
        switches: &SwitchState,
    ) -> bool {
        if self.disabled() {
            return false;
        }
        if !matches!(self.trigger, Trigger::Release | Trigger::ReleaseKey) {
            return false;
        }
        if note < self.lokey || note > self.hikey {
            return false;
        }
        if on_velocity < self.lovel || on_velocity > self.hivel {
            return false;
        }
        if random < self.lorand || (random >= self.hirand && self.hirand < 1.0) {
            return false;
        }
        self.ranges_allow(midi, bpm) && self.keyswitch_allows(midi, switches)
    }

    /// CC trigger check: fires when `cc` crossed into one of the start
    /// spans with this event.
    pub fn matches_cc(&self, cc: u16, previous: f32, value: f32) -> bool {
        if self.disabled() {
            return false;
        }
        self.start_cc.iter().any(|range| {
            range.cc == cc
                && value >= range.lo
                && value <= range.hi
                && (previous < range.lo || previous > range.hi)
        })
    }

    /// Whether `note` falls into this region's key-switch span.
    pub fn consumes_keyswitch(&self, note: u8) -> bool {
        self.keyswitch
            .as_ref()
            .map(|ks| note >= ks.lokey && note <= ks.hikey)
            .unwrap_or(false)
    }

    // -- gains -----------------------------------------------------------

    /// Velocity response gain, linear.
    pub fn velocity_gain(&self, velocity: f32, curves: &CurveTable) -> f32 {
        let shaped = match self.amp_velcurve {
            Some(index) => curves.apply(index, velocity),
            // The default response is the usual power curve.
            None => velocity * velocity,
        };
        let track = self.amp_veltrack.clamp(-1.0, 1.0);
        if track >= 0.0 {
            1.0 - track + track * shaped
        } else {
            1.0 + track * shaped
        }
    }

    /// Key/velocity crossfade product, linear. Fixed per voice at start.
    pub fn key_vel_crossfade_gain(&self, note: u8, velocity: f32) -> f32 {
        let mut gain = 1.0;
        let key = note as f32;

        if self.xfin_key.active() {
            let t = (key - self.xfin_key.lo) / (self.xfin_key.hi - self.xfin_key.lo);
            gain *= xf_in(t, self.xf_keycurve);
        }
        if self.xfout_key.active() {
            let t = (key - self.xfout_key.lo) / (self.xfout_key.hi - self.xfout_key.lo);
            gain *= xf_out(t, self.xf_keycurve);
        }
        if self.xfin_vel.active() {
            let t = (velocity - self.xfin_vel.lo) / (self.xfin_vel.hi - self.xfin_vel.lo);
            gain *= xf_in(t, self.xf_velcurve);
        }
        if self.xfout_vel.active() {
            let t = (velocity - self.xfout_vel.lo) / (self.xfout_vel.hi - self.xfout_vel.lo);
            gain *= xf_out(t, self.xf_velcurve);
        }
        gain
    }

    /// CC crossfade product, linear. Moves with the controllers.
    pub fn cc_crossfade_gain(&self, midi: &MidiState) -> f32 {
        let mut gain = 1.0;
        for range in &self.xfin_cc {
            if range.hi > range.lo {
                let t = (midi.cc_value(range.cc) - range.lo) / (range.hi - range.lo);
                gain *= xf_in(t, self.xf_cccurve);
            }
        }
        for range in &self.xfout_cc {
            if range.hi > range.lo {
                let t = (midi.cc_value(range.cc) - range.lo) / (range.hi - range.lo);
                gain *= xf_out(t, self.xf_cccurve);
            }
        }
        gain
    }

    /// Full crossfade product.
    pub fn crossfade_gain(&self, note: u8, velocity: f32, midi: &MidiState) -> f32 {
        self.key_vel_crossfade_gain(note, velocity) * self.cc_crossfade_gain(midi)
    }

    /// Static volume product in dB: region volume plus the three scale
    /// levels plus amplitude key tracking.
    pub fn base_volume_db(&self, note: u8) -> f32 {
        self.volume
            + self.global_volume
            + self.master_volume
            + self.group_volume
            + self.amp_keytrack * (note as f32 - self.amp_keycenter as f32)
    }

    /// Static amplitude product, normalized.
    pub fn base_amplitude(&self) -> f32 {
        self.amplitude * self.global_amplitude * self.master_amplitude * self.group_amplitude
    }

    /// Pitch offset in cents at trigger time, before matrix modulation.
    pub fn base_pitch_cents(&self, note_pitch: f32, velocity: f32, random: f32) -> f32 {
        (note_pitch - self.pitch_keycenter as f32) * self.pitch_keytrack
            + self.transpose as f32 * 100.0
            + self.tune
            + self.pitch_veltrack * velocity
            + self.pitch_random * random
    }

    /// Pitch bend contribution in cents for a normalized bend value.
    pub fn bend_cents(&self, bend: f32) -> f32 {
        let mut cents = if bend >= 0.0 { bend * self.bend_up } else { -bend * self.bend_down };
        if self.bend_step > 0.0 {
            cents = (cents / self.bend_step).round() * self.bend_step;
        }
        cents
    }

    /// Clamps chain/connection lists to the per-region caps. Called by
    /// `RegionSet::new` so voices can rely on the bounds.
    fn clamp_resources(&mut self) {
        self.filters.truncate(MAX_FILTERS_PER_REGION);
        self.equalizers.truncate(MAX_EQS_PER_REGION);
        self.lfos.truncate(MAX_LFOS_PER_REGION);
        self.flex_egs.truncate(MAX_FLEX_EGS_PER_REGION);
        self.connections.truncate(MAX_CONNECTIONS_PER_REGION);
    }
}

/// The loaded, flattened instrument: all regions plus the curve table and
/// the precomputed load-time indexes.
#[derive(Debug, Clone, Default)]
pub struct RegionSet {
    pub regions: Vec<Region>,
    pub curves: CurveTable,
    /// Bit per MIDI key with at least one region listening.
    key_slots: [u8; 16],
    /// Bit per controller used by any condition or connection.
    cc_slots: [u8; CC_COUNT / 8],
    /// Per-region `(source, target) -> connection index`, sorted for
    /// binary search; makes depth setters O(log n) instead of a scan.
    connection_lookup: Vec<Vec<((ModKey, ModKey), u16)>>,
    num_groups: usize,
    num_samples: usize,
}

impl RegionSet {
    pub fn new(mut regions: Vec<Region>, curves: CurveTable) -> Self {
        let mut key_slots = [0u8; 16];
        let mut cc_slots = [0u8; CC_COUNT / 8];
        let mut groups = Vec::new();
        let mut sample_ptrs: Vec<*const SampleData> = Vec::new();
        let mut connection_lookup = Vec::with_capacity(regions.len());

        let mut mark_cc = |cc: u16| {
            let idx = cc as usize;
            if idx < CC_COUNT {
                cc_slots[idx / 8] |= 1 << (idx % 8);
            }
        };

        for (index, region) in regions.iter_mut().enumerate() {
            region.id = index as RegionId;
            region.clamp_resources();

            if !region.disabled() {
                for key in region.lokey..=region.hikey {
                    key_slots[key as usize / 8] |= 1 << (key as usize % 8);
                }
            }
            for range in region.cc_conditions.iter().chain(&region.start_cc) {
                mark_cc(range.cc);
            }
            for conn in &region.connections {
                if let ModKey::Controller(cc) | ModKey::PerVoiceController(cc) = conn.source {
                    mark_cc(cc);
                }
                if let Some(ModKey::Controller(cc)) = conn.depth_mod {
                    mark_cc(cc);
                }
            }

            if !groups.contains(&region.group) {
                groups.push(region.group);
            }
            if let Some(sample) = &region.sample {
                let ptr = Arc::as_ptr(sample);
                if !sample_ptrs.contains(&ptr) {
                    sample_ptrs.push(ptr);
                }
            }

            let mut lookup: Vec<((ModKey, ModKey), u16)> = region
                .connections
                .iter()
                .enumerate()
                .map(|(i, c)| ((c.source, c.target), i as u16))
                .collect();
            lookup.sort_by_key(|(key, _)| *key);
            connection_lookup.push(lookup);
        }

        Self {
            regions,
            curves,
            key_slots,
            cc_slots,
            connection_lookup,
            num_groups: groups.len(),
            num_samples: sample_ptrs.len(),
        }
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn key_slots(&self) -> &[u8; 16] {
        &self.key_slots
    }

    pub fn cc_slots(&self) -> &[u8; CC_COUNT / 8] {
        &self.cc_slots
    }

    /// Index of the connection for a `(source, target)` pair in a region.
    pub fn connection_index(&self, region: RegionId, source: ModKey, target: ModKey) -> Option<usize> {
        let lookup = self.connection_lookup.get(region as usize)?;
        lookup
            .binary_search_by_key(&(source, target), |(key, _)| *key)
            .ok()
            .map(|pos| lookup[pos].1 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SampleData;

    fn test_sample(frames: usize) -> Arc<SampleData> {
        Arc::new(SampleData::from_mono(&vec![0.5; frames], 48000))
    }

    fn basic_region() -> Region {
        let mut region = Region::with_sample(0, "test", test_sample(1000));
        region.set_key(60);
        region
    }

    #[test]
    fn test_disabled_without_sample() {
        let region = Region::default();
        assert!(region.disabled());
        let region = basic_region();
        assert!(!region.disabled());
    }

    #[test]
    fn test_note_on_matching_honors_ranges() {
        let midi = MidiState::new(48000.0);
        let switches = SwitchState::default();
        let mut region = basic_region();
        region.lovel = 0.5;

        assert!(!region.matches_note_on(61, 1.0, 0.5, &midi, 120.0, &switches));
        assert!(!region.matches_note_on(60, 0.4, 0.5, &midi, 120.0, &switches));
        assert!(region.matches_note_on(60, 0.8, 0.5, &midi, 120.0, &switches));
    }

    #[test]
    fn test_random_range_is_half_open() {
        let midi = MidiState::new(48000.0);
        let switches = SwitchState::default();
        let mut region = basic_region();
        region.lorand = 0.0;
        region.hirand = 0.5;
        assert!(region.matches_note_on(60, 1.0, 0.49, &midi, 120.0, &switches));
        assert!(!region.matches_note_on(60, 1.0, 0.5, &midi, 120.0, &switches));
        // The top of the full span stays inclusive so random == 1 - eps
        // always matches some region.
        region.hirand = 1.0;
        assert!(region.matches_note_on(60, 1.0, 0.999, &midi, 120.0, &switches));
    }

    #[test]
    fn test_release_trigger_matches_note_off_only() {
        let midi = MidiState::new(48000.0);
        let switches = SwitchState::default();
        let mut region = basic_region();
        region.trigger = Trigger::Release;
        assert!(!region.matches_note_on(60, 1.0, 0.5, &midi, 120.0, &switches));
        assert!(region.matches_note_off(60, 1.0, 0.5, &midi, 120.0, &switches));
    }

    #[test]
    fn test_cc_trigger_needs_threshold_crossing() {
        let mut region = basic_region();
        region.start_cc = vec![CcRange { cc: 64, lo: 0.5, hi: 1.0 }];
        assert!(region.matches_cc(64, 0.0, 0.7));
        // Already inside the span: no retrigger.
        assert!(!region.matches_cc(64, 0.6, 0.7));
        assert!(!region.matches_cc(63, 0.0, 0.7));
    }

    #[test]
    fn test_keyswitch_last_gates_region() {
        let midi = MidiState::new(48000.0);
        let mut region = basic_region();
        region.keyswitch = Some(KeySwitch { lokey: 24, hikey: 26, last: Some(25), ..Default::default() });

        let mut switches = SwitchState::default();
        assert!(!region.matches_note_on(60, 1.0, 0.5, &midi, 120.0, &switches));
        switches.last = Some(25);
        assert!(region.matches_note_on(60, 1.0, 0.5, &midi, 120.0, &switches));
    }

    #[test]
    fn test_velocity_gain_default_curve() {
        let curves = CurveTable::new();
        let region = basic_region();
        assert!((region.velocity_gain(1.0, &curves) - 1.0).abs() < 1e-6);
        assert!((region.velocity_gain(0.5, &curves) - 0.25).abs() < 1e-6);

        let mut flat = basic_region();
        flat.amp_veltrack = 0.0;
        assert!((flat.velocity_gain(0.1, &curves) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crossfade_key_spans() {
        let midi = MidiState::new(48000.0);
        let mut region = basic_region();
        region.lokey = 0;
        region.hikey = 127;
        region.xfin_key = XfSpan { lo: 60.0, hi: 64.0 };
        region.xf_keycurve = XfCurve::Gain;

        assert!(region.crossfade_gain(60, 1.0, &midi) < 1e-6);
        assert!((region.crossfade_gain(62, 1.0, &midi) - 0.5).abs() < 1e-6);
        assert!((region.crossfade_gain(64, 1.0, &midi) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bend_cents_asymmetric() {
        let mut region = basic_region();
        region.bend_up = 200.0;
        region.bend_down = -1200.0;
        assert!((region.bend_cents(1.0) - 200.0).abs() < 1e-6);
        assert!((region.bend_cents(-1.0) - (-1200.0)).abs() < 1e-6);
        assert!((region.bend_cents(0.5) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_region_set_precomputes_slots() {
        let mut a = basic_region();
        a.set_key(60);
        let mut b = basic_region();
        b.set_key(61);
        b.group = 2;
        b.cc_conditions = vec![CcRange { cc: 4, lo: 0.0, hi: 1.0 }];

        let set = RegionSet::new(vec![a, b], CurveTable::new());
        assert_eq!(set.num_regions(), 2);
        assert_eq!(set.num_groups(), 2);
        assert_eq!(set.num_samples(), 2);
        assert_ne!(set.key_slots()[60 / 8] & (1 << (60 % 8)), 0);
        assert_ne!(set.cc_slots()[4 / 8] & (1 << (4 % 8)), 0);
        assert_eq!(set.cc_slots()[5 / 8] & (1 << (5 % 8)), 0);
    }

    #[test]
    fn test_connection_lookup_finds_edges() {
        let mut region = basic_region();
        region.connections = vec![
            Connection::new(ModKey::Controller(1), ModKey::Pitch, 100.0),
            Connection::new(ModKey::Controller(74), ModKey::FilCutoff(0), 2400.0),
        ];
        let set = RegionSet::new(vec![region], CurveTable::new());
        assert_eq!(set.connection_index(0, ModKey::Controller(74), ModKey::FilCutoff(0)), Some(1));
        assert_eq!(set.connection_index(0, ModKey::Controller(74), ModKey::Pitch), None);
    }
}
