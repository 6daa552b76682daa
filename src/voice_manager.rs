//! The voice manager.
//!
//! Owns the fixed voice pool and drives region selection on musical
//! events: note-on matching with every condition predicate, polyphony
//! enforcement (region, per-note, self-mask), stealing, group choke,
//! release triggers with their `rt_decay` attenuation, CC-threshold
//! triggers and the sustain pedal.
//!
//! The pool invariant holds at all times: every voice is either free or
//! active, and stealing never drops a voice on the floor — victims ramp
//! out through `FastOff` before they free.

use crate::constants::{CC_SUSTAIN_PEDAL, SUSTAIN_PEDAL_THRESHOLD};
use crate::midi_state::MidiState;
use crate::region::{Region, RegionSet, SwitchState, Trigger};
use crate::types::{GroupId, TriggerEvent, TriggerKind, VoiceId};
use crate::voice::Voice;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Which release-triggered regions a note-off pass may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseFilter {
    All,
    /// Only `release_key` regions, while the pedal defers the rest.
    KeyOnly,
    /// Only `release` regions, fired from the pedal-up catch-up.
    PedalOnly,
}

/// Everything a musical-event call needs from the engine.
pub struct EngineContext<'a> {
    pub regions: &'a RegionSet,
    pub midi: &'a mut MidiState,
    pub bpm: f32,
    pub sample_rate: f32,
    pub sample_quality: u8,
    pub clock: u64,
}

pub struct VoiceManager {
    voices: Vec<Voice>,
    rng: SmallRng,
    switches: SwitchState,
    last_note: Option<u8>,
    /// Per-region sequence counters, rebuilt when the region table swaps.
    sequence_counters: Vec<u32>,
    sustain_down: bool,
    sustain_cancels_release: bool,
    /// Note-offs waiting for the pedal before firing release regions.
    pending_releases: Vec<(u8, f32)>,
    /// Note-ons dropped because the pool had no free voice.
    pub refused_count: u64,
}

impl VoiceManager {
    pub fn new(max_voices: usize, max_block: usize, seed: u64) -> Self {
        let voices = (0..max_voices).map(|i| Voice::new(i as VoiceId, max_block)).collect();
        Self {
            voices,
            rng: SmallRng::seed_from_u64(seed),
            switches: SwitchState::default(),
            last_note: None,
            sequence_counters: Vec::new(),
            sustain_down: false,
            sustain_cancels_release: false,
            pending_releases: Vec::new(),
            refused_count: 0,
        }
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    pub fn num_active(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    pub fn num_free(&self) -> usize {
        self.voices.iter().filter(|v| v.is_free()).count()
    }

    pub fn set_sustain_cancels_release(&mut self, value: bool) {
        self.sustain_cancels_release = value;
    }

    pub fn sustain_cancels_release(&self) -> bool {
        self.sustain_cancels_release
    }

    /// Resets per-table state after a region swap.
    pub fn bind_regions(&mut self, region_count: usize) {
        self.sequence_counters.clear();
        self.sequence_counters.resize(region_count, 0);
        self.switches = SwitchState::default();
        self.pending_releases.clear();
    }

    /// Stops every voice through its release.
    pub fn release_all(&mut self) {
        for voice in self.voices.iter_mut().filter(|v| v.is_active()) {
            voice.release();
        }
    }

    /// Emergency stop.
    pub fn reset_all(&mut self) {
        for voice in &mut self.voices {
            voice.reset();
        }
        self.pending_releases.clear();
    }

    // -- note events -----------------------------------------------------

    /// Handles a note-on: updates MIDI and keyswitch state, scans regions
    /// and starts one voice per match. Returns the number started.
    pub fn note_on(&mut self, ctx: &mut EngineContext, delay: u32, note: u8, velocity: f32) -> usize {
        self.switches.previous_note = self.last_note;
        self.last_note = Some(note);

        let unipolar: f32 = self.rng.random();
        let bipolar: f32 = self.rng.random_range(-1.0..1.0);
        ctx.midi.note_on_event(delay, note, velocity, unipolar, bipolar);

        // Latch key-switches before matching; a switch press may also play.
        for region in &ctx.regions.regions {
            if region.consumes_keyswitch(note) {
                self.switches.last = Some(note);
                break;
            }
        }

        let random: f32 = self.rng.random();
        let mut started = 0;

        for index in 0..ctx.regions.regions.len() {
            let region = &ctx.regions.regions[index];
            if !region.matches_note_on(note, velocity, random, ctx.midi, ctx.bpm, &self.switches) {
                continue;
            }

            // The sequence advances once per key-matched region, whether or
            // not the position fires.
            let counter = self.sequence_counters[index];
            self.sequence_counters[index] = counter.wrapping_add(1);
            if region.sequence_length > 1
                && counter % region.sequence_length != region.sequence_position.saturating_sub(1)
            {
                continue;
            }

            let event = TriggerEvent::note_on(delay, note, velocity);
            if self.start_region_voice(ctx, index, event) {
                started += 1;
            }
        }

        started
    }

    /// Handles a note-off: releases playing voices (or defers them to the
    /// pedal) and fires release-triggered regions. Returns voices started.
    pub fn note_off(&mut self, ctx: &mut EngineContext, delay: u32, note: u8, velocity: f32) -> usize {
        ctx.midi.note_off_event(delay, note, velocity);

        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.note == note && voice.trigger_event().kind == TriggerKind::NoteOn {
                if self.sustain_down {
                    voice.sustained = true;
                } else {
                    voice.release();
                }
            }
        }

        if self.sustain_down {
            // Release regions wait for the pedal; release_key regions fire
            // regardless.
            self.pending_releases.push((note, ctx.midi.note_velocity(note)));
            self.fire_release_regions(ctx, delay, note, ReleaseFilter::KeyOnly)
        } else {
            self.fire_release_regions(ctx, delay, note, ReleaseFilter::All)
        }
    }

    fn fire_release_regions(
        &mut self,
        ctx: &mut EngineContext,
        delay: u32,
        note: u8,
        filter: ReleaseFilter,
    ) -> usize {
        let on_velocity = ctx.midi.note_velocity(note);
        let random: f32 = self.rng.random();
        let mut started = 0;

        for index in 0..ctx.regions.regions.len() {
            let region = &ctx.regions.regions[index];
            match filter {
                ReleaseFilter::All => {}
                ReleaseFilter::KeyOnly if region.trigger != Trigger::ReleaseKey => continue,
                ReleaseFilter::PedalOnly if region.trigger != Trigger::Release => continue,
                _ => {}
            }
            if !region.matches_note_off(note, on_velocity, random, ctx.midi, ctx.bpm, &self.switches) {
                continue;
            }
            let event = TriggerEvent::note_off(delay, note, on_velocity);
            if self.start_region_voice(ctx, index, event) {
                started += 1;
            }
        }
        started
    }

    // -- controllers -----------------------------------------------------

    /// Handles a controller event: records it, runs the sustain pedal
    /// logic, and fires `start_*cc` regions on threshold crossings.
    pub fn cc(&mut self, ctx: &mut EngineContext, delay: u32, cc: u16, value: f32) -> usize {
        let previous = ctx.midi.cc_value(cc);
        ctx.midi.cc_event(delay, cc, value);

        if cc == CC_SUSTAIN_PEDAL {
            self.sustain_pedal(ctx, delay, value);
        }

        let mut started = 0;
        for index in 0..ctx.regions.regions.len() {
            let region = &ctx.regions.regions[index];
            if !region.matches_cc(cc, previous, value) {
                continue;
            }
            let event = TriggerEvent::cc(delay, cc.min(u8::MAX as u16) as u8, value);
            if self.start_region_voice(ctx, index, event) {
                started += 1;
            }
        }
        started
    }

    fn sustain_pedal(&mut self, ctx: &mut EngineContext, delay: u32, value: f32) {
        let down = value >= SUSTAIN_PEDAL_THRESHOLD;
        if down == self.sustain_down {
            return;
        }
        self.sustain_down = down;

        if down {
            if self.sustain_cancels_release {
                for voice in self.voices.iter_mut() {
                    if voice.is_active() && voice.is_releasing() {
                        voice.cancel_release();
                    }
                }
            }
            return;
        }

        // Pedal up: release what the pedal was holding, run sustain loops
        // out, and fire the deferred release regions.
        for voice in self.voices.iter_mut() {
            voice.exit_sustain_loop();
            if voice.is_active() && voice.sustained {
                voice.release();
            }
        }

        let pending = std::mem::take(&mut self.pending_releases);
        for (note, _velocity) in pending {
            self.fire_release_regions(ctx, delay, note, ReleaseFilter::PedalOnly);
        }
    }

    // -- voice allocation ------------------------------------------------

    /// Applies polyphony rules, allocates (or steals toward) a voice, and
    /// starts it. Returns false when the note had to be dropped.
    fn start_region_voice(&mut self, ctx: &mut EngineContext, region_index: usize, event: TriggerEvent) -> bool {
        let region = &ctx.regions.regions[region_index];

        if region.polyphony == Some(0) || region.note_polyphony == Some(0) {
            return false;
        }

        // Self-mask: the new voice replaces an older voice of the same
        // region and note whose current amplitude is no louder.
        if region.note_selfmask {
            let mut victim: Option<usize> = None;
            for (i, voice) in self.voices.iter().enumerate() {
                if voice.is_active()
                    && voice.region_id() == region.id
                    && voice.note == event.number
                    && voice.gate_level() <= event.value
                {
                    let older = victim.map(|v| self.voices[v].age > voice.age).unwrap_or(true);
                    if older {
                        victim = Some(i);
                    }
                }
            }
            if let Some(i) = victim {
                self.voices[i].steal(ctx.sample_rate);
            }
        }

        // Per-region polyphony: FIFO within the competing set.
        if let Some(limit) = region.polyphony {
            let competing: Vec<usize> = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_active() && v.region_id() == region.id)
                .map(|(i, _)| i)
                .collect();
            if competing.len() >= limit as usize {
                if let Some(&oldest) = competing.iter().min_by_key(|&&i| self.voices[i].age) {
                    self.voices[oldest].steal(ctx.sample_rate);
                }
            }
        }

        // Per-note polyphony.
        if let Some(limit) = region.note_polyphony {
            let competing: Vec<usize> = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| {
                    v.is_active() && v.region_id() == region.id && v.note == event.number
                })
                .map(|(i, _)| i)
                .collect();
            if competing.len() >= limit as usize {
                if let Some(&oldest) = competing.iter().min_by_key(|&&i| self.voices[i].age) {
                    self.voices[oldest].steal(ctx.sample_rate);
                }
            }
        }

        let Some(slot) = self.allocate(ctx.sample_rate) else {
            self.refused_count += 1;
            return false;
        };

        let region = &ctx.regions.regions[region_index];
        self.voices[slot].start(
            region,
            &ctx.regions.curves,
            ctx.midi,
            event,
            &mut self.rng,
            ctx.sample_rate,
            ctx.sample_quality,
            ctx.clock,
        );
        let new_id = self.voices[slot].id;

        // Group choke: a region carrying `off_by=G` silences group G.
        if let Some(choked_group) = region.off_by {
            self.choke_group(choked_group, new_id, ctx.sample_rate);
        }

        true
    }

    /// Finds a free voice, stealing the weakest one when the pool is full.
    /// Stolen voices ramp out, so a completely saturated pool can still
    /// refuse the incoming note for one block.
    fn allocate(&mut self, sample_rate: f32) -> Option<usize> {
        if let Some(free) = self.voices.iter().position(|v| v.is_free()) {
            return Some(free);
        }

        // No free voice: fast-off the one with the lowest envelope level,
        // oldest first among equals.
        let victim = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_active())
            .min_by(|(_, a), (_, b)| {
                a.gate_level()
                    .partial_cmp(&b.gate_level())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.age.cmp(&b.age))
            })
            .map(|(i, _)| i);
        if let Some(i) = victim {
            self.voices[i].steal(sample_rate);
        }
        None
    }

    /// Chokes every live member of `group` through its own off mode,
    /// recording the choker.
    pub fn choke_group(&mut self, group: GroupId, source: VoiceId, sample_rate: f32) {
        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.id != source && voice.group == group {
                voice.off(false, sample_rate, Some(source));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveTable;
    use crate::memory::SampleData;
    use crate::region::{CcRange, RegionSet};
    use std::sync::Arc;

    fn sample(frames: usize) -> Arc<SampleData> {
        Arc::new(SampleData::from_mono(&vec![0.5; frames], 48000))
    }

    fn region_on_key(key: u8) -> Region {
        let mut region = Region::with_sample(0, "s", sample(48000));
        region.set_key(key);
        region.amp_eg.release = 0.01;
        region
    }

    struct Rig {
        set: RegionSet,
        midi: MidiState,
        manager: VoiceManager,
        clock: u64,
    }

    impl Rig {
        fn new(regions: Vec<Region>) -> Self {
            let set = RegionSet::new(regions, CurveTable::new());
            let midi = MidiState::new(48000.0);
            let mut manager = VoiceManager::new(8, 1024, 99);
            manager.bind_regions(set.num_regions());
            Self { set, midi, manager, clock: 0 }
        }

        fn note_on(&mut self, delay: u32, note: u8, velocity: f32) -> usize {
            let mut ctx = EngineContext {
                regions: &self.set,
                midi: &mut self.midi,
                bpm: 120.0,
                sample_rate: 48000.0,
                sample_quality: 2,
                clock: self.clock,
            };
            self.manager.note_on(&mut ctx, delay, note, velocity)
        }

        fn note_off(&mut self, delay: u32, note: u8, velocity: f32) -> usize {
            let mut ctx = EngineContext {
                regions: &self.set,
                midi: &mut self.midi,
                bpm: 120.0,
                sample_rate: 48000.0,
                sample_quality: 2,
                clock: self.clock,
            };
            self.manager.note_off(&mut ctx, delay, note, velocity)
        }

        fn cc(&mut self, delay: u32, cc: u16, value: f32) -> usize {
            let mut ctx = EngineContext {
                regions: &self.set,
                midi: &mut self.midi,
                bpm: 120.0,
                sample_rate: 48000.0,
                sample_quality: 2,
                clock: self.clock,
            };
            self.manager.cc(&mut ctx, delay, cc, value)
        }
    }

    #[test]
    fn test_note_on_starts_matching_voice() {
        let mut rig = Rig::new(vec![region_on_key(60)]);
        assert_eq!(rig.note_on(0, 60, 1.0), 1);
        assert_eq!(rig.manager.num_active(), 1);
        assert_eq!(rig.note_on(0, 61, 1.0), 0);
    }

    #[test]
    fn test_empty_region_table_is_a_noop() {
        let mut rig = Rig::new(Vec::new());
        assert_eq!(rig.note_on(0, 60, 1.0), 0);
    }

    #[test]
    fn test_polyphony_zero_never_starts() {
        let mut region = region_on_key(60);
        region.polyphony = Some(0);
        let mut rig = Rig::new(vec![region]);
        assert_eq!(rig.note_on(0, 60, 1.0), 0);
    }

    #[test]
    fn test_pool_invariant_holds_under_load() {
        let mut rig = Rig::new(vec![region_on_key(60)]);
        for _ in 0..20 {
            rig.note_on(0, 60, 1.0);
        }
        assert_eq!(rig.manager.num_active() + rig.manager.num_free(), 8);
    }

    #[test]
    fn test_note_off_releases_only_that_note() {
        let mut rig = Rig::new(vec![region_on_key(60), {
            let mut r = region_on_key(62);
            r.id = 1;
            r
        }]);
        rig.note_on(0, 60, 1.0);
        rig.note_on(0, 62, 1.0);
        rig.note_off(0, 60, 0.0);

        let releasing: Vec<bool> =
            rig.manager.voices().iter().filter(|v| v.is_active()).map(|v| v.is_releasing()).collect();
        assert_eq!(releasing.iter().filter(|&&r| r).count(), 1);
    }

    #[test]
    fn test_release_trigger_fires_on_note_off() {
        let mut release_region = region_on_key(60);
        release_region.trigger = Trigger::Release;
        release_region.id = 1;
        let mut rig = Rig::new(vec![region_on_key(60), release_region]);

        assert_eq!(rig.note_on(0, 60, 0.8), 1);
        assert_eq!(rig.note_off(0, 60, 0.0), 1);

        // The release voice carries the note-on velocity as trigger value.
        let release_voice = rig
            .manager
            .voices()
            .iter()
            .find(|v| v.is_active() && v.trigger_event().kind == TriggerKind::NoteOff)
            .unwrap();
        assert!((release_voice.trigger_event().value - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_group_choke_uses_off_by() {
        let mut victim = region_on_key(60);
        victim.group = 1;
        let mut choker = region_on_key(62);
        choker.id = 1;
        choker.group = 2;
        choker.off_by = Some(1);
        let mut rig = Rig::new(vec![victim, choker]);

        rig.note_on(0, 60, 1.0);
        rig.note_on(0, 62, 1.0);

        let choked = rig
            .manager
            .voices()
            .iter()
            .find(|v| v.is_active() && v.note == 60)
            .unwrap();
        assert_eq!(choked.state(), crate::voice::VoiceState::FastOff);
        assert!(choked.off_source.is_some());
    }

    #[test]
    fn test_note_polyphony_steals_oldest() {
        let mut region = region_on_key(60);
        region.note_polyphony = Some(1);
        let mut rig = Rig::new(vec![region]);

        rig.note_on(0, 60, 0.5);
        rig.clock = 1024;
        rig.note_on(0, 60, 1.0);

        let fast_off = rig
            .manager
            .voices()
            .iter()
            .filter(|v| v.state() == crate::voice::VoiceState::FastOff)
            .count();
        assert_eq!(fast_off, 1);
        let playing = rig
            .manager
            .voices()
            .iter()
            .filter(|v| v.state() == crate::voice::VoiceState::Playing)
            .count();
        assert_eq!(playing, 1);
    }

    #[test]
    fn test_sequence_positions_alternate() {
        let mut first = region_on_key(60);
        first.sequence_length = 2;
        first.sequence_position = 1;
        let mut second = region_on_key(60);
        second.id = 1;
        second.sequence_length = 2;
        second.sequence_position = 2;
        let mut rig = Rig::new(vec![first, second]);

        assert_eq!(rig.note_on(0, 60, 1.0), 1);
        let first_region = rig.manager.voices().iter().find(|v| v.is_active()).unwrap().region_id();
        assert_eq!(first_region, 0);

        assert_eq!(rig.note_on(0, 60, 1.0), 1);
        let started: Vec<_> = rig
            .manager
            .voices()
            .iter()
            .filter(|v| v.is_active())
            .map(|v| v.region_id())
            .collect();
        assert!(started.contains(&1));
    }

    #[test]
    fn test_sustain_pedal_defers_release() {
        let mut rig = Rig::new(vec![region_on_key(60)]);
        rig.note_on(0, 60, 1.0);
        rig.cc(0, CC_SUSTAIN_PEDAL, 1.0);
        rig.note_off(0, 60, 0.0);

        let voice = rig.manager.voices().iter().find(|v| v.is_active()).unwrap();
        assert!(!voice.is_releasing());
        assert!(voice.sustained);

        rig.cc(0, CC_SUSTAIN_PEDAL, 0.0);
        let voice = rig.manager.voices().iter().find(|v| v.is_active()).unwrap();
        assert!(voice.is_releasing());
    }

    #[test]
    fn test_cc_trigger_starts_voice() {
        let mut region = region_on_key(60);
        region.start_cc = vec![CcRange { cc: 30, lo: 0.5, hi: 1.0 }];
        let mut rig = Rig::new(vec![region]);

        assert_eq!(rig.cc(0, 30, 0.8), 1);
        // No retrigger while the controller stays inside the span.
        assert_eq!(rig.cc(0, 30, 0.9), 0);
    }

    #[test]
    fn test_keyswitch_latches_and_gates() {
        let mut gated = region_on_key(60);
        gated.keyswitch = Some(crate::region::KeySwitch {
            lokey: 24,
            hikey: 25,
            last: Some(24),
            ..Default::default()
        });
        let mut rig = Rig::new(vec![gated]);

        assert_eq!(rig.note_on(0, 60, 1.0), 0);
        // Press the switch, then the note plays.
        rig.note_on(0, 24, 1.0);
        assert_eq!(rig.note_on(0, 60, 1.0), 1);
    }
}
