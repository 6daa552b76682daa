//! Time-stamped MIDI state.
//!
//! Every controller is an event vector sorted by sample delay into the
//! current block. The invariant maintained throughout: a vector always
//! holds at least one entry (the base value at delay 0) and its last entry
//! is the "current value", valid into the next block. `advance_time`
//! consumes a block's worth of events and collapses each vector back to a
//! single base entry.
//!
//! Beyond the 128 MIDI controllers the state exposes extended slots
//! (note-on/off velocity, note number, random, gate, alternate, keydelta)
//! so the modulation matrix can treat them uniformly as sources.

use crate::constants::{
    CC_COUNT, EXT_CC_ABS_KEYDELTA, EXT_CC_ALTERNATE, EXT_CC_BIPOLAR_RANDOM,
    EXT_CC_CHANNEL_AFTERTOUCH, EXT_CC_GATE, EXT_CC_KEYDELTA, EXT_CC_NOTE_NUMBER,
    EXT_CC_NOTE_OFF_VELOCITY, EXT_CC_NOTE_ON_VELOCITY, EXT_CC_PITCH_BEND,
    EXT_CC_UNIPOLAR_RANDOM,
};

const NOTE_COUNT: usize = 128;
const EVENT_CAPACITY: usize = 16;

/// One controller change: `value` becomes current `delay` samples into the
/// block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub delay: u32,
    pub value: f32,
}

impl Event {
    pub fn new(delay: u32, value: f32) -> Self {
        Self { delay, value }
    }
}

/// Inserts into a sorted event vector; an event at an existing delay
/// overwrites the previous value.
pub fn insert_event(events: &mut Vec<Event>, delay: u32, value: f32) {
    match events.binary_search_by_key(&delay, |e| e.delay) {
        Ok(pos) => events[pos].value = value,
        Err(pos) => events.insert(pos, Event::new(delay, value)),
    }
}

/// Value of a sorted event vector at `delay`: the last event at or before
/// that time, or the base entry.
pub fn value_at(events: &[Event], delay: u32) -> f32 {
    match events.binary_search_by_key(&delay, |e| e.delay) {
        Ok(pos) => events[pos].value,
        Err(0) => events.first().map(|e| e.value).unwrap_or(0.0),
        Err(pos) => events[pos - 1].value,
    }
}

/// Interleaves two sorted vectors into `dest` so that
/// `dest(t) == a(t) + b(t)` at every delay, using last-known values
/// between points. Used to combine per-note and channel CC streams.
pub fn additive_merge_events(a: &[Event], b: &[Event], dest: &mut Vec<Event>) {
    dest.clear();
    let mut ia = 0;
    let mut ib = 0;
    let mut last_a = a.first().map(|e| e.value).unwrap_or(0.0);
    let mut last_b = b.first().map(|e| e.value).unwrap_or(0.0);

    while ia < a.len() || ib < b.len() {
        let da = a.get(ia).map(|e| e.delay).unwrap_or(u32::MAX);
        let db = b.get(ib).map(|e| e.delay).unwrap_or(u32::MAX);
        let delay = da.min(db);
        if da == delay {
            last_a = a[ia].value;
            ia += 1;
        }
        if db == delay {
            last_b = b[ib].value;
            ib += 1;
        }
        insert_event(dest, delay, last_a + last_b);
    }

    if dest.is_empty() {
        dest.push(Event::new(0, 0.0));
    }
}

/// Per-note performance state.
#[derive(Debug, Clone)]
struct NoteState {
    pressed: bool,
    velocity: f32,
    on_clock: u64,
    /// Duration in samples, recorded at note-off.
    duration: u64,
    /// Per-note pitch bend stream, normalized -1..1.
    bend: Vec<Event>,
    bend_active: bool,
    /// Overridden base pitch in MIDI note units, when a per-note tuning
    /// message replaced the keyboard pitch.
    base_pitch: Option<f32>,
    /// Sparse per-note controller streams.
    cc: Vec<(u16, Vec<Event>)>,
}

impl Default for NoteState {
    fn default() -> Self {
        Self {
            pressed: false,
            velocity: 0.0,
            on_clock: 0,
            duration: 0,
            bend: vec![Event::new(0, 0.0)],
            bend_active: false,
            base_pitch: None,
            cc: Vec::new(),
        }
    }
}

pub struct MidiState {
    sample_rate: f32,
    /// Absolute engine clock in samples, advanced once per block.
    clock: u64,
    cc: Vec<Vec<Event>>,
    cc_defaults: Vec<f32>,
    poly_aftertouch: Vec<Vec<Event>>,
    notes: Vec<NoteState>,
    pressed_count: u32,
    last_note: Option<u8>,
    previous_note: Option<u8>,
    alternate: f32,
    /// CCs that received events this cycle and the previous one.
    changed: Vec<bool>,
    changed_prev: Vec<bool>,
}

impl MidiState {
    pub fn new(sample_rate: f32) -> Self {
        let mut cc = Vec::with_capacity(CC_COUNT);
        for _ in 0..CC_COUNT {
            let mut v = Vec::with_capacity(EVENT_CAPACITY);
            v.push(Event::new(0, 0.0));
            cc.push(v);
        }
        let mut poly_aftertouch = Vec::with_capacity(NOTE_COUNT);
        for _ in 0..NOTE_COUNT {
            let mut v = Vec::with_capacity(4);
            v.push(Event::new(0, 0.0));
            poly_aftertouch.push(v);
        }
        Self {
            sample_rate,
            clock: 0,
            cc,
            cc_defaults: vec![0.0; CC_COUNT],
            poly_aftertouch,
            notes: vec![NoteState::default(); NOTE_COUNT],
            pressed_count: 0,
            last_note: None,
            previous_note: None,
            alternate: 0.0,
            changed: vec![false; CC_COUNT],
            changed_prev: vec![false; CC_COUNT],
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    // --- event input -----------------------------------------------------

    /// Records a note-on and refreshes the note-derived extended CCs.
    /// `unipolar`/`bipolar` are random draws supplied by the engine PRNG.
    pub fn note_on_event(&mut self, delay: u32, note: u8, velocity: f32, unipolar: f32, bipolar: f32) {
        let idx = note as usize & 0x7f;
        if !self.notes[idx].pressed {
            self.pressed_count += 1;
        }
        self.notes[idx].pressed = true;
        self.notes[idx].velocity = velocity;
        self.notes[idx].on_clock = self.clock + delay as u64;
        self.notes[idx].duration = 0;

        let keydelta = match self.last_note {
            Some(prev) => note as f32 - prev as f32,
            None => 0.0,
        };
        self.previous_note = self.last_note;
        self.last_note = Some(note);
        self.alternate = 1.0 - self.alternate;

        self.cc_event(delay, EXT_CC_NOTE_ON_VELOCITY, velocity);
        self.cc_event(delay, EXT_CC_NOTE_NUMBER, note as f32 / 127.0);
        self.cc_event(delay, EXT_CC_GATE, 1.0);
        self.cc_event(delay, EXT_CC_UNIPOLAR_RANDOM, unipolar);
        self.cc_event(delay, EXT_CC_BIPOLAR_RANDOM, bipolar);
        self.cc_event(delay, EXT_CC_ALTERNATE, self.alternate);
        self.cc_event(delay, EXT_CC_KEYDELTA, keydelta / 127.0);
        self.cc_event(delay, EXT_CC_ABS_KEYDELTA, keydelta.abs() / 127.0);
    }

    /// Records a note-off and the resulting note duration.
    pub fn note_off_event(&mut self, delay: u32, note: u8, velocity: f32) {
        let idx = note as usize & 0x7f;
        if self.notes[idx].pressed {
            self.notes[idx].pressed = false;
            self.pressed_count = self.pressed_count.saturating_sub(1);
            let off_clock = self.clock + delay as u64;
            self.notes[idx].duration = off_clock.saturating_sub(self.notes[idx].on_clock);
        }

        self.cc_event(delay, EXT_CC_NOTE_OFF_VELOCITY, velocity);
        if self.pressed_count == 0 {
            self.cc_event(delay, EXT_CC_GATE, 0.0);
        }
    }

    pub fn cc_event(&mut self, delay: u32, cc: u16, value: f32) {
        let idx = cc as usize;
        if idx >= CC_COUNT {
            return;
        }
        insert_event(&mut self.cc[idx], delay, value);
        self.changed[idx] = true;
    }

    /// Pitch bend, normalized -1..1, kept in its extended slot.
    pub fn pitch_bend_event(&mut self, delay: u32, value: f32) {
        self.cc_event(delay, EXT_CC_PITCH_BEND, value.clamp(-1.0, 1.0));
    }

    pub fn channel_aftertouch_event(&mut self, delay: u32, value: f32) {
        self.cc_event(delay, EXT_CC_CHANNEL_AFTERTOUCH, value);
    }

    pub fn poly_aftertouch_event(&mut self, delay: u32, note: u8, value: f32) {
        insert_event(&mut self.poly_aftertouch[note as usize & 0x7f], delay, value);
    }

    /// Per-note pitch bend, normalized -1..1.
    pub fn note_bend_event(&mut self, delay: u32, note: u8, value: f32) {
        let state = &mut self.notes[note as usize & 0x7f];
        insert_event(&mut state.bend, delay, value.clamp(-1.0, 1.0));
        state.bend_active = true;
    }

    /// Per-note controller stream, merged additively with the channel
    /// stream on read.
    pub fn note_cc_event(&mut self, delay: u32, note: u8, cc: u16, value: f32) {
        let state = &mut self.notes[note as usize & 0x7f];
        match state.cc.iter_mut().find(|(num, _)| *num == cc) {
            Some((_, events)) => insert_event(events, delay, value),
            None => {
                let mut events = Vec::with_capacity(4);
                events.push(Event::new(0, 0.0));
                insert_event(&mut events, delay, value);
                state.cc.push((cc, events));
            }
        }
    }

    /// Replaces the keyboard pitch of a note, in MIDI note units.
    pub fn set_note_base_pitch(&mut self, note: u8, pitch: Option<f32>) {
        self.notes[note as usize & 0x7f].base_pitch = pitch;
    }

    pub fn set_cc_default(&mut self, cc: u16, value: f32) {
        let idx = cc as usize;
        if idx < CC_COUNT {
            self.cc_defaults[idx] = value;
        }
    }

    pub fn cc_default(&self, cc: u16) -> f32 {
        self.cc_defaults.get(cc as usize).copied().unwrap_or(0.0)
    }

    // --- reads -----------------------------------------------------------

    /// Current (end-of-block) controller value.
    #[inline]
    pub fn cc_value(&self, cc: u16) -> f32 {
        self.cc
            .get(cc as usize)
            .and_then(|v| v.last())
            .map(|e| e.value)
            .unwrap_or(0.0)
    }

    /// Controller value at a sample offset into the current block.
    #[inline]
    pub fn cc_value_at(&self, cc: u16, delay: u32) -> f32 {
        self.cc
            .get(cc as usize)
            .map(|v| value_at(v, delay))
            .unwrap_or(0.0)
    }

    pub fn cc_events(&self, cc: u16) -> &[Event] {
        &self.cc[cc as usize]
    }

    pub fn pitch_bend(&self) -> f32 {
        self.cc_value(EXT_CC_PITCH_BEND)
    }

    pub fn channel_aftertouch(&self) -> f32 {
        self.cc_value(EXT_CC_CHANNEL_AFTERTOUCH)
    }

    pub fn poly_aftertouch(&self, note: u8) -> f32 {
        self.poly_aftertouch[note as usize & 0x7f]
            .last()
            .map(|e| e.value)
            .unwrap_or(0.0)
    }

    pub fn poly_aftertouch_at(&self, note: u8, delay: u32) -> f32 {
        value_at(&self.poly_aftertouch[note as usize & 0x7f], delay)
    }

    /// Channel + per-note controller value at a delay, merged additively.
    pub fn merged_cc_at(&self, note: u8, cc: u16, delay: u32) -> f32 {
        let channel = self.cc_value_at(cc, delay);
        let state = &self.notes[note as usize & 0x7f];
        let per_note = state
            .cc
            .iter()
            .find(|(num, _)| *num == cc)
            .map(|(_, events)| value_at(events, delay))
            .unwrap_or(0.0);
        channel + per_note
    }

    pub fn note_bend(&self, note: u8) -> f32 {
        let state = &self.notes[note as usize & 0x7f];
        if state.bend_active {
            state.bend.last().map(|e| e.value).unwrap_or(0.0)
        } else {
            0.0
        }
    }

    pub fn note_base_pitch(&self, note: u8) -> f32 {
        self.notes[note as usize & 0x7f]
            .base_pitch
            .unwrap_or(note as f32)
    }

    pub fn is_note_pressed(&self, note: u8) -> bool {
        self.notes[note as usize & 0x7f].pressed
    }

    pub fn pressed_note_count(&self) -> u32 {
        self.pressed_count
    }

    pub fn note_velocity(&self, note: u8) -> f32 {
        self.notes[note as usize & 0x7f].velocity
    }

    /// Seconds a note has been (or was) held. For a still-pressed note the
    /// duration runs against the current clock.
    pub fn note_duration(&self, note: u8) -> f32 {
        let state = &self.notes[note as usize & 0x7f];
        let samples = if state.pressed {
            self.clock.saturating_sub(state.on_clock)
        } else {
            state.duration
        };
        samples as f32 / self.sample_rate
    }

    pub fn last_note_played(&self) -> Option<u8> {
        self.last_note
    }

    /// CCs with events this cycle / the previous cycle.
    pub fn cc_changed(&self) -> &[bool] {
        &self.changed
    }

    pub fn cc_changed_prev(&self) -> &[bool] {
        &self.changed_prev
    }

    /// Collects the distinct non-zero event delays below `block_size`
    /// across all controller vectors, sorted ascending. These are the
    /// segment boundaries for block-precise modulation.
    pub fn segment_boundaries(&self, block_size: u32, out: &mut Vec<u32>) {
        out.clear();
        for (idx, events) in self.cc.iter().enumerate() {
            if !self.changed[idx] || events.len() < 2 {
                continue;
            }
            for e in events.iter() {
                if e.delay > 0 && e.delay < block_size && !out.contains(&e.delay) {
                    out.push(e.delay);
                }
            }
        }
        out.sort_unstable();
    }

    // --- block lifecycle -------------------------------------------------

    /// Consumes one block: advances the clock and collapses every vector
    /// to its final value at delay 0.
    pub fn advance_time(&mut self, block_size: u32) {
        self.clock += block_size as u64;

        std::mem::swap(&mut self.changed, &mut self.changed_prev);
        self.changed.iter_mut().for_each(|c| *c = false);

        for events in self.cc.iter_mut() {
            collapse(events);
        }
        for events in self.poly_aftertouch.iter_mut() {
            collapse(events);
        }
        for state in self.notes.iter_mut() {
            collapse(&mut state.bend);
            // Per-note bend goes inactive once it has returned to zero.
            if state.bend_active && state.bend[0].value == 0.0 {
                state.bend_active = false;
            }
            for (_, events) in state.cc.iter_mut() {
                collapse(events);
            }
        }
    }
}

fn collapse(events: &mut Vec<Event>) {
    let last = events.last().map(|e| e.value).unwrap_or(0.0);
    events.clear();
    events.push(Event::new(0, last));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EXT_CC_GATE;

    #[test]
    fn test_insert_overwrites_at_equal_delay() {
        let mut events = vec![Event::new(0, 0.0)];
        insert_event(&mut events, 100, 0.3);
        insert_event(&mut events, 100, 0.7);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].value, 0.7);
    }

    #[test]
    fn test_value_at_uses_last_known() {
        let mut events = vec![Event::new(0, 0.1)];
        insert_event(&mut events, 64, 0.5);
        insert_event(&mut events, 128, 0.9);
        assert_eq!(value_at(&events, 0), 0.1);
        assert_eq!(value_at(&events, 63), 0.1);
        assert_eq!(value_at(&events, 64), 0.5);
        assert_eq!(value_at(&events, 200), 0.9);
    }

    #[test]
    fn test_cc_survives_advance_time() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(17, 74, 0.42);
        midi.advance_time(512);
        assert_eq!(midi.cc_value(74), 0.42);
        assert_eq!(midi.cc_events(74).len(), 1);
        assert_eq!(midi.cc_events(74)[0].delay, 0);
    }

    #[test]
    fn test_note_duration_measured_in_samples() {
        let mut midi = MidiState::new(48000.0);
        midi.note_on_event(0, 60, 1.0, 0.0, 0.0);
        midi.note_off_event(480, 60, 0.0);
        midi.advance_time(512);
        assert!((midi.note_duration(60) - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_gate_tracks_pressed_notes() {
        let mut midi = MidiState::new(48000.0);
        midi.note_on_event(0, 60, 1.0, 0.0, 0.0);
        midi.note_on_event(0, 64, 1.0, 0.0, 0.0);
        midi.note_off_event(0, 60, 0.0);
        assert_eq!(midi.cc_value(EXT_CC_GATE), 1.0);
        midi.note_off_event(0, 64, 0.0);
        assert_eq!(midi.cc_value(EXT_CC_GATE), 0.0);
    }

    #[test]
    fn test_alternate_toggles_per_note_on() {
        let mut midi = MidiState::new(48000.0);
        midi.note_on_event(0, 60, 1.0, 0.0, 0.0);
        assert_eq!(midi.cc_value(EXT_CC_ALTERNATE), 1.0);
        midi.note_on_event(0, 60, 1.0, 0.0, 0.0);
        assert_eq!(midi.cc_value(EXT_CC_ALTERNATE), 0.0);
    }

    #[test]
    fn test_keydelta_is_signed() {
        let mut midi = MidiState::new(48000.0);
        midi.note_on_event(0, 60, 1.0, 0.0, 0.0);
        midi.note_on_event(0, 48, 1.0, 0.0, 0.0);
        assert!((midi.cc_value(EXT_CC_KEYDELTA) - (-12.0 / 127.0)).abs() < 1e-6);
        assert!((midi.cc_value(EXT_CC_ABS_KEYDELTA) - (12.0 / 127.0)).abs() < 1e-6);
    }

    #[test]
    fn test_additive_merge_is_commutative() {
        let mut a = vec![Event::new(0, 0.1)];
        insert_event(&mut a, 100, 0.2);
        let mut b = vec![Event::new(0, 0.3)];
        insert_event(&mut b, 150, 0.5);

        let mut ab = Vec::new();
        let mut ba = Vec::new();
        additive_merge_events(&a, &b, &mut ab);
        additive_merge_events(&b, &a, &mut ba);
        assert_eq!(ab, ba);

        // Pointwise sums with last-known-value semantics.
        assert!((value_at(&ab, 0) - 0.4).abs() < 1e-6);
        assert!((value_at(&ab, 120) - 0.5).abs() < 1e-6);
        assert!((value_at(&ab, 200) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_per_note_bend_deactivates_at_zero() {
        let mut midi = MidiState::new(48000.0);
        midi.note_bend_event(0, 60, 0.5);
        assert_eq!(midi.note_bend(60), 0.5);
        midi.note_bend_event(10, 60, 0.0);
        midi.advance_time(512);
        assert_eq!(midi.note_bend(60), 0.0);
        // Inactive after returning to zero.
        assert!(!midi.notes[60].bend_active);
    }

    #[test]
    fn test_merged_cc_adds_streams() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 11, 0.25);
        midi.note_cc_event(0, 60, 11, 0.5);
        assert!((midi.merged_cc_at(60, 11, 0) - 0.75).abs() < 1e-6);
        // Other notes see only the channel stream.
        assert!((midi.merged_cc_at(61, 11, 0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_segment_boundaries_collects_midblock_events() {
        let mut midi = MidiState::new(48000.0);
        midi.cc_event(0, 74, 0.5);
        midi.cc_event(256, 74, 1.0);
        midi.cc_event(256, 11, 0.2);
        midi.cc_event(300, 11, 0.4);
        let mut bounds = Vec::new();
        midi.segment_boundaries(512, &mut bounds);
        assert_eq!(bounds, vec![256, 300]);
    }
}
