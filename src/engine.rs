//! The synthesizer engine.
//!
//! Owns the region table, the MIDI state, the voice pool and the output
//! buses, and drives one render block at a time. Control threads talk to
//! it through a bounded channel drained at the top of each block; the
//! audio thread never locks, blocks or allocates on the render path.
//!
//! The region table lives in an `Arc`: loads build a fresh table
//! off-thread and send it over the channel; the swap is a pointer move.
//! Playing voices copied their parameters at start and keep their sample
//! buffers alive through their own `Arc`s, so the old table can drop
//! mid-note without a click.

use crate::constants::{
    DEFAULT_BPM, DEFAULT_OSCILLATOR_QUALITY, DEFAULT_SAMPLE_QUALITY,
    FREEWHEELING_OSCILLATOR_QUALITY, FREEWHEELING_SAMPLE_QUALITY, MAX_BLOCK_SEGMENTS,
    MAX_EFFECT_BUSES,
};
use crate::dsp::Frame;
use crate::midi_state::MidiState;
use crate::region::RegionSet;
use crate::types::ControlMessage;
use crate::voice_manager::{EngineContext, VoiceManager};
use crossbeam_channel::Receiver;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub struct Synth {
    pub sample_rate: f32,
    max_block: usize,
    regions: Arc<RegionSet>,
    pub midi: MidiState,
    pub manager: VoiceManager,
    buses: Vec<Vec<Frame>>,
    pub bpm: f32,
    pub sample_quality: u8,
    pub oscillator_quality: u8,
    pub freewheeling: bool,
    pub freewheeling_sample_quality: u8,
    pub freewheeling_oscillator_quality: u8,
    control_rx: Option<Receiver<ControlMessage>>,
    reply_queue: Option<Arc<ArrayQueue<rosc::OscMessage>>>,
    segment_scratch: Vec<u32>,
    /// Control messages dropped at the queue, incremented by the server.
    pub dropped_events: Arc<AtomicU64>,
}

impl Synth {
    pub fn new(sample_rate: f32, max_block: usize, max_voices: usize) -> Self {
        let buses = (0..=MAX_EFFECT_BUSES).map(|_| vec![Frame::ZERO; max_block]).collect();
        Self {
            sample_rate,
            max_block,
            regions: Arc::new(RegionSet::default()),
            midi: MidiState::new(sample_rate),
            manager: VoiceManager::new(max_voices, max_block, 0x5712),
            buses,
            bpm: DEFAULT_BPM,
            sample_quality: DEFAULT_SAMPLE_QUALITY,
            oscillator_quality: DEFAULT_OSCILLATOR_QUALITY,
            freewheeling: false,
            freewheeling_sample_quality: FREEWHEELING_SAMPLE_QUALITY,
            freewheeling_oscillator_quality: FREEWHEELING_OSCILLATOR_QUALITY,
            control_rx: None,
            reply_queue: None,
            segment_scratch: Vec::with_capacity(MAX_BLOCK_SEGMENTS),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attaches the control queue the dispatch server feeds.
    pub fn set_control_channel(&mut self, rx: Receiver<ControlMessage>) {
        self.control_rx = Some(rx);
    }

    /// Attaches the lock-free queue dispatch replies are pushed onto.
    pub fn set_reply_queue(&mut self, queue: Arc<ArrayQueue<rosc::OscMessage>>) {
        self.reply_queue = Some(queue);
    }

    // -- region table ----------------------------------------------------

    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }

    /// Mutable access for the dispatch setters. Returns None if a control
    /// thread still holds the table, in which case the set is a no-op.
    pub fn regions_mut(&mut self) -> Option<&mut RegionSet> {
        Arc::get_mut(&mut self.regions)
    }

    /// Installs a freshly built region table.
    pub fn set_regions(&mut self, set: Arc<RegionSet>) {
        self.manager.bind_regions(set.num_regions());
        self.regions = set;
    }

    pub fn effective_sample_quality(&self) -> u8 {
        if self.freewheeling {
            self.freewheeling_sample_quality
        } else {
            self.sample_quality
        }
    }

    pub fn effective_oscillator_quality(&self) -> u8 {
        if self.freewheeling {
            self.freewheeling_oscillator_quality
        } else {
            self.oscillator_quality
        }
    }

    pub fn num_active_voices(&self) -> usize {
        self.manager.num_active()
    }

    // -- musical events --------------------------------------------------

    pub fn note_on(&mut self, delay: u32, note: u8, velocity: f32) -> usize {
        let quality = self.effective_sample_quality();
        let clock = self.midi.clock();
        let mut ctx = EngineContext {
            regions: self.regions.as_ref(),
            midi: &mut self.midi,
            bpm: self.bpm,
            sample_rate: self.sample_rate,
            sample_quality: quality,
            clock,
        };
        self.manager.note_on(&mut ctx, delay, note, velocity)
    }

    pub fn note_off(&mut self, delay: u32, note: u8, velocity: f32) -> usize {
        let quality = self.effective_sample_quality();
        let clock = self.midi.clock();
        let mut ctx = EngineContext {
            regions: self.regions.as_ref(),
            midi: &mut self.midi,
            bpm: self.bpm,
            sample_rate: self.sample_rate,
            sample_quality: quality,
            clock,
        };
        self.manager.note_off(&mut ctx, delay, note, velocity)
    }

    pub fn cc(&mut self, delay: u32, cc: u16, value: f32) -> usize {
        let quality = self.effective_sample_quality();
        let clock = self.midi.clock();
        let mut ctx = EngineContext {
            regions: self.regions.as_ref(),
            midi: &mut self.midi,
            bpm: self.bpm,
            sample_rate: self.sample_rate,
            sample_quality: quality,
            clock,
        };
        self.manager.cc(&mut ctx, delay, cc, value)
    }

    pub fn pitch_bend(&mut self, delay: u32, value: f32) {
        self.midi.pitch_bend_event(delay, value);
    }

    pub fn channel_aftertouch(&mut self, delay: u32, value: f32) {
        self.midi.channel_aftertouch_event(delay, value);
    }

    pub fn poly_aftertouch(&mut self, delay: u32, note: u8, value: f32) {
        self.midi.poly_aftertouch_event(delay, note, value);
    }

    pub fn all_sound_off(&mut self) {
        self.manager.release_all();
    }

    pub fn panic(&mut self) {
        self.manager.reset_all();
    }

    // -- rendering -------------------------------------------------------

    /// Renders one block into the internal buses and advances MIDI time.
    pub fn render_block(&mut self, block_len: usize) {
        let n = block_len.min(self.max_block);

        self.drain_control_queue();

        for bus in &mut self.buses {
            Frame::process_block_zero(&mut bus[..n]);
        }

        self.midi.segment_boundaries(n as u32, &mut self.segment_scratch);
        self.segment_scratch.truncate(MAX_BLOCK_SEGMENTS);

        for voice in self.manager.voices_mut() {
            voice.render_block(
                &mut self.buses,
                n,
                &self.segment_scratch,
                &self.midi,
                &self.regions.curves,
                self.bpm,
                self.sample_rate,
            );
        }

        self.midi.advance_time(n as u32);
    }

    fn drain_control_queue(&mut self) {
        let Some(rx) = self.control_rx.clone() else {
            return;
        };
        while let Ok(message) = rx.try_recv() {
            self.apply(message);
        }
    }

    fn apply(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::NoteOn { delay, note, velocity } => {
                self.note_on(delay, note, velocity);
            }
            ControlMessage::NoteOff { delay, note, velocity } => {
                self.note_off(delay, note, velocity);
            }
            ControlMessage::Cc { delay, cc, value } => {
                self.cc(delay, cc, value);
            }
            ControlMessage::PitchBend { delay, value } => self.pitch_bend(delay, value),
            ControlMessage::ChannelAftertouch { delay, value } => {
                self.channel_aftertouch(delay, value)
            }
            ControlMessage::PolyAftertouch { delay, note, value } => {
                self.poly_aftertouch(delay, note, value)
            }
            ControlMessage::SwapRegions(set) => self.set_regions(set),
            ControlMessage::Tempo(bpm) => self.bpm = bpm.clamp(1.0, 999.0),
            ControlMessage::AllSoundOff => self.all_sound_off(),
            ControlMessage::Panic => self.panic(),
            ControlMessage::Dispatch(message) => self.handle_dispatch(message),
        }
    }

    fn handle_dispatch(&mut self, message: rosc::OscMessage) {
        use crate::dispatch::Reply;
        let reply = crate::dispatch::dispatch(self, &message.addr, &message.args);
        let Some(queue) = &self.reply_queue else {
            return;
        };
        let args = match reply {
            Some(Reply::Values(values)) => values,
            Some(Reply::Nil) => vec![rosc::OscType::Nil],
            _ => return,
        };
        let _ = queue.push(rosc::OscMessage { addr: message.addr, args });
    }

    /// Rendered output for one bus; 0 is the main bus.
    pub fn bus(&self, index: usize) -> &[Frame] {
        &self.buses[index]
    }

    pub fn num_buses(&self) -> usize {
        self.buses.len()
    }

    /// Interleaves the main bus into a stereo f32 buffer for the host.
    pub fn write_interleaved(&self, out: &mut [f32]) {
        let frames = out.len() / 2;
        for (i, frame) in self.buses[0].iter().take(frames).enumerate() {
            out[i * 2] = frame.left;
            out[i * 2 + 1] = frame.right;
        }
    }
}
