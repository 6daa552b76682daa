//! strix: a realtime SFZ-style sample-playback engine.
//!
//! The core is the voice pipeline and its modulation graph: a bounded
//! polyphonic voice pool fed by sample-accurate MIDI state, rendering
//! regions through envelopes, LFOs, a filter/EQ chain and a panner, with
//! an OSC path/typetag protocol for control and introspection.

pub mod audio;
pub mod constants;
pub mod curve;
pub mod dispatch;
pub mod dsp;
pub mod engine;
pub mod memory;
pub mod midi_state;
pub mod mod_matrix;
pub mod region;
pub mod types;
pub mod voice;
pub mod voice_manager;

pub use dsp::Frame;
pub use engine::Synth;
pub use region::{Region, RegionSet};
