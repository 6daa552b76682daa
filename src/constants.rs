//! Centralized constants for the strix engine.
//! Contains only the constants that are actually used throughout the codebase.

// Audio processing constants - Used in main.rs CLI defaults and engine.rs
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 8192;

// Voice pool - Used in main.rs and voice_manager.rs
pub const DEFAULT_MAX_VOICES: usize = 64;
pub const MAX_VOICES_LIMIT: usize = 256;

// Output buses: bus 0 is the main output, 1..=MAX_EFFECT_BUSES are sends
pub const MAX_EFFECT_BUSES: usize = 4;

// Per-region resource caps. Regions exceeding these are clamped at load.
pub const MAX_FILTERS_PER_REGION: usize = 4;
pub const MAX_EQS_PER_REGION: usize = 4;
pub const MAX_LFOS_PER_REGION: usize = 8;
pub const MAX_FLEX_EGS_PER_REGION: usize = 8;
pub const MAX_CONNECTIONS_PER_REGION: usize = 48;

// Controller space: 128 MIDI CCs plus the extended slots below.
pub const CC_COUNT: usize = 144;
pub const MIDI_CC_COUNT: usize = 128;

// Extended CC slots (virtual controllers beyond MIDI's 128)
pub const EXT_CC_PITCH_BEND: u16 = 128;
pub const EXT_CC_CHANNEL_AFTERTOUCH: u16 = 129;
pub const EXT_CC_POLY_AFTERTOUCH: u16 = 130;
pub const EXT_CC_NOTE_ON_VELOCITY: u16 = 131;
pub const EXT_CC_NOTE_OFF_VELOCITY: u16 = 132;
pub const EXT_CC_NOTE_NUMBER: u16 = 133;
pub const EXT_CC_GATE: u16 = 134;
pub const EXT_CC_UNIPOLAR_RANDOM: u16 = 135;
pub const EXT_CC_BIPOLAR_RANDOM: u16 = 136;
pub const EXT_CC_ALTERNATE: u16 = 137;
pub const EXT_CC_KEYDELTA: u16 = 140;
pub const EXT_CC_ABS_KEYDELTA: u16 = 141;

// Well-known controllers
pub const CC_SUSTAIN_PEDAL: u16 = 64;
pub const SUSTAIN_PEDAL_THRESHOLD: f32 = 0.5;

// Curve table - Used in curve.rs and mod_matrix.rs
pub const CURVE_TABLE_SIZE: usize = 256;
pub const CURVE_POINTS: usize = 128;
pub const CURVE_LINEAR: u8 = 0;
pub const CURVE_CONCAVE: u8 = 1;
pub const CURVE_CONVEX: u8 = 2;

// Voice lifecycle - Used in voice.rs and voice_manager.rs
pub const FAST_OFF_TIME: f32 = 0.005; // seconds, steal/choke amplitude ramp
pub const SILENCE_THRESHOLD: f32 = 1e-4;
pub const EG_RELEASE_FLOOR: f32 = 1e-3; // -60 dB target over the release time

// Interpolation quality switchover. Quality values at or above this use
// 4-point Hermite, below it linear.
pub const HERMITE_QUALITY: u8 = 3;
pub const DEFAULT_SAMPLE_QUALITY: u8 = 2;
pub const DEFAULT_OSCILLATOR_QUALITY: u8 = 1;
pub const FREEWHEELING_SAMPLE_QUALITY: u8 = 10;
pub const FREEWHEELING_OSCILLATOR_QUALITY: u8 = 3;

// Default performance state
pub const DEFAULT_BPM: f32 = 120.0;
pub const DEFAULT_BEND_UP: f32 = 200.0; // cents
pub const DEFAULT_BEND_DOWN: f32 = -200.0; // cents
pub const DEFAULT_PITCH_KEYTRACK: f32 = 100.0; // cents per key

// Block render segmentation: within-block CC boundaries honored per block.
pub const MAX_BLOCK_SEGMENTS: usize = 16;

// Network and dispatch constants - Used in main.rs and dispatch/server.rs
pub const DEFAULT_OSC_PORT: u16 = 9127;
pub const OSC_RECV_BUFFER_SIZE: usize = 4096;
pub const CONTROL_CHANNEL_BOUND: usize = 1024;

// Thread priority - Used in main.rs and audio.rs
pub const DEFAULT_AUDIO_PRIORITY: u8 = 80;

// Sample library - Used in main.rs and memory/sample.rs
pub const DEFAULT_SAMPLE_DIR: &str = "./samples";
