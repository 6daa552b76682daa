//! Block-render scenarios driven end to end through the engine.

use std::sync::Arc;
use strix::constants::MAX_EFFECT_BUSES;
use strix::curve::CurveTable;
use strix::dsp::biquad::FilterKind;
use strix::memory::SampleData;
use strix::mod_matrix::{Connection, ModKey};
use strix::region::{FilterDescriptor, LoopMode, Region, RegionSet, Trigger};
use strix::Synth;

const SR: f32 = 48000.0;

fn sine_sample(seconds: f32, freq: f32) -> Arc<SampleData> {
    let frames = (seconds * SR) as usize;
    let mono: Vec<f32> = (0..frames)
        .map(|i| (std::f32::consts::TAU * freq * i as f32 / SR).sin())
        .collect();
    Arc::new(SampleData::from_mono(&mono, SR as u32))
}

fn constant_sample(seconds: f32, level: f32) -> Arc<SampleData> {
    let frames = (seconds * SR) as usize;
    Arc::new(SampleData::from_mono(&vec![level; frames], SR as u32))
}

fn noise_sample(seconds: f32) -> Arc<SampleData> {
    let frames = (seconds * SR) as usize;
    let mut state = 0x12345u32;
    let mono: Vec<f32> = (0..frames)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            ((state >> 16) as f32 / 32768.0) - 1.0
        })
        .collect();
    Arc::new(SampleData::from_mono(&mono, SR as u32))
}

fn flat_region(id: u32, sample: Arc<SampleData>) -> Region {
    let mut region = Region::with_sample(id, "test", sample);
    region.set_key(60);
    region.amp_eg.attack = 0.0;
    region.amp_eg.release = 0.01;
    region.amp_veltrack = 0.0;
    region
}

fn synth_with(regions: Vec<Region>) -> Synth {
    let mut synth = Synth::new(SR, 8192, 32);
    synth.set_regions(Arc::new(RegionSet::new(regions, CurveTable::new())));
    synth
}

fn peak(frames: &[strix::Frame]) -> f32 {
    frames.iter().map(|f| f.left.abs().max(f.right.abs())).fold(0.0, f32::max)
}

#[test]
fn sine_region_renders_first_block_verbatim() {
    // Scenario 1: a 440 Hz sine at the keycenter comes through at unity.
    let mut synth = synth_with(vec![flat_region(0, sine_sample(1.0, 440.0))]);
    assert_eq!(synth.note_on(0, 60, 1.0), 1);
    synth.render_block(1024);

    assert_eq!(synth.num_active_voices(), 1);
    let bus = synth.bus(0);
    for i in (16..1024).step_by(101) {
        let expected = (std::f32::consts::TAU * 440.0 * i as f32 / SR).sin();
        assert!(
            (bus[i].left - expected).abs() < 2e-2,
            "sample {}: {} vs {}",
            i,
            bus[i].left,
            expected
        );
    }
}

#[test]
fn release_decays_and_frees_the_voice() {
    // Scenario 2: full level until the note-off, then an exponential tail.
    let mut synth = synth_with(vec![flat_region(0, constant_sample(1.0, 0.5))]);
    synth.note_on(0, 60, 1.0);
    synth.note_off(512, 60, 0.0);
    synth.render_block(1024);

    let bus = synth.bus(0);
    assert!((bus[100].left - 0.5).abs() < 1e-3, "pre-release level {}", bus[100].left);
    assert!((bus[511].left - 0.5).abs() < 1e-3);
    // Monotonically shrinking tail.
    assert!(bus[600].left < 0.5);
    assert!(bus[900].left < bus[600].left);

    // 10 ms release: gone by the end of the next block.
    synth.render_block(1024);
    assert_eq!(synth.num_active_voices(), 0);
}

#[test]
fn rt_decay_attenuates_release_samples_by_held_time() {
    // Scenario 3: one second of hold at rt_decay=6 costs 6 dB.
    let mut attack = flat_region(0, constant_sample(1.0, 0.5));
    attack.amplitude = 0.0; // keep the held note silent so we measure the release voice

    let mut release = flat_region(1, constant_sample(1.0, 0.5));
    release.trigger = Trigger::Release;
    release.rt_decay = 6.0;

    let mut synth = synth_with(vec![attack, release]);
    synth.note_on(0, 60, 1.0);
    for _ in 0..6 {
        synth.render_block(8000); // exactly one second total
    }
    synth.note_off(0, 60, 0.0);
    synth.render_block(1024);

    let expected = 0.5 * 10.0f32.powf(-6.0 / 20.0);
    let level = synth.bus(0)[100].left;
    assert!((level - expected).abs() < 0.01, "release level {} vs {}", level, expected);
}

#[test]
fn group_choke_silences_within_five_milliseconds() {
    // Scenario 4: off_by=1 chokes the playing group-1 voice.
    let mut victim = flat_region(0, constant_sample(1.0, 0.5));
    victim.group = 1;
    let mut choker = flat_region(1, constant_sample(1.0, 0.5));
    choker.set_key(62);
    choker.group = 2;
    choker.off_by = Some(1);
    choker.amplitude = 0.0;

    let mut synth = synth_with(vec![victim, choker]);
    synth.note_on(0, 60, 1.0);
    synth.render_block(512);
    assert!(peak(&synth.bus(0)[..512]) > 0.4);

    synth.note_on(0, 62, 1.0);
    synth.render_block(512);
    // 5 ms at 48 kHz is 240 samples; past that the victim is silent.
    let tail = &synth.bus(0)[300..512];
    assert!(peak(tail) < 1e-3, "tail peak {}", peak(tail));
}

#[test]
fn cutoff_cc_changes_mid_block_at_the_event_sample() {
    // Scenario 5: cc74 opens the filter by +1200 cents per half unit.
    let mut region = flat_region(0, noise_sample(1.0));
    region.filters = vec![FilterDescriptor {
        kind: FilterKind::Lpf2p,
        cutoff: 500.0,
        ..Default::default()
    }];
    let mut conn = Connection::new(ModKey::Controller(74), ModKey::FilCutoff(0), 2400.0);
    conn.smooth_ms = 0.0;
    region.connections = vec![conn];

    let mut synth = synth_with(vec![region]);
    synth.note_on(0, 60, 1.0);
    synth.cc(0, 74, 0.5);
    synth.cc(256, 74, 1.0);
    synth.render_block(512);

    let bus = synth.bus(0);
    let rms = |range: std::ops::Range<usize>| {
        let slice = &bus[range];
        (slice.iter().map(|f| f.left * f.left).sum::<f32>() / slice.len() as f32).sqrt()
    };
    // A wider filter passes more of the noise band.
    let closed = rms(64..256);
    let open = rms(320..512);
    assert!(open > closed * 1.2, "closed {} open {}", closed, open);
}

#[test]
fn selfmask_keeps_one_voice_per_region_and_note() {
    // Scenario 6: two regions on the same key, limit one voice per note.
    let make = |id: u32| {
        let mut region = flat_region(id, constant_sample(1.0, 0.5));
        region.note_polyphony = Some(1);
        region.note_selfmask = true;
        region
    };
    let mut synth = synth_with(vec![make(0), make(1)]);

    assert_eq!(synth.note_on(0, 60, 0.5), 2);
    synth.render_block(1024);
    assert_eq!(synth.note_on(0, 60, 1.0), 2);
    // Let the 5 ms steal ramps finish.
    synth.render_block(1024);
    synth.render_block(1024);

    let survivors: Vec<f32> = synth
        .manager
        .voices()
        .iter()
        .filter(|v| v.is_active())
        .map(|v| v.velocity)
        .collect();
    assert_eq!(survivors.len(), 2, "one survivor per region");
    assert!(survivors.iter().all(|&v| (v - 1.0).abs() < 1e-6));
}

#[test]
fn loop_continuous_repeats_the_first_iteration() {
    let frames = 100;
    let mono: Vec<f32> = (0..frames).map(|i| i as f32 / frames as f32).collect();
    let sample = Arc::new(SampleData::from_mono(&mono, SR as u32));

    let mut region = flat_region(0, sample);
    region.loop_spec.mode = LoopMode::LoopContinuous;
    region.loop_spec.start = 0;
    region.loop_spec.end = frames as u64;

    let mut synth = synth_with(vec![region]);
    synth.note_on(0, 60, 1.0);
    synth.render_block(200);

    let bus = synth.bus(0);
    for i in 0..100 {
        assert!(
            (bus[i].left - bus[i + 100].left).abs() < 1e-4,
            "iteration mismatch at {}: {} vs {}",
            i,
            bus[i].left,
            bus[i + 100].left
        );
    }
    assert_eq!(synth.num_active_voices(), 1);
}

#[test]
fn one_shot_runs_to_the_end_despite_note_off() {
    let mut region = flat_region(0, constant_sample(0.02, 0.5));
    region.loop_spec.mode = LoopMode::OneShot;

    let mut synth = synth_with(vec![region]);
    synth.note_on(0, 60, 1.0);
    synth.note_off(64, 60, 0.0);
    synth.render_block(512);
    // Still sounding after the note-off.
    assert!(synth.bus(0)[400].left > 0.4);
    assert_eq!(synth.num_active_voices(), 1);

    // Frees at the sample end (0.02 s = 960 frames).
    synth.render_block(1024);
    assert_eq!(synth.num_active_voices(), 0);
}

#[test]
fn effect_bus_receives_scaled_send() {
    let mut region = flat_region(0, constant_sample(1.0, 0.5));
    region.gain_to_effect[1] = 0.5;

    let mut synth = synth_with(vec![region]);
    assert!(MAX_EFFECT_BUSES >= 1);
    synth.note_on(0, 60, 1.0);
    synth.render_block(256);

    let main = synth.bus(0)[100].left;
    let send = synth.bus(1)[100].left;
    assert!(main > 0.4);
    assert!((send - main * 0.5).abs() < 1e-4);
}

#[test]
fn pitch_bend_shifts_playback_rate() {
    let mut region = flat_region(0, sine_sample(1.0, 440.0));
    region.bend_up = 1200.0;

    let mut synth = synth_with(vec![region]);
    synth.pitch_bend(0, 1.0);
    synth.note_on(0, 60, 1.0);
    synth.render_block(512);

    // A full-up bend of 1200 cents doubles the increment, so the voice
    // consumes two source frames per output sample.
    let voice = synth.manager.voices().iter().find(|v| v.is_active()).unwrap();
    assert!((voice.source_position() - 1024.0).abs() < 2.0, "pos {}", voice.source_position());
}

#[test]
fn empty_table_never_starts_voices() {
    let mut synth = synth_with(Vec::new());
    assert_eq!(synth.note_on(0, 60, 1.0), 0);
    synth.render_block(512);
    assert_eq!(synth.num_active_voices(), 0);
    assert_eq!(peak(&synth.bus(0)[..512]), 0.0);
}

#[test]
fn block_size_one_applies_events_before_render() {
    let mut synth = synth_with(vec![flat_region(0, constant_sample(1.0, 0.5))]);
    synth.note_on(0, 60, 1.0);
    synth.render_block(1);
    assert!((synth.bus(0)[0].left - 0.5).abs() < 1e-3);
}
