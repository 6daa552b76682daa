//! The dispatch surface: every endpoint of the control bus.
//!
//! Values cross the wire in the mapping language's units: percent for
//! amplitude/pan/width/position and send levels, dB for volumes and
//! resonance, cents for pitch and cutoff depths, normalized 0..1 for
//! controller values. Internally amplitude-like values live as 0..1 and
//! pan-like as -1..1; the handlers convert at the boundary.

use super::{PathCall, PathTable, Reply};
use crate::constants::{EXT_CC_CHANNEL_AFTERTOUCH, EXT_CC_PITCH_BEND, MAX_EFFECT_BUSES};
use crate::engine::Synth;
use crate::mod_matrix::ModKey;
use crate::region::Region;
use crate::types::TriggerKind;
use rosc::OscType;
use std::str::FromStr;

fn with_region<F>(synth: &Synth, call: &PathCall, read: F) -> Reply
where
    F: FnOnce(&Region) -> Reply,
{
    match synth.regions().regions.get(call.index(0)) {
        Some(region) => read(region),
        None => Reply::Nil,
    }
}

fn with_region_mut<F>(synth: &mut Synth, call: &PathCall, write: F) -> Reply
where
    F: FnOnce(&mut Region),
{
    let index = call.index(0);
    match synth.regions_mut().and_then(|set| set.regions.get_mut(index)) {
        Some(region) => {
            write(region);
            Reply::None
        }
        None => Reply::Nil,
    }
}

fn float_reply(value: f32) -> Reply {
    Reply::Values(vec![OscType::Float(value)])
}

fn int_reply(value: i64) -> Reply {
    Reply::Values(vec![OscType::Int(value as i32)])
}

fn string_reply(value: String) -> Reply {
    Reply::Values(vec![OscType::String(value)])
}

fn bool_reply(value: bool) -> Reply {
    Reply::Values(vec![OscType::Bool(value)])
}

fn bits_blob(bits: impl Iterator<Item = bool>) -> Vec<u8> {
    let mut blob = Vec::new();
    for (i, bit) in bits.enumerate() {
        if i % 8 == 0 {
            blob.push(0);
        }
        if bit {
            *blob.last_mut().unwrap() |= 1 << (i % 8);
        }
    }
    blob
}

/// Registers a get/set pair for an f32 region field with a unit scale
/// applied on the way out (`get * scale`) and inverted on the way in.
macro_rules! region_f32 {
    ($table:expr, $path:literal, $scale:literal, $field:ident) => {
        $table.add($path, "", |synth, call| {
            with_region(synth, call, |r| float_reply(r.$field * $scale))
        });
        $table.add($path, "f", |synth, call| {
            let Some(value) = call.float(0) else { return Reply::Nil };
            with_region_mut(synth, call, |r| r.$field = value / $scale)
        });
    };
}

macro_rules! region_eg_f32 {
    ($table:expr, $path:literal, $scale:literal, $field:ident) => {
        $table.add($path, "", |synth, call| {
            with_region(synth, call, |r| float_reply(r.amp_eg.$field * $scale))
        });
        $table.add($path, "f", |synth, call| {
            let Some(value) = call.float(0) else { return Reply::Nil };
            with_region_mut(synth, call, |r| r.amp_eg.$field = value / $scale)
        });
    };
}

/// Depth endpoints for CC connections: `(source cc, target)` resolved
/// through the load-time connection index, value scaled per target unit.
macro_rules! region_cc_depth {
    ($table:expr, $path:literal, $scale:literal, $target:expr) => {
        $table.add($path, "", |synth, call| {
            let region = call.index(0) as u32;
            let cc = call.index(1) as u16;
            let set = synth.regions();
            let Some(conn) = set
                .connection_index(region, ModKey::Controller(cc), $target)
                .and_then(|i| set.regions.get(region as usize).map(|r| r.connections[i]))
            else {
                return Reply::Nil;
            };
            float_reply(conn.depth * $scale)
        });
        $table.add($path, "f", |synth, call| {
            let Some(value) = call.float(0) else { return Reply::Nil };
            let region = call.index(0) as u32;
            let cc = call.index(1) as u16;
            let Some(set) = synth.regions_mut() else { return Reply::None };
            let Some(index) = set.connection_index(region, ModKey::Controller(cc), $target) else {
                return Reply::Nil;
            };
            set.regions[region as usize].connections[index].depth = value / $scale;
            Reply::None
        });
    };
}

/// Populates the compiled path table. Called once, at first dispatch.
pub fn install(table: &mut PathTable) {
    // -- inventory -------------------------------------------------------
    table.add("/num_regions", "", |synth, _| int_reply(synth.regions().num_regions() as i64));
    table.add("/num_groups", "", |synth, _| int_reply(synth.regions().num_groups() as i64));
    table.add("/num_samples", "", |synth, _| int_reply(synth.regions().num_samples() as i64));
    table.add("/num_active_voices", "", |synth, _| int_reply(synth.num_active_voices() as i64));
    table.add("/num_refused_voices", "", |synth, _| {
        int_reply(synth.manager.refused_count as i64)
    });
    table.add("/num_dropped_events", "", |synth, _| {
        int_reply(synth.dropped_events.load(std::sync::atomic::Ordering::Relaxed) as i64)
    });

    table.add("/key/slots", "", |synth, _| {
        Reply::Values(vec![OscType::Blob(synth.regions().key_slots().to_vec())])
    });
    table.add("/cc/slots", "", |synth, _| {
        Reply::Values(vec![OscType::Blob(synth.regions().cc_slots().to_vec())])
    });
    table.add("/cc/changed", "", |synth, _| {
        Reply::Values(vec![OscType::Blob(bits_blob(synth.midi.cc_changed().iter().copied()))])
    });
    table.add("/cc/changed~", "", |synth, _| {
        Reply::Values(vec![OscType::Blob(bits_blob(synth.midi.cc_changed_prev().iter().copied()))])
    });

    // -- runtime controllers ---------------------------------------------
    table.add("/cc&/value", "", |synth, call| {
        float_reply(synth.midi.cc_value(call.index(0) as u16))
    });
    table.add("/cc&/value", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        synth.cc(0, call.index(0) as u16, value);
        Reply::None
    });
    table.add("/cc&/default", "", |synth, call| {
        float_reply(synth.midi.cc_default(call.index(0) as u16))
    });
    table.add("/cc&/default", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        synth.midi.set_cc_default(call.index(0) as u16, value);
        Reply::None
    });
    table.add("/aftertouch", "", |synth, _| {
        float_reply(synth.midi.cc_value(EXT_CC_CHANNEL_AFTERTOUCH))
    });
    table.add("/aftertouch", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        synth.channel_aftertouch(0, value);
        Reply::None
    });
    table.add("/poly_aftertouch/&", "", |synth, call| {
        float_reply(synth.midi.poly_aftertouch(call.index(0) as u8))
    });
    table.add("/poly_aftertouch/&", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        synth.poly_aftertouch(0, call.index(0) as u8, value);
        Reply::None
    });
    table.add("/pitch_bend", "", |synth, _| float_reply(synth.midi.cc_value(EXT_CC_PITCH_BEND)));
    table.add("/pitch_bend", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        synth.pitch_bend(0, value);
        Reply::None
    });

    // -- global settings -------------------------------------------------
    table.add("/sample_quality", "", |synth, _| int_reply(synth.sample_quality as i64));
    table.add("/sample_quality", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        synth.sample_quality = value.clamp(0, 10) as u8;
        Reply::None
    });
    table.add("/oscillator_quality", "", |synth, _| int_reply(synth.oscillator_quality as i64));
    table.add("/oscillator_quality", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        synth.oscillator_quality = value.clamp(0, 10) as u8;
        Reply::None
    });
    table.add("/freewheeling_sample_quality", "", |synth, _| {
        int_reply(synth.freewheeling_sample_quality as i64)
    });
    table.add("/freewheeling_sample_quality", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        synth.freewheeling_sample_quality = value.clamp(0, 10) as u8;
        Reply::None
    });
    table.add("/freewheeling_oscillator_quality", "", |synth, _| {
        int_reply(synth.freewheeling_oscillator_quality as i64)
    });
    table.add("/freewheeling_oscillator_quality", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        synth.freewheeling_oscillator_quality = value.clamp(0, 10) as u8;
        Reply::None
    });
    table.add("/sustain_cancels_release", "", |synth, _| {
        bool_reply(synth.manager.sustain_cancels_release())
    });
    table.add("/sustain_cancels_release", "T", |synth, _| {
        synth.manager.set_sustain_cancels_release(true);
        Reply::None
    });
    table.add("/sustain_cancels_release", "F", |synth, _| {
        synth.manager.set_sustain_cancels_release(false);
        Reply::None
    });

    // -- voice introspection ---------------------------------------------
    table.add("/voice&/trigger_value", "", |synth, call| {
        match synth.manager.voices().get(call.index(0)) {
            Some(v) if v.is_active() => float_reply(v.trigger_event().value),
            _ => Reply::Nil,
        }
    });
    table.add("/voice&/trigger_number", "", |synth, call| {
        match synth.manager.voices().get(call.index(0)) {
            Some(v) if v.is_active() => int_reply(v.trigger_event().number as i64),
            _ => Reply::Nil,
        }
    });
    table.add("/voice&/trigger_type", "", |synth, call| {
        match synth.manager.voices().get(call.index(0)) {
            Some(v) if v.is_active() => {
                let kind: TriggerKind = v.trigger_event().kind;
                string_reply(kind.as_str().to_string())
            }
            _ => Reply::Nil,
        }
    });
    table.add("/voice&/remaining_delay", "", |synth, call| {
        match synth.manager.voices().get(call.index(0)) {
            Some(v) if v.is_active() => int_reply(v.remaining_delay() as i64),
            _ => Reply::Nil,
        }
    });
    table.add("/voice&/source_position", "", |synth, call| {
        match synth.manager.voices().get(call.index(0)) {
            Some(v) if v.is_active() => {
                Reply::Values(vec![OscType::Long(v.source_position() as i64)])
            }
            _ => Reply::Nil,
        }
    });

    // -- region scalar fields --------------------------------------------
    region_f32!(table, "/region&/volume", 1.0, volume);
    region_f32!(table, "/region&/amplitude", 100.0, amplitude);
    region_f32!(table, "/region&/pan", 100.0, pan);
    region_f32!(table, "/region&/position", 100.0, position);
    region_f32!(table, "/region&/width", 100.0, width);
    region_f32!(table, "/region&/delay", 1.0, delay);
    region_f32!(table, "/region&/tune", 1.0, tune);
    region_f32!(table, "/region&/bend_up", 1.0, bend_up);
    region_f32!(table, "/region&/bend_down", 1.0, bend_down);
    region_f32!(table, "/region&/bend_step", 1.0, bend_step);
    region_f32!(table, "/region&/rt_decay", 1.0, rt_decay);
    region_f32!(table, "/region&/amp_veltrack", 100.0, amp_veltrack);
    region_f32!(table, "/region&/amp_keytrack", 1.0, amp_keytrack);
    region_f32!(table, "/region&/amp_random", 1.0, amp_random);
    region_f32!(table, "/region&/pitch_keytrack", 1.0, pitch_keytrack);
    region_f32!(table, "/region&/pitch_veltrack", 1.0, pitch_veltrack);
    region_f32!(table, "/region&/pitch_random", 1.0, pitch_random);
    region_f32!(table, "/region&/off_time", 1.0, off_time);
    region_f32!(table, "/region&/oscillator_detune", 1.0, oscillator_detune);
    region_f32!(table, "/region&/oscillator_mod_depth", 100.0, oscillator_mod_depth);

    region_eg_f32!(table, "/region&/ampeg_delay", 1.0, delay);
    region_eg_f32!(table, "/region&/ampeg_start", 100.0, start);
    region_eg_f32!(table, "/region&/ampeg_attack", 1.0, attack);
    region_eg_f32!(table, "/region&/ampeg_hold", 1.0, hold);
    region_eg_f32!(table, "/region&/ampeg_decay", 1.0, decay);
    region_eg_f32!(table, "/region&/ampeg_sustain", 100.0, sustain);
    region_eg_f32!(table, "/region&/ampeg_release", 1.0, release);

    table.add("/region&/sample", "", |synth, call| {
        with_region(synth, call, |r| string_reply(r.sample_name.clone()))
    });
    table.add("/region&/enabled", "", |synth, call| {
        with_region(synth, call, |r| bool_reply(!r.disabled()))
    });
    table.add("/region&/oscillator", "", |synth, call| {
        with_region(synth, call, |r| bool_reply(r.oscillator))
    });
    table.add("/region&/direction", "", |synth, call| {
        with_region(synth, call, |r| {
            string_reply(if r.reverse { "reverse".into() } else { "forward".into() })
        })
    });
    table.add("/region&/trigger", "", |synth, call| {
        with_region(synth, call, |r| string_reply(r.trigger.to_string()))
    });
    table.add("/region&/offset", "", |synth, call| {
        with_region(synth, call, |r| Reply::Values(vec![OscType::Long(r.offset as i64)]))
    });
    table.add("/region&/offset", "h", |synth, call| {
        let Some(value) = call.long(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.offset = value.max(0) as u64)
    });
    table.add("/region&/pitch_keycenter", "", |synth, call| {
        with_region(synth, call, |r| int_reply(r.pitch_keycenter as i64))
    });
    table.add("/region&/pitch_keycenter", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.pitch_keycenter = value.clamp(0, 127) as u8)
    });
    table.add("/region&/transpose", "", |synth, call| {
        with_region(synth, call, |r| int_reply(r.transpose as i64))
    });
    table.add("/region&/transpose", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.transpose = value)
    });

    table.add("/region&/key_range", "", |synth, call| {
        with_region(synth, call, |r| {
            Reply::Values(vec![OscType::Int(r.lokey as i32), OscType::Int(r.hikey as i32)])
        })
    });
    table.add("/region&/key_range", "ii", |synth, call| {
        let (Some(lo), Some(hi)) = (call.int(0), call.int(1)) else { return Reply::Nil };
        with_region_mut(synth, call, |r| {
            r.lokey = lo.clamp(0, 127) as u8;
            r.hikey = hi.clamp(0, 127) as u8;
        })
    });
    table.add("/region&/vel_range", "", |synth, call| {
        with_region(synth, call, |r| {
            Reply::Values(vec![OscType::Float(r.lovel), OscType::Float(r.hivel)])
        })
    });
    table.add("/region&/vel_range", "ff", |synth, call| {
        let (Some(lo), Some(hi)) = (call.float(0), call.float(1)) else { return Reply::Nil };
        with_region_mut(synth, call, |r| {
            r.lovel = lo;
            r.hivel = hi;
        })
    });
    // `cc_range` takes start from args[0] and end from args[1].
    table.add("/region&/cc_range&", "", |synth, call| {
        let cc = call.index(1) as u16;
        with_region(synth, call, |r| {
            match r.cc_conditions.iter().find(|range| range.cc == cc) {
                Some(range) => {
                    Reply::Values(vec![OscType::Float(range.lo), OscType::Float(range.hi)])
                }
                None => Reply::Nil,
            }
        })
    });
    table.add("/region&/cc_range&", "ff", |synth, call| {
        let (Some(lo), Some(hi)) = (call.float(0), call.float(1)) else { return Reply::Nil };
        let cc = call.index(1) as u16;
        with_region_mut(synth, call, |r| {
            if let Some(range) = r.cc_conditions.iter_mut().find(|range| range.cc == cc) {
                range.lo = lo;
                range.hi = hi;
            }
        })
    });

    table.add("/region&/loop_mode", "", |synth, call| {
        with_region(synth, call, |r| string_reply(r.loop_spec.mode.to_string()))
    });
    table.add("/region&/loop_mode", "s", |synth, call| {
        let Some(name) = call.string(0) else { return Reply::Nil };
        let Ok(mode) = crate::region::LoopMode::from_str(name) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.loop_spec.mode = mode)
    });
    table.add("/region&/loop_range", "", |synth, call| {
        with_region(synth, call, |r| {
            Reply::Values(vec![
                OscType::Long(r.loop_spec.start as i64),
                OscType::Long(r.loop_spec.end as i64),
            ])
        })
    });
    table.add("/region&/loop_range", "hh", |synth, call| {
        let (Some(start), Some(end)) = (call.long(0), call.long(1)) else { return Reply::Nil };
        with_region_mut(synth, call, |r| {
            r.loop_spec.start = start.max(0) as u64;
            r.loop_spec.end = end.max(0) as u64;
        })
    });
    table.add("/region&/loop_crossfade", "", |synth, call| {
        with_region(synth, call, |r| float_reply(r.loop_spec.crossfade))
    });
    table.add("/region&/loop_crossfade", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.loop_spec.crossfade = value.max(0.0))
    });

    table.add("/region&/group", "", |synth, call| {
        with_region(synth, call, |r| Reply::Values(vec![OscType::Long(r.group)]))
    });
    table.add("/region&/group", "h", |synth, call| {
        let Some(value) = call.long(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.group = value)
    });
    table.add("/region&/off_by", "", |synth, call| {
        with_region(synth, call, |r| match r.off_by {
            Some(group) => Reply::Values(vec![OscType::Long(group)]),
            None => Reply::Nil,
        })
    });
    table.add("/region&/off_by", "h", |synth, call| {
        let Some(value) = call.long(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.off_by = Some(value))
    });
    table.add("/region&/off_mode", "", |synth, call| {
        with_region(synth, call, |r| string_reply(r.off_mode.to_string()))
    });
    table.add("/region&/off_mode", "s", |synth, call| {
        let Some(name) = call.string(0) else { return Reply::Nil };
        let Ok(mode) = crate::region::OffMode::from_str(name) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.off_mode = mode)
    });

    table.add("/region&/polyphony", "", |synth, call| {
        with_region(synth, call, |r| match r.polyphony {
            Some(limit) => int_reply(limit as i64),
            None => Reply::Nil,
        })
    });
    table.add("/region&/polyphony", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.polyphony = Some(value.max(0) as u32))
    });
    table.add("/region&/note_polyphony", "", |synth, call| {
        with_region(synth, call, |r| match r.note_polyphony {
            Some(limit) => int_reply(limit as i64),
            None => Reply::Nil,
        })
    });
    table.add("/region&/note_polyphony", "i", |synth, call| {
        let Some(value) = call.int(0) else { return Reply::Nil };
        with_region_mut(synth, call, |r| r.note_polyphony = Some(value.max(0) as u32))
    });
    table.add("/region&/note_selfmask", "", |synth, call| {
        with_region(synth, call, |r| bool_reply(r.note_selfmask))
    });
    table.add("/region&/note_selfmask", "T", |synth, call| {
        with_region_mut(synth, call, |r| r.note_selfmask = true)
    });
    table.add("/region&/note_selfmask", "F", |synth, call| {
        with_region_mut(synth, call, |r| r.note_selfmask = false)
    });
    table.add("/region&/sequence_length", "", |synth, call| {
        with_region(synth, call, |r| int_reply(r.sequence_length as i64))
    });
    table.add("/region&/sequence_position", "", |synth, call| {
        with_region(synth, call, |r| int_reply(r.sequence_position as i64))
    });

    // -- filter and EQ chains --------------------------------------------
    table.add("/region&/filter&/cutoff", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.filters.get(index) {
            Some(f) => float_reply(f.cutoff),
            None => Reply::Nil,
        })
    });
    table.add("/region&/filter&/cutoff", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let index = call.index(1);
        with_region_mut(synth, call, |r| {
            if let Some(f) = r.filters.get_mut(index) {
                f.cutoff = value.max(0.0);
            }
        })
    });
    table.add("/region&/filter&/resonance", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.filters.get(index) {
            Some(f) => float_reply(f.resonance),
            None => Reply::Nil,
        })
    });
    table.add("/region&/filter&/resonance", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let index = call.index(1);
        with_region_mut(synth, call, |r| {
            if let Some(f) = r.filters.get_mut(index) {
                f.resonance = value;
            }
        })
    });
    table.add("/region&/filter&/gain", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.filters.get(index) {
            Some(f) => float_reply(f.gain),
            None => Reply::Nil,
        })
    });
    table.add("/region&/filter&/gain", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let index = call.index(1);
        with_region_mut(synth, call, |r| {
            if let Some(f) = r.filters.get_mut(index) {
                f.gain = value;
            }
        })
    });
    table.add("/region&/filter&/type", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.filters.get(index) {
            Some(f) => string_reply(f.kind.to_string()),
            None => Reply::Nil,
        })
    });
    table.add("/region&/eq&/frequency", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.equalizers.get(index) {
            Some(eq) => float_reply(eq.frequency),
            None => Reply::Nil,
        })
    });
    table.add("/region&/eq&/frequency", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let index = call.index(1);
        with_region_mut(synth, call, |r| {
            if let Some(eq) = r.equalizers.get_mut(index) {
                eq.frequency = value.max(0.0);
            }
        })
    });
    table.add("/region&/eq&/gain", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.equalizers.get(index) {
            Some(eq) => float_reply(eq.gain),
            None => Reply::Nil,
        })
    });
    table.add("/region&/eq&/gain", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let index = call.index(1);
        with_region_mut(synth, call, |r| {
            if let Some(eq) = r.equalizers.get_mut(index) {
                eq.gain = value;
            }
        })
    });
    table.add("/region&/eq&/bandwidth", "", |synth, call| {
        let index = call.index(1);
        with_region(synth, call, |r| match r.equalizers.get(index) {
            Some(eq) => float_reply(eq.bandwidth),
            None => Reply::Nil,
        })
    });
    table.add("/region&/eq&/bandwidth", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let index = call.index(1);
        with_region_mut(synth, call, |r| {
            if let Some(eq) = r.equalizers.get_mut(index) {
                eq.bandwidth = value.max(0.01);
            }
        })
    });

    // -- effect sends ----------------------------------------------------
    table.add("/region&/effect&", "", |synth, call| {
        let bus = call.index(1);
        if bus == 0 || bus > MAX_EFFECT_BUSES {
            return Reply::Nil;
        }
        with_region(synth, call, |r| float_reply(r.gain_to_effect[bus] * 100.0))
    });
    table.add("/region&/effect&", "f", |synth, call| {
        let Some(value) = call.float(0) else { return Reply::Nil };
        let bus = call.index(1);
        if bus == 0 || bus > MAX_EFFECT_BUSES {
            return Reply::Nil;
        }
        with_region_mut(synth, call, |r| r.gain_to_effect[bus] = value / 100.0)
    });

    // -- CC modulation depths --------------------------------------------
    region_cc_depth!(table, "/region&/volume_cc&", 1.0, ModKey::Volume);
    region_cc_depth!(table, "/region&/amplitude_cc&", 100.0, ModKey::Amplitude);
    region_cc_depth!(table, "/region&/pan_cc&", 100.0, ModKey::Pan);
    region_cc_depth!(table, "/region&/position_cc&", 100.0, ModKey::Position);
    region_cc_depth!(table, "/region&/width_cc&", 100.0, ModKey::Width);
    region_cc_depth!(table, "/region&/pitch_cc&", 1.0, ModKey::Pitch);
    region_cc_depth!(table, "/region&/cutoff_cc&", 1.0, ModKey::FilCutoff(0));
    region_cc_depth!(table, "/region&/resonance_cc&", 1.0, ModKey::FilResonance(0));
}
