//! strix engine binary.
//!
//! Stands the engine up against the default audio output, serves the OSC
//! control protocol, and optionally maps a folder of WAV files across the
//! keyboard so there is something to play before an instrument loader
//! takes over.

use clap::Parser;
use crossbeam_channel::bounded;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use strix::audio::{self, SelectionResult};
use strix::constants::{
    CONTROL_CHANNEL_BOUND, DEFAULT_AUDIO_PRIORITY, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_VOICES,
    DEFAULT_OSC_PORT, DEFAULT_SAMPLE_DIR, DEFAULT_SAMPLE_RATE, MAX_BLOCK_SIZE,
};
use strix::curve::CurveTable;
use strix::dispatch::server::DispatchServer;
use strix::engine::Synth;
use strix::memory::SampleLibrary;
use strix::region::{Region, RegionSet};

/// Command line arguments for the strix engine.
#[derive(Parser)]
#[command(name = "strix")]
#[command(about = "Realtime SFZ-style sample playback engine")]
struct Args {
    /// Audio sample rate in Hz
    #[arg(short, long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Audio buffer size per callback, in frames
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Maximum number of simultaneous voices
    #[arg(short, long, default_value_t = DEFAULT_MAX_VOICES)]
    max_voices: usize,

    /// Specific audio output device name
    #[arg(long)]
    output_device: Option<String>,

    /// OSC server port
    #[arg(long, default_value_t = DEFAULT_OSC_PORT)]
    osc_port: u16,

    /// OSC server host address
    #[arg(long, default_value = "127.0.0.1")]
    osc_host: String,

    /// Directory of WAV files to map across the keyboard at startup
    #[arg(long, default_value = DEFAULT_SAMPLE_DIR)]
    sample_dir: String,

    /// First key of the startup sample map
    #[arg(long, default_value_t = 48)]
    base_key: u8,

    /// Audio thread priority (0-99, 0 disables elevation)
    #[arg(long, default_value_t = DEFAULT_AUDIO_PRIORITY)]
    audio_priority: u8,

    /// List available audio output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn print_banner(args: &Args, device_name: &str, mapped: usize) {
    println!();
    println!("strix  --  sample rate {} Hz, buffer {}", args.sample_rate, args.block_size);
    println!("       output: {}", device_name);
    println!("       OSC: {}:{}", args.osc_host, args.osc_port);
    println!("       startup map: {} sample(s) from {}", mapped, args.sample_dir);
    println!();
}

/// Maps each library sample onto one key, chromatically from `base_key`.
fn autoload_regions(library: &SampleLibrary, sample_dir: &str, base_key: u8) -> RegionSet {
    let mut regions = Vec::new();
    let mut key = base_key;

    let dir = std::path::Path::new(sample_dir);
    let mut names: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "wav").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
    }
    names.sort();

    for name in names {
        let Ok(sample) = library.get(&name) else {
            eprintln!("warning: could not load sample '{}'", name);
            continue;
        };
        let mut region = Region::with_sample(regions.len() as u32, &name, sample);
        region.set_key(key);
        region.amp_eg.attack = 0.001;
        region.amp_eg.release = 0.05;
        regions.push(region);
        if key == 127 {
            break;
        }
        key += 1;
    }

    RegionSet::new(regions, CurveTable::new())
}

fn main() {
    let args = Args::parse();

    if args.list_devices {
        audio::list_output_devices(args.sample_rate);
        return;
    }

    let device_info = match audio::select_output_device(args.sample_rate, args.output_device.as_deref()) {
        SelectionResult::Success(info) => info,
        SelectionResult::Fallback(info, reason) => {
            println!("audio device: {}", reason);
            info
        }
        SelectionResult::Error(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    let block_size = args.block_size.min(MAX_BLOCK_SIZE);
    let mut synth = Synth::new(args.sample_rate as f32, MAX_BLOCK_SIZE, args.max_voices);

    let library = SampleLibrary::new(&args.sample_dir);
    let regions = autoload_regions(&library, &args.sample_dir, args.base_key.min(127));
    let mapped = regions.num_regions();
    synth.set_regions(Arc::new(regions));

    let (control_tx, control_rx) = bounded(CONTROL_CHANNEL_BOUND);
    let reply_queue = Arc::new(ArrayQueue::new(64));
    synth.set_control_channel(control_rx);
    synth.set_reply_queue(Arc::clone(&reply_queue));

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut server = match DispatchServer::new(
        &args.osc_host,
        args.osc_port,
        control_tx,
        reply_queue,
        Arc::clone(&shutdown),
        Arc::clone(&synth.dropped_events),
    ) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    print_banner(&args, &device_info.name, mapped);

    let server_handle = thread::Builder::new()
        .name("dispatch".to_string())
        .spawn(move || server.run())
        .expect("failed to spawn dispatch thread");

    if let Err(err) = audio::run_output(
        synth,
        device_info.device,
        args.sample_rate,
        block_size,
        args.audio_priority,
        Arc::clone(&shutdown),
    ) {
        eprintln!("{}", err);
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    let _ = server_handle.join();
}
