//! Audio output: device selection and the realtime render thread.
//!
//! The render thread owns the [`Synth`] outright. Control threads reach
//! it only through the bounded channels wired up in `main.rs`, so the
//! cpal callback runs without locks: drain, render, interleave.

use crate::engine::Synth;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};

pub struct DeviceInfo {
    pub device: Device,
    pub name: String,
    pub is_default: bool,
}

pub enum SelectionResult {
    Success(DeviceInfo),
    Fallback(DeviceInfo, String),
    Error(String),
}

/// Picks an output device: the preferred name, the system default, then
/// the first device that validates for stereo output at our rate.
pub fn select_output_device(sample_rate: u32, preferred: Option<&str>) -> SelectionResult {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let validate = |device: &Device| -> bool {
        device
            .supported_output_configs()
            .map(|mut configs| {
                configs.any(|cfg| {
                    cfg.channels() == 2
                        && cfg.min_sample_rate().0 <= sample_rate
                        && cfg.max_sample_rate().0 >= sample_rate
                })
            })
            .unwrap_or(false)
    };

    if let Some(name) = preferred {
        if let Ok(devices) = host.output_devices() {
            for device in devices {
                if device.name().map(|n| n == name).unwrap_or(false) && validate(&device) {
                    return SelectionResult::Success(DeviceInfo {
                        is_default: name == default_name,
                        name: name.to_string(),
                        device,
                    });
                }
            }
        }
    }

    if let Some(device) = host.default_output_device() {
        if validate(&device) {
            let name = device.name().unwrap_or_else(|_| "default".to_string());
            let info = DeviceInfo { device, name: name.clone(), is_default: true };
            return match preferred {
                Some(_) => SelectionResult::Fallback(info, format!("falling back to {}", name)),
                None => SelectionResult::Success(info),
            };
        }
    }

    if let Ok(devices) = host.output_devices() {
        for device in devices {
            if validate(&device) {
                let name = device.name().unwrap_or_else(|_| "unknown".to_string());
                return SelectionResult::Fallback(
                    DeviceInfo { device, name: name.clone(), is_default: false },
                    format!("falling back to {}", name),
                );
            }
        }
    }

    SelectionResult::Error("no suitable stereo output device found".to_string())
}

/// Lists output devices with a validation mark for our configuration.
pub fn list_output_devices(sample_rate: u32) {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    println!("Available audio output devices:");
    match host.output_devices() {
        Ok(devices) => {
            for device in devices {
                let Ok(name) = device.name() else { continue };
                let supported = device
                    .supported_output_configs()
                    .map(|mut cfgs| {
                        cfgs.any(|c| {
                            c.channels() == 2
                                && c.min_sample_rate().0 <= sample_rate
                                && c.max_sample_rate().0 >= sample_rate
                        })
                    })
                    .unwrap_or(false);
                let mark = if supported { "+" } else { "-" };
                let default_mark = if name == default_name { " [default]" } else { "" };
                println!("  {} {}{}", mark, name, default_mark);
            }
        }
        Err(e) => eprintln!("error listing devices: {}", e),
    }
}

/// Maps a 0-99 user priority onto the platform's realtime range.
fn platform_priority(user_priority: u8) -> u8 {
    let user_priority = user_priority.min(99);

    #[cfg(target_os = "macos")]
    {
        15 + ((user_priority as u16 * 32) / 99) as u8
    }

    #[cfg(target_os = "linux")]
    {
        user_priority.max(1)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        user_priority.min(31)
    }
}

/// Runs the output stream until `shutdown` goes up. Blocks the calling
/// thread; the synth moves into the cpal callback.
pub fn run_output(
    mut synth: Synth,
    device: Device,
    sample_rate: u32,
    buffer_size: usize,
    audio_priority: u8,
    shutdown: Arc<AtomicBool>,
) -> Result<(), String> {
    if audio_priority > 0 {
        let priority = platform_priority(audio_priority);
        match ThreadPriorityValue::try_from(priority) {
            Ok(value) => {
                if set_current_thread_priority(ThreadPriority::Crossplatform(value)).is_err() {
                    eprintln!("warning: could not raise audio thread priority");
                }
            }
            Err(e) => eprintln!("warning: invalid thread priority {}: {}", priority, e),
        }
    }

    let config = StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(buffer_size as u32),
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                data.fill(0.0);
                let frames = data.len() / 2;
                synth.render_block(frames);
                synth.write_interleaved(data);
            },
            |err| eprintln!("audio stream error: {}", err),
            None,
        )
        .map_err(|e| format!("failed to build output stream: {}", e))?;

    stream.play().map_err(|e| format!("failed to start output stream: {}", e))?;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);
    Ok(())
}
