//! Sample buffers and the preload library.
//!
//! Buffers are immutable once loaded and shared as `Arc<SampleData>`:
//! voices clone the Arc at start and drop it on free, so a library or
//! region-table swap cannot pull data out from under a playing voice.
//! Loading happens on control threads only; the audio thread sees ready
//! buffers or nothing.

use crate::types::EngineError;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An immutable stereo sample, interleaved left/right.
#[derive(Debug, Clone)]
pub struct SampleData {
    data: Vec<f32>,
    frames: usize,
    sample_rate: u32,
}

impl SampleData {
    /// Wraps interleaved stereo data.
    pub fn from_stereo(data: Vec<f32>, sample_rate: u32) -> Self {
        let frames = data.len() / 2;
        Self { data, frames, sample_rate }
    }

    /// Duplicates a mono buffer into both channels.
    pub fn from_mono(mono: &[f32], sample_rate: u32) -> Self {
        let mut data = Vec::with_capacity(mono.len() * 2);
        for &s in mono {
            data.push(s);
            data.push(s);
        }
        Self { data, frames: mono.len(), sample_rate }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame accessor; out-of-range reads return silence.
    #[inline]
    pub fn frame(&self, index: usize) -> (f32, f32) {
        if index >= self.frames {
            return (0.0, 0.0);
        }
        (self.data[index * 2], self.data[index * 2 + 1])
    }

    /// Decodes a WAV file into a stereo buffer. Mono files are duplicated,
    /// extra channels beyond two are dropped.
    pub fn from_wav(path: &Path) -> Result<Self, EngineError> {
        let mut reader = hound::WavReader::open(path).map_err(|e| EngineError::SampleLoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let raw: Result<Vec<f32>, hound::Error> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect(),
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader.samples::<i32>().map(|s| s.map(|v| v as f32 * scale)).collect()
            }
        };
        let raw = raw.map_err(|e| EngineError::SampleLoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let frames = raw.len() / channels;
        let mut data = Vec::with_capacity(frames * 2);
        for frame in raw.chunks_exact(channels) {
            let left = frame[0];
            let right = if channels > 1 { frame[1] } else { left };
            data.push(left);
            data.push(right);
        }

        Ok(Self { data, frames, sample_rate: spec.sample_rate })
    }
}

/// Folder-indexed WAV library.
///
/// The index and the loaded map are concurrent so a control thread can
/// keep loading while another queries; nothing here is touched from the
/// audio thread.
pub struct SampleLibrary {
    root: PathBuf,
    loaded: DashMap<PathBuf, Arc<SampleData>>,
    by_name: DashMap<String, PathBuf>,
}

impl SampleLibrary {
    pub fn new(root: &str) -> Self {
        let library = Self {
            root: PathBuf::from(root),
            loaded: DashMap::new(),
            by_name: DashMap::new(),
        };
        if library.root.exists() {
            library.scan();
        }
        library
    }

    /// Rebuilds the name index from the root directory (recursive one
    /// level: root and its immediate subdirectories).
    pub fn scan(&self) {
        self.by_name.clear();
        self.scan_dir(&self.root.clone());
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    self.scan_dir(&entry.path());
                }
            }
        }
    }

    fn scan_dir(&self, dir: &Path) {
        if let Ok(files) = std::fs::read_dir(dir) {
            for file in files.flatten() {
                let path = file.path();
                if path.extension().map(|e| e == "wav").unwrap_or(false) {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        self.by_name.insert(stem.to_string(), path.clone());
                        // Also index relative to the root for nested names.
                        if let Ok(rel) = path.strip_prefix(&self.root) {
                            self.by_name.insert(rel.display().to_string(), path.clone());
                        }
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Loads (or returns the cached) sample by indexed name.
    pub fn get(&self, name: &str) -> Result<Arc<SampleData>, EngineError> {
        let path = self
            .by_name
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::SampleNotFound { name: name.to_string() })?;
        self.load(&path)
    }

    /// Loads (or returns the cached) sample by path.
    pub fn load(&self, path: &Path) -> Result<Arc<SampleData>, EngineError> {
        if let Some(cached) = self.loaded.get(path) {
            return Ok(Arc::clone(&cached));
        }
        let sample = Arc::new(SampleData::from_wav(path)?);
        self.loaded.insert(path.to_path_buf(), Arc::clone(&sample));
        Ok(sample)
    }

    /// Registers an in-memory sample under a name, mainly for hosts that
    /// hand over buffers directly.
    pub fn insert(&self, name: &str, sample: Arc<SampleData>) {
        let key = PathBuf::from(format!("<memory>/{}", name));
        self.by_name.insert(name.to_string(), key.clone());
        self.loaded.insert(key, sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_duplicates_channels() {
        let sample = SampleData::from_mono(&[0.1, 0.2, 0.3], 48000);
        assert_eq!(sample.frames(), 3);
        assert_eq!(sample.frame(1), (0.2, 0.2));
    }

    #[test]
    fn test_out_of_range_reads_are_silent() {
        let sample = SampleData::from_stereo(vec![0.5, -0.5], 48000);
        assert_eq!(sample.frame(0), (0.5, -0.5));
        assert_eq!(sample.frame(1), (0.0, 0.0));
    }

    #[test]
    fn test_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..100 {
            let v = ((i as f32 / 100.0) * std::f32::consts::TAU).sin();
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let sample = SampleData::from_wav(&path).unwrap();
        assert_eq!(sample.frames(), 100);
        assert_eq!(sample.sample_rate(), 48000);
        let (l, r) = sample.frame(25);
        assert_eq!(l, r);
        assert!((l - (0.25 * std::f32::consts::TAU).sin()).abs() < 1e-3);
    }

    #[test]
    fn test_library_indexes_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        let library = SampleLibrary::new(dir.path().to_str().unwrap());
        assert!(!library.is_empty());
        let a = library.get("hit").unwrap();
        let b = library.get("hit").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_missing_sample_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let library = SampleLibrary::new(dir.path().to_str().unwrap());
        assert!(library.get("nope").is_err());
    }
}
