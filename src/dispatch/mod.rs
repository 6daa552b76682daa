//! The control dispatch bus.
//!
//! Endpoints are OSC-style `path` plus typetag signature pairs. Instead of
//! matching strings at call time, the table is compiled once: every
//! `(pattern, signature)` pair gets an FNV-1a hash, and incoming paths are
//! canonicalized (digit runs become the `&` wildcard, their values
//! extracted as indices) into a fixed stack buffer before a single hash
//! lookup. Collisions are resolved by verifying the stored pattern.
//!
//! Queries carry an empty signature and answer with typed values; sets
//! carry the field's typetag and answer nothing. Out-of-range indices
//! answer OSC Nil.

pub mod paths;
pub mod server;

use crate::engine::Synth;
use rosc::OscType;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Maximum wildcard indices a path can carry (`/region12/eq2/gain` has 2).
pub const MAX_PATH_INDICES: usize = 3;
const MAX_PATH_LEN: usize = 96;
const MAX_SIG_LEN: usize = 8;

/// A parsed call: wildcard indices plus the raw arguments.
pub struct PathCall<'a> {
    pub indices: [u32; MAX_PATH_INDICES],
    pub index_count: usize,
    pub args: &'a [OscType],
}

impl<'a> PathCall<'a> {
    pub fn index(&self, n: usize) -> usize {
        self.indices.get(n).copied().unwrap_or(0) as usize
    }

    pub fn float(&self, n: usize) -> Option<f32> {
        match self.args.get(n)? {
            OscType::Float(f) => Some(*f),
            OscType::Double(d) => Some(*d as f32),
            OscType::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    pub fn int(&self, n: usize) -> Option<i32> {
        match self.args.get(n)? {
            OscType::Int(i) => Some(*i),
            OscType::Long(l) => Some(*l as i32),
            _ => None,
        }
    }

    pub fn long(&self, n: usize) -> Option<i64> {
        match self.args.get(n)? {
            OscType::Int(i) => Some(*i as i64),
            OscType::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn string(&self, n: usize) -> Option<&str> {
        match self.args.get(n)? {
            OscType::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn bool_arg(&self, n: usize) -> Option<bool> {
        match self.args.get(n)? {
            OscType::Bool(b) => Some(*b),
            OscType::Int(i) => Some(*i != 0),
            _ => None,
        }
    }
}

/// Handler outcome.
pub enum Reply {
    /// A set endpoint: nothing to send back.
    None,
    /// Out-of-range index or unreadable value.
    Nil,
    Values(Vec<OscType>),
}

pub type Handler = fn(&mut Synth, &PathCall) -> Reply;

struct Entry {
    pattern: &'static str,
    signature: &'static str,
    handler: Handler,
}

#[derive(Default)]
pub struct PathTable {
    entries: HashMap<u64, Vec<Entry>>,
}

impl PathTable {
    /// Registers a handler for a `(pattern, signature)` pair.
    pub fn add(&mut self, pattern: &'static str, signature: &'static str, handler: Handler) {
        let hash = fnv1a(pattern.as_bytes()) ^ fnv1a(signature.as_bytes()).rotate_left(17);
        self.entries.entry(hash).or_default().push(Entry { pattern, signature, handler });
    }

    fn find(&self, pattern: &str, signature: &str) -> Option<&Entry> {
        let hash = fnv1a(pattern.as_bytes()) ^ fnv1a(signature.as_bytes()).rotate_left(17);
        self.entries
            .get(&hash)?
            .iter()
            .find(|e| e.pattern == pattern && e.signature == signature)
    }
}

/// FNV-1a, the table's pattern hash.
pub const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x100000001b3);
        i += 1;
    }
    hash
}

static TABLE: OnceLock<PathTable> = OnceLock::new();

fn table() -> &'static PathTable {
    TABLE.get_or_init(|| {
        let mut table = PathTable::default();
        paths::install(&mut table);
        table
    })
}

/// Canonicalizes a path into `buf`: digit runs collapse to `&` and land in
/// `indices`. Returns the canonical length, or None if the path overflows.
fn canonicalize(
    path: &str,
    buf: &mut [u8; MAX_PATH_LEN],
    indices: &mut [u32; MAX_PATH_INDICES],
) -> Option<(usize, usize)> {
    let bytes = path.as_bytes();
    let mut out = 0;
    let mut index_count = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_digit() {
            let mut value: u32 = 0;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                value = value.wrapping_mul(10).wrapping_add((bytes[i] - b'0') as u32);
                i += 1;
            }
            if index_count >= MAX_PATH_INDICES || out >= MAX_PATH_LEN {
                return None;
            }
            indices[index_count] = value;
            index_count += 1;
            buf[out] = b'&';
            out += 1;
        } else {
            if out >= MAX_PATH_LEN {
                return None;
            }
            buf[out] = b;
            out += 1;
            i += 1;
        }
    }

    Some((out, index_count))
}

fn signature_of(args: &[OscType], buf: &mut [u8; MAX_SIG_LEN]) -> Option<usize> {
    if args.len() > MAX_SIG_LEN {
        return None;
    }
    for (i, arg) in args.iter().enumerate() {
        buf[i] = match arg {
            OscType::Int(_) => b'i',
            OscType::Long(_) => b'h',
            OscType::Float(_) => b'f',
            OscType::Double(_) => b'd',
            OscType::String(_) => b's',
            OscType::Blob(_) => b'b',
            OscType::Bool(true) => b'T',
            OscType::Bool(false) => b'F',
            OscType::Nil => b'N',
            _ => return None,
        };
    }
    Some(args.len())
}

/// Routes one message. Returns None for unknown `(path, signature)` pairs.
pub fn dispatch(synth: &mut Synth, path: &str, args: &[OscType]) -> Option<Reply> {
    let mut path_buf = [0u8; MAX_PATH_LEN];
    let mut indices = [0u32; MAX_PATH_INDICES];
    let (path_len, index_count) = canonicalize(path, &mut path_buf, &mut indices)?;
    let pattern = std::str::from_utf8(&path_buf[..path_len]).ok()?;

    let mut sig_buf = [0u8; MAX_SIG_LEN];
    let sig_len = signature_of(args, &mut sig_buf)?;
    let signature = std::str::from_utf8(&sig_buf[..sig_len]).ok()?;

    let entry = table().find(pattern, signature)?;
    let call = PathCall { indices, index_count, args };
    Some((entry.handler)(synth, &call))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_extracts_indices() {
        let mut buf = [0u8; MAX_PATH_LEN];
        let mut indices = [0u32; MAX_PATH_INDICES];
        let (len, count) = canonicalize("/region12/delay", &mut buf, &mut indices).unwrap();
        assert_eq!(std::str::from_utf8(&buf[..len]).unwrap(), "/region&/delay");
        assert_eq!(count, 1);
        assert_eq!(indices[0], 12);
    }

    #[test]
    fn test_canonicalize_two_indices() {
        let mut buf = [0u8; MAX_PATH_LEN];
        let mut indices = [0u32; MAX_PATH_INDICES];
        let (len, count) = canonicalize("/region3/eq1/gain", &mut buf, &mut indices).unwrap();
        assert_eq!(std::str::from_utf8(&buf[..len]).unwrap(), "/region&/eq&/gain");
        assert_eq!(count, 2);
        assert_eq!(indices[0], 3);
        assert_eq!(indices[1], 1);
    }

    #[test]
    fn test_fnv_distinguishes_patterns() {
        assert_ne!(fnv1a(b"/region&/delay"), fnv1a(b"/region&/volume"));
        assert_ne!(fnv1a(b""), fnv1a(b"f"));
    }

    #[test]
    fn test_signature_of_typetags() {
        let mut buf = [0u8; MAX_SIG_LEN];
        let args = vec![
            OscType::Float(1.0),
            OscType::Int(2),
            OscType::String("x".into()),
            OscType::Bool(true),
        ];
        let len = signature_of(&args, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"fisT");
    }
}
