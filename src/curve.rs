//! Controller curve tables.
//!
//! A curve is a 128-point table applied to a normalized controller value
//! before it enters the modulation matrix. The engine holds a table of 256
//! curve slots; slots 0..=2 are the built-in linear, concave and convex
//! shapes and the rest default to linear until an instrument defines them.

use crate::constants::{CURVE_CONCAVE, CURVE_CONVEX, CURVE_LINEAR, CURVE_POINTS, CURVE_TABLE_SIZE};

#[derive(Debug, Clone)]
pub struct Curve {
    points: [f32; CURVE_POINTS],
}

impl Curve {
    pub fn linear() -> Self {
        let mut points = [0.0; CURVE_POINTS];
        for (i, p) in points.iter_mut().enumerate() {
            *p = i as f32 / (CURVE_POINTS - 1) as f32;
        }
        Self { points }
    }

    /// Slow start, fast finish.
    pub fn concave() -> Self {
        let mut points = [0.0; CURVE_POINTS];
        for (i, p) in points.iter_mut().enumerate() {
            let x = i as f32 / (CURVE_POINTS - 1) as f32;
            *p = x * x;
        }
        Self { points }
    }

    /// Fast start, slow finish. Mirror of the concave shape.
    pub fn convex() -> Self {
        let mut points = [0.0; CURVE_POINTS];
        for (i, p) in points.iter_mut().enumerate() {
            let x = i as f32 / (CURVE_POINTS - 1) as f32;
            let inv = 1.0 - x;
            *p = 1.0 - inv * inv;
        }
        Self { points }
    }

    /// Builds a curve from sparse `(index, value)` anchors, linearly
    /// interpolating between them the way `curve_index`/`vNNN` opcode sets
    /// describe user curves.
    pub fn from_anchors(anchors: &[(usize, f32)]) -> Self {
        let mut curve = Self::linear();
        if anchors.is_empty() {
            return curve;
        }

        let mut sorted: Vec<(usize, f32)> = anchors
            .iter()
            .map(|&(i, v)| (i.min(CURVE_POINTS - 1), v))
            .collect();
        sorted.sort_by_key(|&(i, _)| i);
        sorted.dedup_by_key(|&mut (i, _)| i);

        // Flat extension before the first and after the last anchor.
        let (first_idx, first_val) = sorted[0];
        for p in curve.points.iter_mut().take(first_idx) {
            *p = first_val;
        }
        let (last_idx, last_val) = *sorted.last().unwrap();
        for p in curve.points.iter_mut().skip(last_idx) {
            *p = last_val;
        }

        for pair in sorted.windows(2) {
            let (i0, v0) = pair[0];
            let (i1, v1) = pair[1];
            let span = (i1 - i0).max(1) as f32;
            for i in i0..=i1 {
                let t = (i - i0) as f32 / span;
                curve.points[i] = v0 + (v1 - v0) * t;
            }
        }
        curve
    }

    /// Evaluates the curve for `x` in [0, 1] with linear interpolation
    /// between table points.
    #[inline]
    pub fn value_at(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        let pos = x * (CURVE_POINTS - 1) as f32;
        let idx = pos as usize;
        if idx >= CURVE_POINTS - 1 {
            return self.points[CURVE_POINTS - 1];
        }
        let frac = pos - idx as f32;
        self.points[idx] + (self.points[idx + 1] - self.points[idx]) * frac
    }
}

/// The engine-wide table of curve slots.
#[derive(Debug, Clone)]
pub struct CurveTable {
    curves: Vec<Curve>,
}

impl Default for CurveTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CurveTable {
    pub fn new() -> Self {
        let mut curves = vec![Curve::linear(); CURVE_TABLE_SIZE];
        curves[CURVE_CONCAVE as usize] = Curve::concave();
        curves[CURVE_CONVEX as usize] = Curve::convex();
        Self { curves }
    }

    /// Installs an instrument-defined curve. Out-of-range indices are
    /// ignored rather than grown; the table size is part of the contract.
    pub fn set(&mut self, index: usize, curve: Curve) {
        if index < self.curves.len() {
            self.curves[index] = curve;
        }
    }

    #[inline]
    pub fn get(&self, index: u8) -> &Curve {
        // Index is u8-sized on connections so it cannot exceed the table.
        &self.curves[index as usize]
    }

    /// Applies curve `index` to `x`, identity for the linear slot.
    #[inline]
    pub fn apply(&self, index: u8, x: f32) -> f32 {
        if index == CURVE_LINEAR {
            return x.clamp(0.0, 1.0);
        }
        self.get(index).value_at(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_curve_is_identity() {
        let table = CurveTable::new();
        for i in 0..=10 {
            let x = i as f32 / 10.0;
            assert!((table.apply(CURVE_LINEAR, x) - x).abs() < 1e-6);
        }
    }

    #[test]
    fn test_concave_below_convex_above() {
        let table = CurveTable::new();
        let x = 0.5;
        assert!(table.apply(CURVE_CONCAVE, x) < x);
        assert!(table.apply(CURVE_CONVEX, x) > x);
    }

    #[test]
    fn test_anchored_curve_interpolates() {
        let curve = Curve::from_anchors(&[(0, 0.0), (127, 0.5)]);
        assert!((curve.value_at(1.0) - 0.5).abs() < 1e-6);
        assert!((curve.value_at(0.5) - 0.25).abs() < 1e-2);
    }

    #[test]
    fn test_endpoints_clamped() {
        let table = CurveTable::new();
        assert_eq!(table.apply(CURVE_LINEAR, -1.0), 0.0);
        assert_eq!(table.apply(CURVE_LINEAR, 2.0), 1.0);
    }
}
