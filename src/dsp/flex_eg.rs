//! Flex envelopes: multi-segment generators described as point lists
//! instead of ADSR stages.
//!
//! Each point gives a target level reached over a segment time with a
//! shape exponent. An optional sustain index freezes playback on that
//! point's level until release; any flex EG can be nominated as the
//! voice's gating amplitude envelope (`ampeg`), replacing the classic EG.

pub type CcDeltas = Vec<(u16, f32)>;

/// One segment endpoint.
#[derive(Debug, Clone, Default)]
pub struct FlexPoint {
    /// Segment duration in seconds.
    pub time: f32,
    /// Target level at the end of the segment.
    pub level: f32,
    /// Shape exponent: 1 is linear, above 1 slow-start, below 1 fast-start.
    pub shape: f32,
    pub time_cc: CcDeltas,
    pub level_cc: CcDeltas,
}

/// Region-side flex envelope description.
#[derive(Debug, Clone, Default)]
pub struct FlexEgDescriptor {
    pub points: Vec<FlexPoint>,
    /// Index of the point to hold until release, if any.
    pub sustain_point: Option<usize>,
    /// When set, this envelope gates the voice amplitude.
    pub amp_gate: bool,
}

impl FlexEgDescriptor {
    /// Resolves CC-modulated times and levels for one voice.
    pub fn resolve(&self, cc: &dyn Fn(u16) -> f32) -> Vec<ResolvedPoint> {
        self.points
            .iter()
            .map(|p| {
                let mut time = p.time;
                for &(num, delta) in &p.time_cc {
                    time += delta * cc(num);
                }
                let mut level = p.level;
                for &(num, delta) in &p.level_cc {
                    level += delta * cc(num);
                }
                ResolvedPoint {
                    time: time.max(0.0),
                    level,
                    shape: if p.shape <= 0.0 { 1.0 } else { p.shape },
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedPoint {
    pub time: f32,
    pub level: f32,
    pub shape: f32,
}

/// Per-voice flex envelope state.
#[derive(Debug, Clone, Default)]
pub struct FlexEgState {
    points: Vec<ResolvedPoint>,
    sustain_point: Option<usize>,
    segment: usize,
    segment_time: f32,
    segment_start_level: f32,
    level: f32,
    released: bool,
    finished: bool,
}

impl FlexEgState {
    pub fn trigger(&mut self, points: Vec<ResolvedPoint>, sustain_point: Option<usize>) {
        self.points = points;
        self.sustain_point = sustain_point;
        self.segment = 0;
        self.segment_time = 0.0;
        self.segment_start_level = 0.0;
        self.level = 0.0;
        self.released = false;
        self.finished = self.points.is_empty();
    }

    /// Resolves a descriptor straight into this state's point storage,
    /// reusing its capacity.
    pub fn trigger_from(&mut self, desc: &FlexEgDescriptor, cc: &dyn Fn(u16) -> f32) {
        self.points.clear();
        for p in &desc.points {
            let mut time = p.time;
            for &(num, delta) in &p.time_cc {
                time += delta * cc(num);
            }
            let mut level = p.level;
            for &(num, delta) in &p.level_cc {
                level += delta * cc(num);
            }
            self.points.push(ResolvedPoint {
                time: time.max(0.0),
                level,
                shape: if p.shape <= 0.0 { 1.0 } else { p.shape },
            });
        }
        self.sustain_point = desc.sustain_point;
        self.segment = 0;
        self.segment_time = 0.0;
        self.segment_start_level = 0.0;
        self.level = 0.0;
        self.released = false;
        self.finished = self.points.is_empty();
    }

    #[inline]
    pub fn release(&mut self) {
        self.released = true;
    }

    /// Pulls a mid-release envelope back under its sustain hold. A
    /// finished envelope stays finished.
    #[inline]
    pub fn cancel_release(&mut self) {
        if !self.finished {
            self.released = false;
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Advances one sample.
    pub fn tick(&mut self, dt: f32) -> f32 {
        if self.finished {
            return self.level;
        }

        // Holding on the sustain point until release.
        if !self.released {
            if let Some(sustain) = self.sustain_point {
                if self.segment > sustain {
                    return self.level;
                }
            }
        }

        // A sustain point on the last segment has nowhere to go after
        // release.
        if self.segment >= self.points.len() {
            self.finished = true;
            return self.level;
        }

        let point = self.points[self.segment];
        self.segment_time += dt;

        if point.time <= 0.0 || self.segment_time >= point.time {
            self.level = point.level;
            self.advance_segment();
        } else {
            let t = (self.segment_time / point.time).clamp(0.0, 1.0);
            let shaped = t.powf(point.shape);
            self.level = self.segment_start_level + (point.level - self.segment_start_level) * shaped;
        }

        self.level
    }

    pub fn process_block(&mut self, out: &mut [f32], sample_rate: f32) {
        let dt = 1.0 / sample_rate;
        for sample in out.iter_mut() {
            *sample = self.tick(dt);
        }
    }

    fn advance_segment(&mut self) {
        // Reaching the sustain point parks the envelope there; releases
        // resume from wherever the hold left it.
        if !self.released {
            if let Some(sustain) = self.sustain_point {
                if self.segment == sustain {
                    self.segment += 1;
                    self.segment_time = 0.0;
                    self.segment_start_level = self.level;
                    return;
                }
            }
        }

        self.segment += 1;
        self.segment_time = 0.0;
        self.segment_start_level = self.level;
        if self.segment >= self.points.len() {
            self.finished = true;
        }
    }
}
