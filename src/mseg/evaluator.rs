//! Realtime MSEG evaluation.
//!
//! `value_at` is pure with respect to the storage and keeps all its playback
//! memory in an [`EvaluatorState`], so any number of voices (plus a display
//! preview) can evaluate one storage concurrently.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{EditMode, LoopMode, MsegStorage, SegmentShape, MINIMUM_DURATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Playing,
    Releasing,
}

/// Per-player evaluation memory: segment memo, release bookkeeping, the
/// Brownian scratch registers, and an owned RNG so concurrent players
/// never share random streams.
#[derive(Debug, Clone)]
pub struct EvaluatorState {
    pub loop_state: LoopState,
    pub released: bool,
    pub release_start_phase: f64,
    pub release_start_value: f32,
    pub last_output: f32,
    pub time_along_segment: f32,
    /// Retrigger flags raised when a flagged segment begins; the voice
    /// consumes these once per block.
    pub retrigger_feg: bool,
    pub retrigger_aeg: bool,
    last_eval: i32,
    has_triggered: bool,
    /// Brownian scratch: walker value, walker time, snapped output.
    scratch: [f32; 3],
    rng: SmallRng,
}

impl EvaluatorState {
    pub fn new(seed: u64) -> Self {
        Self {
            loop_state: LoopState::Playing,
            released: false,
            release_start_phase: 0.0,
            release_start_value: 0.0,
            last_output: 0.0,
            time_along_segment: 0.0,
            retrigger_feg: false,
            retrigger_aeg: false,
            last_eval: -1,
            has_triggered: false,
            scratch: [0.0; 3],
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Reseed the random stream without touching playback state.
    pub fn seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    /// Reset playback memory for a fresh trigger.
    pub fn start(&mut self) {
        self.loop_state = LoopState::Playing;
        self.released = false;
        self.release_start_phase = 0.0;
        self.release_start_value = 0.0;
        self.last_eval = -1;
        self.has_triggered = false;
        self.time_along_segment = 0.0;
        self.retrigger_feg = false;
        self.retrigger_aeg = false;
        self.scratch = [0.0; 3];
    }

    /// Mark the gate as dropped; the next evaluation transitions into the
    /// release region.
    pub fn release(&mut self) {
        self.released = true;
    }
}

/// Locate the segment containing time `t` and how far along it we are.
/// `ignore_loops` folds `t` modulo the total duration; otherwise the loop
/// region algebra applies.
pub fn time_to_segment(
    ms: &MsegStorage,
    t: f64,
    ignore_loops: bool,
) -> Option<(usize, f32)> {
    if ms.total_duration <= MINIMUM_DURATION {
        return None;
    }

    if ignore_loops {
        let mut t = t;
        if t >= ms.total_duration as f64 {
            let nup = t / ms.total_duration as f64;
            t -= (nup as i64) as f64 * ms.total_duration as f64;
            if t < 0.0 {
                t += ms.total_duration as f64;
            }
        }

        for i in 0..ms.n_active {
            if t >= ms.segment_start[i] as f64 && t < ms.segment_end[i] as f64 {
                return Some((i, (t - ms.segment_start[i] as f64) as f32));
            }
        }
        return None;
    }

    let ls = if ms.loop_start >= 0 { ms.loop_start as usize } else { 0 };

    if t <= ms.duration_to_loop_end as f64 {
        for i in 0..ms.n_active {
            if t >= ms.segment_start[i] as f64 && t <= ms.segment_end[i] as f64 {
                return Some((i, (t - ms.segment_start[i] as f64) as f32));
            }
        }
    } else if ms.loop_start > ms.loop_end && ms.loop_start >= 0 && ms.loop_end >= 0 {
        // Inverted loop points: park at the loop end point.
        let idx = ms.loop_end as usize;
        return Some((idx, ms.segments[idx].duration));
    } else {
        let mut nt = t - ms.duration_to_loop_end as f64;
        let span = ms.duration_loop_start_to_loop_end as f64;
        let nup = nt / span;
        nt -= (nup as i64) as f64 * span;
        if nt < 0.0 {
            nt += span;
        }
        nt += ms.segment_start[ls] as f64;

        for i in 0..ms.n_active {
            if nt >= ms.segment_start[i] as f64 && nt <= ms.segment_end[i] as f64 {
                return Some((i, (nt - ms.segment_start[i] as f64) as f32));
            }
        }
    }

    Some((0, 0.0))
}

/// Evaluate the MSEG at integer phase `ip` plus fractional phase `fup`,
/// with global deform `df` in [-1, 1]. `force_one_shot` overrides the loop
/// mode (used when the host owns looping).
pub fn value_at(
    ip: i32,
    fup: f32,
    df: f32,
    ms: &MsegStorage,
    es: &mut EvaluatorState,
    force_one_shot: bool,
) -> f32 {
    if ms.n_active == 0 {
        return df;
    }

    es.has_triggered = false;
    es.retrigger_feg = false;
    es.retrigger_aeg = false;

    let up = ip as f64 + fup as f64;

    // A finished one-shot stays finished.
    if up >= ms.total_duration as f64
        && (ms.loop_mode == LoopMode::OneShot || force_one_shot)
        && ms.edit_mode != EditMode::LfoCycle
    {
        return ms.segments[ms.n_active - 1].nv1;
    }

    let mut df = df.max(-1.0).min(1.0);

    if es.loop_state == LoopState::Playing && es.released {
        es.release_start_phase = up;
        es.release_start_value = es.last_output;
        es.loop_state = LoopState::Releasing;
    }

    let idx: usize;
    let mut time_along_segment: f32;

    if es.loop_state == LoopState::Playing || ms.loop_mode != LoopMode::GatedLoop {
        let one_shot = force_one_shot
            || ms.loop_mode == LoopMode::OneShot
            || ms.edit_mode == EditMode::LfoCycle;
        match time_to_segment(ms, up, one_shot) {
            Some((i, along)) if i < ms.n_active => {
                idx = i;
                time_along_segment = along;
            }
            _ => return 0.0,
        }
    } else {
        // Gated loop, released: remap time since release onto the region
        // after the loop end.
        if ms.loop_end == -1 || ms.loop_end as usize >= ms.n_active {
            return es.release_start_value;
        }

        if es.release_start_phase == up {
            idx = (ms.loop_end + 1) as usize;
            time_along_segment = 0.0;
        } else {
            let adjusted =
                up - es.release_start_phase + ms.segment_end[ms.loop_end as usize] as f64;

            let mut found = None;
            for ai in 0..ms.n_active {
                if ms.segment_start[ai] as f64 <= adjusted
                    && (ms.segment_end[ai] as f64) > adjusted
                {
                    found = Some(ai);
                    break;
                }
            }
            match found {
                Some(ai) => {
                    idx = ai;
                    time_along_segment = (adjusted - ms.segment_start[ai] as f64) as f32;
                }
                None => return ms.segments[ms.n_active - 1].nv1,
            }
        }
    }

    // Wrap detection when looping a single segment: time moving backwards
    // means we crossed the segment start again.
    if time_along_segment < es.time_along_segment {
        es.has_triggered = true;
    }

    let r = ms.segments[idx];
    let mut seg_init = false;

    if idx as i32 != es.last_eval || es.has_triggered {
        seg_init = true;
        es.last_eval = idx as i32;
        es.retrigger_feg = r.retrigger_feg;
        es.retrigger_aeg = r.retrigger_aeg;
        es.has_triggered = false;
    }

    if !r.use_deform {
        df = 0.0;
    }
    if r.invert_deform {
        df = -df;
    }

    if r.duration <= MINIMUM_DURATION {
        return (r.v0 + r.nv1) * 0.5;
    }

    let mut lv0 = r.v0;
    let lv1 = r.nv1;
    let mut lcpv = r.cpv;

    // In the gated release segment the start value moves to wherever we
    // were when the gate dropped; the control point keeps its ratio.
    if es.loop_state == LoopState::Releasing
        && ms.loop_mode == LoopMode::GatedLoop
        && idx as i32 == ms.loop_end + 1
    {
        lv0 = es.release_start_value;
        let cpratio = if r.nv1 != r.v0 {
            (r.cpv - r.v0) / (r.nv1 - r.v0)
        } else {
            0.5
        };
        lcpv = cpratio * (r.nv1 - lv0) + lv0;
    }

    let mut res;

    match r.shape {
        SegmentShape::Hold => {
            res = lv0;
        }
        SegmentShape::Linear | SegmentShape::SCurve => {
            if lv0 == lv1 {
                es.time_along_segment = time_along_segment;
                return lv0;
            }

            let mut frac = time_along_segment / r.duration;
            let mut scurve_mirrored = false;

            if r.shape == SegmentShape::SCurve {
                // Deforms below 1e-4 underflow (exp(adf) - 1 collapses to
                // the last float decimal) and are identical to zero anyway.
                if df.abs() > 1e-4 {
                    let adf = df * 10.0;
                    frac = ((adf * frac).exp() - 1.0) / (adf.exp() - 1.0);
                }

                if frac > 0.5 {
                    frac = 1.0 - (frac - 0.5) * 2.0;
                    scurve_mirrored = true;
                } else {
                    frac *= 2.0;
                }
            }

            /*
             * The control point bends the 0..1 line through an exponential
             * (e^ax - 1)/(e^a - 1) that passes through V = cpv/2 + 0.5 at
             * x = 1/2. With Q = e^(a/2) that gives V Q^2 - Q + (1-V) = 0,
             * so Q = (1 - sqrt(1 - 4V(1-V))) / 2V and a = 2 ln Q.
             */
            let mut v = 0.5 * r.cpv + 0.5;
            let mut amul = 1.0;
            if v < 0.5 {
                amul = -1.0;
                v = 1.0 - v;
            }

            let disc = 1.0 - 4.0 * v * (1.0 - v);
            let mut a = 0.0;
            if v.abs() > 1e-3 {
                let q = ((1.0 - disc.max(0.0).sqrt()) / (2.0 * v))
                    .max(0.00001)
                    .min(1_000_000.0);
                a = amul * 2.0 * q.ln();
            }

            let mut cpline = frac;
            if a.abs() > 1e-3 {
                cpline = ((a * frac).exp() - 1.0) / (a.exp() - 1.0);
            }

            if r.shape == SegmentShape::Linear {
                // Two-iteration fixed-point bend of the line.
                let dfa = -0.5 * df.max(-3.0).min(3.0);
                let mut x = 2.0 * cpline - 1.0;
                x = x - dfa * x * x + dfa;
                x = x - dfa * x * x + dfa;
                cpline = 0.5 * (x + 1.0);
            }

            if r.shape == SegmentShape::SCurve {
                if !scurve_mirrored {
                    cpline *= 0.5;
                } else {
                    cpline = 1.0 - 0.5 * cpline;
                }
            }

            res = cpline * (lv1 - lv0) + lv0;
        }
        SegmentShape::QuadBezier => {
            // Push the drawn control point out 2x from the chord midpoint
            // so the curve passes through it.
            let mut cpv = lcpv;
            let mut cpt = r.cpduration * r.duration;

            if (cpt - r.duration * 0.5).abs() < 1e-5 {
                cpt += 1e-4;
            }

            let tp = r.duration / 2.0;
            let vp = (lv1 - lv0) / 2.0 + lv0;
            let dt = cpt - tp;
            let dy = cpv - vp;
            cpv = vp + 2.0 * dy;
            cpt = tp + 2.0 * dt;

            // Solve (px2 - 2 px1) t^2 + 2 px1 t - ttarget = 0 for the
            // bezier parameter at this phase (px0 is zero).
            let ttarget = time_along_segment;
            let (px1, px2) = (cpt, r.duration);
            let (py0, py1, py2) = (lv0, cpv, lv1);

            let a = px2 - 2.0 * px1;
            let b = 2.0 * px1;
            let c = -ttarget;
            let disc = b * b - 4.0 * a * c;

            if a == 0.0 || disc < 0.0 {
                let frac = time_along_segment / r.duration;
                res = frac * lv1 + (1.0 - frac) * lv0;
            } else {
                let mut t = (-b + disc.sqrt()) / (2.0 * a);

                if df < 0.0 {
                    t = t.powf(1.0 + df * 0.7);
                }
                if df > 0.0 {
                    t = t.powf(1.0 + df * 3.0);
                }

                res = (1.0 - t) * (1.0 - t) * py0 + 2.0 * (1.0 - t) * t * py1 + t * t * py2;
            }
        }
        SegmentShape::Bump => {
            let t = time_along_segment / r.duration;

            let d = -df * 0.5 + 0.5;
            let deform = 20.0 + d * d * d * 500.0;

            let g = (-deform * (t - 0.5) * (t - 0.5)).exp();
            let l = (lv1 - lv0) * t + lv0;
            let q = r.cpv - (lv0 + lv1) * 0.5;

            res = l + q * g;
        }
        SegmentShape::Sine
        | SegmentShape::Sawtooth
        | SegmentShape::Triangle
        | SegmentShape::Square => {
            // Control point sets the oscillation count on an exponential
            // taper, 0..100 extra cycles.
            let pct = (r.cpv + 1.0) * 0.5;
            let a_s = 5.0f32;
            let scaledpct = ((a_s * pct).exp() - 1.0) / (a_s.exp() - 1.0);
            let steps = (scaledpct * 100.0) as i32;
            let frac = time_along_segment / r.duration;
            let mut kernel = 0.0f32;

            match r.shape {
                SegmentShape::Sine => {
                    // cos so the endpoints land on 1 and -1; odd multiples
                    // of pi give the half-extra cycle.
                    let mul = (1 + 2 * steps) as f32 * std::f32::consts::PI;
                    kernel = (mul * frac).cos();
                }
                SegmentShape::Sawtooth => {
                    let mul = (steps + 1) as f64;
                    let phase = mul * frac as f64;
                    let dphase = phase - (phase as i64) as f64;
                    kernel = (1.0 - 2.0 * dphase) as f32;
                }
                SegmentShape::Triangle => {
                    let mul = 0.5 + steps as f64;
                    let phase = mul * frac as f64;
                    let dphase = phase - (phase as i64) as f64;
                    kernel = if dphase < 0.5 {
                        (1.0 - 4.0 * dphase) as f32
                    } else {
                        (4.0 * (dphase - 0.5) - 1.0) as f32
                    };
                }
                SegmentShape::Square => {
                    let mul = (steps + 1) as f32;
                    let tphase = mul * frac;
                    let phase = tphase - (tphase as i32) as f32;
                    let pw = (df + 1.0) / 2.0;
                    kernel = if phase < pw { 1.0 } else { -1.0 };
                }
                _ => {}
            }

            if r.shape != SegmentShape::Square {
                let a = -0.5 * df.max(-3.0).min(3.0);
                kernel = kernel - a * kernel * kernel + a;
                kernel = kernel - a * kernel * kernel + a;
            }

            res = (lv0 - lv1) * ((kernel + 1.0) * 0.5) + lv1;
        }
        SegmentShape::Stairs => {
            let pct = (r.cpv + 1.0) * 0.5;
            let a_s = 5.0f32;
            let scaledpct = ((a_s * pct).exp() - 1.0) / (a_s.exp() - 1.0);
            let steps = (scaledpct * 100.0) as i32 + 2;
            let mut frac =
                ((steps as f32 * time_along_segment / r.duration) as i32) as f32
                    / (steps - 1) as f32;

            if df < 0.0 {
                frac = frac.powf(1.0 + df * 0.7);
            }
            if df > 0.0 {
                frac = frac.powf(1.0 + df * 3.0);
            }

            res = frac * lv1 + (1.0 - frac) * lv0;
        }
        SegmentShape::SmoothStairs => {
            let pct = (r.cpv + 1.0) * 0.5;
            let a_s = 5.0f32;
            let scaledpct = ((a_s * pct).exp() - 1.0) / (a_s.exp() - 1.0);
            let steps = ((scaledpct * 100.0) as i32 + 2) as f32;
            let frac = time_along_segment / r.duration;

            let c = if df < 0.0 { 1.0 + df * 0.7 } else { 1.0 + df * 3.0 };
            let z = frac.powf(c);

            let q = (z * steps).floor() / steps;
            let rr = (z - q) * steps;
            let b = rr * 2.0 - 1.0;

            res = (b * b * b + 1.0) / (2.0 * steps) + q;
            res = res * (lv1 - lv0) + lv0;
        }
        SegmentShape::Brownian => {
            const VAL: usize = 0;
            const LAST_TIME: usize = 1;
            const OUT: usize = 2;

            if seg_init {
                es.scratch[VAL] = lv0;
                es.scratch[OUT] = lv0;
                es.scratch[LAST_TIME] = 0.0;
            }

            let target_time = time_along_segment / r.duration;

            if target_time >= 1.0 {
                res = lv1;
            } else if target_time <= 0.0 {
                res = lv0;
            } else if target_time <= es.scratch[LAST_TIME] {
                res = es.scratch[OUT];
            } else {
                while es.scratch[LAST_TIME] < target_time && es.scratch[LAST_TIME] < 1.0 {
                    let ncd = r.cpduration;

                    // cpduration near 1 means spiky: larger dt. Slowest is
                    // five steps across the segment.
                    let sdt = 0.2 * (1.0 - ncd) * (1.0 - ncd);
                    let dt = sdt.max(0.0001).min(1.0 - es.scratch[LAST_TIME]);

                    if es.scratch[LAST_TIME] < 1.0 {
                        let lincoef =
                            (lv1 - es.scratch[VAL]) / (1.0 - es.scratch[LAST_TIME]);
                        let randcoef = 0.1 * lcpv;

                        // Wiener bridge, but bounce away from the rails if
                        // the random step would cross them.
                        let uniform: f32 = es.rng.random_range(-1.0..=1.0);
                        let linstp = es.scratch[VAL] + lincoef * dt;
                        let mut randup = randcoef;
                        let mut randdn = randcoef;

                        if linstp + randup > 1.0 {
                            randup = 1.0 - linstp;
                        } else if linstp - randdn < -1.0 {
                            randdn = linstp + 1.0;
                        }

                        let randadj = if uniform > 0.0 {
                            randup * uniform
                        } else {
                            randdn * uniform
                        };

                        es.scratch[VAL] +=
                            (lincoef * dt + randadj).max(-1.0).min(1.0);
                        es.scratch[LAST_TIME] += dt;
                    } else {
                        es.scratch[VAL] = lv1;
                    }
                }

                if lcpv < 0.0 {
                    // Negative control point quantizes to 1..24 levels.
                    let a = (-lcpv * 24.0).floor() + 1.0;
                    es.scratch[OUT] = (es.scratch[VAL] * a).floor() / a;
                } else {
                    es.scratch[OUT] = es.scratch[VAL];
                }

                es.scratch[OUT] = es.scratch[OUT].max(-1.0).min(1.0);
                res = es.scratch[OUT];
            }
        }
    }

    es.time_along_segment = time_along_segment;

    res = res.max(-1.0).min(1.0);
    if !res.is_finite() {
        res = 0.0;
    }
    es.last_output = res;

    res
}
