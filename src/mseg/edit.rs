//! Structural editing of MSEG storage.
//!
//! None of this runs on the audio thread. Every public operation finishes
//! with [`rebuild_cache`], which re-derives the boundary cache, pins each
//! segment's end value to its successor's start, and clamps loop points,
//! so the evaluator can trust the storage unconditionally afterwards.

use tracing::{debug, warn};

use super::{
    EditMode, EndpointMode, LoopMode, MsegStorage, Segment, SegmentShape, MINIMUM_DURATION,
};
use crate::MAX_SEGMENTS;

/// Recompute all derived fields from the segment list.
pub fn rebuild_cache(ms: &mut MsegStorage) {
    force_to_constrained_normal_form(ms);

    if ms.loop_start > ms.n_active as i32 - 1 {
        ms.loop_start = -1;
    }
    if ms.loop_end > ms.n_active as i32 - 1 {
        ms.loop_end = -1;
    }

    let mut totald = 0.0f32;

    for i in 0..ms.n_active {
        ms.segment_start[i] = totald;
        totald += ms.segments[i].duration;
        ms.segment_end[i] = totald;

        let nextseg = i + 1;
        if nextseg >= ms.n_active {
            if ms.endpoint_mode == EndpointMode::Locked {
                ms.segments[i].nv1 = ms.segments[0].v0;
            }
        } else {
            ms.segments[i].nv1 = ms.segments[nextseg].v0;
        }
    }

    ms.total_duration = totald;

    if ms.edit_mode == EditMode::Envelope && ms.n_active > 0 {
        ms.envelope_mode_duration = totald;
        ms.envelope_mode_nv1 = ms.segments[ms.n_active - 1].nv1;
    }

    if ms.edit_mode == EditMode::LfoCycle && totald != 1.0 && ms.n_active > 0 {
        if (totald - 1.0).abs() > 1e-5 {
            debug!(total = totald, "LFO-cycle durations drifted off 1.0; repinning");
        }
        ms.total_duration = 1.0;
        ms.segment_end[ms.n_active - 1] = 1.0;
    }

    for i in 0..ms.n_active {
        constrain_control_point(ms, i);
    }

    ms.duration_to_loop_end = ms.total_duration;
    ms.duration_loop_start_to_loop_end = ms.total_duration;

    if ms.n_active > 0 {
        if ms.loop_end >= 0 {
            ms.duration_to_loop_end = ms.segment_end[ms.loop_end as usize];
        }

        let le = if ms.loop_end >= 0 { ms.loop_end as usize } else { ms.n_active - 1 };
        let ls = if ms.loop_start >= 0 { ms.loop_start as usize } else { 0 };
        ms.duration_loop_start_to_loop_end = ms.segment_end[le] - ms.segment_start[ls];
    }
}

/// Scrub non-finite values out of every segment slot.
pub fn force_to_constrained_normal_form(ms: &mut MsegStorage) {
    for (i, seg) in ms.segments.iter_mut().enumerate() {
        let mut scrubbed = false;
        if !seg.v0.is_finite() {
            seg.v0 = 0.0;
            scrubbed = true;
        }
        if !seg.cpv.is_finite() {
            seg.cpv = 0.0;
            scrubbed = true;
        }
        if !seg.duration.is_finite() {
            seg.duration = 0.1;
            scrubbed = true;
        }
        if !seg.cpduration.is_finite() {
            seg.cpduration = 0.6;
            scrubbed = true;
        }
        if scrubbed && i < ms.n_active {
            warn!(segment = i, "scrubbed non-finite values from segment");
        }
    }
}

/// Clamp segment `idx`'s control point into its legal box.
pub fn constrain_control_point(ms: &mut MsegStorage, idx: usize) {
    let seg = &mut ms.segments[idx];
    if !seg.cpduration.is_finite() {
        seg.cpduration = 0.5;
    }
    if !seg.cpv.is_finite() {
        seg.cpv = 0.0;
    }
    seg.cpduration = seg.cpduration.max(0.0).min(1.0);
    seg.cpv = seg.cpv.max(-1.0).min(1.0);
}

/// Move segment `idx`'s control point back to its neutral position.
pub fn reset_control_point(ms: &mut MsegStorage, idx: usize) {
    ms.segments[idx].cpduration = 0.5;
    ms.segments[idx].cpv = 0.0;
    if ms.segments[idx].shape == SegmentShape::QuadBezier {
        ms.segments[idx].cpv = 0.5 * (ms.segments[idx].v0 + ms.segments[idx].nv1);
    }
}

fn segment_at(ms: &MsegStorage, t: f32) -> Option<usize> {
    super::evaluator::time_to_segment(ms, t as f64, true).map(|(i, _)| i)
}

/// Change the shape of the segment containing time `t`.
pub fn set_shape_at(ms: &mut MsegStorage, t: f32, shape: SegmentShape) {
    if let Some(idx) = segment_at(ms, t) {
        ms.segments[idx].shape = shape;
        rebuild_cache(ms);
    }
}

fn insert_at_index(ms: &mut MsegStorage, insert_index: usize) {
    if ms.n_active >= MAX_SEGMENTS || insert_index > ms.n_active {
        return;
    }

    for i in ((insert_index + 1)..MAX_SEGMENTS).rev() {
        ms.segments[i] = ms.segments[i - 1];
    }

    ms.segments[insert_index] = Segment {
        duration: 0.25,
        cpduration: 0.125,
        ..Default::default()
    };

    let mut nxt = insert_index + 1;
    if nxt >= ms.n_active {
        nxt = 0;
    }
    ms.segments[insert_index].cpv = ms.segments[nxt].v0 * 0.5;

    if ms.loop_start >= insert_index as i32 {
        ms.loop_start += 1;
    }
    if ms.loop_end >= insert_index as i32 - 1 {
        ms.loop_end += 1;
    }

    ms.n_active += 1;
}

/// Insert a fresh segment after the one containing time `t`.
pub fn insert_after(ms: &mut MsegStorage, t: f32) {
    let idx = segment_at(ms, t).unwrap_or(0);
    insert_at_index(ms, idx + 1);
    rebuild_cache(ms);
}

/// Insert a fresh segment before the one containing time `t`.
pub fn insert_before(ms: &mut MsegStorage, t: f32) {
    let idx = segment_at(ms, t).unwrap_or(0);
    insert_at_index(ms, idx);
    rebuild_cache(ms);
}

/// Append a linear segment so the envelope reaches value `nv` at time `t`
/// past the current end. Envelope mode only.
pub fn extend_to(ms: &mut MsegStorage, t: f32, nv: f32) {
    if ms.edit_mode == EditMode::LfoCycle {
        return;
    }
    if t < ms.total_duration {
        return;
    }

    let nv = nv.max(-1.0).min(1.0);

    // Keep the loop end pinned to the old final segment.
    let fixup_loop_end = ms.loop_end < 0 || ms.loop_end == ms.n_active as i32 - 1;

    insert_at_index(ms, ms.n_active);

    if fixup_loop_end && ms.n_active > 1 {
        ms.loop_end = ms.n_active as i32 - 2;
    }

    let sn = ms.n_active - 1;
    ms.segments[sn].shape = SegmentShape::Linear;
    ms.segments[sn].v0 = if sn == 0 { 0.0 } else { ms.segments[sn - 1].nv1 };

    let dt = t - ms.total_duration;
    ms.segments[sn].duration = dt;
    ms.segments[sn].cpduration = 0.5;
    ms.segments[sn].cpv = 0.0;
    ms.segments[sn].nv1 = nv;

    if ms.endpoint_mode == EndpointMode::Locked {
        // The start point must follow the new endpoint; carry the control
        // point along at the same ratios.
        let s0 = ms.segments[0];
        let cpdratio = if s0.duration > 0.0 { s0.cpduration / s0.duration } else { 0.5 };
        let cpvratio = if s0.nv1 != s0.v0 {
            (s0.cpv - s0.v0) / (s0.nv1 - s0.v0)
        } else {
            0.5
        };

        ms.segments[0].v0 = nv;
        ms.segments[0].cpduration = cpdratio * ms.segments[0].duration;
        ms.segments[0].cpv = (ms.segments[0].nv1 - nv) * cpvratio + nv;
    }

    rebuild_cache(ms);
}

/// Split the segment containing `t` in two, with the new knot at value `nv`.
pub fn split_segment(ms: &mut MsegStorage, t: f32, nv: f32) {
    let Some(idx) = segment_at(ms, t) else { return };
    let nv = nv.max(-1.0).min(1.0);

    let mut t = t;
    while t > ms.total_duration {
        t -= ms.total_duration;
    }
    while t < 0.0 {
        t += ms.total_duration;
    }

    let pv1 = ms.segments[idx].nv1;
    let dt = (t - ms.segment_start[idx]) / ms.segments[idx].duration;
    let q = ms.segments[idx];

    insert_at_index(ms, idx + 1);

    ms.segments[idx].nv1 = nv;
    ms.segments[idx].duration *= dt;

    ms.segments[idx + 1] = Segment {
        v0: nv,
        shape: q.shape,
        nv1: pv1,
        duration: q.duration * (1.0 - dt),
        use_deform: q.use_deform,
        invert_deform: q.invert_deform,
        retrigger_feg: q.retrigger_feg,
        retrigger_aeg: q.retrigger_aeg,
        // Control point times are normalized, so both halves keep them.
        cpduration: q.cpduration,
        cpv: q.cpv,
    };

    rebuild_cache(ms);
}

/// Merge the knot nearest to `t` into its prior segment.
pub fn unsplit_segment(ms: &mut MsegStorage, t: f32, wrap_time: bool) {
    if ms.n_active <= 1 {
        return;
    }

    let mut idx = segment_at(ms, t).unwrap_or(0) as i32;

    if !wrap_time && t >= ms.total_duration {
        idx = ms.n_active as i32 - 1;
    }
    if idx >= ms.n_active as i32 - 1 {
        idx = ms.n_active as i32 - 1;
    }

    let uidx = idx as usize;
    let prior: i32;

    if (ms.segment_end[uidx] - t < t - ms.segment_start[uidx]) || t >= ms.total_duration {
        if uidx == ms.n_active - 1 {
            delete_segment(ms, uidx);
            return;
        }
        idx += 1;
        prior = idx - 1;
    } else {
        prior = idx - 1;
    }

    let prior = if prior < 0 { ms.n_active as i32 - 1 } else { prior } as usize;
    let idx = idx as usize;
    if prior == idx {
        return;
    }

    let p = ms.segments[prior];
    let cpdratio = p.cpduration / p.duration;

    ms.segments[prior].duration += ms.segments[idx].duration;
    ms.segments[prior].nv1 = ms.segments[idx].nv1;
    ms.segments[prior].cpduration = cpdratio * ms.segments[prior].duration;

    for i in idx..ms.n_active - 1 {
        ms.segments[i] = ms.segments[i + 1];
    }
    ms.n_active -= 1;

    if ms.loop_start > idx as i32 {
        ms.loop_start -= 1;
    }
    if ms.loop_end >= idx as i32 {
        ms.loop_end -= 1;
    }

    rebuild_cache(ms);
}

/// Delete the segment containing time `t`.
pub fn delete_segment_at(ms: &mut MsegStorage, t: f32) {
    if ms.n_active <= 1 {
        return;
    }
    if let Some(idx) = segment_at(ms, t) {
        delete_segment(ms, idx);
    }
}

/// Delete segment `idx`. In LFO-cycle mode the final segment stretches to
/// keep the total duration at 1.0.
pub fn delete_segment(ms: &mut MsegStorage, idx: usize) {
    if ms.n_active <= 1 || idx >= ms.n_active {
        return;
    }

    for i in idx..ms.n_active - 1 {
        ms.segments[i] = ms.segments[i + 1];
    }
    ms.n_active -= 1;

    if ms.edit_mode == EditMode::LfoCycle {
        let ei = ms.n_active - 1;
        let cd: f32 = (0..ei).map(|i| ms.segments[i].duration).sum();
        ms.segments[ei].duration = 1.0 - cd;
        ms.segments[ei].cpduration += 1.0 - cd;
    }

    if ms.loop_start > idx as i32 {
        ms.loop_start -= 1;
    }
    if ms.loop_end >= idx as i32 {
        ms.loop_end -= 1;
    }

    rebuild_cache(ms);
}

/// Multiply all durations by `factor`, optionally capped so the total
/// duration never exceeds `max_duration` (pass 0 for no cap).
pub fn scale_durations(ms: &mut MsegStorage, factor: f32, max_duration: f32) {
    let mut factor = factor;
    if max_duration > 0.0 && ms.total_duration * factor > max_duration {
        factor = max_duration / ms.total_duration;
    }

    for i in 0..ms.n_active {
        ms.segments[i].duration *= factor;
    }

    rebuild_cache(ms);
}

/// Multiply all knot values by `factor`.
pub fn scale_values(ms: &mut MsegStorage, factor: f32) {
    for i in 0..ms.n_active {
        ms.segments[i].v0 *= factor;
    }
    if ms.endpoint_mode == EndpointMode::Free && ms.n_active > 0 {
        ms.segments[ms.n_active - 1].nv1 *= factor;
    }
    rebuild_cache(ms);
}

/// Set every duration to `value`; in LFO-cycle mode the value is forced to
/// 1/n so the cycle invariant holds.
pub fn set_all_durations_to(ms: &mut MsegStorage, value: f32) {
    let value = if ms.edit_mode == EditMode::LfoCycle {
        1.0 / ms.n_active as f32
    } else {
        value
    };

    for i in 0..ms.n_active {
        ms.segments[i].duration = value;
    }

    rebuild_cache(ms);
}

/// Reverse the envelope in time.
pub fn mirror(ms: &mut MsegStorage) {
    let mut h = 0usize;
    let mut t = ms.n_active - 1;
    let v0 = ms.segments[0].v0;

    while h < t {
        ms.segments.swap(h, t);
        ms.segments[h].v0 = ms.segments[h].nv1;
        ms.segments[t].v0 = ms.segments[t].nv1;
        h += 1;
        t -= 1;
    }

    if h == t {
        ms.segments[h].v0 = ms.segments[h].nv1;
    }

    if ms.endpoint_mode == EndpointMode::Free {
        ms.segments[ms.n_active - 1].nv1 = v0;
    }

    // Flip curvature for the shapes whose control point is directional.
    for i in 0..ms.n_active {
        match ms.segments[i].shape {
            SegmentShape::Linear => ms.segments[i].cpv *= -1.0,
            SegmentShape::QuadBezier => {
                ms.segments[i].cpduration = 1.0 - ms.segments[i].cpduration
            }
            _ => {}
        }
    }

    rebuild_cache(ms);
}

/// Set the loop start segment, pushing the loop end out of the way if the
/// ordering would invert.
pub fn set_loop_start(ms: &mut MsegStorage, seg: i32) {
    ms.loop_start = seg;
    if ms.loop_end >= 0 && ms.loop_end < ms.loop_start {
        ms.loop_end = (seg - 1).max(0);
    }
    rebuild_cache(ms);
}

/// Set the loop end segment, pulling the loop start back if needed.
pub fn set_loop_end(ms: &mut MsegStorage, seg: i32) {
    ms.loop_end = seg;
    if ms.loop_start >= 0 && ms.loop_start > ms.loop_end {
        ms.loop_start = (seg + 1).min(ms.n_active as i32 - 1);
    }
    rebuild_cache(ms);
}

/// Grow or shrink segment `idx` by `dx`, shifting all later segments. In
/// LFO-cycle mode later segments absorb the change to keep the total at 1.
pub fn adjust_duration_shifting_subsequent(
    ms: &mut MsegStorage,
    idx: usize,
    dx: f32,
    max_duration: f32,
) {
    let mut dx = dx;

    if ms.edit_mode == EditMode::LfoCycle {
        if ms.segment_end[idx] + dx > 1.0 {
            dx = 1.0 - ms.segment_end[idx];
        }
        if ms.segment_end[idx] + dx < 0.0 {
            dx = ms.segment_end[idx];
        }
        if -dx > ms.segments[idx].duration {
            dx = -ms.segments[idx].duration;
        }
    }

    if max_duration > 0.0 && dx > 0.0 && ms.total_duration + dx > max_duration {
        dx = max_duration - ms.total_duration;
    }

    let rcv = if ms.segments[idx].duration > 0.0 {
        ms.segments[idx].cpduration / ms.segments[idx].duration
    } else {
        0.5
    };

    let prior = ms.segments[idx].duration;
    ms.segments[idx].duration = (ms.segments[idx].duration + dx).max(0.0);
    let change = ms.segments[idx].duration - prior;
    ms.segments[idx].cpduration = ms.segments[idx].duration * rcv;

    if ms.edit_mode == EditMode::LfoCycle {
        if change > 0.0 {
            // Squash later segments to make room.
            let mut to_consume = change;
            let mut i = ms.n_active as i32 - 1;
            while i > idx as i32 && to_consume > 0.0 {
                let ui = i as usize;
                if ms.segments[ui].duration >= to_consume {
                    ms.segments[ui].duration -= to_consume;
                    to_consume = 0.0;
                } else {
                    to_consume -= ms.segments[ui].duration;
                    ms.segments[ui].duration = 0.0;
                }
                i -= 1;
            }
        } else {
            ms.segments[ms.n_active - 1].duration -= change;
        }
    }

    rebuild_cache(ms);
}

/// Move the knot between segments `idx` and `idx + 1` by `dx` without
/// changing the total duration.
pub fn adjust_duration_constant_total(ms: &mut MsegStorage, idx: usize, dx: f32) {
    let next = idx + 1;
    let mut dx = dx;

    if (ms.segments[idx].duration + dx) <= MINIMUM_DURATION && dx < 0.0 {
        dx = 0.0;
    }
    if next < ms.n_active && (ms.segments[next].duration - dx) <= MINIMUM_DURATION && dx > 0.0 {
        dx = 0.0;
    }

    let mut csum = ms.segments[idx].duration;
    if next < ms.n_active {
        csum += ms.segments[next].duration;
    }

    let rcv = if ms.segments[idx].duration > 0.0 {
        ms.segments[idx].cpduration / ms.segments[idx].duration
    } else {
        0.5
    };
    ms.segments[idx].duration = (ms.segments[idx].duration + dx).max(0.0).min(csum);
    ms.segments[idx].cpduration = ms.segments[idx].duration * rcv;
    let pd = ms.segments[idx].duration;

    if next < ms.n_active {
        let rcv = if ms.segments[next].duration > 0.0 {
            ms.segments[next].cpduration / ms.segments[next].duration
        } else {
            0.5
        };
        ms.segments[next].duration = csum - pd;
        ms.segments[next].cpduration = ms.segments[next].duration * rcv;
    }

    rebuild_cache(ms);
}

/// Switch between envelope and LFO-cycle editing. Entering cycle mode
/// normalizes durations to a total of 1; leaving it restores the
/// remembered envelope duration and endpoint.
pub fn modify_edit_mode(ms: &mut MsegStorage, em: EditMode) {
    if em == ms.edit_mode {
        return;
    }

    let mut target_duration = 1.0;

    if ms.edit_mode == EditMode::LfoCycle && em == EditMode::Envelope {
        if ms.envelope_mode_duration > 0.0 {
            target_duration = ms.envelope_mode_duration;
        }
        if ms.envelope_mode_nv1 >= -1.0 {
            ms.segments[ms.n_active - 1].nv1 = ms.envelope_mode_nv1;
        }
    }

    let ratio = target_duration / ms.total_duration;
    for seg in ms.segments.iter_mut() {
        seg.duration *= ratio;
    }

    ms.edit_mode = em;
    rebuild_cache(ms);
}

fn blank_all_segments(ms: &mut MsegStorage) {
    ms.segments = [Segment::default(); MAX_SEGMENTS];
}

/// Reset to a single one-second decay from 1 to 0.
pub fn clear(ms: &mut MsegStorage) {
    ms.edit_mode = EditMode::Envelope;
    ms.loop_mode = LoopMode::Loop;
    ms.endpoint_mode = EndpointMode::Free;

    blank_all_segments(ms);
    ms.n_active = 1;
    ms.segments[0] = Segment {
        duration: 1.0,
        v0: 1.0,
        nv1: 0.0,
        ..Default::default()
    };

    ms.loop_start = 0;
    ms.loop_end = 0;

    rebuild_cache(ms);
}

/// Default per-voice envelope: rise, fall to a held plateau under a gated
/// loop, then decay to zero on release.
pub fn create_default_envelope(ms: &mut MsegStorage) {
    ms.edit_mode = EditMode::Envelope;
    ms.loop_mode = LoopMode::GatedLoop;
    ms.endpoint_mode = EndpointMode::Free;

    blank_all_segments(ms);
    ms.n_active = 4;

    ms.segments[0] = Segment {
        duration: 1.0,
        v0: 0.0,
        cpv: 0.8,
        cpduration: 0.5,
        ..Default::default()
    };
    ms.segments[1] = Segment {
        duration: 1.0,
        v0: 1.0,
        cpv: 0.8,
        cpduration: 0.5,
        ..Default::default()
    };
    ms.segments[2] = Segment {
        duration: 1.0,
        v0: 0.5,
        cpv: 0.5,
        cpduration: 0.8,
        ..Default::default()
    };
    ms.segments[3] = Segment {
        duration: 1.0,
        v0: 0.5,
        nv1: 0.0,
        cpv: 0.5,
        cpduration: 0.8,
        ..Default::default()
    };

    ms.loop_start = 2;
    ms.loop_end = 2;

    rebuild_cache(ms);
}

/// Default LFO cycle: a bipolar triangle-ish shape over one cycle.
pub fn create_default_cycle(ms: &mut MsegStorage) {
    ms.edit_mode = EditMode::LfoCycle;
    ms.loop_mode = LoopMode::Loop;

    blank_all_segments(ms);
    ms.n_active = 4;

    let values = [0.0f32, 1.0, 0.0, -1.0];
    for (i, v) in values.iter().enumerate() {
        ms.segments[i] = Segment {
            duration: 0.25,
            v0: *v,
            invert_deform: i % 2 == 1,
            ..Default::default()
        };
    }

    ms.loop_start = 0;
    ms.loop_end = 3;

    rebuild_cache(ms);
}

/// A rising staircase of hold segments, one knot per step.
pub fn create_step_sequence(ms: &mut MsegStorage, num_segments: usize) {
    ms.endpoint_mode = EndpointMode::Free;
    ms.loop_mode = LoopMode::Loop;

    let num_segments = num_segments.clamp(2, MAX_SEGMENTS);
    ms.n_active = num_segments;

    let step_len = if ms.edit_mode == EditMode::Envelope {
        1.0
    } else {
        1.0 / num_segments as f32
    };

    blank_all_segments(ms);
    for i in 0..num_segments {
        ms.segments[i] = Segment {
            duration: step_len,
            shape: SegmentShape::Hold,
            v0: i as f32 / (num_segments - 1) as f32,
            ..Default::default()
        };
    }
    ms.segments[num_segments - 1].nv1 = ms.segments[0].v0;

    ms.loop_start = 0;
    ms.loop_end = num_segments as i32 - 1;

    rebuild_cache(ms);
}

/// Repeated saw ramps from 1 to -1 with an adjustable curve.
pub fn create_saw(ms: &mut MsegStorage, num_segments: usize, curve: f32) {
    let is_env = ms.edit_mode == EditMode::Envelope;
    let num_segments = num_segments.clamp(1, MAX_SEGMENTS / 2);
    let step_len = if is_env { 1.0 } else { 1.0 / num_segments as f32 };

    if is_env {
        ms.endpoint_mode = EndpointMode::Free;
    }
    ms.loop_mode = LoopMode::Loop;
    ms.n_active = num_segments * 2 - is_env as usize;

    blank_all_segments(ms);
    for i in 0..num_segments {
        ms.segments[i * 2] = Segment {
            duration: step_len,
            cpv: curve,
            v0: 1.0,
            ..Default::default()
        };
        ms.segments[i * 2 + 1] = Segment {
            duration: 0.0,
            v0: -1.0,
            ..Default::default()
        };
    }
    ms.segments[ms.n_active - 1].nv1 = -1.0;

    ms.loop_start = 0;
    ms.loop_end = ms.n_active as i32 - 1;

    rebuild_cache(ms);
}

/// A piecewise-linear approximation of one sine cycle.
pub fn create_sine_approximation(ms: &mut MsegStorage, num_segments: usize) {
    let num_segments = num_segments.clamp(2, MAX_SEGMENTS);
    let dp = 2.0 * std::f32::consts::PI / num_segments as f32;
    let dt = 1.0 / num_segments as f32;

    ms.loop_mode = LoopMode::Loop;
    ms.endpoint_mode = EndpointMode::Locked;
    ms.n_active = num_segments;

    blank_all_segments(ms);
    for i in 0..num_segments {
        ms.segments[i] = Segment {
            duration: dt,
            v0: (i as f32 * dp).sin(),
            nv1: ((i + 1) as f32 * dp).sin(),
            ..Default::default()
        };
    }

    ms.loop_start = 0;
    ms.loop_end = num_segments as i32 - 1;

    rebuild_cache(ms);
}
