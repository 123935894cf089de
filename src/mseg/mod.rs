//! Multi-segment envelope generator: storage model, realtime evaluator,
//! and the structural editing operations.
//!
//! The storage is a fixed-capacity arena of segments plus cached absolute
//! boundaries, so the audio-thread evaluator never allocates or walks more
//! than the active prefix. All editing goes through [`edit`], whose
//! operations end in a cache rebuild that restores every invariant the
//! evaluator relies on.

pub mod edit;
pub mod evaluator;

pub use evaluator::{EvaluatorState, LoopState};

use crate::MAX_SEGMENTS;

/// Durations at or below this are treated as zero-width steps.
pub const MINIMUM_DURATION: f32 = 0.0;

/// Curve family of one segment. All shapes interpolate from the segment's
/// start value to the next segment's start value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentShape {
    #[default]
    Linear,
    /// Quadratic bezier whose control point is pushed out so the drawn
    /// point lies on the curve.
    QuadBezier,
    /// Two mirrored exponential line copies meeting at the midpoint.
    SCurve,
    Hold,
    Sine,
    Sawtooth,
    Triangle,
    Square,
    Stairs,
    SmoothStairs,
    /// Wiener-bridge random walk pinned to both endpoints.
    Brownian,
    /// Line plus a Gaussian bump toward the control point.
    Bump,
}

/// One envelope segment. `nv1` is cache: the start value of the successor
/// (or of segment 0 when the endpoint is locked), pinned by
/// [`edit::rebuild_cache`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    pub duration: f32,
    pub v0: f32,
    pub nv1: f32,
    /// Control point value in [-1, 1]; meaning varies per shape.
    pub cpv: f32,
    /// Control point time as a 0..1 fraction of the segment duration.
    pub cpduration: f32,
    pub shape: SegmentShape,
    pub use_deform: bool,
    pub invert_deform: bool,
    /// Raise the filter-envelope retrigger flag when this segment begins.
    pub retrigger_feg: bool,
    /// Raise the amp-envelope retrigger flag when this segment begins.
    pub retrigger_aeg: bool,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            duration: 0.0,
            v0: 0.0,
            nv1: 0.0,
            cpv: 0.0,
            cpduration: 0.5,
            shape: SegmentShape::Linear,
            use_deform: true,
            invert_deform: false,
            retrigger_feg: false,
            retrigger_aeg: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EditMode {
    /// Durations are free; the envelope spans its total duration.
    Envelope,
    /// Total duration is pinned to exactly 1.0 (one LFO cycle).
    LfoCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LoopMode {
    OneShot,
    Loop,
    /// Loop while gated, then play out the post-loop tail on release.
    GatedLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EndpointMode {
    /// The final endpoint mirrors segment 0's start value.
    Locked,
    Free,
}

/// The storage model for one MSEG. Fields below the `cache` marker are
/// derived; edit the segments through [`edit`] so they stay consistent.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MsegStorage {
    pub segments: [Segment; MAX_SEGMENTS],
    pub n_active: usize,
    pub edit_mode: EditMode,
    pub loop_mode: LoopMode,
    pub endpoint_mode: EndpointMode,
    /// Loop start segment index, -1 for "from the beginning".
    pub loop_start: i32,
    /// Loop end segment index, -1 for "to the end".
    pub loop_end: i32,

    // cache, rebuilt by edit::rebuild_cache
    pub total_duration: f32,
    pub segment_start: [f32; MAX_SEGMENTS],
    pub segment_end: [f32; MAX_SEGMENTS],
    pub duration_to_loop_end: f32,
    pub duration_loop_start_to_loop_end: f32,
    /// Remembered envelope-mode duration while in LFO-cycle mode; -1 unset.
    pub envelope_mode_duration: f32,
    /// Remembered final endpoint while in LFO-cycle mode; -2 unset.
    pub envelope_mode_nv1: f32,
}

impl Default for MsegStorage {
    fn default() -> Self {
        let mut ms = Self::empty();
        edit::create_default_envelope(&mut ms);
        ms
    }
}

impl MsegStorage {
    /// A storage with no active segments; evaluation returns the deform
    /// argument untouched until segments are added.
    pub fn empty() -> Self {
        Self {
            segments: [Segment::default(); MAX_SEGMENTS],
            n_active: 0,
            edit_mode: EditMode::Envelope,
            loop_mode: LoopMode::Loop,
            endpoint_mode: EndpointMode::Free,
            loop_start: -1,
            loop_end: -1,
            total_duration: 0.0,
            segment_start: [0.0; MAX_SEGMENTS],
            segment_end: [0.0; MAX_SEGMENTS],
            duration_to_loop_end: 0.0,
            duration_loop_start_to_loop_end: 0.0,
            envelope_mode_duration: -1.0,
            envelope_mode_nv1: -2.0,
        }
    }
}
