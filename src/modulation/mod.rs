//! Block-rate modulation sources: the common source trait, the per-block
//! evaluation context, and the host-controller smoother. The concrete
//! generators live in [`envelope`] and [`lfo`].

pub mod envelope;
pub mod lfo;

use crate::dsp::LagSmoother;
use crate::BLOCK_SIZE;

/// Everything a modulator needs to advance one control block.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub sample_rate: f32,
    pub sample_rate_inv: f32,
    /// Tempo relative to 120 BPM; 1.0 when not synced to a host.
    pub temposync_ratio: f32,
    pub temposync_ratio_inv: f32,
    /// Host song position in beats, for free-running phase locks.
    pub song_pos: f64,
}

impl BlockContext {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            sample_rate_inv: 1.0 / sample_rate,
            temposync_ratio: 1.0,
            temposync_ratio_inv: 1.0,
            song_pos: 0.0,
        }
    }

    pub fn with_tempo(mut self, temposync_ratio: f32) -> Self {
        self.temposync_ratio = temposync_ratio;
        self.temposync_ratio_inv = 1.0 / temposync_ratio;
        self
    }

    /// Per-block phase increment for a rate parameter expressed in
    /// log2 seconds: `(BLOCK_SIZE / sample_rate) * 2^(-x)`.
    #[inline]
    pub fn envelope_rate_linear(&self, x: f32) -> f32 {
        BLOCK_SIZE as f32 * self.sample_rate_inv * (-x).exp2()
    }
}

/// Coarse classification of a modulation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModSourceKind {
    Adsr,
    Lfo,
    Controller,
}

/// A block-rate modulation source. `process_block` advances one control
/// block; `output` is the scalar the router reads afterwards.
pub trait ModulationSource {
    fn process_block(&mut self, ctx: &BlockContext);
    fn output(&self) -> f32;
    fn kind(&self) -> ModSourceKind;

    /// Called when the owning voice is (re)gated.
    fn attack(&mut self) {}
    /// Called when the owning voice's gate drops.
    fn release(&mut self) {}

    /// True for sources allocated per voice (envelopes, LFOs); false for
    /// shared monophonic sources (controllers).
    fn per_voice(&self) -> bool {
        false
    }

    fn is_bipolar(&self) -> bool {
        false
    }
}

/// A host/MIDI controller value, lagged toward its target each block so
/// stepped controller input never zippers the routed destinations.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSource {
    smoother: LagSmoother,
    bipolar: bool,
}

impl ControllerSource {
    pub fn new(bipolar: bool) -> Self {
        Self {
            smoother: LagSmoother::new(0.25),
            bipolar,
        }
    }

    pub fn set_target(&mut self, value: f32) {
        let (lo, hi) = if self.bipolar { (-1.0, 1.0) } else { (0.0, 1.0) };
        self.smoother.set_target(value.max(lo).min(hi));
    }

    /// Snap to a value without smoothing, for initialization.
    pub fn init(&mut self, value: f32) {
        self.smoother.set_instant(value);
    }
}

impl ModulationSource for ControllerSource {
    fn process_block(&mut self, _ctx: &BlockContext) {
        self.smoother.process();
    }

    fn output(&self) -> f32 {
        self.smoother.value()
    }

    fn kind(&self) -> ModSourceKind {
        ModSourceKind::Controller
    }

    fn is_bipolar(&self) -> bool {
        self.bipolar
    }
}
