//! Pitch glide from the previous key toward the current one.

use crate::modulation::BlockContext;

/// Shape of the glide trajectory between the source and target keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GlideCurve {
    /// Fast at first, easing into the target.
    Log,
    #[default]
    Linear,
    /// Slow at first, accelerating into the target.
    Exp,
}

#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlideOptions {
    pub curve: GlideCurve,
    /// Scale the rate so every glide covers one semitone in the same time,
    /// regardless of the interval width.
    pub constant_rate: bool,
    /// Quantize the gliding pitch to whole semitones.
    pub gliss: bool,
    /// With gliss, retrigger the envelopes each time a new semitone is
    /// reached.
    pub retrigger: bool,
    pub temposync: bool,
}

// Curve pair: log is log2(1 + 10x) / log2(11), exp is its reflection, so
// both pass exactly through (0, 0) and (1, 1).
#[inline]
fn glide_log(x: f32) -> f32 {
    (1.0 + 10.0 * x).log2() / 11.0_f32.log2()
}

#[inline]
fn glide_exp(x: f32) -> f32 {
    1.0 - glide_log(1.0 - x)
}

/// Glide state for one voice. `update` is called once per block with the
/// (possibly modulated) portamento time in log2 seconds.
#[derive(Debug, Clone, Copy)]
pub struct Glide {
    source_key: f32,
    phase: f32,
    done: bool,
    last_semitone: f32,
}

impl Glide {
    pub fn new(source_key: f32) -> Self {
        Self {
            source_key,
            phase: 0.0,
            done: false,
            last_semitone: (source_key + 0.5).floor(),
        }
    }

    /// A glide that is already at the target, for non-legato starts.
    pub fn finished() -> Self {
        Self {
            source_key: 0.0,
            phase: 1.0,
            done: true,
            last_semitone: 0.0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Advance one block toward `target_key`. Returns the gliding key and
    /// whether a gliss retrigger fired.
    pub fn update(
        &mut self,
        opts: &GlideOptions,
        time: f32,
        target_key: f32,
        ctx: &BlockContext,
    ) -> (f32, bool) {
        if self.done {
            return (target_key, false);
        }

        let ts = if opts.temposync {
            ctx.temposync_ratio
        } else {
            1.0
        };
        // Times past 4 log2-seconds are clamped; anything longer would be
        // indistinguishable from a stuck note.
        let mut rate = ctx.envelope_rate_linear(time.min(4.0)) * ts;
        if opts.constant_rate {
            rate /= (1.0 / 12.0) * (target_key - self.source_key).abs() + 0.000_01;
        }
        self.phase += rate;
        if self.phase >= 1.0 {
            self.phase = 1.0;
            self.done = true;
        }

        let t = match opts.curve {
            GlideCurve::Log => glide_log(self.phase),
            GlideCurve::Linear => self.phase,
            GlideCurve::Exp => glide_exp(self.phase),
        };
        let mut key = (1.0 - t) * self.source_key + t * target_key;

        let mut retrigger = false;
        if opts.gliss {
            key = (key + 0.5).floor();
            if opts.retrigger && key != self.last_semitone {
                retrigger = true;
            }
            self.last_semitone = key;
        }

        (key, retrigger)
    }
}
