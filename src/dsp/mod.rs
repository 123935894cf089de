//! Small scalar DSP helpers shared by the modulation and voice layers.

use crate::BLOCK_SIZE_INV;

/// Convert decibels to a linear gain factor.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(0.05 * db)
}

/// Perceptual amplitude taper for mixer levels: negative inputs are
/// silence, and the curve is cubed so the lower half of the control
/// range stays usable.
#[inline]
pub fn amp_to_linear(x: f32) -> f32 {
    let x = x.max(0.0);
    x * x * x
}

/*
 * Pan law
 * -------
 * A quadratic over-unity pan: center position is exactly unity on both
 * sides, a fully hard-panned side rises to 1.5x while the opposite side
 * reaches zero. Positions beyond +-1 (reachable once stereo width is
 * applied on top of pan) invert phase rather than clamping at zero.
 */

/// Left gain for a pan position in [-2, 2].
#[inline]
pub fn pan_left(pos: f32) -> f32 {
    let pos = pos.clamp(-2.0, 2.0);
    1.0 - 0.75 * pos - 0.25 * pos * pos
}

/// Right gain for a pan position in [-2, 2].
#[inline]
pub fn pan_right(pos: f32) -> f32 {
    let pos = pos.clamp(-2.0, 2.0);
    1.0 + 0.75 * pos - 0.25 * pos * pos
}

/// MIDI note number (fractional) to frequency in Hz, A440 tuning.
#[inline]
pub fn pitch_to_hz(note: f32) -> f32 {
    440.0 * ((note - 69.0) / 12.0).exp2()
}

/// Catmull-Rom style cubic interpolation across four samples. `mu` is the
/// fractional position between `y1` and `y2`.
#[inline]
pub fn cubic_interpolate(y0: f32, y1: f32, y2: f32, y3: f32, mu: f32) -> f32 {
    let mu2 = mu * mu;
    let a0 = y3 - y2 - y0 + y1;
    let a1 = y0 - y1 - a0;
    let a2 = y2 - y0;
    let a3 = y1;
    a0 * mu * mu2 + a1 * mu2 + a2 * mu + a3
}

/// First-order correlated noise. The caller supplies uniform white noise in
/// [-1, 1]; `correlation` in [-1, 1] lowpasses (positive) or highpasses
/// (negative) the sequence, with energy compensation so the output level
/// stays comparable across the whole range. Zero correlation passes the
/// white input through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelatedNoise {
    state: f32,
}

impl CorrelatedNoise {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
    }

    pub fn next(&mut self, correlation: f32, white: f32) -> f32 {
        let wf = correlation.clamp(-1.0, 1.0) * 0.9;
        let wfa = wf.abs();
        self.state = wf * self.state + (1.0 - wfa) * white;
        let comp = ((1.0 + wfa) / (1.0 - wfa)).sqrt();
        (self.state * comp).clamp(-1.0, 1.0)
    }
}

/// One-pole lag toward a target, re-targeted at block rate. Used for
/// controller smoothing and mixer level de-zippering.
#[derive(Debug, Clone, Copy)]
pub struct LagSmoother {
    value: f32,
    target: f32,
    rate: f32,
}

impl LagSmoother {
    /// `rate` is the per-block approach fraction in (0, 1].
    pub fn new(rate: f32) -> Self {
        Self {
            value: 0.0,
            target: 0.0,
            rate: rate.clamp(1e-4, 1.0),
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    /// Snap both value and target, skipping the lag.
    pub fn set_instant(&mut self, value: f32) {
        self.value = value;
        self.target = value;
    }

    pub fn process(&mut self) -> f32 {
        self.value += self.rate * (self.target - self.value);
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Per-block linear interpolator: holds a current value plus the per-sample
/// delta that reaches the new target by block end. The per-sample step is a
/// single add, suitable for the inner sample loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockInterp {
    value: f32,
    delta: f32,
}

impl BlockInterp {
    pub fn set_target(&mut self, target: f32) {
        self.delta = (target - self.value) * BLOCK_SIZE_INV;
    }

    pub fn set_instant(&mut self, value: f32) {
        self.value = value;
        self.delta = 0.0;
    }

    #[inline]
    pub fn step(&mut self) -> f32 {
        self.value += self.delta;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Injects a tiny alternating-sign offset into samples whose magnitude
/// would underflow to a denormal, keeping filter feedback paths out of the
/// denormal range without touching CPU flags.
#[derive(Debug, Clone, Copy)]
pub struct DenormalGuard {
    flip: f32,
}

impl Default for DenormalGuard {
    fn default() -> Self {
        Self { flip: 1e-16 }
    }
}

impl DenormalGuard {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn apply(&mut self, x: f32) -> f32 {
        if x.abs() < 1e-20 {
            self.flip = -self.flip;
            x + self.flip
        } else {
            x
        }
    }
}
