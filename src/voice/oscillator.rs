//! Oscillator slot boundary. Synthesis itself lives behind
//! [`OscillatorSource`]; the voice only consumes rendered blocks for
//! mixing, ring modulation and FM routing.

use crate::modulation::BlockContext;
use crate::BLOCK_SIZE;

/// FM routing between the three oscillator slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FmMode {
    #[default]
    Off,
    /// Oscillator 2 modulates oscillator 1.
    TwoToOne,
    /// Oscillator 3 modulates 2, which modulates 1.
    ThreeToTwoToOne,
    /// Oscillators 2 and 3 are summed and modulate 1 together.
    TwoAndThreeToOne,
}

impl FmMode {
    pub fn uses_osc2(self) -> bool {
        !matches!(self, FmMode::Off)
    }

    pub fn uses_osc3(self) -> bool {
        matches!(self, FmMode::ThreeToTwoToOne | FmMode::TwoAndThreeToOne)
    }
}

/// One oscillator slot. `pitch` is in fractional MIDI note units; `fm`
/// carries the modulator block and a linear depth when FM routing targets
/// this slot. Mono sources return the same buffer from both output
/// accessors.
pub trait OscillatorSource {
    fn process_block(
        &mut self,
        pitch: f32,
        fm: Option<(&[f32; BLOCK_SIZE], f32)>,
        stereo: bool,
        ctx: &BlockContext,
    );

    fn output(&self) -> &[f32; BLOCK_SIZE];

    fn output_r(&self) -> &[f32; BLOCK_SIZE] {
        self.output()
    }
}

/// Minimal phase-modulated sine source, the reference implementation used
/// by the integration tests and benchmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SineSource {
    phase: f32,
    out: [f32; BLOCK_SIZE],
}

impl SineSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OscillatorSource for SineSource {
    fn process_block(
        &mut self,
        pitch: f32,
        fm: Option<(&[f32; BLOCK_SIZE], f32)>,
        _stereo: bool,
        ctx: &BlockContext,
    ) {
        let incr = crate::dsp::pitch_to_hz(pitch) * ctx.sample_rate_inv;
        for (k, out) in self.out.iter_mut().enumerate() {
            let mut ph = self.phase;
            if let Some((buf, depth)) = fm {
                ph += buf[k] * depth;
            }
            *out = (std::f32::consts::TAU * ph).sin();
            self.phase += incr;
        }
        self.phase -= self.phase.floor();
    }

    fn output(&self) -> &[f32; BLOCK_SIZE] {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_source_spans_full_range_and_stays_bounded() {
        let ctx = BlockContext::new(48_000.0);
        let mut osc = SineSource::new();
        let mut lo = 1.0f32;
        let mut hi = -1.0f32;
        for _ in 0..100 {
            osc.process_block(69.0, None, false, &ctx);
            for &s in osc.output() {
                lo = lo.min(s);
                hi = hi.max(s);
                assert!((-1.0..=1.0).contains(&s));
            }
        }
        assert!(lo < -0.99 && hi > 0.99);
    }

    #[test]
    fn fm_input_bends_the_phase() {
        let ctx = BlockContext::new(48_000.0);
        let mut plain = SineSource::new();
        let mut modded = SineSource::new();
        let fm = [0.25; BLOCK_SIZE];
        plain.process_block(69.0, None, false, &ctx);
        modded.process_block(69.0, Some((&fm, 1.0)), false, &ctx);
        // A constant quarter-cycle phase offset turns sine into cosine.
        assert!((modded.output()[0] - 1.0).abs() < 1e-3);
        assert!(plain.output()[0].abs() < 1e-3);
    }
}
