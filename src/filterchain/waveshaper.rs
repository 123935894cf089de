//! Lane-parallel waveshaper kernels. Each kernel is a pure function of the
//! input and the (per-sample interpolated) drive, applied elementwise
//! across all four lanes.

use super::Lane4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WaveshaperKind {
    #[default]
    Off,
    /// Rational tanh approximation, clipped to [-1, 1].
    Soft,
    /// Hard clip at unity.
    Hard,
    /// Soft saturation with a DC-shifted knee, so positive and negative
    /// halves distort differently.
    Asymmetric,
    /// Sine fold-back over two half-periods.
    SineFold,
    /// Bit-crush style quantizer whose step size follows drive.
    Digital,
}

impl WaveshaperKind {
    pub fn is_active(self) -> bool {
        self != WaveshaperKind::Off
    }

    /// Apply the kernel across all four lanes. `Off` passes through.
    #[inline]
    pub fn process(self, input: Lane4, drive: Lane4) -> Lane4 {
        match self {
            WaveshaperKind::Off => input,
            WaveshaperKind::Soft => Lane4::map2(input, drive, soft),
            WaveshaperKind::Hard => Lane4::map2(input, drive, hard),
            WaveshaperKind::Asymmetric => Lane4::map2(input, drive, asym),
            WaveshaperKind::SineFold => Lane4::map2(input, drive, sine_fold),
            WaveshaperKind::Digital => Lane4::map2(input, drive, digital),
        }
    }
}

// y = x * (27 + x^2) / (27 + 9 * x^2), a close tanh fit that stays cheap.
#[inline]
fn soft(x: f32, drive: f32) -> f32 {
    let x = x * drive;
    let xx = x * x;
    (x * (27.0 + xx) / (27.0 + 9.0 * xx)).clamp(-1.0, 1.0)
}

#[inline]
fn hard(x: f32, drive: f32) -> f32 {
    (x * drive).clamp(-1.0, 1.0)
}

#[inline]
fn asym(x: f32, drive: f32) -> f32 {
    let x = (x * drive).clamp(-16.0, 16.0);
    (x + 0.5).tanh() - 0.5_f32.tanh()
}

#[inline]
fn sine_fold(x: f32, drive: f32) -> f32 {
    let x = (x * drive).clamp(-2.0, 2.0);
    (std::f32::consts::FRAC_PI_2 * x).sin()
}

// Quantize to 1/16 steps of the drive-scaled range; the half-step offset
// keeps zero input on a riser edge like the original DAC model.
#[inline]
fn digital(x: f32, drive: f32) -> f32 {
    if drive.abs() < 1e-12 {
        return 0.0;
    }
    let a = (x * 16.0 / drive + 0.5).round();
    drive * 0.0625 * (a - 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_is_linearish_at_small_input_and_clips_large() {
        assert!((soft(0.01, 1.0) - 0.01).abs() < 1e-4);
        assert_eq!(soft(10.0, 1.0), 1.0);
        assert_eq!(soft(-10.0, 1.0), -1.0);
    }

    #[test]
    fn hard_clip_is_exact_at_unity() {
        assert_eq!(hard(0.5, 1.0), 0.5);
        assert_eq!(hard(1.7, 1.0), 1.0);
        assert_eq!(hard(0.9, 2.0), 1.0);
    }

    #[test]
    fn asym_treats_polarities_differently() {
        let pos = asym(0.5, 1.0);
        let neg = asym(-0.5, 1.0);
        assert!(
            (pos + neg).abs() > 1e-3,
            "asymmetric shaper must not be odd-symmetric: {pos} vs {neg}"
        );
        assert!(asym(0.0, 1.0).abs() < 1e-7, "zero in, zero out");
    }

    #[test]
    fn sine_fold_wraps_past_unity() {
        assert!((sine_fold(1.0, 1.0) - 1.0).abs() < 1e-6);
        // Past the fold point the output comes back down.
        assert!(sine_fold(1.5, 1.0) < sine_fold(1.0, 1.0));
    }

    #[test]
    fn digital_quantizes_to_sixteenths() {
        let y = digital(0.3, 1.0);
        let steps = y / 0.0625;
        assert!(
            (steps - steps.round()).abs() < 1e-4 || ((steps * 2.0) - (steps * 2.0).round()).abs() < 1e-4,
            "output {y} is not on the quantizer grid"
        );
    }

    #[test]
    fn off_passes_lanes_through() {
        let x = Lane4::new([0.1, -0.2, 0.3, -0.4]);
        let d = Lane4::splat(2.0);
        assert_eq!(WaveshaperKind::Off.process(x, d), x);
    }
}
