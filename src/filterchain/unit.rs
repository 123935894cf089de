//! Lane-parallel filter units: a two-pole state-variable core in low-,
//! high- and band-pass flavors at 12 and 24 dB/oct, with per-sample
//! coefficient interpolation and a resonance-dependent saturation register
//! that tames self-oscillation.

use super::Lane4;
use crate::BLOCK_SIZE_INV;

/// Coefficient slots: C0 = frequency (F1), C1 = damping (Q1), C2 = clip
/// damping, C3 = output gain.
pub const N_COEFF: usize = 4;
/// Register slots: R0/R1 stage one, R2 the saturation register, R3/R4
/// stage two (24 dB models only).
pub const N_REG: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterModel {
    #[default]
    Off,
    Lp12,
    Lp24,
    Hp12,
    Hp24,
    Bp12,
    Bp24,
}

impl FilterModel {
    pub fn is_active(self) -> bool {
        self != FilterModel::Off
    }

    fn four_pole(self) -> bool {
        matches!(self, FilterModel::Lp24 | FilterModel::Hp24 | FilterModel::Bp24)
    }
}

/// Direct coefficient set for one lane of an SVF unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvfCoefficients {
    pub c: [f32; N_COEFF],
}

impl SvfCoefficients {
    /// Derive coefficients from a cutoff in Hz and a resonance in [0, 1].
    pub fn calculate(model: FilterModel, freq_hz: f32, reso: f32, sample_rate_inv: f32) -> Self {
        let f1 = 2.0 * (std::f32::consts::PI * (freq_hz * sample_rate_inv).min(0.11)).sin();
        let reso = reso.clamp(0.0, 1.0).sqrt();

        let overshoot = if model.four_pole() { 0.1 } else { 0.15 };
        let q1 = 2.0 - reso * (2.0 + overshoot) + f1 * f1 * overshoot * 0.9;
        let q1 = q1.min(2.0).min(2.0 - 1.52 * f1);

        let clip_damp = 0.1 * reso * f1;
        let gain = 1.0 - 0.65 * reso;

        Self {
            c: [f1, q1, clip_damp, gain],
        }
    }
}

/// One filter unit across all four lanes. Coefficients ramp toward their
/// per-block targets one delta step per sample; registers persist across
/// blocks (the voice carries them when lanes are reassigned).
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterUnit {
    pub model: FilterModel,
    pub c: [Lane4; N_COEFF],
    pub dc: [Lane4; N_COEFF],
    pub r: [Lane4; N_REG],
}

impl FilterUnit {
    /// Set one lane's coefficient targets, ramped over the coming block.
    pub fn set_lane_coefficients(&mut self, lane: usize, target: &SvfCoefficients) {
        for i in 0..N_COEFF {
            let cur = self.c[i].get(lane);
            self.dc[i].set(lane, (target.c[i] - cur) * BLOCK_SIZE_INV);
        }
    }

    /// Snap one lane's coefficients without interpolation, for note-on.
    pub fn reset_lane(&mut self, lane: usize, target: &SvfCoefficients) {
        for i in 0..N_COEFF {
            self.c[i].set(lane, target.c[i]);
            self.dc[i].set(lane, 0.0);
        }
        for reg in &mut self.r {
            reg.set(lane, 0.0);
        }
        // The saturation register multiplies both integrators; it must
        // start at unity, not zero.
        self.r[2].set(lane, 1.0);
    }

    pub fn lane_registers(&self, lane: usize) -> [f32; N_REG] {
        let mut out = [0.0; N_REG];
        for (i, reg) in self.r.iter().enumerate() {
            out[i] = reg.get(lane);
        }
        out
    }

    pub fn set_lane_registers(&mut self, lane: usize, regs: &[f32; N_REG]) {
        for (i, reg) in self.r.iter_mut().enumerate() {
            reg.set(lane, regs[i]);
        }
    }

    /// Advance one sample. `Off` is the identity and touches nothing.
    #[inline]
    pub fn process(&mut self, input: Lane4) -> Lane4 {
        match self.model {
            FilterModel::Off => input,
            FilterModel::Lp12 => self.svf_12(input, SvfOutput::Low),
            FilterModel::Hp12 => self.svf_12(input, SvfOutput::High),
            FilterModel::Bp12 => self.svf_12(input, SvfOutput::Band),
            FilterModel::Lp24 => self.svf_24(input, SvfOutput::Low),
            FilterModel::Hp24 => self.svf_24(input, SvfOutput::High),
            FilterModel::Bp24 => self.svf_24(input, SvfOutput::Band),
        }
    }

    /// Double-sampled two-pole SVF. The second inner pass halves the
    /// effective tuning error of the Chamberlin structure at high cutoff.
    #[inline]
    fn svf_12(&mut self, input: Lane4, out: SvfOutput) -> Lane4 {
        self.c[0] += self.dc[0];
        self.c[1] += self.dc[1];

        let l = self.r[1] + self.c[0] * self.r[0];
        let h = input - l - self.c[1] * self.r[0];
        let b = self.r[0] + self.c[0] * h;

        let l2 = l + self.c[0] * b;
        let h2 = input - l2 - self.c[1] * b;
        let b2 = b + self.c[0] * h2;

        self.r[0] = b2 * self.r[2];
        self.r[1] = l2 * self.r[2];

        self.c[2] += self.dc[2];
        self.r[2] = (Lane4::splat(1.0) - self.c[2] * b * b).max(Lane4::splat(0.1));

        self.c[3] += self.dc[3];
        match out {
            SvfOutput::Low => l2 * self.c[3],
            SvfOutput::High => h2 * self.c[3],
            SvfOutput::Band => b2 * self.c[3],
        }
    }

    /// Two cascaded SVF stages sharing coefficients and the saturation
    /// register.
    #[inline]
    fn svf_24(&mut self, input: Lane4, out: SvfOutput) -> Lane4 {
        self.c[0] += self.dc[0];
        self.c[1] += self.dc[1];

        let mut l = self.r[1] + self.c[0] * self.r[0];
        let mut h = input - l - self.c[1] * self.r[0];
        let mut b = self.r[0] + self.c[0] * h;

        l = l + self.c[0] * b;
        h = input - l - self.c[1] * b;
        b = b + self.c[0] * h;

        self.r[0] = b * self.r[2];
        self.r[1] = l * self.r[2];

        let stage2_in = match out {
            SvfOutput::Low => l,
            SvfOutput::High => h,
            SvfOutput::Band => b,
        };

        let mut l = self.r[4] + self.c[0] * self.r[3];
        let mut h = stage2_in - l - self.c[1] * self.r[3];
        let mut b = self.r[3] + self.c[0] * h;

        l = l + self.c[0] * b;
        h = stage2_in - l - self.c[1] * b;
        b = b + self.c[0] * h;

        self.r[3] = b * self.r[2];
        self.r[4] = l * self.r[2];

        self.c[2] += self.dc[2];
        self.r[2] = (Lane4::splat(1.0) - self.c[2] * b * b).max(Lane4::splat(0.1));

        self.c[3] += self.dc[3];
        match out {
            SvfOutput::Low => l * self.c[3],
            SvfOutput::High => h * self.c[3],
            SvfOutput::Band => b * self.c[3],
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SvfOutput {
    Low,
    High,
    Band,
}
