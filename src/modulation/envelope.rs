//! Dual-engine ADSR envelope.

use crate::modulation::{BlockContext, ModSourceKind, ModulationSource};

/// Lower bound of the time parameters, in log2 seconds. An attack within
/// 0.01 of this value is treated as instantaneous.
pub const ENV_TIME_MIN: f32 = -8.0;
/// Upper bound of the time parameters, in log2 seconds.
pub const ENV_TIME_MAX: f32 = 5.0;

/// Threshold below which the analog engine considers itself silent.
const SILENCE_THRESHOLD: f32 = 1e-6;

/// Rate parameter used by the stolen-voice fast release, regardless of the
/// release setting.
const UBER_RELEASE_RATE: f32 = -6.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsrStage {
    Attack,
    /// Also holds at sustain: the decay arm re-reads the sustain parameter
    /// every block, so raising it mid-note swells back up.
    Decay,
    Release,
    UberRelease,
    Idle,
}

/// Per-block parameter snapshot for one ADSR. The voice rebuilds this from
/// its modulated parameter copy before each `process_block`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdsrParams {
    /// Attack time, log2 seconds.
    pub attack: f32,
    /// Decay time, log2 seconds.
    pub decay: f32,
    /// Sustain level in [0, 1].
    pub sustain: f32,
    /// Release time, log2 seconds.
    pub release: f32,
    /// 0 = sqrt (fast start), 1 = linear, 2 = squared (slow start).
    pub attack_shape: u8,
    /// 0 = linear, 1 = quadratic bounds, 2 = cubic bounds.
    pub decay_shape: u8,
    /// Extra powers of phase applied during release.
    pub release_shape: u8,
    /// Select the analog (capacitor) engine instead of the digital one.
    pub analog: bool,
    /// Hold the pre-release level until the envelope actually idles.
    pub gated_release: bool,
    pub attack_sync: bool,
    pub decay_sync: bool,
    pub release_sync: bool,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack: ENV_TIME_MIN,
            decay: -2.0,
            sustain: 1.0,
            release: -5.0,
            attack_shape: 1,
            decay_shape: 0,
            release_shape: 0,
            analog: false,
            gated_release: false,
            attack_sync: false,
            decay_sync: false,
            release_sync: false,
        }
    }
}

/*
 * Two engines share this struct.
 *
 * Digital: a phase accumulator walked by envelope_rate_linear, shaped per
 * stage. Decay does not track a curve directly; instead it computes the
 * reachable [l_lo, l_hi] interval for this block from the current phase
 * and rate, then clamps the sustain target into it. That formulation keeps
 * decay monotone at any rate and lets sustain changes swell smoothly.
 *
 * Analog: an RC capacitor model. Charge v_c1 toward a 1.5 rail while
 * gated; a latch flips to discharge once the cap passes 1.0, after which
 * it drains toward sustain^2 (gated) or zero (released). The one-block
 * delayed copy of v_c1 drives the latch so the attack overshoot is
 * deterministic.
 */
#[derive(Debug, Clone)]
pub struct AdsrEnvelope {
    params: AdsrParams,
    stage: AdsrStage,
    phase: f32,
    output: f32,
    scale_stage: f32,
    idle_count: u32,

    v_c1: f32,
    v_c1_delayed: f32,
    discharge: bool,
    ungate_hold: f32,
}

impl AdsrEnvelope {
    pub fn new(params: AdsrParams) -> Self {
        Self {
            params,
            stage: AdsrStage::Attack,
            phase: 0.0,
            output: 0.0,
            scale_stage: 1.0,
            idle_count: 0,
            v_c1: 0.0,
            v_c1_delayed: 0.0,
            discharge: false,
            ungate_hold: 0.0,
        }
    }

    pub fn params(&self) -> &AdsrParams {
        &self.params
    }

    pub fn set_params(&mut self, params: AdsrParams) {
        self.params = params;
    }

    pub fn stage(&self) -> AdsrStage {
        self.stage
    }

    /// Restart the envelope from an arbitrary level without a click: the
    /// phase is set to the inverse of the attack shape at `start`, so the
    /// output curve passes exactly through the current level.
    pub fn attack_from(&mut self, start: f32) {
        self.phase = 0.0;
        self.output = 0.0;
        self.idle_count = 0;
        self.scale_stage = 1.0;

        if start > 0.0 {
            self.output = start;
            self.phase = match self.params.attack_shape {
                0 => start * start,
                2 => start.sqrt(),
                _ => start,
            };
        }

        self.v_c1 = start;
        self.v_c1_delayed = start;
        self.discharge = false;
        self.ungate_hold = 0.0;

        self.stage = AdsrStage::Attack;

        // Instant attack skips straight to decay at full level.
        if (self.params.attack - ENV_TIME_MIN) < 0.01 {
            self.stage = AdsrStage::Decay;
            self.output = 1.0;
            self.phase = 1.0;
        }
    }

    /// Retrigger from the current level, but only while still gated.
    pub fn retrigger_from(&mut self, start: f32) {
        if matches!(self.stage, AdsrStage::Attack | AdsrStage::Decay) {
            self.attack_from(start);
        }
    }

    /// Fast fixed-rate release for voice stealing; ignores the release
    /// time parameter.
    pub fn uber_release(&mut self) {
        self.scale_stage = self.output;
        self.phase = 1.0;
        self.stage = AdsrStage::UberRelease;
    }

    /// True once the envelope has been idle for at least one full block.
    pub fn is_idle(&self) -> bool {
        self.stage == AdsrStage::Idle && self.idle_count > 0
    }

    fn process_digital(&mut self, ctx: &BlockContext) {
        let p = self.params;
        let ts = |sync: bool| if sync { ctx.temposync_ratio } else { 1.0 };

        match self.stage {
            AdsrStage::Attack => {
                self.phase += ctx.envelope_rate_linear(p.attack) * ts(p.attack_sync);
                if self.phase >= 1.0 {
                    self.phase = 1.0;
                    self.stage = AdsrStage::Decay;
                }
                self.output = match p.attack_shape {
                    0 => self.phase.sqrt(),
                    2 => self.phase * self.phase,
                    _ => self.phase,
                };
            }
            AdsrStage::Decay => {
                let rate = ctx.envelope_rate_linear(p.decay) * ts(p.decay_sync);
                let (mut l_lo, l_hi) = match p.decay_shape {
                    1 => {
                        let sx = self.phase.sqrt();
                        let lo = self.phase - 2.0 * sx * rate + rate * rate;
                        let hi = self.phase + 2.0 * sx * rate + rate * rate;
                        (lo, hi)
                    }
                    2 => {
                        let sx = self.phase.powf(0.333_333_3);
                        let lo = self.phase - 3.0 * sx * sx * rate + 3.0 * sx * rate * rate
                            - rate * rate * rate;
                        let hi = self.phase + 3.0 * sx * sx * rate + 3.0 * sx * rate * rate
                            + rate * rate * rate;
                        (lo, hi)
                    }
                    _ => (self.phase - rate, self.phase + rate),
                };

                if p.decay_shape == 1 {
                    // The rate^2 term lifts both bounds off a near-zero
                    // sustain; floor the lower bound in the corner cases.
                    if (p.sustain < 1e-3 && self.phase < 1e-4)
                        || (p.sustain == 0.0 && p.decay < -7.0)
                    {
                        l_lo = 0.0;
                    }
                    // At rates above one block the lower bound can leapfrog
                    // the sustain and oscillate around it.
                    if rate > 1.0 && l_lo > p.sustain {
                        l_lo = p.sustain;
                    }
                }

                self.phase = p.sustain.max(l_lo).min(l_hi);
                self.output = self.phase;
            }
            AdsrStage::Release | AdsrStage::UberRelease => {
                let rate = if self.stage == AdsrStage::UberRelease {
                    ctx.envelope_rate_linear(UBER_RELEASE_RATE)
                } else {
                    ctx.envelope_rate_linear(p.release) * ts(p.release_sync)
                };
                self.phase -= rate;

                if !p.gated_release {
                    let mut out = self.phase;
                    for _ in 0..p.release_shape {
                        out *= self.phase;
                    }
                    self.output = out * self.scale_stage;
                }

                if self.phase < 0.0 {
                    self.stage = AdsrStage::Idle;
                    self.output = 0.0;
                }
            }
            AdsrStage::Idle => {
                self.idle_count += 1;
            }
        }

        self.output = self.output.max(0.0).min(1.0);
    }

    fn process_analog(&mut self, ctx: &BlockContext) {
        let p = self.params;
        let ts = |sync: bool| if sync { ctx.temposync_ratio } else { 1.0 };

        const V_CC: f32 = 1.5;
        let gate = matches!(self.stage, AdsrStage::Attack | AdsrStage::Decay);

        self.discharge = (self.v_c1_delayed > 1.0 || self.discharge) && gate;
        self.v_c1_delayed = self.v_c1;

        let s2 = {
            let s = p.sustain.max(0.0).min(1.0);
            s * s
        };
        let v_gate = if gate { V_CC } else { 0.0 };
        let v_attack = if self.discharge { 0.0 } else { v_gate };
        let v_decay = if self.discharge { s2 } else { V_CC };
        let v_release = v_gate;

        let diff_v_a = (v_attack - self.v_c1).max(0.0);
        // Allowing the positive kernel while discharging and gated lets
        // sustain swells charge the cap back up.
        let diff_vd_kernel = v_decay - self.v_c1;
        let diff_v_d = if self.discharge && gate {
            diff_vd_kernel
        } else {
            diff_vd_kernel.min(0.0)
        };
        let diff_v_r = (v_release - self.v_c1).min(0.0);

        let coeff_offset = 2.0 - (ctx.sample_rate / crate::BLOCK_SIZE as f32).log2();
        let coef = |x: f32, sync: bool| (coeff_offset - x * ts(sync)).min(0.0).exp2();
        let coef_a = coef(p.attack, p.attack_sync);
        let coef_d = coef(p.decay, p.decay_sync);
        let coef_r = if self.stage == AdsrStage::UberRelease {
            6.0
        } else {
            coef(p.release, p.release_sync)
        };

        self.v_c1 += diff_v_a * coef_a;
        self.v_c1 += diff_v_d * coef_d;
        self.v_c1 += diff_v_r * coef_r;

        self.output = self.v_c1;
        if gate {
            self.ungate_hold = self.output;
        } else if p.gated_release {
            self.output = self.ungate_hold;
        }

        if !gate && !self.discharge && self.v_c1 < SILENCE_THRESHOLD {
            self.stage = AdsrStage::Idle;
            self.output = 0.0;
            self.idle_count += 1;
        }
    }
}

impl ModulationSource for AdsrEnvelope {
    fn process_block(&mut self, ctx: &BlockContext) {
        if self.params.analog {
            self.process_analog(ctx);
        } else {
            self.process_digital(ctx);
        }
    }

    fn output(&self) -> f32 {
        self.output
    }

    fn kind(&self) -> ModSourceKind {
        ModSourceKind::Adsr
    }

    fn attack(&mut self) {
        self.attack_from(0.0);
    }

    fn release(&mut self) {
        self.scale_stage = self.output;
        self.phase = 1.0;
        self.stage = AdsrStage::Release;
    }

    fn per_voice(&self) -> bool {
        true
    }
}
