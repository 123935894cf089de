//! Low-frequency oscillator with ten output shapes, a DAHDSR amplitude
//! sub-envelope, and three trigger modes.
//!
//! The phase accumulator and the shape kernels are deliberately decoupled:
//! `process_block` owns wrapping, history refills and the sub-envelope,
//! while each kernel is a pure function of `(phase, deform, history)`. The
//! step sequencer additionally raises retrigger flags the owning voice
//! forwards to its filter and amp envelopes.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::dsp::{cubic_interpolate, CorrelatedNoise};
use crate::modulation::envelope::{ENV_TIME_MAX, ENV_TIME_MIN};
use crate::modulation::{BlockContext, ModSourceKind, ModulationSource};
use crate::mseg::{self, EditMode, EvaluatorState, MsegStorage};

/// Number of step-sequencer steps.
pub const N_STEPS: usize = 16;

/// Seed counter for live generators; display instances use fixed seeds so
/// previews are stable across redraws.
static NEXT_SEED: AtomicU64 = AtomicU64::new(1234);

const DISPLAY_RNG_SEED: u64 = 46;
// A different seed than the live path on purpose, so a preview never
// mirrors the voice it sits next to.
const DISPLAY_MSEG_SEED: u64 = 2112;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LfoShape {
    #[default]
    Sine,
    Triangle,
    Ramp,
    Square,
    SampleHold,
    /// Sample & hold smoothed by cubic interpolation over a 4-sample ring.
    Noise,
    StepSeq,
    /// The DAHDSR sub-envelope itself is the output.
    Envelope,
    /// Delegates to the multi-segment envelope evaluator.
    Mseg,
    /// Host-evaluated program source behind [`FormulaSource`].
    Formula,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerMode {
    /// Phase starts at the start-phase parameter on every gate.
    #[default]
    KeyTrigger,
    /// Phase and step index are drawn at random on every gate.
    Random,
    /// Phase is derived from the song position, so every voice agrees.
    FreeRun,
}

/// Step sequencer data driven by the [`LfoShape::StepSeq`] shape.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StepSequence {
    pub steps: [f32; N_STEPS],
    pub loop_start: i32,
    pub loop_end: i32,
    /// Three bitplanes: bit `step` retriggers both voice envelopes,
    /// `16 + step` the filter envelope only, `32 + step` the amp envelope
    /// only.
    pub trigmask: u64,
}

impl Default for StepSequence {
    fn default() -> Self {
        Self {
            steps: [0.0; N_STEPS],
            loop_start: 0,
            loop_end: N_STEPS as i32 - 1,
            trigmask: 0,
        }
    }
}

/// Per-block parameter snapshot, written by the owning voice after
/// modulation routing has been applied.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LfoParams {
    pub shape: LfoShape,
    pub trigger_mode: TriggerMode,
    /// Rate in log2 Hz.
    pub rate: f32,
    /// Deactivated rate freezes the phase; for the step sequencer this
    /// enables scrub mode, where the phase knob selects the step directly.
    pub rate_deactivated: bool,
    pub rate_temposync: bool,
    /// Initial phase in [0, 1). For the step sequencer this knob is the
    /// shuffle amount instead (extended range, clamped to +-1.99).
    pub start_phase: f32,
    /// Output scale, extended range clamped to [-3, 3].
    pub magnitude: f32,
    pub deform: f32,
    pub unipolar: bool,

    // DAHDSR sub-envelope, stage times in log2 seconds.
    pub delay: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    /// Bypass the sub-envelope entirely (constant 1).
    pub delay_deactivated: bool,
    pub env_temposync: bool,
}

impl Default for LfoParams {
    fn default() -> Self {
        Self {
            shape: LfoShape::Sine,
            trigger_mode: TriggerMode::KeyTrigger,
            rate: 0.0,
            rate_deactivated: false,
            rate_temposync: false,
            start_phase: 0.0,
            magnitude: 1.0,
            deform: 0.0,
            unipolar: false,
            delay: ENV_TIME_MIN,
            attack: ENV_TIME_MIN,
            hold: ENV_TIME_MIN,
            decay: 0.0,
            sustain: 1.0,
            release: ENV_TIME_MAX,
            delay_deactivated: false,
            env_temposync: false,
        }
    }
}

/// Host-evaluated program source plugged into [`LfoShape::Formula`]. The
/// generator drives phase and lifecycle; evaluation lives outside this
/// crate.
pub trait FormulaSource: Send {
    fn attack(&mut self) {}
    fn release(&mut self) {}

    /// Sample for the unwrapped phase `int_phase + phase`. `released`
    /// mirrors the gate state.
    fn value_at(&mut self, int_phase: i32, phase: f32, deform: f32, released: bool) -> f32;

    /// When false the sub-envelope is bypassed for this source.
    fn uses_envelope(&self) -> bool {
        true
    }

    /// (filter, amp) retrigger requests raised by the last evaluation.
    fn retrigger_flags(&mut self) -> (bool, bool) {
        (false, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvStage {
    Delay,
    Attack,
    Hold,
    Decay,
    Release,
    /// Terminal state for MSEG/Formula shapes released at maximum release
    /// time; the delegate handles its own tail.
    MsegRelease,
    Stuck,
}

/*
 * Shape kernels
 * -------------
 * Pure functions of the wrapped phase, the deform amount, and (for the
 * sampled shapes) the 4-sample history ring. Everything stateful - phase
 * wrapping, history refills, step advance - happens in process_block
 * before these run.
 */

/// Fixed-point quadratic bend, applied twice. Zero deform is the identity,
/// so every continuous kernel reproduces its base shape exactly at
/// deform = 0.
#[inline]
fn bend1(x: f32, deform: f32) -> f32 {
    let a = 0.5 * deform.clamp(-3.0, 3.0);
    let x = x - a * x * x + a;
    x - a * x * x + a
}

#[inline]
fn sine_kernel(phase: f32, deform: f32) -> f32 {
    bend1((std::f32::consts::TAU * phase).sin(), deform)
}

#[inline]
fn triangle_kernel(phase: f32, deform: f32) -> f32 {
    let tri = if phase > 0.5 { 1.0 - phase } else { phase };
    bend1(-1.0 + 4.0 * tri, deform)
}

#[inline]
fn ramp_kernel(phase: f32, deform: f32) -> f32 {
    bend1(1.0 - 2.0 * phase, deform)
}

/// Deform is pulse width: the edge sits at 0.5 + 0.5 * deform.
#[inline]
fn square_kernel(phase: f32, deform: f32) -> f32 {
    if phase > 0.5 + 0.5 * deform {
        -1.0
    } else {
        1.0
    }
}

/// Step-sequencer interpolation morph. deform sweeps from a hard gate
/// through sample-and-hold into linear and finally cubic interpolation
/// between adjacent steps.
fn step_morph(h: &[f32; 4], phase: f32, df: f32) -> f32 {
    if df > 0.5 {
        let linear = (1.0 - phase) * h[2] + phase * h[1];
        let cubic = cubic_interpolate(h[3], h[2], h[1], h[0], phase);
        (2.0 - 2.0 * df) * linear + (2.0 * df - 1.0) * cubic
    } else if df > -0.0001 {
        let cf = (phase / (2.0 * df + 0.00001)).max(0.0).min(1.0);
        (1.0 - cf) * h[2] + cf * h[1]
    } else if df > -0.5 {
        let cf = ((1.0 - phase) / (-2.0 * df + 0.00001)).max(0.0).min(1.0);
        cf * h[1]
    } else {
        let cf = (phase / (2.0 + 2.0 * df + 0.00001)).max(0.0).min(1.0);
        (1.0 - cf) * h[1]
    }
}

/// One LFO instance. Live generators reseed their RNG on every `attack`
/// from a process-wide counter; display instances keep fixed seeds.
pub struct LfoGenerator {
    params: LfoParams,
    steps: StepSequence,
    mseg: MsegStorage,
    mseg_state: EvaluatorState,
    formula: Option<Box<dyn FormulaSource>>,
    rng: SmallRng,
    noise: CorrelatedNoise,
    is_display: bool,

    phase: f32,
    int_phase: i32,
    phase_initialized: bool,
    ratemult: f32,
    shuffle_id: u32,
    step: i32,
    prior_step: i32,
    prior_phase: f32,
    wf_history: [f32; 4],
    /// Held kernel value for the sampled shapes.
    iout: f32,

    env_state: EnvStage,
    env_val: f32,
    env_phase: f32,
    env_releasestart: f32,

    output: f32,
    raw_output: f32,
    retrigger_feg: bool,
    retrigger_aeg: bool,
}

impl LfoGenerator {
    pub fn new(params: LfoParams) -> Self {
        Self::with_seeds(params, next_seed(), next_seed(), false)
    }

    /// An editor/preview instance with fixed seeds, exempt from the
    /// attack-time reseed so redraws are reproducible.
    pub fn new_display(params: LfoParams) -> Self {
        Self::with_seeds(params, DISPLAY_RNG_SEED, DISPLAY_MSEG_SEED, true)
    }

    fn with_seeds(params: LfoParams, rng_seed: u64, mseg_seed: u64, is_display: bool) -> Self {
        Self {
            params,
            steps: StepSequence::default(),
            mseg: MsegStorage::default(),
            mseg_state: EvaluatorState::new(mseg_seed),
            formula: None,
            rng: SmallRng::seed_from_u64(rng_seed),
            noise: CorrelatedNoise::new(),
            is_display,
            phase: 0.0,
            int_phase: 0,
            phase_initialized: false,
            ratemult: 1.0,
            shuffle_id: 0,
            step: 0,
            prior_step: -1,
            prior_phase: -1000.0,
            wf_history: [0.0; 4],
            iout: 0.0,
            env_state: EnvStage::Stuck,
            env_val: 0.0,
            env_phase: 0.0,
            env_releasestart: 0.0,
            output: 0.0,
            raw_output: 0.0,
            retrigger_feg: false,
            retrigger_aeg: false,
        }
    }

    pub fn set_params(&mut self, params: LfoParams) {
        self.params = params;
    }

    pub fn params(&self) -> &LfoParams {
        &self.params
    }

    pub fn set_step_sequence(&mut self, steps: StepSequence) {
        self.steps = steps;
    }

    pub fn step_sequence(&self) -> &StepSequence {
        &self.steps
    }

    pub fn set_mseg(&mut self, mseg: MsegStorage) {
        self.mseg = mseg;
    }

    pub fn mseg(&self) -> &MsegStorage {
        &self.mseg
    }

    pub fn set_formula(&mut self, formula: Box<dyn FormulaSource>) {
        self.formula = Some(formula);
    }

    /// Raw kernel output before envelope and magnitude are applied.
    pub fn raw_output(&self) -> f32 {
        self.raw_output
    }

    /// Current sub-envelope level.
    pub fn env_output(&self) -> f32 {
        self.env_val
    }

    /// (filter, amp) retrigger requests raised during the last block.
    pub fn retrigger_flags(&self) -> (bool, bool) {
        (self.retrigger_feg, self.retrigger_aeg)
    }

    fn white(&mut self) -> f32 {
        self.rng.random_range(-1.0..=1.0)
    }

    fn corr_noise(&mut self, correlation: f32) -> f32 {
        let white = self.white();
        self.noise.next(correlation.clamp(-1.0, 1.0), white)
    }

    /// An envelope-mode MSEG longer than one cycle spans the whole
    /// duration, so the start phase is stretched to match.
    fn mseg_phase_adjustment(&mut self) {
        if self.params.shape == LfoShape::Mseg
            && self.mseg.edit_mode == EditMode::Envelope
            && self.mseg.total_duration > 1.0
        {
            let up = self.phase as f64 * self.mseg.total_duration as f64;
            self.int_phase = up.floor() as i32;
            self.phase = (up - up.floor()) as f32;
        }
    }

    fn init_phase_from_start_phase(&mut self) {
        self.phase = self.params.start_phase;
        self.phase_initialized = true;

        // A scrubbed bipolar triangle reads nicest centered on zero.
        if self.params.shape == LfoShape::Triangle
            && self.params.rate_deactivated
            && !self.params.unipolar
        {
            self.phase += 0.25;
        }

        self.phase -= self.phase.floor();
        self.int_phase = 0;
        self.mseg_phase_adjustment();
    }

    fn update_shuffle(&mut self) {
        let shuffle = self.params.start_phase.clamp(-1.99, 1.99);
        self.shuffle_id = (self.shuffle_id + 1) & 1;
        self.ratemult = if self.shuffle_id != 0 {
            1.0 / (1.0 - 0.5 * shuffle)
        } else {
            1.0 / (1.0 + 0.5 * shuffle)
        };
    }

    fn advance_step(&mut self) {
        self.step += 1;
        if self.steps.loop_end >= self.steps.loop_start {
            if self.step > self.steps.loop_end {
                self.step = self.steps.loop_start;
            }
        } else if self.step >= self.steps.loop_start {
            // Inverted loop points still park playback at the loop end.
            self.step = self.steps.loop_end + 1;
        }
    }

    fn apply_trigmask(&mut self, step: i32) {
        let step = step as u32 & (N_STEPS as u32 - 1);
        if self.steps.trigmask & (1u64 << step) != 0 {
            self.retrigger_feg = true;
            self.retrigger_aeg = true;
        }
        if self.steps.trigmask & (1u64 << (16 + step)) != 0 {
            self.retrigger_feg = true;
        }
        if self.steps.trigmask & (1u64 << (32 + step)) != 0 {
            self.retrigger_aeg = true;
        }
    }

    fn step_at(&self, index: i32) -> f32 {
        self.steps.steps[index.rem_euclid(N_STEPS as i32) as usize]
    }
}

fn next_seed() -> u64 {
    NEXT_SEED.fetch_add(1, Ordering::Relaxed)
}

impl ModulationSource for LfoGenerator {
    fn attack(&mut self) {
        if self.is_display {
            self.mseg_state.seed(DISPLAY_MSEG_SEED);
        } else {
            self.rng = SmallRng::seed_from_u64(next_seed());
            self.mseg_state.seed(next_seed());
        }
        self.mseg_state.start();

        if !self.phase_initialized {
            self.init_phase_from_start_phase();
        }

        self.env_state = EnvStage::Delay;
        self.env_val = 0.0;
        self.env_phase = 0.0;
        self.ratemult = 1.0;

        // Zero-length leading stages cascade straight through.
        if self.params.delay <= ENV_TIME_MIN {
            self.env_state = EnvStage::Attack;
            if self.params.attack <= ENV_TIME_MIN {
                self.env_state = EnvStage::Hold;
                self.env_val = 1.0;
                if self.params.hold <= ENV_TIME_MIN {
                    self.env_state = EnvStage::Decay;
                }
            }
        }

        if self.is_display {
            self.phase = if self.params.shape == LfoShape::StepSeq {
                0.0
            } else {
                self.params.start_phase
            };
            self.int_phase = 0;
            self.step = 0;
            self.mseg_phase_adjustment();
        } else {
            // For the step sequencer the phase knob is shuffle, not phase.
            let mut slider = if self.params.shape == LfoShape::StepSeq {
                0.0
            } else {
                self.params.start_phase
            };
            slider -= slider.floor();

            match self.params.trigger_mode {
                TriggerMode::KeyTrigger => {
                    self.phase = slider;
                    self.int_phase = 0;
                    self.step = 0;
                    self.mseg_phase_adjustment();
                }
                TriggerMode::Random => {
                    self.phase = self.rng.random_range(0.0..1.0);
                    self.int_phase = 0;
                    self.mseg_phase_adjustment();
                    self.step = if self.steps.loop_end <= 0 {
                        0
                    } else {
                        (self.rng.random_range(0..self.steps.loop_end)) & (N_STEPS as i32 - 1)
                    };
                }
                TriggerMode::FreeRun => {
                    self.phase = slider;
                    self.int_phase = 0;
                    self.mseg_phase_adjustment();
                    // process_block recomputes the locked phase from the
                    // song position each block, using the context it gets
                    // there.
                    self.phase_initialized = false;
                }
            }
        }

        match self.params.shape {
            LfoShape::SampleHold => {
                self.noise.reset();
                let df = self.params.deform;
                self.iout = self.corr_noise(df);
            }
            LfoShape::Noise => {
                self.noise.reset();
                let df = self.params.deform;
                for i in 0..4 {
                    self.wf_history[i] = self.corr_noise(df) * self.phase;
                }
                self.phase = 0.0;
            }
            LfoShape::StepSeq => {
                self.wf_history[1] = self.step_at(self.step);
                self.wf_history[2] = self.step_at(self.step - 1);
                self.wf_history[3] = self.step_at(self.step - 2);
                self.advance_step();
                self.update_shuffle();
                self.wf_history[0] = self.step_at(self.step);
            }
            LfoShape::Triangle => {
                if !self.params.unipolar {
                    self.phase += 0.25;
                    if self.phase >= 1.0 {
                        self.phase -= 1.0;
                        self.int_phase += 1;
                    }
                }
            }
            LfoShape::Sine => {
                if self.params.unipolar {
                    self.phase += 0.75;
                    if self.phase >= 1.0 {
                        self.phase -= 1.0;
                        self.int_phase += 1;
                    }
                }
            }
            LfoShape::Formula => {
                if let Some(f) = self.formula.as_mut() {
                    f.attack();
                }
            }
            _ => {}
        }
    }

    fn release(&mut self) {
        if self.params.release < ENV_TIME_MAX {
            self.env_state = EnvStage::Release;
            self.env_releasestart = self.env_val;
            self.env_phase = 0.0;
        } else if matches!(self.params.shape, LfoShape::Mseg | LfoShape::Formula) {
            self.env_state = EnvStage::MsegRelease;
            if let Some(f) = self.formula.as_mut() {
                f.release();
            }
        }
    }

    fn process_block(&mut self, ctx: &BlockContext) {
        let p = self.params;

        if !self.phase_initialized && p.trigger_mode == TriggerMode::FreeRun && !self.is_display {
            // Lock phase to the song position so every voice agrees.
            let mut lrate = (p.rate as f64).exp2();
            if p.rate_temposync {
                lrate *= ctx.temposync_ratio as f64;
            }
            // song_pos is in beats and temposync_ratio is tempo/120, so
            // beats * tsratio_inv / 2 is elapsed seconds.
            let time_passed = ctx.song_pos * ctx.temposync_ratio_inv as f64 * 0.5;

            let mut start_phase = if p.shape == LfoShape::StepSeq {
                0.0
            } else {
                p.start_phase as f64 - (p.start_phase as f64).floor()
            };
            if p.shape == LfoShape::Mseg
                && self.mseg.edit_mode == EditMode::Envelope
                && self.mseg.total_duration > 1.0
            {
                start_phase *= self.mseg.total_duration as f64;
            }

            let total_phase = start_phase + time_passed * lrate;
            let ipart = total_phase.floor();
            self.phase = (total_phase - ipart) as f32;
            self.int_phase = ipart as i32;
            self.phase_initialized = true;

            let loop_len = (self.steps.loop_end - self.steps.loop_start + 1).max(1);
            self.step = (ipart as i32).rem_euclid(loop_len) + self.steps.loop_start;
        } else if !self.phase_initialized
            || (p.trigger_mode == TriggerMode::KeyTrigger && p.rate_deactivated)
        {
            self.init_phase_from_start_phase();
        }

        self.retrigger_feg = false;
        self.retrigger_aeg = false;

        let mut frate = ctx.envelope_rate_linear(-p.rate);
        if p.rate_deactivated {
            frate = 0.0;
        }
        if p.rate_temposync {
            frate *= ctx.temposync_ratio;
        }

        self.phase += frate * self.ratemult;

        if frate == 0.0 && self.phase == 0.0 && p.shape == LfoShape::StepSeq {
            // Scrub mode at exactly zero never leaves step 0 otherwise.
            self.phase = 0.001;
        }

        // DAHDSR sub-envelope.
        if self.env_state != EnvStage::Stuck && self.env_state != EnvStage::MsegRelease {
            let stage_time = match self.env_state {
                EnvStage::Delay => p.delay,
                EnvStage::Attack => p.attack,
                EnvStage::Hold => p.hold,
                EnvStage::Decay => p.decay,
                EnvStage::Release => p.release,
                EnvStage::MsegRelease | EnvStage::Stuck => 0.0,
            };
            let mut envrate = ctx.envelope_rate_linear(stage_time);
            if p.env_temposync {
                envrate *= ctx.temposync_ratio;
            }
            self.env_phase += envrate;

            if self.env_phase > 1.0 {
                match self.env_state {
                    EnvStage::Delay => {
                        self.env_state = EnvStage::Attack;
                        self.env_phase = 0.0;
                    }
                    EnvStage::Attack => {
                        self.env_state = EnvStage::Hold;
                        self.env_phase = 0.0;
                    }
                    EnvStage::Hold => {
                        self.env_state = EnvStage::Decay;
                        self.env_phase = 0.0;
                    }
                    EnvStage::Decay => {
                        self.env_state = EnvStage::Stuck;
                        self.env_phase = 0.0;
                        self.env_val = p.sustain;
                    }
                    EnvStage::Release => {
                        self.env_state = EnvStage::Stuck;
                        self.env_phase = 0.0;
                        self.env_val = 0.0;
                    }
                    EnvStage::MsegRelease | EnvStage::Stuck => {}
                }
            }

            match self.env_state {
                EnvStage::Delay => self.env_val = 0.0,
                EnvStage::Attack => self.env_val = self.env_phase,
                EnvStage::Hold => self.env_val = 1.0,
                EnvStage::Decay => {
                    self.env_val = (1.0 - self.env_phase) + self.env_phase * p.sustain;
                }
                EnvStage::Release => {
                    self.env_val = (1.0 - self.env_phase) * self.env_releasestart;
                }
                EnvStage::MsegRelease | EnvStage::Stuck => {}
            }
        }

        if self.phase >= 1.0 || self.phase < 0.0 {
            if self.phase >= 2.0 {
                // Fast rates can cross several cycles per block; extract
                // all of them at once instead of looping.
                let ipart = self.phase.floor();
                self.phase -= ipart;
                self.int_phase += ipart as i32;
            } else if self.phase < 0.0 {
                let ip = self.phase as i32 - 1;
                let np = self.phase - ip as f32;
                if (0.0..1.0).contains(&np) {
                    self.phase = np;
                    self.int_phase += ip;
                } else {
                    self.phase = 0.0;
                }
            } else {
                self.phase -= 1.0;
                self.int_phase += 1;
            }

            match p.shape {
                LfoShape::SampleHold => {
                    let df = p.deform;
                    self.iout = self.corr_noise(df);
                }
                LfoShape::Noise => {
                    let df = p.deform;
                    let fresh = self.corr_noise(df);
                    self.wf_history.copy_within(0..3, 1);
                    self.wf_history[0] = fresh;
                }
                LfoShape::StepSeq => {
                    self.apply_trigmask(self.step);
                    self.advance_step();
                    self.update_shuffle();
                    self.wf_history.copy_within(0..3, 1);
                    self.wf_history[0] = self.step_at(self.step);
                }
                _ => {}
            }
        }

        let mut useenvval = self.env_val;
        if p.delay_deactivated {
            useenvval = 1.0;
        }

        let iout = match p.shape {
            LfoShape::Sine => sine_kernel(self.phase, p.deform),
            LfoShape::Triangle => triangle_kernel(self.phase, p.deform),
            LfoShape::Ramp => ramp_kernel(self.phase, p.deform),
            LfoShape::Square => square_kernel(self.phase, p.deform),
            LfoShape::SampleHold => self.iout,
            LfoShape::Noise => cubic_interpolate(
                self.wf_history[3],
                self.wf_history[2],
                self.wf_history[1],
                self.wf_history[0],
                self.phase,
            ),
            LfoShape::StepSeq => {
                let mut calc_phase = self.phase;

                if frate == 0.0 {
                    // Scrub: the phase knob sweeps the whole sequence, so
                    // map it onto the loop and interpolate inside the step.
                    let p16 = self.phase * N_STEPS as f32;
                    let mut pstep = p16 as i32 & (N_STEPS as i32 - 1);
                    let sphase = p16 - (p16 as i32) as f32;

                    let last_step = self.steps.loop_end.max(self.steps.loop_start);
                    let loop_len = (self.steps.loop_end - self.steps.loop_start).abs() + 1;
                    while pstep > last_step && pstep >= 0 {
                        pstep -= loop_len;
                    }
                    pstep &= N_STEPS as i32 - 1;

                    if pstep != self.prior_step {
                        self.prior_step = pstep;
                        self.apply_trigmask(pstep);
                    }

                    if self.prior_phase != self.phase {
                        self.prior_phase = self.phase;
                        for i in 0..4 {
                            self.wf_history[i] = self.step_at(pstep + 1 - i as i32);
                        }
                    }

                    calc_phase = sphase;
                }

                step_morph(&self.wf_history, calc_phase, p.deform)
            }
            LfoShape::Envelope => (1.0 - p.deform) + p.deform * self.env_val,
            LfoShape::Mseg => {
                self.mseg_state.released = matches!(
                    self.env_state,
                    EnvStage::Release | EnvStage::MsegRelease
                );
                let v = mseg::evaluator::value_at(
                    self.int_phase,
                    self.phase,
                    p.deform,
                    &self.mseg,
                    &mut self.mseg_state,
                    false,
                );
                self.retrigger_feg = self.mseg_state.retrigger_feg;
                self.retrigger_aeg = self.mseg_state.retrigger_aeg;
                v
            }
            LfoShape::Formula => {
                let released = matches!(
                    self.env_state,
                    EnvStage::Release | EnvStage::MsegRelease
                );
                match self.formula.as_mut() {
                    Some(f) => {
                        let v = f.value_at(self.int_phase, self.phase, p.deform, released);
                        if !f.uses_envelope() {
                            useenvval = 1.0;
                        }
                        let (feg, aeg) = f.retrigger_flags();
                        self.retrigger_feg |= feg;
                        self.retrigger_aeg |= aeg;
                        v
                    }
                    None => 0.0,
                }
            }
        };

        let mut io2 = iout;
        if p.unipolar {
            if p.shape != LfoShape::StepSeq {
                io2 = 0.5 + 0.5 * io2;
            } else if io2 < 0.0 {
                // Step values are authored in [-1, 1]; unipolar just
                // gates out the negative ones rather than remapping.
                io2 = 0.0;
            }
        }

        let magn = p.magnitude.clamp(-3.0, 3.0);
        self.output = useenvval * magn * io2;
        self.raw_output = if p.shape == LfoShape::Envelope {
            io2 * useenvval
        } else {
            io2
        };
    }

    fn output(&self) -> f32 {
        self.output
    }

    fn kind(&self) -> ModSourceKind {
        ModSourceKind::Lfo
    }

    fn per_voice(&self) -> bool {
        true
    }

    fn is_bipolar(&self) -> bool {
        !self.params.unipolar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BlockContext {
        BlockContext::new(48_000.0)
    }

    fn bypassed(shape: LfoShape) -> LfoParams {
        LfoParams {
            shape,
            delay_deactivated: true,
            ..LfoParams::default()
        }
    }

    #[test]
    fn bend_is_identity_at_zero_deform() {
        for x in [-1.0, -0.5, 0.0, 0.3, 1.0] {
            assert_eq!(bend1(x, 0.0), x);
        }
    }

    #[test]
    fn sine_reproduces_base_kernel_at_zero_deform() {
        let mut lfo = LfoGenerator::new(bypassed(LfoShape::Sine));
        lfo.attack();
        let c = ctx();
        for _ in 0..200 {
            lfo.process_block(&c);
            let expected = (std::f32::consts::TAU * lfo.phase).sin();
            assert!(
                (lfo.output() - expected).abs() < 1e-5,
                "deform 0 must be the pure sine, got {} want {}",
                lfo.output(),
                expected
            );
            assert!(lfo.output().abs() <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn deformed_kernels_stay_bounded() {
        for shape in [LfoShape::Sine, LfoShape::Triangle, LfoShape::Ramp] {
            for df in [-1.0, 1.0] {
                let mut p = bypassed(shape);
                p.deform = df;
                let mut lfo = LfoGenerator::new(p);
                lfo.attack();
                let c = ctx();
                for _ in 0..500 {
                    lfo.process_block(&c);
                    assert!(
                        lfo.output().abs() <= 1.0 + 1e-5,
                        "{shape:?} deform {df} escaped range: {}",
                        lfo.output()
                    );
                }
            }
        }
    }

    #[test]
    fn square_deform_moves_pulse_width() {
        assert_eq!(square_kernel(0.6, 0.0), -1.0);
        assert_eq!(square_kernel(0.6, 0.5), 1.0);
        assert_eq!(square_kernel(0.8, 0.5), -1.0);
    }

    #[test]
    fn unipolar_sine_stays_in_unit_interval() {
        let mut p = bypassed(LfoShape::Sine);
        p.unipolar = true;
        let mut lfo = LfoGenerator::new(p);
        lfo.attack();
        let c = ctx();
        for _ in 0..500 {
            lfo.process_block(&c);
            assert!(
                (0.0..=1.0).contains(&lfo.output()),
                "unipolar output escaped: {}",
                lfo.output()
            );
        }
    }

    #[test]
    fn multi_cycle_phase_advance_wraps_in_one_block() {
        // 2^13 Hz at 48k with 32-sample blocks crosses several cycles per
        // block; the wrap must extract all of them at once.
        let mut p = bypassed(LfoShape::Sine);
        p.rate = 13.0;
        let mut lfo = LfoGenerator::new(p);
        lfo.attack();
        let c = ctx();
        let mut last_ip = 0;
        for _ in 0..20 {
            lfo.process_block(&c);
            assert!((0.0..1.0).contains(&lfo.phase), "phase {}", lfo.phase);
            assert!(lfo.int_phase >= last_ip);
            last_ip = lfo.int_phase;
        }
        assert!(last_ip > 20, "multiple wraps per block expected");
    }

    #[test]
    fn negative_start_phase_wraps_into_range() {
        let mut p = bypassed(LfoShape::Ramp);
        p.start_phase = -6.02;
        let mut lfo = LfoGenerator::new(p);
        lfo.attack();
        assert!((0.0..1.0).contains(&lfo.phase), "phase {}", lfo.phase);
        assert!((lfo.phase - 0.98).abs() < 1e-4);
    }

    #[test]
    fn trigmask_bitplanes_raise_the_right_flags() {
        let mut p = bypassed(LfoShape::StepSeq);
        p.rate = 11.0; // wrap every block
        let mut lfo = LfoGenerator::new(p);
        // Step 0 -> both, step 1 -> filter only, step 2 -> amp only.
        lfo.set_step_sequence(StepSequence {
            trigmask: 1 | (1 << (16 + 1)) | (1 << (32 + 2)),
            loop_start: 0,
            loop_end: 3,
            ..StepSequence::default()
        });
        lfo.attack();
        let c = ctx();

        let mut seen = Vec::new();
        for _ in 0..8 {
            let before = lfo.step;
            lfo.process_block(&c);
            if lfo.step != before {
                seen.push((before, lfo.retrigger_flags()));
            }
        }
        for (step, (feg, aeg)) in seen {
            match step {
                0 => assert!(feg && aeg, "step 0 retriggers both"),
                1 => assert!(feg && !aeg, "step 1 is filter-only"),
                2 => assert!(!feg && aeg, "step 2 is amp-only"),
                _ => assert!(!feg && !aeg, "step {step} has no trigger bits"),
            }
        }
    }

    #[test]
    fn step_unipolar_gates_negative_steps_to_zero() {
        let mut p = bypassed(LfoShape::StepSeq);
        p.unipolar = true;
        p.rate = 8.0;
        let mut lfo = LfoGenerator::new(p);
        let mut seq = StepSequence::default();
        seq.steps[0] = -1.0;
        seq.steps[1] = 0.5;
        seq.loop_end = 1;
        lfo.set_step_sequence(seq);
        lfo.attack();
        let c = ctx();
        for _ in 0..64 {
            lfo.process_block(&c);
            assert!(lfo.output() >= 0.0, "negative step leaked: {}", lfo.output());
            assert!(lfo.output() <= 0.5 + 1e-5);
        }
    }

    #[test]
    fn scrub_mode_selects_steps_from_the_phase_knob() {
        let mut p = bypassed(LfoShape::StepSeq);
        p.rate_deactivated = true;
        p.trigger_mode = TriggerMode::KeyTrigger;
        let mut seq = StepSequence::default();
        for (i, s) in seq.steps.iter_mut().enumerate() {
            *s = i as f32 / 15.0;
        }
        let c = ctx();

        // Hold the scrub knob in the middle of step 5 and of step 12.
        for (knob, want) in [(5.5 / 16.0, seq.steps[5]), (12.5 / 16.0, seq.steps[12])] {
            p.start_phase = knob;
            let mut lfo = LfoGenerator::new(p);
            lfo.set_step_sequence(seq);
            lfo.attack();
            lfo.process_block(&c);
            lfo.process_block(&c);
            assert!(
                (lfo.output() - want).abs() < 1e-5,
                "scrub at {knob} read {} want {want}",
                lfo.output()
            );
        }
    }

    #[test]
    fn envelope_cascade_skips_zero_length_stages() {
        let mut p = bypassed(LfoShape::Envelope);
        p.delay = ENV_TIME_MIN;
        p.attack = ENV_TIME_MIN;
        p.hold = ENV_TIME_MIN;
        p.decay = 2.0;
        p.sustain = 0.5;
        p.delay_deactivated = false;
        p.deform = 1.0; // output the raw envelope
        let mut lfo = LfoGenerator::new(p);
        lfo.attack();
        assert_eq!(lfo.env_state, EnvStage::Decay);
        assert_eq!(lfo.env_output(), 1.0);
        let c = ctx();
        lfo.process_block(&c);
        assert!(lfo.env_output() < 1.0 && lfo.env_output() > 0.5);
    }

    #[test]
    fn envelope_release_decays_to_zero_and_sticks() {
        let mut p = bypassed(LfoShape::Envelope);
        p.delay_deactivated = false;
        p.attack = ENV_TIME_MIN;
        p.delay = ENV_TIME_MIN;
        p.hold = 2.0;
        p.release = -6.0;
        p.deform = 1.0;
        let mut lfo = LfoGenerator::new(p);
        lfo.attack();
        let c = ctx();
        lfo.process_block(&c);
        assert_eq!(lfo.env_output(), 1.0, "holding at full level");

        lfo.release();
        for _ in 0..2000 {
            lfo.process_block(&c);
        }
        assert_eq!(lfo.env_output(), 0.0);
        assert_eq!(lfo.env_state, EnvStage::Stuck);
        assert_eq!(lfo.output(), 0.0);
    }

    #[test]
    fn free_run_voices_agree_on_phase() {
        let mut p = bypassed(LfoShape::Sine);
        p.trigger_mode = TriggerMode::FreeRun;
        p.rate = 1.5;
        let c = ctx().with_tempo(1.25);
        let c = BlockContext { song_pos: 16.5, ..c };

        let mut a = LfoGenerator::new(p);
        let mut b = LfoGenerator::new(p);
        a.attack();
        // Simulate b being gated later: same song position, fresh attack.
        b.attack();
        a.process_block(&c);
        b.process_block(&c);
        assert!(
            (a.phase - b.phase).abs() < 1e-6,
            "free-running voices must phase-lock: {} vs {}",
            a.phase,
            b.phase
        );
        assert_eq!(a.int_phase, b.int_phase);
    }

    #[test]
    fn display_instance_is_reproducible_across_attacks() {
        let mut p = bypassed(LfoShape::SampleHold);
        p.rate = 6.0;
        let c = ctx();

        let run = || {
            let mut lfo = LfoGenerator::new_display(p);
            lfo.attack();
            let mut out = Vec::new();
            for _ in 0..32 {
                lfo.process_block(&c);
                out.push(lfo.output());
            }
            out
        };
        assert_eq!(run(), run(), "fixed seeds make previews deterministic");
    }

    #[test]
    fn live_instances_differ_between_attacks() {
        let mut p = bypassed(LfoShape::SampleHold);
        p.rate = 6.0;
        let c = ctx();
        let mut lfo = LfoGenerator::new(p);

        let mut run = || {
            lfo.attack();
            let mut out = Vec::new();
            for _ in 0..32 {
                lfo.process_block(&c);
                out.push(lfo.output());
            }
            out
        };
        assert_ne!(run(), run(), "each gate draws a fresh random sequence");
    }

    #[test]
    fn magnitude_is_clamped_to_extended_range() {
        let mut p = bypassed(LfoShape::Square);
        p.magnitude = 10.0;
        let mut lfo = LfoGenerator::new(p);
        lfo.attack();
        lfo.process_block(&ctx());
        assert!((lfo.output().abs() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn mseg_shape_tracks_the_default_cycle() {
        let mut p = bypassed(LfoShape::Mseg);
        p.rate = 2.0;
        let mut lfo = LfoGenerator::new(p);
        let mut ms = MsegStorage::empty();
        crate::mseg::edit::create_default_cycle(&mut ms);
        lfo.set_mseg(ms);
        lfo.attack();
        let c = ctx();
        let mut peak = -2.0f32;
        let mut trough = 2.0f32;
        for _ in 0..2000 {
            lfo.process_block(&c);
            peak = peak.max(lfo.output());
            trough = trough.min(lfo.output());
        }
        assert!(peak > 0.9, "cycle reaches its +1 node, peak {peak}");
        assert!(trough < -0.9, "cycle reaches its -1 node, trough {trough}");
    }

    struct ConstantFormula(f32);

    impl FormulaSource for ConstantFormula {
        fn value_at(&mut self, _ip: i32, _phase: f32, _df: f32, _released: bool) -> f32 {
            self.0
        }
        fn uses_envelope(&self) -> bool {
            false
        }
    }

    #[test]
    fn formula_hook_bypasses_envelope_when_asked() {
        let p = LfoParams {
            shape: LfoShape::Formula,
            delay: 2.0, // a long delay would otherwise hold the envelope at 0
            ..LfoParams::default()
        };
        let mut lfo = LfoGenerator::new(p);
        lfo.set_formula(Box::new(ConstantFormula(0.75)));
        lfo.attack();
        lfo.process_block(&ctx());
        assert!(
            (lfo.output() - 0.75).abs() < 1e-6,
            "source opted out of the envelope, got {}",
            lfo.output()
        );
    }
}
