//! Per-voice control and audio assembly.
//!
//! Once per block a voice advances its modulation sources (LFO 1 first,
//! unconditionally, because its step-sequencer trigger mask can retrigger
//! the envelopes), rebuilds its local parameter copy from the base values
//! plus the routing table, resolves portamento and pitch, mixes the
//! oscillator/ring/noise channels, and stages the result into its assigned
//! lane of the shared filter chain with per-sample interpolation targets.
//! The chain's per-lane filter registers are read back after the kernel
//! runs so a voice keeps its filter state even when the lane backing store
//! is reused by another voice in between.

pub mod oscillator;
pub mod params;
pub mod portamento;

pub use oscillator::{FmMode, OscillatorSource, SineSource};
pub use params::{apply_routes, Dest, ModRoute, ParamPool, RouteSource};
pub use portamento::{Glide, GlideCurve, GlideOptions};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::dsp::{
    amp_to_linear, db_to_linear, pan_left, pan_right, pitch_to_hz, CorrelatedNoise, DenormalGuard,
    LagSmoother,
};
use crate::filterchain::{
    ChainTopology, FilterModel, LaneControlTargets, LaneRegisters, QuadChainState,
    SvfCoefficients, WaveshaperKind,
};
use crate::modulation::envelope::{AdsrEnvelope, AdsrParams};
use crate::modulation::lfo::{LfoGenerator, LfoParams, StepSequence};
use crate::modulation::{BlockContext, ModulationSource};
use crate::BLOCK_SIZE;

/// Per-voice LFO slots. LFO 1 owns the step-sequencer trigger mask.
pub const N_VOICE_LFOS: usize = 2;

/// Mixer channels feeding the filter lane.
pub const N_MIX_CHANNELS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixChannel {
    Osc1,
    Osc2,
    Osc3,
    Ring12,
    Ring23,
    Noise,
}

impl MixChannel {
    fn level_dest(self) -> Dest {
        match self {
            MixChannel::Osc1 => Dest::OscLevel1,
            MixChannel::Osc2 => Dest::OscLevel2,
            MixChannel::Osc3 => Dest::OscLevel3,
            MixChannel::Ring12 => Dest::RingLevel12,
            MixChannel::Ring23 => Dest::RingLevel23,
            MixChannel::Noise => Dest::NoiseLevel,
        }
    }
}

const MIX_CHANNELS: [MixChannel; N_MIX_CHANNELS] = [
    MixChannel::Osc1,
    MixChannel::Osc2,
    MixChannel::Osc3,
    MixChannel::Ring12,
    MixChannel::Ring23,
    MixChannel::Noise,
];

/// Which side(s) of the filter lane input a mixer channel feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelRoute {
    Left,
    #[default]
    Both,
    Right,
}

/// Static per-note configuration, captured from the patch at note-on.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub topology: ChainTopology,
    pub filter_a: FilterModel,
    pub filter_b: FilterModel,
    pub waveshaper: WaveshaperKind,
    /// Cutoff keytracking in semitones per semitone, per filter.
    pub keytrack_a: f32,
    pub keytrack_b: f32,
    /// Treat filter B's cutoff as an offset from A's final cutoff.
    pub cutoff_b_is_offset: bool,
    /// Filter B reuses filter A's resonance.
    pub link_resonance: bool,
    /// Key the keytracking and cutoff tracking are centered on.
    pub keytrack_root: f32,
    pub octave: i32,
    /// Pitch-bend range in semitones, each direction.
    pub bend_range_up: f32,
    pub bend_range_down: f32,
    pub fm_mode: FmMode,
    pub channel_active: [bool; N_MIX_CHANNELS],
    pub channel_route: [ChannelRoute; N_MIX_CHANNELS],
    /// Decorrelate the noise channel's right side.
    pub stereo_noise: bool,
    pub glide: GlideOptions,
    /// Retrigger the envelopes from their current level instead of zero.
    pub retrigger_from_current: bool,
    pub amp_env: AdsrParams,
    pub filter_env: AdsrParams,
    pub lfo: [LfoParams; N_VOICE_LFOS],
    pub lfo_steps: [StepSequence; N_VOICE_LFOS],
}

impl Default for VoiceConfig {
    fn default() -> Self {
        let mut channel_active = [false; N_MIX_CHANNELS];
        channel_active[MixChannel::Osc1 as usize] = true;
        Self {
            topology: ChainTopology::Serial1,
            filter_a: FilterModel::Lp12,
            filter_b: FilterModel::Off,
            waveshaper: WaveshaperKind::Off,
            keytrack_a: 0.0,
            keytrack_b: 0.0,
            cutoff_b_is_offset: false,
            link_resonance: false,
            keytrack_root: 60.0,
            octave: 0,
            bend_range_up: 2.0,
            bend_range_down: 2.0,
            fm_mode: FmMode::Off,
            channel_active,
            channel_route: [ChannelRoute::Both; N_MIX_CHANNELS],
            stereo_noise: false,
            glide: GlideOptions::default(),
            retrigger_from_current: true,
            amp_env: AdsrParams::default(),
            filter_env: AdsrParams::default(),
            lfo: [LfoParams::default(); N_VOICE_LFOS],
            lfo_steps: [StepSequence::default(); N_VOICE_LFOS],
        }
    }
}

/// Mutable per-note state the lifecycle manager inspects.
#[derive(Debug, Clone, Copy)]
pub struct VoiceState {
    pub key: i32,
    pub velocity: f32,
    pub channel: u8,
    pub gate: bool,
    /// Cleared once the amp envelope reports idle; the voice manager
    /// reclaims the slot.
    pub keep_playing: bool,
    pub uber_release: bool,
    /// Pitch-bend position in [-1, 1].
    pub pitch_bend: f32,
    /// Gliding key, before bend/octave/pitch offsets.
    pub pkey: f32,
    /// Final per-voice pitch in MIDI note units.
    pub pitch: f32,
    /// Keytrack output: (pitch - root) / 12.
    pub keytrack: f32,
}

/// One polyphonic voice. The voice owns its modulation sources and scratch
/// buffers; the routing table, controller values and the shared chain are
/// passed in per block.
pub struct Voice {
    pub state: VoiceState,
    config: VoiceConfig,
    params: ParamPool,
    local: ParamPool,

    amp_eg: AdsrEnvelope,
    filter_eg: AdsrEnvelope,
    lfos: [LfoGenerator; N_VOICE_LFOS],
    glide: Glide,

    oscillators: [Option<Box<dyn OscillatorSource>>; 3],
    osc_l: [[f32; BLOCK_SIZE]; 3],
    osc_r: [[f32; BLOCK_SIZE]; 3],
    fm_buffer: [f32; BLOCK_SIZE],

    levels: [LagSmoother; N_MIX_CHANNELS],
    level_now: [f32; N_MIX_CHANNELS],
    pfg: LagSmoother,
    pfg_now: f32,

    rng: SmallRng,
    noise_l: CorrelatedNoise,
    noise_r: CorrelatedNoise,
    noise_hold: (f32, f32),
    guard_l: DenormalGuard,
    guard_r: DenormalGuard,

    registers: LaneRegisters,
    prev_controls: LaneControlTargets,
    prev_out: [f32; 4],
    prev_coeff: [SvfCoefficients; 2],
    first_block: bool,
    age: u32,
}

impl Voice {
    /// Start a voice. `glide_from` is the previous key for legato
    /// portamento; `None` starts at the target key. `seed` feeds the
    /// voice-owned noise RNG so renders are reproducible.
    pub fn new(
        config: VoiceConfig,
        params: ParamPool,
        key: i32,
        velocity: f32,
        channel: u8,
        glide_from: Option<f32>,
        seed: u64,
    ) -> Self {
        let state = VoiceState {
            key,
            velocity: velocity.clamp(0.0, 1.0),
            channel,
            gate: true,
            keep_playing: true,
            uber_release: false,
            pitch_bend: 0.0,
            pkey: glide_from.unwrap_or(key as f32),
            pitch: key as f32,
            keytrack: 0.0,
        };
        let glide = match glide_from {
            Some(from) => Glide::new(from),
            None => Glide::finished(),
        };

        let mut amp_eg = AdsrEnvelope::new(config.amp_env);
        let mut filter_eg = AdsrEnvelope::new(config.filter_env);
        amp_eg.attack_from(0.0);
        filter_eg.attack_from(0.0);

        let mut lfos = [
            LfoGenerator::new(config.lfo[0]),
            LfoGenerator::new(config.lfo[1]),
        ];
        for (lfo, steps) in lfos.iter_mut().zip(config.lfo_steps.iter()) {
            lfo.set_step_sequence(*steps);
            lfo.attack();
        }

        let mut levels = [LagSmoother::new(0.25); N_MIX_CHANNELS];
        let mut level_now = [0.0; N_MIX_CHANNELS];
        for (i, ch) in MIX_CHANNELS.iter().enumerate() {
            let v = amp_to_linear(params[ch.level_dest()]);
            levels[i].set_instant(v);
            level_now[i] = v;
        }
        let mut pfg = LagSmoother::new(0.25);
        let pfg_now = db_to_linear(params[Dest::PreFilterGain]);
        pfg.set_instant(pfg_now);

        Self {
            state,
            config,
            params,
            local: params,
            amp_eg,
            filter_eg,
            lfos,
            glide,
            oscillators: [None, None, None],
            osc_l: [[0.0; BLOCK_SIZE]; 3],
            osc_r: [[0.0; BLOCK_SIZE]; 3],
            fm_buffer: [0.0; BLOCK_SIZE],
            levels,
            level_now,
            pfg,
            pfg_now,
            rng: SmallRng::seed_from_u64(seed),
            noise_l: CorrelatedNoise::new(),
            noise_r: CorrelatedNoise::new(),
            noise_hold: (0.0, 0.0),
            guard_l: DenormalGuard::new(),
            guard_r: DenormalGuard::new(),
            registers: initial_registers(),
            prev_controls: LaneControlTargets::default(),
            prev_out: [0.0; 4],
            prev_coeff: [SvfCoefficients::default(); 2],
            first_block: true,
            age: 0,
        }
    }

    pub fn set_oscillator(&mut self, slot: usize, osc: Box<dyn OscillatorSource>) {
        if slot < self.oscillators.len() {
            self.oscillators[slot] = Some(osc);
        }
    }

    pub fn set_pitch_bend(&mut self, bend: f32) {
        self.state.pitch_bend = bend.clamp(-1.0, 1.0);
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn params_mut(&mut self) -> &mut ParamPool {
        &mut self.params
    }

    /// Post-routing value of one destination, as of the last block.
    pub fn local_value(&self, dest: Dest) -> f32 {
        self.local[dest]
    }

    pub fn amp_eg(&self) -> &AdsrEnvelope {
        &self.amp_eg
    }

    pub fn filter_eg(&self) -> &AdsrEnvelope {
        &self.filter_eg
    }

    pub fn lfo(&self, i: usize) -> Option<&LfoGenerator> {
        self.lfos.get(i)
    }

    pub fn lfo_mut(&mut self, i: usize) -> Option<&mut LfoGenerator> {
        self.lfos.get_mut(i)
    }

    /// Blocks rendered since note-on, for steal-priority decisions.
    pub fn age(&self) -> u32 {
        self.age
    }

    /// Drop the gate. Envelopes enter release; LFO sub-envelopes release.
    pub fn release(&mut self) {
        self.state.gate = false;
        self.amp_eg.release();
        self.filter_eg.release();
        for lfo in &mut self.lfos {
            lfo.release();
        }
    }

    /// Fixed fast release for voice stealing.
    pub fn uber_release(&mut self) {
        if self.state.uber_release {
            return;
        }
        self.state.uber_release = true;
        self.state.gate = false;
        self.amp_eg.uber_release();
        self.filter_eg.uber_release();
        for lfo in &mut self.lfos {
            lfo.release();
        }
    }

    /// Render one block into `lane` of the shared chain. Returns false once
    /// the voice can be reclaimed; the lane is then masked out and cleared.
    pub fn process_block(
        &mut self,
        ctx: &BlockContext,
        routes: &[ModRoute],
        mono: &[f32],
        chain: &mut QuadChainState,
        lane: usize,
    ) -> bool {
        self.process_control_block(ctx, routes, mono);
        if !self.state.keep_playing {
            chain.set_lane_active(lane, false);
            chain.clear_lane_input(lane);
            return false;
        }
        self.assemble_audio(ctx, chain, lane);
        self.populate_lane(ctx, chain, lane);
        self.first_block = false;
        self.age += 1;
        true
    }

    /// Copy the lane's filter registers back after the chain kernel ran.
    pub fn fetch_lane(&mut self, chain: &QuadChainState, lane: usize) {
        self.registers = chain.read_lane(lane);
    }

    fn process_control_block(&mut self, ctx: &BlockContext, routes: &[ModRoute], mono: &[f32]) {
        // LFO 1 first: its block may raise envelope retrigger requests.
        self.lfos[0].process_block(ctx);
        let (retrig_feg, retrig_aeg) = self.lfos[0].retrigger_flags();
        for lfo in &mut self.lfos[1..] {
            lfo.process_block(ctx);
        }

        if retrig_aeg {
            let from = self.retrigger_level(self.amp_eg.output());
            self.amp_eg.retrigger_from(from);
        }
        if retrig_feg {
            let from = self.retrigger_level(self.filter_eg.output());
            self.filter_eg.retrigger_from(from);
        }

        self.amp_eg.process_block(ctx);
        self.filter_eg.process_block(ctx);
        if self.amp_eg.is_idle() {
            self.state.keep_playing = false;
        }

        let mut local = self.params;
        apply_routes(&mut local, routes, |source| self.source_output(source, mono));
        self.local = local;

        let (pkey, gliss_retrig) = self.glide.update(
            &self.config.glide,
            self.local[Dest::PortamentoTime],
            self.state.key as f32,
            ctx,
        );
        self.state.pkey = pkey;
        if gliss_retrig {
            let amp_from = self.retrigger_level(self.amp_eg.output());
            let flt_from = self.retrigger_level(self.filter_eg.output());
            self.amp_eg.retrigger_from(amp_from);
            self.filter_eg.retrigger_from(flt_from);
        }

        let bend = if self.state.pitch_bend >= 0.0 {
            self.state.pitch_bend * self.config.bend_range_up
        } else {
            self.state.pitch_bend * self.config.bend_range_down
        };
        self.state.pitch =
            self.state.pkey + bend + self.local[Dest::Pitch] + 12.0 * self.config.octave as f32;
        self.state.keytrack = (self.state.pitch - self.config.keytrack_root) / 12.0;

        for (i, ch) in MIX_CHANNELS.iter().enumerate() {
            self.levels[i].set_target(amp_to_linear(self.local[ch.level_dest()]));
            self.level_now[i] = self.levels[i].process();
        }
        self.pfg.set_target(db_to_linear(self.local[Dest::PreFilterGain]));
        self.pfg_now = self.pfg.process();
    }

    fn retrigger_level(&self, current: f32) -> f32 {
        if self.config.retrigger_from_current {
            current
        } else {
            0.0
        }
    }

    fn source_output(&self, source: RouteSource, mono: &[f32]) -> f32 {
        match source {
            RouteSource::AmpEg => self.amp_eg.output(),
            RouteSource::FilterEg => self.filter_eg.output(),
            RouteSource::Lfo(i) => self.lfos.get(i).map(|l| l.output()).unwrap_or(0.0),
            RouteSource::Controller(i) => mono.get(i).copied().unwrap_or(0.0),
        }
    }

    fn assemble_audio(&mut self, ctx: &BlockContext, chain: &mut QuadChainState, lane: usize) {
        let active = &self.config.channel_active;
        let fm = self.config.fm_mode;
        let stereo = matches!(self.config.topology, ChainTopology::Stereo | ChainTopology::Wide);
        let pitch = self.state.pitch;
        let fm_depth = db_to_linear(self.local[Dest::FmDepth]);

        let need3 = active[MixChannel::Osc3 as usize]
            || active[MixChannel::Ring23 as usize]
            || fm.uses_osc3();
        let need2 = active[MixChannel::Osc2 as usize]
            || active[MixChannel::Ring12 as usize]
            || active[MixChannel::Ring23 as usize]
            || fm.uses_osc2();
        let need1 = active[MixChannel::Osc1 as usize] || active[MixChannel::Ring12 as usize];

        // Modulators render before their carriers: 3, then 2, then 1.
        if need3 {
            if let Some(osc) = self.oscillators[2].as_mut() {
                osc.process_block(pitch, None, stereo, ctx);
                self.osc_l[2] = *osc.output();
                self.osc_r[2] = *osc.output_r();
            }
        }
        if need2 {
            let fm2 = if fm == FmMode::ThreeToTwoToOne {
                Some((&self.osc_l[2], fm_depth))
            } else {
                None
            };
            if let Some(osc) = self.oscillators[1].as_mut() {
                osc.process_block(pitch, fm2, stereo, ctx);
                self.osc_l[1] = *osc.output();
                self.osc_r[1] = *osc.output_r();
            }
        }
        if need1 {
            if fm == FmMode::TwoAndThreeToOne {
                for k in 0..BLOCK_SIZE {
                    self.fm_buffer[k] = self.osc_l[1][k] + self.osc_l[2][k];
                }
            }
            let fm1 = match fm {
                FmMode::Off => None,
                FmMode::TwoToOne | FmMode::ThreeToTwoToOne => Some((&self.osc_l[1], fm_depth)),
                FmMode::TwoAndThreeToOne => Some((&self.fm_buffer, fm_depth)),
            };
            if let Some(osc) = self.oscillators[0].as_mut() {
                osc.process_block(pitch, fm1, stereo, ctx);
                self.osc_l[0] = *osc.output();
                self.osc_r[0] = *osc.output_r();
            }
        }

        let color = self.local[Dest::NoiseColor].clamp(-1.0, 1.0);
        let noise_active = active[MixChannel::Noise as usize];

        for k in 0..BLOCK_SIZE {
            // The noise generator runs at half rate; sample pairs match.
            if noise_active && k % 2 == 0 {
                let white = self.rng.random_range(-1.0..=1.0);
                let nl = self.noise_l.next(color, white);
                let nr = if self.config.stereo_noise {
                    let white = self.rng.random_range(-1.0..=1.0);
                    self.noise_r.next(color, white)
                } else {
                    nl
                };
                self.noise_hold = (nl, nr);
            }

            let samples: [(f32, f32); N_MIX_CHANNELS] = [
                (self.osc_l[0][k], self.osc_r[0][k]),
                (self.osc_l[1][k], self.osc_r[1][k]),
                (self.osc_l[2][k], self.osc_r[2][k]),
                (
                    self.osc_l[0][k] * self.osc_l[1][k],
                    self.osc_r[0][k] * self.osc_r[1][k],
                ),
                (
                    self.osc_l[1][k] * self.osc_l[2][k],
                    self.osc_r[1][k] * self.osc_r[2][k],
                ),
                self.noise_hold,
            ];

            let mut l = 0.0;
            let mut r = 0.0;
            for (i, &(sl, sr)) in samples.iter().enumerate() {
                if !active[i] {
                    continue;
                }
                let g = self.level_now[i];
                match self.route_for(self.config.channel_route[i]) {
                    ChannelRoute::Left => l += g * sl,
                    ChannelRoute::Right => r += g * sr,
                    ChannelRoute::Both => {
                        l += g * sl;
                        r += g * sr;
                    }
                }
            }

            chain.dl[k].set(lane, self.guard_l.apply(l * self.pfg_now));
            chain.dr[k].set(lane, self.guard_r.apply(r * self.pfg_now));
        }
    }

    /// In the serial topologies the right lane input joins the chain after
    /// filter A, so "both" collapses onto the left input.
    fn route_for(&self, route: ChannelRoute) -> ChannelRoute {
        match (self.config.topology, route) {
            (
                ChainTopology::Serial1 | ChainTopology::Serial2 | ChainTopology::Serial3,
                ChannelRoute::Both,
            ) => ChannelRoute::Left,
            _ => route,
        }
    }

    fn populate_lane(&mut self, ctx: &BlockContext, chain: &mut QuadChainState, lane: usize) {
        chain.set_lane_active(lane, true);

        // All lanes of one chain share models/waveshaper by contract; the
        // voice re-asserts them from its own config.
        chain.units[0].model = self.config.filter_a;
        chain.units[1].model = self.config.filter_b;
        chain.ws = self.config.waveshaper;

        let feg = self.filter_eg.output();
        let key_off = self.state.pitch - self.config.keytrack_root;
        let env_semis = self.local[Dest::EnvModDepth] * feg;
        let cutoff_a = self.local[Dest::CutoffA] + self.config.keytrack_a * key_off + env_semis;
        let cutoff_b = if self.config.cutoff_b_is_offset {
            cutoff_a + self.local[Dest::CutoffB]
        } else {
            self.local[Dest::CutoffB] + self.config.keytrack_b * key_off + env_semis
        };
        let reso_a = self.local[Dest::ResonanceA].clamp(0.0, 1.0);
        let reso_b = if self.config.link_resonance {
            reso_a
        } else {
            self.local[Dest::ResonanceB].clamp(0.0, 1.0)
        };

        let co = [
            SvfCoefficients::calculate(
                self.config.filter_a,
                pitch_to_hz(cutoff_a),
                reso_a,
                ctx.sample_rate_inv,
            ),
            SvfCoefficients::calculate(
                self.config.filter_b,
                pitch_to_hz(cutoff_b),
                reso_b,
                ctx.sample_rate_inv,
            ),
        ];
        let wide = self.config.topology == ChainTopology::Wide;
        for unit in 0..2 {
            let mut slots = [unit, usize::MAX];
            if wide {
                // The right-side pair mirrors the left coefficients.
                chain.units[unit + 2].model = chain.units[unit].model;
                slots[1] = unit + 2;
            }
            for &slot in slots.iter().filter(|&&s| s != usize::MAX) {
                if self.first_block {
                    chain.units[slot].reset_lane(lane, &co[unit]);
                } else {
                    chain.units[slot].reset_lane(lane, &self.prev_coeff[unit]);
                    chain.units[slot].set_lane_coefficients(lane, &co[unit]);
                }
            }
            self.prev_coeff[unit] = co[unit];
        }
        // reset_lane clears the registers; restore the voice's copy.
        chain.load_lane(lane, &self.registers);

        let vel_att = self.local[Dest::VcaVelSense] * (1.0 - self.state.velocity);
        let gain =
            db_to_linear(self.local[Dest::VcaGain] + vel_att) * self.amp_eg.output();
        let balance = self.local[Dest::FilterBalance].clamp(-1.0, 1.0);
        let (mix1, mix2) = match self.config.topology {
            ChainTopology::Serial1
            | ChainTopology::Serial2
            | ChainTopology::Serial3
            | ChainTopology::Ring
            | ChainTopology::Wide => ((1.0 - balance).min(1.0), (1.0 + balance).min(1.0)),
            ChainTopology::Dual1 | ChainTopology::Dual2 | ChainTopology::Stereo => {
                (0.5 - 0.5 * balance, 0.5 + 0.5 * balance)
            }
        };
        let controls = LaneControlTargets {
            gain,
            feedback: self.local[Dest::Feedback],
            mix1,
            mix2,
            drive: db_to_linear(self.local[Dest::WaveshaperDrive]),
        };
        if self.first_block {
            chain.reset_lane_control(lane, &controls);
        } else {
            chain.reset_lane_control(lane, &self.prev_controls);
            chain.set_lane_control_targets(lane, &controls);
        }
        self.prev_controls = controls;

        let mut amp = 0.5 * amp_to_linear(self.local[Dest::Volume]);
        match self.config.topology {
            ChainTopology::Wide => amp *= 2.0 / 3.0,
            ChainTopology::Stereo => amp *= 4.0 / 3.0,
            _ => {}
        }
        let mut pan1 = self.local[Dest::Pan].clamp(-1.0, 1.0);
        let out = if matches!(
            self.config.topology,
            ChainTopology::Stereo | ChainTopology::Wide
        ) {
            let width = self.local[Dest::Width];
            let pan2 = pan1 + width;
            pan1 -= width;
            [
                amp * pan_left(pan1),
                amp * pan_right(pan1),
                amp * pan_left(pan2),
                amp * pan_right(pan2),
            ]
        } else {
            [amp * pan_left(pan1), amp * pan_right(pan1), 0.0, 0.0]
        };
        if self.first_block {
            chain.reset_lane_output(lane, out[0], out[1], out[2], out[3]);
        } else {
            let p = self.prev_out;
            chain.reset_lane_output(lane, p[0], p[1], p[2], p[3]);
            chain.set_lane_output_targets(lane, out[0], out[1], out[2], out[3]);
        }
        self.prev_out = out;
    }
}

/// Fresh lane registers: everything zero except the SVF saturation
/// register, which idles at unity.
fn initial_registers() -> LaneRegisters {
    let mut regs = LaneRegisters::default();
    for unit in &mut regs.unit {
        unit[2] = 1.0;
    }
    regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::lfo::LfoShape;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SR: f32 = 48_000.0;

    fn ctx() -> BlockContext {
        BlockContext::new(SR)
    }

    /// Oscillator emitting a constant value, for exact-level assertions.
    struct ConstSource {
        value: f32,
        out: [f32; BLOCK_SIZE],
    }

    impl ConstSource {
        fn new(value: f32) -> Self {
            Self {
                value,
                out: [0.0; BLOCK_SIZE],
            }
        }
    }

    impl OscillatorSource for ConstSource {
        fn process_block(
            &mut self,
            _pitch: f32,
            _fm: Option<(&[f32; BLOCK_SIZE], f32)>,
            _stereo: bool,
            _ctx: &BlockContext,
        ) {
            self.out = [self.value; BLOCK_SIZE];
        }

        fn output(&self) -> &[f32; BLOCK_SIZE] {
            &self.out
        }
    }

    /// Records the FM input it was handed, pre-scaled by depth.
    struct ProbeSource {
        seen: Rc<RefCell<Vec<f32>>>,
        out: [f32; BLOCK_SIZE],
    }

    impl OscillatorSource for ProbeSource {
        fn process_block(
            &mut self,
            _pitch: f32,
            fm: Option<(&[f32; BLOCK_SIZE], f32)>,
            _stereo: bool,
            _ctx: &BlockContext,
        ) {
            let mut seen = self.seen.borrow_mut();
            seen.clear();
            if let Some((buf, depth)) = fm {
                seen.extend(buf.iter().map(|v| v * depth));
            }
        }

        fn output(&self) -> &[f32; BLOCK_SIZE] {
            &self.out
        }
    }

    fn const_voice(value: f32) -> Voice {
        let mut v = Voice::new(
            VoiceConfig {
                filter_a: FilterModel::Off,
                ..VoiceConfig::default()
            },
            ParamPool::default(),
            60,
            1.0,
            0,
            None,
            7,
        );
        v.set_oscillator(0, Box::new(ConstSource::new(value)));
        v
    }

    #[test]
    fn lane_input_is_source_times_level_and_prefilter_gain() {
        let mut v = const_voice(0.5);
        let mut chain = QuadChainState::new();
        assert!(v.process_block(&ctx(), &[], &[], &mut chain, 1));
        for k in 0..BLOCK_SIZE {
            // Level 1.0 (amp taper of 1) and 0 dB PFG: the lane carries the
            // source verbatim, on both sides via the Both route... which
            // collapses to Left under the serial topology.
            assert!((chain.dl[k].get(1) - 0.5).abs() < 1e-6, "sample {k}");
            assert_eq!(chain.dr[k].get(1), 0.0);
        }
        assert_eq!(chain.mask.get(1), 1.0);
    }

    #[test]
    fn prefilter_gain_scales_the_lane_input() {
        let mut v = const_voice(0.5);
        v.params_mut()[Dest::PreFilterGain] = 6.0;
        // Rebuild so the ctor snap picks the new base value up.
        let mut v2 = Voice::new(v.config().clone(), *v.params_mut(), 60, 1.0, 0, None, 7);
        v2.set_oscillator(0, Box::new(ConstSource::new(0.5)));
        let mut chain = QuadChainState::new();
        v2.process_block(&ctx(), &[], &[], &mut chain, 0);
        let expected = 0.5 * db_to_linear(6.0);
        assert!((chain.dl[0].get(0) - expected).abs() < 1e-5);
    }

    #[test]
    fn routing_accumulates_onto_the_local_copy() {
        let mut v = const_voice(0.0);
        let base = v.local_value(Dest::CutoffA);
        let routes = [ModRoute {
            source: RouteSource::Controller(0),
            dest: Dest::CutoffA,
            depth: 12.0,
            muted: false,
        }];
        let mut chain = QuadChainState::new();
        v.process_block(&ctx(), &routes, &[0.5], &mut chain, 0);
        assert!((v.local_value(Dest::CutoffA) - (base + 6.0)).abs() < 1e-6);
    }

    #[test]
    fn pitch_combines_key_bend_octave_and_keytrack() {
        let mut v = Voice::new(
            VoiceConfig {
                octave: 1,
                bend_range_up: 2.0,
                ..VoiceConfig::default()
            },
            ParamPool::default(),
            60,
            1.0,
            0,
            None,
            1,
        );
        v.set_pitch_bend(1.0);
        let mut chain = QuadChainState::new();
        v.process_block(&ctx(), &[], &[], &mut chain, 0);
        assert!((v.state.pitch - 74.0).abs() < 1e-5, "60 + 2 + 12");
        assert!((v.state.keytrack - 14.0 / 12.0).abs() < 1e-5);
    }

    #[test]
    fn released_voice_reports_reclaimable_and_masks_its_lane() {
        let mut v = const_voice(0.5);
        let mut chain = QuadChainState::new();
        v.process_block(&ctx(), &[], &[], &mut chain, 2);
        v.release();
        let mut reclaimed = false;
        for _ in 0..500 {
            if !v.process_block(&ctx(), &[], &[], &mut chain, 2) {
                reclaimed = true;
                break;
            }
        }
        assert!(reclaimed, "default release must idle within 500 blocks");
        assert_eq!(chain.mask.get(2), 0.0);
        for k in 0..BLOCK_SIZE {
            assert_eq!(chain.dl[k].get(2), 0.0);
        }
    }

    #[test]
    fn uber_release_reclaims_faster_than_a_slow_release() {
        let slow_params = AdsrParams {
            release: 3.0,
            ..AdsrParams::default()
        };
        let mk = || {
            let mut v = Voice::new(
                VoiceConfig {
                    amp_env: slow_params,
                    filter_a: FilterModel::Off,
                    ..VoiceConfig::default()
                },
                ParamPool::default(),
                60,
                1.0,
                0,
                None,
                3,
            );
            v.set_oscillator(0, Box::new(ConstSource::new(0.5)));
            v
        };
        let blocks_until_dead = |v: &mut Voice| {
            let mut chain = QuadChainState::new();
            v.process_block(&ctx(), &[], &[], &mut chain, 0);
            let mut n = 0;
            while v.process_block(&ctx(), &[], &[], &mut chain, 0) && n < 20_000 {
                n += 1;
            }
            n
        };
        let mut slow = mk();
        slow.release();
        let mut fast = mk();
        fast.uber_release();
        let slow_n = blocks_until_dead(&mut slow);
        let fast_n = blocks_until_dead(&mut fast);
        assert!(
            fast_n * 10 < slow_n,
            "uber release ({fast_n} blocks) vs release ({slow_n})"
        );
        assert!(fast.state.uber_release);
    }

    #[test]
    fn summed_fm_mode_feeds_carrier_with_both_modulators() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut active = [false; N_MIX_CHANNELS];
        active[MixChannel::Osc1 as usize] = true;
        let mut v = Voice::new(
            VoiceConfig {
                fm_mode: FmMode::TwoAndThreeToOne,
                channel_active: active,
                filter_a: FilterModel::Off,
                ..VoiceConfig::default()
            },
            ParamPool::default(),
            60,
            1.0,
            0,
            None,
            11,
        );
        v.set_oscillator(
            0,
            Box::new(ProbeSource {
                seen: Rc::clone(&seen),
                out: [0.0; BLOCK_SIZE],
            }),
        );
        v.set_oscillator(1, Box::new(ConstSource::new(0.25)));
        v.set_oscillator(2, Box::new(ConstSource::new(0.5)));
        let mut chain = QuadChainState::new();
        v.process_block(&ctx(), &[], &[], &mut chain, 0);
        let seen = seen.borrow();
        assert_eq!(seen.len(), BLOCK_SIZE);
        // 0 dB FM depth: the carrier sees the plain modulator sum.
        assert!((seen[0] - 0.75).abs() < 1e-6, "got {}", seen[0]);
    }

    #[test]
    fn step_trigger_mask_holds_the_amp_envelope_down() {
        let amp_env = AdsrParams {
            attack: 0.0, // one second
            ..AdsrParams::default()
        };
        let mk = |trigmask: u64| {
            let lfo = LfoParams {
                shape: LfoShape::StepSeq,
                rate: 6.0,
                ..LfoParams::default()
            };
            let steps = StepSequence {
                trigmask,
                ..StepSequence::default()
            };
            Voice::new(
                VoiceConfig {
                    amp_env,
                    retrigger_from_current: false,
                    lfo: [lfo, LfoParams::default()],
                    lfo_steps: [steps, StepSequence::default()],
                    ..VoiceConfig::default()
                },
                ParamPool::default(),
                60,
                1.0,
                0,
                None,
                5,
            )
        };
        let run = |v: &mut Voice| {
            let mut chain = QuadChainState::new();
            for _ in 0..300 {
                v.process_block(&ctx(), &[], &[], &mut chain, 0);
            }
            v.amp_eg().output()
        };
        let mut plain = mk(0);
        let mut retriggered = mk((1 << 16) - 1);
        let free = run(&mut plain);
        let held = run(&mut retriggered);
        assert!(
            held < free * 0.5,
            "retriggered attack ({held}) must trail the free one ({free})"
        );
    }

    #[test]
    fn filter_registers_survive_a_lane_takeover() {
        // Default config keeps filter A as a 12 dB lowpass, so the
        // registers actually move.
        let mut v = Voice::new(VoiceConfig::default(), ParamPool::default(), 60, 1.0, 0, None, 9);
        v.set_oscillator(0, Box::new(ConstSource::new(0.5)));
        let mut chain = QuadChainState::new();
        let mut l = [0.0f32; BLOCK_SIZE];
        let mut r = [0.0f32; BLOCK_SIZE];
        v.process_block(&ctx(), &[], &[], &mut chain, 0);
        chain.process_block(ChainTopology::Serial1, &mut l, &mut r);
        v.fetch_lane(&chain, 0);
        let saved = chain.read_lane(0);

        // Another voice scribbles over the lane's registers.
        chain.load_lane(0, &LaneRegisters::default());

        v.process_block(&ctx(), &[], &[], &mut chain, 0);
        let restored = chain.read_lane(0);
        assert_eq!(restored.unit, saved.unit);
        assert_eq!(restored.ws_lpf, saved.ws_lpf);
        assert_eq!(restored.fb_line_l, saved.fb_line_l);
        assert!(
            saved.unit[0].iter().any(|&r| r != 0.0 && r != 1.0),
            "lowpass registers should have moved off their initial values"
        );
    }

    #[test]
    fn stereo_topology_splits_the_output_pairs_by_width() {
        let mut params = ParamPool::default();
        params[Dest::Width] = 0.5;
        let mut v = Voice::new(
            VoiceConfig {
                topology: ChainTopology::Stereo,
                filter_a: FilterModel::Off,
                ..VoiceConfig::default()
            },
            params,
            60,
            1.0,
            0,
            None,
            2,
        );
        v.set_oscillator(0, Box::new(ConstSource::new(0.5)));
        let mut chain = QuadChainState::new();
        v.process_block(&ctx(), &[], &[], &mut chain, 0);
        // pan1 = -width, pan2 = +width: the first pair leans left, the
        // second right, symmetrically.
        assert!(chain.out_l.get(0) > chain.out_r.get(0));
        assert!(chain.out2_r.get(0) > chain.out2_l.get(0));
        assert!((chain.out_l.get(0) - chain.out2_r.get(0)).abs() < 1e-6);
    }

    #[test]
    fn const_input_survives_the_full_chain_identity_path() {
        // Filters and shaper off, unity gain: output equals input scaled by
        // the half-amp volume law.
        let mut v = const_voice(0.5);
        let mut chain = QuadChainState::new();
        let mut l = [0.0f32; BLOCK_SIZE];
        let mut r = [0.0f32; BLOCK_SIZE];
        v.process_block(&ctx(), &[], &[], &mut chain, 0);
        chain.process_block(ChainTopology::Serial1, &mut l, &mut r);
        // amp EG hits 1.0 in the first block (instant attack); expected
        // output is 0.5 (input) * 1.0 (gain) * 0.5 (volume amp).
        assert!((l[BLOCK_SIZE - 1] - 0.25).abs() < 1e-4, "got {}", l[BLOCK_SIZE - 1]);
    }
}
