//! Four-voice-wide filter/waveshaper chain.
//!
//! Up to four voices each own one lane of a shared state record; the chain
//! then runs one sample-by-sample pass per block with every control value
//! (gain, feedback, both mixes, drive, output gains, filter coefficients)
//! advanced by a precomputed per-sample delta. Inactive lanes are removed
//! by a multiplicative lane mask on every output write, never by a branch,
//! so all four lanes execute identical control flow.

pub mod unit;
pub mod waveshaper;

pub use unit::{FilterModel, FilterUnit, SvfCoefficients, N_COEFF, N_REG};
pub use waveshaper::WaveshaperKind;

use std::ops::{Add, AddAssign, Mul, Sub};

use crate::{BLOCK_SIZE, BLOCK_SIZE_INV, N_LANES};

/// Four lanes of samples, one per voice, with elementwise arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Lane4(pub [f32; N_LANES]);

impl Lane4 {
    #[inline]
    pub fn new(v: [f32; N_LANES]) -> Self {
        Self(v)
    }

    #[inline]
    pub fn splat(v: f32) -> Self {
        Self([v; N_LANES])
    }

    #[inline]
    pub fn get(&self, lane: usize) -> f32 {
        self.0[lane]
    }

    #[inline]
    pub fn set(&mut self, lane: usize, v: f32) {
        self.0[lane] = v;
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        Self([
            self.0[0].max(other.0[0]),
            self.0[1].max(other.0[1]),
            self.0[2].max(other.0[2]),
            self.0[3].max(other.0[3]),
        ])
    }

    /// Sum across lanes, for folding the four voices into one output.
    #[inline]
    pub fn sum(self) -> f32 {
        self.0[0] + self.0[1] + self.0[2] + self.0[3]
    }

    #[inline]
    pub fn map2(a: Self, b: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Self([
            f(a.0[0], b.0[0]),
            f(a.0[1], b.0[1]),
            f(a.0[2], b.0[2]),
            f(a.0[3], b.0[3]),
        ])
    }
}

impl Add for Lane4 {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self([
            self.0[0] + rhs.0[0],
            self.0[1] + rhs.0[1],
            self.0[2] + rhs.0[2],
            self.0[3] + rhs.0[3],
        ])
    }
}

impl AddAssign for Lane4 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Lane4 {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self([
            self.0[0] - rhs.0[0],
            self.0[1] - rhs.0[1],
            self.0[2] - rhs.0[2],
            self.0[3] - rhs.0[3],
        ])
    }
}

impl Mul for Lane4 {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self([
            self.0[0] * rhs.0[0],
            self.0[1] * rhs.0[1],
            self.0[2] * rhs.0[2],
            self.0[3] * rhs.0[3],
        ])
    }
}

/// Cubic soft clip on [-1.5, 1.5], used on every feedback path so runaway
/// resonance folds over instead of growing without bound.
#[inline]
fn softclip(x: Lane4) -> Lane4 {
    Lane4([
        softclip1(x.0[0]),
        softclip1(x.0[1]),
        softclip1(x.0[2]),
        softclip1(x.0[3]),
    ])
}

#[inline]
fn softclip1(x: f32) -> f32 {
    let x = x.clamp(-1.5, 1.5);
    x - (4.0 / 27.0) * x * x * x
}

/// Where feedback is injected and how the two filter units are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChainTopology {
    /// A -> waveshaper -> B, no feedback path at all.
    #[default]
    Serial1,
    /// As Serial1, with the final output fed back into the input.
    Serial2,
    /// As Serial2, but B only lives inside the feedback loop.
    Serial3,
    /// A and B in parallel, waveshaper after the mix.
    Dual1,
    /// A and B in parallel, waveshaper on the A branch before the mix.
    Dual2,
    /// A and B in parallel, combined by a ring-style cross-product.
    Ring,
    /// A filters left, B filters right, independent mixes per side.
    Stereo,
    /// Fully doubled signal path: two A units and two B units, one pair
    /// per side.
    Wide,
}

/// Registers one voice carries between blocks so a lane handoff never
/// clicks.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneRegisters {
    pub unit: [[f32; N_REG]; 4],
    pub ws_lpf: f32,
    pub fb_line_l: f32,
    pub fb_line_r: f32,
}

/// The shared four-lane state record. Voices populate their lane (input
/// block, control targets, coefficient targets, mask), then the owner runs
/// `process_block` once and voices read their registers back.
pub struct QuadChainState {
    /// Left/right input, one Lane4 per sample.
    pub dl: [Lane4; BLOCK_SIZE],
    pub dr: [Lane4; BLOCK_SIZE],

    /// Unit 0 = A, 1 = B; 2 and 3 are the right-side pair for Wide.
    pub units: [FilterUnit; 4],
    pub ws: WaveshaperKind,

    pub gain: Lane4,
    pub dgain: Lane4,
    pub fb: Lane4,
    pub dfb: Lane4,
    pub mix1: Lane4,
    pub dmix1: Lane4,
    pub mix2: Lane4,
    pub dmix2: Lane4,
    pub drive: Lane4,
    pub ddrive: Lane4,

    pub ws_lpf: Lane4,
    pub fb_line_l: Lane4,
    pub fb_line_r: Lane4,

    pub out_l: Lane4,
    pub out_r: Lane4,
    pub dout_l: Lane4,
    pub dout_r: Lane4,
    pub out2_l: Lane4,
    pub out2_r: Lane4,
    pub dout2_l: Lane4,
    pub dout2_r: Lane4,

    /// 1.0 for live lanes, 0.0 for idle ones; multiplied into every
    /// output write.
    pub mask: Lane4,
}

impl Default for QuadChainState {
    fn default() -> Self {
        Self::new()
    }
}

impl QuadChainState {
    pub fn new() -> Self {
        Self {
            dl: [Lane4::default(); BLOCK_SIZE],
            dr: [Lane4::default(); BLOCK_SIZE],
            units: [FilterUnit::default(); 4],
            ws: WaveshaperKind::Off,
            gain: Lane4::default(),
            dgain: Lane4::default(),
            fb: Lane4::default(),
            dfb: Lane4::default(),
            mix1: Lane4::default(),
            dmix1: Lane4::default(),
            mix2: Lane4::default(),
            dmix2: Lane4::default(),
            drive: Lane4::default(),
            ddrive: Lane4::default(),
            ws_lpf: Lane4::default(),
            fb_line_l: Lane4::default(),
            fb_line_r: Lane4::default(),
            out_l: Lane4::default(),
            out_r: Lane4::default(),
            dout_l: Lane4::default(),
            dout_r: Lane4::default(),
            out2_l: Lane4::default(),
            out2_r: Lane4::default(),
            dout2_l: Lane4::default(),
            dout2_r: Lane4::default(),
            mask: Lane4::default(),
        }
    }

    /// Zero one lane's input block.
    pub fn clear_lane_input(&mut self, lane: usize) {
        for k in 0..BLOCK_SIZE {
            self.dl[k].set(lane, 0.0);
            self.dr[k].set(lane, 0.0);
        }
    }

    pub fn set_lane_active(&mut self, lane: usize, active: bool) {
        self.mask.set(lane, if active { 1.0 } else { 0.0 });
    }

    /// Ramp one lane's control values toward `targets` over the block.
    pub fn set_lane_control_targets(&mut self, lane: usize, t: &LaneControlTargets) {
        set_ramp(&mut self.gain, &mut self.dgain, lane, t.gain);
        set_ramp(&mut self.fb, &mut self.dfb, lane, t.feedback);
        set_ramp(&mut self.mix1, &mut self.dmix1, lane, t.mix1);
        set_ramp(&mut self.mix2, &mut self.dmix2, lane, t.mix2);
        set_ramp(&mut self.drive, &mut self.ddrive, lane, t.drive);
    }

    /// Snap one lane's control values, for the first block of a note.
    pub fn reset_lane_control(&mut self, lane: usize, t: &LaneControlTargets) {
        set_snap(&mut self.gain, &mut self.dgain, lane, t.gain);
        set_snap(&mut self.fb, &mut self.dfb, lane, t.feedback);
        set_snap(&mut self.mix1, &mut self.dmix1, lane, t.mix1);
        set_snap(&mut self.mix2, &mut self.dmix2, lane, t.mix2);
        set_snap(&mut self.drive, &mut self.ddrive, lane, t.drive);
    }

    /// Ramp one lane's output gains (main and second stereo pair).
    pub fn set_lane_output_targets(&mut self, lane: usize, l: f32, r: f32, l2: f32, r2: f32) {
        set_ramp(&mut self.out_l, &mut self.dout_l, lane, l);
        set_ramp(&mut self.out_r, &mut self.dout_r, lane, r);
        set_ramp(&mut self.out2_l, &mut self.dout2_l, lane, l2);
        set_ramp(&mut self.out2_r, &mut self.dout2_r, lane, r2);
    }

    pub fn reset_lane_output(&mut self, lane: usize, l: f32, r: f32, l2: f32, r2: f32) {
        set_snap(&mut self.out_l, &mut self.dout_l, lane, l);
        set_snap(&mut self.out_r, &mut self.dout_r, lane, r);
        set_snap(&mut self.out2_l, &mut self.dout2_l, lane, l2);
        set_snap(&mut self.out2_r, &mut self.dout2_r, lane, r2);
    }

    /// Copy one lane's registers out, for the voice to carry.
    pub fn read_lane(&self, lane: usize) -> LaneRegisters {
        LaneRegisters {
            unit: [
                self.units[0].lane_registers(lane),
                self.units[1].lane_registers(lane),
                self.units[2].lane_registers(lane),
                self.units[3].lane_registers(lane),
            ],
            ws_lpf: self.ws_lpf.get(lane),
            fb_line_l: self.fb_line_l.get(lane),
            fb_line_r: self.fb_line_r.get(lane),
        }
    }

    /// Restore registers into a lane before processing.
    pub fn load_lane(&mut self, lane: usize, regs: &LaneRegisters) {
        for (u, r) in self.units.iter_mut().zip(regs.unit.iter()) {
            u.set_lane_registers(lane, r);
        }
        self.ws_lpf.set(lane, regs.ws_lpf);
        self.fb_line_l.set(lane, regs.fb_line_l);
        self.fb_line_r.set(lane, regs.fb_line_r);
    }

    /// One block pass. Output is accumulated (not overwritten) into the
    /// first `BLOCK_SIZE` samples of `out_l`/`out_r`, lanes summed.
    pub fn process_block(&mut self, topology: ChainTopology, out_l: &mut [f32], out_r: &mut [f32]) {
        match topology {
            ChainTopology::Serial1 => self.process_serial::<1>(out_l, out_r),
            ChainTopology::Serial2 => self.process_serial::<2>(out_l, out_r),
            ChainTopology::Serial3 => self.process_serial::<3>(out_l, out_r),
            ChainTopology::Dual1 => self.process_dual::<1>(out_l, out_r),
            ChainTopology::Dual2 => self.process_dual::<2>(out_l, out_r),
            ChainTopology::Ring => self.process_ring(out_l, out_r),
            ChainTopology::Stereo => self.process_stereo(out_l, out_r),
            ChainTopology::Wide => self.process_wide(out_l, out_r),
        }
    }

    #[inline]
    fn write_outputs(&mut self, x: Lane4, k: usize, out_l: &mut [f32], out_r: &mut [f32]) {
        self.out_l += self.dout_l;
        self.out_r += self.dout_r;
        out_l[k] += (x * self.out_l).sum();
        out_r[k] += (x * self.out_r).sum();
    }

    #[inline]
    fn write_outputs_dual(
        &mut self,
        x: Lane4,
        y: Lane4,
        k: usize,
        out_l: &mut [f32],
        out_r: &mut [f32],
    ) {
        self.out_l += self.dout_l;
        self.out_r += self.dout_r;
        self.out2_l += self.dout2_l;
        self.out2_r += self.dout2_r;
        out_l[k] += (x * self.out_l + y * self.out2_l).sum();
        out_r[k] += (x * self.out_r + y * self.out2_r).sum();
    }

    fn process_serial<const VARIANT: u8>(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let a = self.units[0].model.is_active();
        let ws = self.ws.is_active();
        let b = self.units[1].model.is_active();
        let half = Lane4::splat(0.5);
        let one = Lane4::splat(1.0);

        for k in 0..BLOCK_SIZE {
            let input = if VARIANT == 1 {
                self.dl[k]
            } else {
                self.fb += self.dfb;
                self.dl[k] + softclip(self.fb * self.fb_line_l)
            };
            let mut x = input;
            let mut y = self.dr[k];
            let mask = self.mask;

            if a {
                x = self.units[0].process(x);
            }
            if ws {
                self.ws_lpf = half * (self.ws_lpf + mask * x);
                self.drive += self.ddrive;
                x = self.ws.process(self.ws_lpf, self.drive);
            }
            if a || ws {
                self.mix1 += self.dmix1;
                x = input * (one - self.mix1) + x * self.mix1;
            }

            if VARIANT == 3 {
                // Unit B only exists inside the feedback loop: the dry
                // branch goes straight out, the loop carries the rest.
                self.gain += self.dgain;
                let out = mask * (x * self.gain);
                self.write_outputs(out, k, out_l, out_r);

                y = y + out;
                if b {
                    y = self.units[1].process(y);
                }
                self.mix2 += self.dmix2;
                self.fb_line_l = y;
            } else {
                y = x + y;
                if b {
                    y = self.units[1].process(y);
                }
                self.mix2 += self.dmix2;
                x = x * (one - self.mix2) + y * self.mix2;
                self.gain += self.dgain;
                let out = mask * (x * self.gain);
                if VARIANT == 2 {
                    self.fb_line_l = out;
                }
                self.write_outputs(out, k, out_l, out_r);
            }
        }
    }

    fn process_dual<const VARIANT: u8>(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let a = self.units[0].model.is_active();
        let ws = self.ws.is_active();
        let b = self.units[1].model.is_active();
        let half = Lane4::splat(0.5);

        for k in 0..BLOCK_SIZE {
            self.fb += self.dfb;
            let fb = softclip(self.fb * self.fb_line_l);
            let mut x = self.dl[k] + fb;
            let mut y = self.dr[k] + fb;
            let mask = self.mask;

            if a {
                x = self.units[0].process(x);
            }

            if VARIANT == 1 {
                if b {
                    y = self.units[1].process(y);
                }
                self.mix1 += self.dmix1;
                self.mix2 += self.dmix2;
                x = x * self.mix1 + y * self.mix2;
                if ws {
                    self.ws_lpf = half * (self.ws_lpf + mask * x);
                    self.drive += self.ddrive;
                    x = self.ws.process(self.ws_lpf, self.drive);
                }
            } else {
                if ws {
                    self.ws_lpf = half * (self.ws_lpf + mask * x);
                    self.drive += self.ddrive;
                    x = self.ws.process(self.ws_lpf, self.drive);
                }
                if b {
                    y = self.units[1].process(y);
                }
                self.mix1 += self.dmix1;
                self.mix2 += self.dmix2;
                x = x * self.mix1 + y * self.mix2;
            }

            self.gain += self.dgain;
            let out = mask * (x * self.gain);
            self.fb_line_l = out;
            self.write_outputs(out, k, out_l, out_r);
        }
    }

    fn process_ring(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let a = self.units[0].model.is_active();
        let ws = self.ws.is_active();
        let b = self.units[1].model.is_active();
        let half = Lane4::splat(0.5);
        let one = Lane4::splat(1.0);

        for k in 0..BLOCK_SIZE {
            self.fb += self.dfb;
            let fb = softclip(self.fb * self.fb_line_l);
            let mut x = self.dl[k] + fb;
            let mut y = self.dr[k] + fb;
            let mask = self.mask;

            if a {
                x = self.units[0].process(x);
            }
            if b {
                y = self.units[1].process(y);
            }

            self.mix1 += self.dmix1;
            self.mix2 += self.dmix2;
            // Cross-mixed product: each mix fades one side of the
            // multiplication between the two branches.
            x = ((one - self.mix1) * y + x * self.mix1)
                * ((one - self.mix2) * x + y * self.mix2);

            if ws {
                self.ws_lpf = half * (self.ws_lpf + x);
                self.drive += self.ddrive;
                x = self.ws.process(mask * self.ws_lpf, self.drive);
            }

            self.gain += self.dgain;
            let out = mask * (x * self.gain);
            self.fb_line_l = out;
            self.write_outputs(out, k, out_l, out_r);
        }
    }

    fn process_stereo(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let a = self.units[0].model.is_active();
        let ws = self.ws.is_active();
        let b = self.units[1].model.is_active();

        for k in 0..BLOCK_SIZE {
            self.fb += self.dfb;
            let fb = softclip(self.fb * self.fb_line_l);
            let mut x = self.dl[k] + fb;
            let mut y = self.dr[k] + fb;
            let mask = self.mask;

            if a {
                x = self.units[0].process(x);
            }
            if b {
                y = self.units[1].process(y);
            }
            if ws {
                self.drive += self.ddrive;
                x = self.ws.process(mask * x, self.drive);
                y = self.ws.process(mask * y, self.drive);
            }

            self.mix1 += self.dmix1;
            self.mix2 += self.dmix2;
            x = x * self.mix1;
            y = y * self.mix2;

            self.gain += self.dgain;
            let x = mask * (x * self.gain);
            let y = mask * (y * self.gain);
            self.fb_line_l = x + y;

            self.write_outputs_dual(x, y, k, out_l, out_r);
        }
    }

    fn process_wide(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let a = self.units[0].model.is_active();
        let ws = self.ws.is_active();
        let b = self.units[1].model.is_active();
        let one = Lane4::splat(1.0);

        for k in 0..BLOCK_SIZE {
            self.fb += self.dfb;
            let fb_l = self.fb * self.fb_line_l;
            let fb_r = self.fb * self.fb_line_r;
            let xin = self.dl[k] + softclip(fb_l);
            let yin = self.dr[k] + softclip(fb_r);
            let mut x = xin;
            let mut y = yin;
            let mask = self.mask;

            if a {
                x = self.units[0].process(x);
                y = self.units[2].process(y);
            }
            if ws {
                self.drive += self.ddrive;
                x = self.ws.process(mask * x, self.drive);
                y = self.ws.process(mask * y, self.drive);
            }
            if a || ws {
                self.mix1 += self.dmix1;
                let t = one - self.mix1;
                x = xin * t + x * self.mix1;
                y = yin * t + y * self.mix1;
            }
            if b {
                let z = self.units[1].process(x);
                let w = self.units[3].process(y);
                self.mix2 += self.dmix2;
                let t = one - self.mix2;
                x = x * t + z * self.mix2;
                y = y * t + w * self.mix2;
            }

            self.gain += self.dgain;
            let x = mask * (x * self.gain);
            let y = mask * (y * self.gain);
            self.fb_line_l = x;
            self.fb_line_r = y;

            self.write_outputs_dual(x, y, k, out_l, out_r);
        }
    }
}

/// Per-lane control targets written once per block by the owning voice.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneControlTargets {
    pub gain: f32,
    pub feedback: f32,
    pub mix1: f32,
    pub mix2: f32,
    pub drive: f32,
}

#[inline]
fn set_ramp(value: &mut Lane4, delta: &mut Lane4, lane: usize, target: f32) {
    delta.set(lane, (target - value.get(lane)) * BLOCK_SIZE_INV);
}

#[inline]
fn set_snap(value: &mut Lane4, delta: &mut Lane4, lane: usize, target: f32) {
    value.set(lane, target);
    delta.set(lane, 0.0);
}
