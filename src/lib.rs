//! Realtime-safe per-voice modulation and lane-parallel filter processing
//! for polyphonic synthesis.
//!
//! The crate is organized around one voice's control-rate block: modulation
//! sources (`modulation`, `mseg`) advance once per [`BLOCK_SIZE`] samples,
//! the voice assembler (`voice`) mixes oscillator channels and stages them
//! into one lane of a four-wide filter chain (`filterchain`), which runs all
//! lanes per sample with branch-free masking.

pub mod dsp;
pub mod filterchain;
pub mod modulation;
pub mod mseg;
pub mod voice;

/// Samples rendered per control block. All modulators advance once per block.
pub const BLOCK_SIZE: usize = 32;

/// Reciprocal of [`BLOCK_SIZE`], used for per-sample interpolation deltas.
pub const BLOCK_SIZE_INV: f32 = 1.0 / BLOCK_SIZE as f32;

/// Number of voices one filter chain processes in parallel.
pub const N_LANES: usize = 4;

/// Arena capacity of a multi-segment envelope.
pub const MAX_SEGMENTS: usize = 128;
