//! Benchmarks for the modulation sources and the lane-parallel chain.
//!
//! Run with: cargo bench
//!
//! Everything here renders one control block of 32 samples; at 48 kHz that
//! is a 0.67 ms real-time deadline shared by all voices and the chain
//! kernel, so per-block costs should sit comfortably in the microseconds.
//!
//! Benchmark groups:
//!   - modsources/*  Block-rate generators (ADSR, LFO shapes, MSEG)
//!   - scenarios/*   Chain topologies and a fully assembled voice

use criterion::{criterion_group, criterion_main};

mod modsources;
mod scenarios;

criterion_group!(
    benches,
    modsources::bench_adsr,
    modsources::bench_lfo,
    modsources::bench_mseg,
    scenarios::bench_chain,
    scenarios::bench_full_voice,
);
criterion_main!(benches);
