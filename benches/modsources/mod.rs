//! Benchmarks for block-rate modulation sources.

mod adsr;
mod lfo;
mod mseg;

pub use adsr::bench_adsr;
pub use lfo::bench_lfo;
pub use mseg::bench_mseg;
