//! Scenario benchmarks: the shared chain kernel and a whole voice block.

mod chain;
mod full_voice;

pub use chain::bench_chain;
pub use full_voice::bench_full_voice;
