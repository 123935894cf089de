//! Benchmarks for the dual-engine ADSR.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use lanevoice_dsp::modulation::envelope::{AdsrEnvelope, AdsrParams};
use lanevoice_dsp::modulation::{BlockContext, ModulationSource};

pub fn bench_adsr(c: &mut Criterion) {
    let mut group = c.benchmark_group("modsources/adsr");
    let ctx = BlockContext::new(48_000.0);

    for (name, analog) in [("digital", false), ("analog", true)] {
        let mut env = AdsrEnvelope::new(AdsrParams {
            attack: -3.0,
            decay: -2.0,
            sustain: 0.7,
            release: -4.0,
            analog,
            ..AdsrParams::default()
        });
        env.attack_from(0.0);
        // Advance into the decay/sustain region so the steady-state path
        // is what gets measured.
        for _ in 0..500 {
            env.process_block(&ctx);
        }
        group.bench_with_input(BenchmarkId::new(name, "sustain"), &analog, |b, _| {
            b.iter(|| {
                env.process_block(black_box(&ctx));
                black_box(env.output())
            })
        });
    }

    group.finish();
}
