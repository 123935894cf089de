//! Benchmarks for the multi-segment envelope evaluator.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use lanevoice_dsp::mseg::{edit, evaluator, EvaluatorState, MsegStorage};

pub fn bench_mseg(c: &mut Criterion) {
    let mut group = c.benchmark_group("modsources/mseg");

    let builders: [(&str, fn(&mut MsegStorage)); 3] = [
        ("default_envelope", edit::create_default_envelope),
        ("cycle", edit::create_default_cycle),
        ("step_sequence_16", |ms| edit::create_step_sequence(ms, 16)),
    ];

    for (name, build) in builders {
        let mut ms = MsegStorage::default();
        build(&mut ms);
        let mut es = EvaluatorState::new(17);
        es.start();
        let mut phase = 0.0f32;
        group.bench_with_input(BenchmarkId::new("value_at", name), &name, |b, _| {
            b.iter(|| {
                // Walk the envelope like an LFO block loop would.
                phase += 0.01;
                if phase >= 1.0 {
                    phase -= 1.0;
                }
                black_box(evaluator::value_at(0, phase, 0.2, &ms, &mut es, false))
            })
        });
    }

    group.finish();
}
