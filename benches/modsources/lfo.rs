//! Benchmarks for the LFO shapes.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use lanevoice_dsp::modulation::lfo::{LfoGenerator, LfoParams, LfoShape};
use lanevoice_dsp::modulation::{BlockContext, ModulationSource};

pub fn bench_lfo(c: &mut Criterion) {
    let mut group = c.benchmark_group("modsources/lfo");
    let ctx = BlockContext::new(48_000.0);

    let shapes = [
        ("sine", LfoShape::Sine),
        ("triangle", LfoShape::Triangle),
        ("square", LfoShape::Square),
        ("sample_hold", LfoShape::SampleHold),
        ("noise", LfoShape::Noise),
        ("step_seq", LfoShape::StepSeq),
        ("envelope", LfoShape::Envelope),
        ("mseg", LfoShape::Mseg),
    ];

    for (name, shape) in shapes {
        let mut lfo = LfoGenerator::new(LfoParams {
            shape,
            rate: 2.0,
            deform: 0.3,
            ..LfoParams::default()
        });
        if shape == LfoShape::Mseg {
            let mut ms = lanevoice_dsp::mseg::MsegStorage::default();
            lanevoice_dsp::mseg::edit::create_default_cycle(&mut ms);
            lfo.set_mseg(ms);
        }
        lfo.attack();
        group.bench_with_input(BenchmarkId::new("block", name), &shape, |b, _| {
            b.iter(|| {
                lfo.process_block(black_box(&ctx));
                black_box(lfo.output())
            })
        });
    }

    group.finish();
}
