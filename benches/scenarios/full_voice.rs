//! Benchmark for a fully assembled polyphonic block: four voices, each
//! with two LFOs, two envelopes and a modulation route, sharing one chain.

use std::hint::black_box;

use criterion::Criterion;
use lanevoice_dsp::filterchain::{ChainTopology, FilterModel, QuadChainState, WaveshaperKind};
use lanevoice_dsp::modulation::lfo::{LfoParams, LfoShape};
use lanevoice_dsp::modulation::BlockContext;
use lanevoice_dsp::voice::{
    Dest, ModRoute, ParamPool, RouteSource, SineSource, Voice, VoiceConfig,
};
use lanevoice_dsp::{BLOCK_SIZE, N_LANES};

pub fn bench_full_voice(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenarios/full_voice");
    let ctx = BlockContext::new(48_000.0);

    let config = VoiceConfig {
        topology: ChainTopology::Serial2,
        filter_a: FilterModel::Lp24,
        filter_b: FilterModel::Hp12,
        waveshaper: WaveshaperKind::Soft,
        lfo: [
            LfoParams {
                shape: LfoShape::Sine,
                rate: 1.0,
                ..LfoParams::default()
            },
            LfoParams {
                shape: LfoShape::SampleHold,
                rate: 3.0,
                ..LfoParams::default()
            },
        ],
        ..VoiceConfig::default()
    };
    let routes = [
        ModRoute {
            source: RouteSource::Lfo(0),
            dest: Dest::CutoffA,
            depth: 12.0,
            muted: false,
        },
        ModRoute {
            source: RouteSource::FilterEg,
            dest: Dest::CutoffA,
            depth: 24.0,
            muted: false,
        },
    ];

    let mut chain = QuadChainState::new();
    let mut voices: Vec<Voice> = (0..N_LANES)
        .map(|i| {
            let mut v = Voice::new(
                config.clone(),
                ParamPool::default(),
                48 + 7 * i as i32,
                0.9,
                0,
                None,
                i as u64 + 1,
            );
            v.set_oscillator(0, Box::new(SineSource::new()));
            v
        })
        .collect();

    let mut l = [0.0f32; BLOCK_SIZE];
    let mut r = [0.0f32; BLOCK_SIZE];
    group.bench_function("four_voices_one_block", |b| {
        b.iter(|| {
            for (lane, voice) in voices.iter_mut().enumerate() {
                voice.process_block(black_box(&ctx), &routes, &[], &mut chain, lane);
            }
            l.fill(0.0);
            r.fill(0.0);
            chain.process_block(ChainTopology::Serial2, &mut l, &mut r);
            for (lane, voice) in voices.iter_mut().enumerate() {
                voice.fetch_lane(&chain, lane);
            }
            black_box((l[0], r[0]))
        })
    });

    group.finish();
}
