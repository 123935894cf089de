//! Benchmarks for the 4-lane filter/waveshaper chain, one per topology.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use lanevoice_dsp::filterchain::{
    ChainTopology, FilterModel, LaneControlTargets, QuadChainState, SvfCoefficients,
    WaveshaperKind,
};
use lanevoice_dsp::BLOCK_SIZE;

const TOPOLOGIES: [(&str, ChainTopology); 8] = [
    ("serial1", ChainTopology::Serial1),
    ("serial2", ChainTopology::Serial2),
    ("serial3", ChainTopology::Serial3),
    ("dual1", ChainTopology::Dual1),
    ("dual2", ChainTopology::Dual2),
    ("ring", ChainTopology::Ring),
    ("stereo", ChainTopology::Stereo),
    ("wide", ChainTopology::Wide),
];

fn loaded_chain() -> QuadChainState {
    let mut q = QuadChainState::new();
    let co = SvfCoefficients::calculate(FilterModel::Lp12, 1_500.0, 0.3, 1.0 / 48_000.0);
    for lane in 0..4 {
        q.set_lane_active(lane, true);
        for k in 0..BLOCK_SIZE {
            // Detuned saw-ish ramps so every lane carries signal.
            let t = (k + lane * 7) as f32 / BLOCK_SIZE as f32;
            q.dl[k].set(lane, t * 2.0 - 1.0);
            q.dr[k].set(lane, 1.0 - t * 2.0);
        }
        q.reset_lane_control(
            lane,
            &LaneControlTargets {
                gain: 0.8,
                feedback: 0.3,
                mix1: 0.7,
                mix2: 0.5,
                drive: 1.5,
            },
        );
        q.reset_lane_output(lane, 0.25, 0.25, 0.25, 0.25);
        for u in &mut q.units {
            u.model = FilterModel::Lp12;
            u.reset_lane(lane, &co);
        }
    }
    q.ws = WaveshaperKind::Soft;
    q
}

pub fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenarios/chain");

    for (name, topology) in TOPOLOGIES {
        let mut q = loaded_chain();
        let mut l = [0.0f32; BLOCK_SIZE];
        let mut r = [0.0f32; BLOCK_SIZE];
        group.bench_with_input(BenchmarkId::new("topology", name), &topology, |b, _| {
            b.iter(|| {
                l.fill(0.0);
                r.fill(0.0);
                q.process_block(black_box(topology), &mut l, &mut r);
                black_box((l[0], r[0]))
            })
        });
    }

    group.finish();
}
