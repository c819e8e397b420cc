//! Pipeline and peer-copy throughput on the host runtime.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use xferbench_core::runtime::HostRuntime;
use xferbench_core::types::DeviceId;
use xferbench_patterns::peer::{run_peer_copy, PeerCopyConfig, PeerPath};
use xferbench_patterns::pipeline::{run_pipeline, HostBuffers, PipelineConfig};

fn random_buffers(len: usize) -> HostBuffers<f64> {
    let mut rng = rand::thread_rng();
    HostBuffers {
        a: (0..len).map(|_| rng.gen()).collect(),
        b: (0..len).map(|_| rng.gen()).collect(),
        c: vec![0.0; len],
    }
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    for &len in &[1 << 16, 1 << 20] {
        for devices in [1usize, 2] {
            let runtime = HostRuntime::new(devices);
            let config = PipelineConfig::new(len).with_devices(devices);
            group.bench_with_input(
                BenchmarkId::new(format!("{devices}-device"), len),
                &len,
                |bencher, &len| {
                    let mut host = random_buffers(len);
                    bencher.iter(|| {
                        run_pipeline(&runtime, &config, &mut host).unwrap();
                        black_box(host.c[len - 1]);
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_peer_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("peer_copy");
    let runtime = HostRuntime::new(2);
    let config = PeerCopyConfig::new(1 << 20).with_repetitions(4);
    for path in [PeerPath::Direct, PeerPath::Staged] {
        group.bench_function(BenchmarkId::from_parameter(format!("{path:?}")), |bencher| {
            bencher.iter(|| {
                let report =
                    run_peer_copy::<f64, _>(&runtime, &config, DeviceId(0), DeviceId(1), path)
                        .unwrap();
                black_box(report.bandwidth_gbps());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline, bench_peer_copy);
criterion_main!(benches);
