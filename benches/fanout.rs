use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use chanrelay::health::count_anomalies;
use chanrelay::session::Broadcaster;
use chanrelay::source::SyntheticNoise;
use chanrelay::{ConsumerId, EmitFn, SAMPLES_PER_CHANNEL};

const CHANNELS: usize = 32;

fn noise_chunk() -> Vec<f32> {
    let mut noise = SyntheticNoise::with_seed(CHANNELS, SAMPLES_PER_CHANNEL, Duration::from_millis(100), 1);
    noise.generate().samples().to_vec()
}

fn bench_fanout(c: &mut Criterion) {
    let chunk = noise_chunk();
    let emit: EmitFn = Arc::new(|_: &ConsumerId, batch: Vec<f32>| {
        black_box(batch);
    });

    let mut group = c.benchmark_group("broadcast_deliver");
    group.throughput(Throughput::Elements(1));

    for consumers in [1_usize, 16, 128] {
        group.bench_function(format!("{consumers}_consumers_8_channels"), |b| {
            let mut bc = Broadcaster::new(CHANNELS, 10);
            for i in 0..consumers {
                let positions = (0..8).map(|k| (i + k * 3) % CHANNELS).collect();
                bc.subscribe(ConsumerId::new(format!("c{i}")), positions, Arc::clone(&emit))
                    .unwrap();
            }
            b.iter(|| {
                for batch in bc.deliver(black_box(&chunk)) {
                    batch.dispatch();
                }
            });
        });
    }
    group.finish();
}

fn bench_monitor(c: &mut Criterion) {
    let chunk = noise_chunk();
    let mut group = c.benchmark_group("signal_monitor");
    group.throughput(Throughput::Elements(chunk.len() as u64));
    group.bench_function("count_anomalies_32ch", |b| {
        b.iter(|| count_anomalies(black_box(&chunk), 50.0));
    });
    group.finish();
}

criterion_group!(fanout, bench_fanout, bench_monitor);
criterion_main!(fanout);
