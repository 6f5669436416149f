use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use duet_media::codec::scripted_payload;
use duet_media::{
    AudioParams, Depacketizer, DepacketizerConfig, EncodedUnit, JitterBuffer, JitterBufferConfig,
    NullSink, ScriptedDecoder,
};

fn bench_jitter_steady_state(c: &mut Criterion) {
    let buffer = JitterBuffer::new(JitterBufferConfig::default(), Arc::new(NullSink)).unwrap();
    let chunk = vec![1i16; buffer.frame_size()];
    for _ in 0..4 {
        buffer.write(&chunk).unwrap();
    }

    c.bench_function("jitter_write_read_20ms_stereo", |b| {
        b.iter(|| {
            buffer.write(black_box(&chunk)).unwrap();
            black_box(buffer.read().unwrap());
        })
    });
}

fn bench_depacketizer_with_loss(c: &mut Criterion) {
    let config = DepacketizerConfig::new(AudioParams::new(48_000, 2), true);
    let mut depack =
        Depacketizer::new(ScriptedDecoder::new(2), config, Arc::new(NullSink)).unwrap();
    let payload = scripted_payload(1, 960);
    let mut ts = 0u32;

    c.bench_function("depacketizer_every_third_unit_lost", |b| {
        b.iter(|| {
            let unit = EncodedUnit::new(payload.clone(), ts);
            black_box(depack.process(&unit).unwrap());
            ts = ts.wrapping_add(960 * 3);
        })
    });
}

criterion_group!(benches, bench_jitter_steady_state, bench_depacketizer_with_loss);
criterion_main!(benches);
