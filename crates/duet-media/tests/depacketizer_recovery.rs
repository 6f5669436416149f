use std::sync::Arc;

use duet_media::codec::{scripted_payload, PLC_FILL};
use duet_media::{
    AudioParams, CountingSink, Depacketizer, DepacketizerConfig, EncodedUnit, EventKind,
    JitterBuffer, JitterBufferConfig, NullSink, ScriptedDecoder,
};
use duet_proto::ts_diff;
use rand::{thread_rng, Rng};

const DURATIONS: [u16; 5] = [120, 240, 480, 960, 1920];

fn depacketizer(
    decoder: ScriptedDecoder,
    channels: u16,
    fec: bool,
) -> Depacketizer<ScriptedDecoder> {
    let config = DepacketizerConfig::new(AudioParams::new(48_000, channels), fec);
    Depacketizer::new(decoder, config, Arc::new(NullSink)).unwrap()
}

#[test]
fn lossless_stream_emits_exactly_the_timestamp_advance() {
    let mut rng = thread_rng();
    for _ in 0..100 {
        let channels = rng.gen_range(1..=2u16);
        let mut depack = depacketizer(ScriptedDecoder::new(channels as usize), channels, true);
        let start: u32 = rng.gen();
        let mut ts = start;
        let mut emitted = 0usize;

        for _ in 0..200 {
            let duration = DURATIONS[rng.gen_range(0..DURATIONS.len())];
            let unit = EncodedUnit::new(scripted_payload(1, duration), ts);
            emitted += depack.process(&unit).unwrap().len();
            ts = ts.wrapping_add(duration as u32);
        }

        let advance = ts.wrapping_sub(start) as usize;
        assert_eq!(emitted, advance * channels as usize);
        assert_eq!(depack.next_timestamp(), Some(ts));
        assert_eq!(depack.stats().gaps, 0);
    }
}

#[test]
fn fec_fills_any_run_of_lost_units_exactly() {
    let mut rng = thread_rng();
    for _ in 0..200 {
        let duration = DURATIONS[rng.gen_range(0..DURATIONS.len())] as u32;
        let lost = rng.gen_range(1..=6u32);
        let sink = Arc::new(CountingSink::new());
        let config = DepacketizerConfig::new(AudioParams::new(48_000, 2), true);
        let mut depack = Depacketizer::new(ScriptedDecoder::new(2), config, sink.clone()).unwrap();

        let t0: u32 = rng.gen();
        depack
            .process(&EncodedUnit::new(scripted_payload(1, duration as u16), t0))
            .unwrap();

        let resume = t0.wrapping_add(duration * (lost + 1));
        let out = depack
            .process(&EncodedUnit::new(scripted_payload(2, duration as u16), resume))
            .unwrap();

        let missing = (duration * lost * 2) as usize;
        let current = (duration * 2) as usize;
        assert_eq!(out.len(), missing + current);
        assert_eq!(sink.samples(EventKind::Recovered), missing as u64);

        let stats = depack.stats();
        assert_eq!(stats.fec_samples, (duration * 2) as u64);
        if lost == 1 {
            assert_eq!(depack.decoder().conceal_calls, 0);
        } else {
            assert_eq!(stats.concealed_samples, missing as u64 - stats.fec_samples);
            assert!(out[..missing - current].iter().all(|s| *s == PLC_FILL));
        }
        assert_eq!(
            depack.next_timestamp(),
            Some(resume.wrapping_add(duration))
        );
    }
}

#[test]
fn shuffled_arrival_never_moves_output_backwards() {
    let mut rng = thread_rng();
    for _ in 0..100 {
        let mut depack = depacketizer(ScriptedDecoder::new(2), 2, rng.gen_bool(0.5));
        let base: u32 = rng.gen();
        let mut units: Vec<u32> = (0..64).map(|i| base.wrapping_add(i * 960)).collect();

        // local reordering, duplication and loss
        for i in 0..units.len() - 1 {
            if rng.gen_bool(0.2) {
                units.swap(i, i + 1);
            }
        }
        let mut arrivals = Vec::new();
        for ts in units {
            if rng.gen_bool(0.1) {
                continue;
            }
            arrivals.push(ts);
            if rng.gen_bool(0.05) {
                arrivals.push(ts);
            }
        }

        let mut last: Option<u32> = None;
        for ts in arrivals {
            let out = depack
                .process(&EncodedUnit::new(scripted_payload(3, 960), ts))
                .unwrap();
            assert_eq!(out.len() % 2, 0);
            let next = depack.next_timestamp().unwrap();
            if let Some(prev) = last {
                let advance = ts_diff(next, prev);
                assert!(advance >= 0);
                assert_eq!(advance as usize, out.len() / 2);
            }
            last = Some(next);
        }
    }
}

#[test]
fn depacketizer_feeds_jitter_buffer_without_drift() {
    let config = JitterBufferConfig {
        params: AudioParams::new(48_000, 2),
        ..Default::default()
    };
    let jitter = JitterBuffer::new(config, Arc::new(NullSink)).unwrap();
    let mut depack = depacketizer(ScriptedDecoder::new(2), 2, true);

    // one 20ms unit in, one 20ms frame out; every fifth unit is lost
    let mut ts = 0u32;
    for n in 0..500 {
        if n % 5 != 3 {
            let pcm = depack
                .process(&EncodedUnit::new(scripted_payload(9, 960), ts))
                .unwrap();
            jitter.write(&pcm).unwrap();
        }
        ts = ts.wrapping_add(960);
        assert_eq!(jitter.read().unwrap().len(), 1920);
    }

    assert_eq!(jitter.stats().unwrap().resets, 0);
}
