use bytes::Bytes;
use duet_proto::{ts_advance, ts_diff, AudioPacket, DUET_MAGIC, DUET_VERSION, HEADER_SIZE};
use rand::{thread_rng, Rng};

#[test]
fn fuzz_decode_audio_packet_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = AudioPacket::decode(Bytes::from(data));
    }
}

#[test]
fn random_mutation_of_valid_header_is_handled() {
    let mut rng = thread_rng();
    let mut packet = vec![0u8; HEADER_SIZE + 32];
    packet[0..2].copy_from_slice(&DUET_MAGIC);
    packet[2..4].copy_from_slice(&DUET_VERSION.to_be_bytes());

    for _ in 0..1_000 {
        let mut mutated = packet.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let _ = AudioPacket::decode(Bytes::from(mutated));
    }
}

#[test]
fn ts_diff_matches_advance_for_random_steps() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let base: u32 = rng.gen();
        let step: usize = rng.gen_range(0..(i32::MAX as usize));
        let ahead = ts_advance(base, step);
        assert_eq!(ts_diff(ahead, base), step as i32);
        assert_eq!(ts_diff(base, ahead), -(step as i32));
    }
}
