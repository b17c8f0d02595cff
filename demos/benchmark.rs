//! Throughput benchmark for the CCat encoder and decoder.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use ccat::{CauchyCaterpillar, Settings};

fn main() {
    let packet_bytes = 1296usize;
    let packets = 20_000u64;
    let fec_interval = 3u64;

    // Encode: originals plus one recovery per interval.
    let data = vec![0x5au8; packet_bytes];
    let mut sender = CauchyCaterpillar::new(Settings::default(), |_, _| {}).unwrap();

    let encode_start = Instant::now();
    let mut recovery_bytes = 0usize;
    for sequence in 0..packets {
        sender.encode_original(sequence, &data).unwrap();
        if (sequence + 1) % fec_interval == 0 {
            recovery_bytes += sender.encode_recovery().unwrap().payload.len();
        }
    }
    let encode_elapsed = encode_start.elapsed();
    let encoded_mb = (packets as usize * packet_bytes) as f64 / 1_000_000.0;
    println!(
        "encode: {} originals ({:.1} MB) + {:.1} MB recovery in {:.1} ms = {:.0} MB/s",
        packets,
        encoded_mb,
        recovery_bytes as f64 / 1_000_000.0,
        encode_elapsed.as_secs_f64() * 1000.0,
        encoded_mb / encode_elapsed.as_secs_f64()
    );

    // Decode: drop every fec_interval-th original so each recovery packet
    // has exactly one unknown to peel.
    let mut sender = CauchyCaterpillar::new(Settings::default(), |_, _| {}).unwrap();
    let recovered = Rc::new(Cell::new(0u64));
    let count = Rc::clone(&recovered);
    let mut receiver = CauchyCaterpillar::new(Settings::default(), move |_, _| {
        count.set(count.get() + 1);
    })
    .unwrap();

    let decode_start = Instant::now();
    for sequence in 0..packets {
        sender.encode_original(sequence, &data).unwrap();
        if sequence % fec_interval != 0 {
            receiver.decode_original(sequence, &data).unwrap();
        }
        if (sequence + 1) % fec_interval == 0 {
            let recovery = sender.encode_recovery().unwrap();
            receiver.decode_recovery(&recovery).unwrap();
        }
    }
    let decode_elapsed = decode_start.elapsed();
    println!(
        "decode: {} originals, {} recovered in {:.1} ms = {:.0} MB/s",
        packets,
        recovered.get(),
        decode_elapsed.as_secs_f64() * 1000.0,
        encoded_mb / decode_elapsed.as_secs_f64()
    );
}
