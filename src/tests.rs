//! End-to-end sender/receiver scenarios for the codec.
//!
//! Packet content is generated by a PCG seeded from `(sequence, bytes)`,
//! so every delivered packet can be checked byte-for-byte against what the
//! sender must have produced, without the harness storing anything.

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashSet;
    use std::rc::Rc;

    use rand::RngCore;
    use rand_pcg::Pcg32;

    use crate::{CauchyCaterpillar, Clock, RecoveryPacket, Settings};

    struct ManualClock(Cell<u64>);

    impl Clock for ManualClock {
        fn now_usec(&self) -> u64 {
            self.0.get()
        }
    }

    type Log = Rc<RefCell<Vec<(u64, Vec<u8>)>>>;

    fn packet_content(sequence: u64, bytes: usize) -> Vec<u8> {
        let mut prng = Pcg32::new(sequence, bytes as u64);
        let mut data = vec![0u8; bytes];
        prng.fill_bytes(&mut data);
        data
    }

    fn pair_with_clock(clock: Rc<dyn Clock>) -> (CauchyCaterpillar, CauchyCaterpillar, Log) {
        let sender =
            CauchyCaterpillar::with_clock(Settings::default(), |_, _| {}, Rc::clone(&clock))
                .unwrap();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let receiver = CauchyCaterpillar::with_clock(
            Settings::default(),
            move |sequence, data| sink.borrow_mut().push((sequence, data.to_vec())),
            clock,
        )
        .unwrap();
        (sender, receiver, log)
    }

    fn pair() -> (CauchyCaterpillar, CauchyCaterpillar, Log) {
        pair_with_clock(Rc::new(ManualClock(Cell::new(0))))
    }

    /// Recovery packets cross the wire in serialized form.
    fn over_the_wire(packet: &RecoveryPacket) -> RecoveryPacket {
        let mut wire = Vec::new();
        packet.write(&mut wire);
        RecoveryPacket::parse(&wire).expect("emitted packet must parse")
    }

    #[test]
    fn s1_no_loss_never_fires_callback() {
        let (mut sender, mut receiver, log) = pair();
        let sizes = [1usize, 37, 1000];

        for sequence in 0..1000u64 {
            let data = packet_content(sequence, sizes[sequence as usize % sizes.len()]);
            sender.encode_original(sequence, &data).unwrap();
            receiver.decode_original(sequence, &data).unwrap();

            if sequence % 3 == 2 {
                let recovery = sender.encode_recovery().unwrap();
                receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();
            }
        }

        assert!(log.borrow().is_empty());
        assert_eq!(receiver.decoder().pending_rows(), 0);
        assert_eq!(receiver.decoder().highest_seen(), Some(999));
    }

    #[test]
    fn s2_uniform_loss_soak() {
        const TRIALS: u64 = 10;
        const PACKETS: u64 = 2000;
        const DROP_THRESHOLD: u32 = u32::MAX / 5; // p = 0.2

        let mut effective_loss_sum = 0.0f64;

        for seed in 0..TRIALS {
            let (mut sender, mut receiver, log) = pair();
            let mut prng = Pcg32::new(seed, 0xa02b_dbf7_bb3c_0a7);
            let mut delivered: HashSet<u64> = HashSet::new();

            for sequence in 0..PACKETS {
                let bytes = (prng.next_u32() % 1000 + 1) as usize;
                let data = packet_content(sequence, bytes);
                sender.encode_original(sequence, &data).unwrap();

                if prng.next_u32() >= DROP_THRESHOLD {
                    receiver.decode_original(sequence, &data).unwrap();
                    delivered.insert(sequence);
                }

                if sequence % 3 == 2 {
                    let recovery = sender.encode_recovery().unwrap();
                    if prng.next_u32() >= DROP_THRESHOLD {
                        receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();
                    }
                }
            }

            // Keep emitting recovery packets so the tail of the stream gets
            // the same protection a continuous stream would.
            for _ in 0..60 {
                let recovery = sender.encode_recovery().unwrap();
                if prng.next_u32() >= DROP_THRESHOLD {
                    receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();
                }
            }

            // Every reconstruction is correct, unique, and for a packet the
            // receiver never saw directly.
            let mut recovered: HashSet<u64> = HashSet::new();
            for (sequence, data) in log.borrow().iter() {
                assert!(recovered.insert(*sequence), "duplicate delivery {}", sequence);
                assert!(!delivered.contains(sequence), "recovered a received packet");
                assert_eq!(data, &packet_content(*sequence, data.len()));
            }
            delivered.extend(recovered);

            let missing = PACKETS - delivered.len() as u64;
            effective_loss_sum += missing as f64 / PACKETS as f64;
        }

        let average = effective_loss_sum / TRIALS as f64;
        assert!(average < 0.01, "effective loss {:.3}% too high", average * 100.0);
    }

    #[test]
    fn s3_single_loss_single_recovery() {
        let (mut sender, mut receiver, log) = pair();

        for sequence in 0..=8u64 {
            let data = packet_content(sequence, 100);
            sender.encode_original(sequence, &data).unwrap();
            if sequence != 5 {
                receiver.decode_original(sequence, &data).unwrap();
            }
        }

        let recovery = sender.encode_recovery().unwrap();
        receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 5);
        assert_eq!(log[0].1, packet_content(5, 100));
    }

    #[test]
    fn s4_two_losses_one_recovery_stays_pending() {
        let (mut sender, mut receiver, log) = pair();

        for sequence in 0..=10u64 {
            let data = packet_content(sequence, 100);
            sender.encode_original(sequence, &data).unwrap();
            if sequence != 5 && sequence != 7 {
                receiver.decode_original(sequence, &data).unwrap();
            }
        }

        let recovery = sender.encode_recovery().unwrap();
        receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();

        assert!(log.borrow().is_empty());
        assert_eq!(receiver.decoder().pending_rows(), 1);
    }

    #[test]
    fn s5_two_losses_two_recoveries_deliver_in_order() {
        let (mut sender, mut receiver, log) = pair();

        for sequence in 0..=10u64 {
            let data = packet_content(sequence, 100);
            sender.encode_original(sequence, &data).unwrap();
            if sequence != 5 && sequence != 7 {
                receiver.decode_original(sequence, &data).unwrap();
            }
        }

        let first = sender.encode_recovery().unwrap();
        let second = sender.encode_recovery().unwrap();
        assert_ne!(first.row, second.row);
        receiver.decode_recovery(&over_the_wire(&first)).unwrap();
        receiver.decode_recovery(&over_the_wire(&second)).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, 5);
        assert_eq!(log[0].1, packet_content(5, 100));
        assert_eq!(log[1].0, 7);
        assert_eq!(log[1].1, packet_content(7, 100));
    }

    #[test]
    fn s6_window_expiration_abandons_stale_loss() {
        let clock = Rc::new(ManualClock(Cell::new(0)));
        let (mut sender, mut receiver, log) = pair_with_clock(clock.clone());

        for sequence in 0..=10u64 {
            let data = packet_content(sequence, 100);
            sender.encode_original(sequence, &data).unwrap();
            if sequence != 5 {
                receiver.decode_original(sequence, &data).unwrap();
            }
        }

        // Well past the 100 ms window: the encoder abandons everything sent
        // so far, including the lost packet 5.
        clock.0.set(200_000);

        for sequence in 11..=20u64 {
            let data = packet_content(sequence, 100);
            sender.encode_original(sequence, &data).unwrap();
            receiver.decode_original(sequence, &data).unwrap();
        }

        let recovery = sender.encode_recovery().unwrap();
        assert_eq!(recovery.sequence_start, 11);
        receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn lone_recovery_roundtrips_a_single_packet() {
        // A count-1 recovery carries the whole original; a receiver that
        // saw nothing else still reconstructs it exactly.
        let (mut sender, mut receiver, log) = pair();

        let data = packet_content(42, 333);
        sender.encode_original(42, &data).unwrap();
        let recovery = sender.encode_recovery().unwrap();
        receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 42);
        assert_eq!(log[0].1, data);
    }

    #[test]
    fn wire_output_is_deterministic() {
        let make_wire = || {
            let (mut sender, _receiver, _log) = pair();
            let mut wire = Vec::new();
            for sequence in 0..50u64 {
                let data = packet_content(sequence, 64 + (sequence as usize % 200));
                sender.encode_original(sequence, &data).unwrap();
                if sequence % 3 == 2 {
                    sender.encode_recovery().unwrap().write(&mut wire);
                }
            }
            wire
        };
        assert_eq!(make_wire(), make_wire());
    }

    #[test]
    fn burst_loss_within_window_is_fully_recovered() {
        // Ten consecutive losses, then enough distinct recovery rows to
        // solve them all at once.
        let (mut sender, mut receiver, log) = pair();

        for sequence in 0..30u64 {
            let data = packet_content(sequence, 200);
            sender.encode_original(sequence, &data).unwrap();
            if !(10..20).contains(&sequence) {
                receiver.decode_original(sequence, &data).unwrap();
            }
        }

        for _ in 0..10 {
            let recovery = sender.encode_recovery().unwrap();
            receiver.decode_recovery(&over_the_wire(&recovery)).unwrap();
        }

        let log = log.borrow();
        let sequences: Vec<u64> = log.iter().map(|(sequence, _)| *sequence).collect();
        assert_eq!(sequences, (10..20).collect::<Vec<u64>>());
        for (sequence, data) in log.iter() {
            assert_eq!(data, &packet_content(*sequence, 200));
        }
    }
}
