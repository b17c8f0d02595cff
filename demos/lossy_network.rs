//! Simulate many independent sender/receiver pairs over a lossy link and
//! report effective loss before and after recovery.
//!
//! ```text
//! cargo run --example lossy_network -- --pairs 20 --packets 5000 --loss 0.2
//! ```

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use ccat::{CauchyCaterpillar, Settings};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser, Debug)]
#[command(about = "CCat lossy-network simulator")]
struct Args {
    /// Number of independent codec pairs to run
    #[arg(long, default_value_t = 20)]
    pairs: u64,

    /// Originals sent per pair
    #[arg(long, default_value_t = 5000)]
    packets: u64,

    /// Independent drop probability for every packet
    #[arg(long, default_value_t = 0.2)]
    loss: f64,

    /// Emit one recovery packet per this many originals
    #[arg(long, default_value_t = 3)]
    fec_interval: u64,

    /// Largest original packet size
    #[arg(long, default_value_t = 1000)]
    max_bytes: usize,

    /// Base RNG seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

struct TrialResult {
    raw_missing: u64,
    missing: u64,
    recovered: u64,
}

fn run_trial(args: &Args, seed: u64) -> TrialResult {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut sender = CauchyCaterpillar::new(Settings::default(), |_, _| {}).unwrap();
    let recovered: Rc<RefCell<HashSet<u64>>> = Rc::new(RefCell::new(HashSet::new()));
    let sink = Rc::clone(&recovered);
    let mut receiver = CauchyCaterpillar::new(Settings::default(), move |sequence, _data| {
        if !sink.borrow_mut().insert(sequence) {
            tracing::error!(sequence, "duplicate delivery");
        }
    })
    .unwrap();

    let mut delivered: HashSet<u64> = HashSet::new();
    let mut raw_missing = 0u64;

    for sequence in 0..args.packets {
        let bytes = rng.gen_range(1..=args.max_bytes);
        let data: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();

        sender.encode_original(sequence, &data).unwrap();
        if rng.gen_bool(args.loss) {
            raw_missing += 1;
        } else {
            receiver.decode_original(sequence, &data).unwrap();
            delivered.insert(sequence);
        }

        if (sequence + 1) % args.fec_interval == 0 {
            let recovery = sender.encode_recovery().unwrap();
            if !rng.gen_bool(args.loss) {
                receiver.decode_recovery(&recovery).unwrap();
            }
        }
    }

    let recovered = recovered.borrow();
    let recovered_count = recovered.len() as u64;
    delivered.extend(recovered.iter().copied());

    TrialResult {
        raw_missing,
        missing: args.packets - delivered.len() as u64,
        recovered: recovered_count,
    }
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    println!(
        "CCat lossy-network simulation: {} pairs x {} packets, loss {:.0}%, 1 recovery per {} originals",
        args.pairs,
        args.packets,
        args.loss * 100.0,
        args.fec_interval
    );

    let mut raw_missing = 0u64;
    let mut missing = 0u64;
    let mut recovered = 0u64;
    let mut worst = 0.0f64;

    for pair in 0..args.pairs {
        let result = run_trial(&args, args.seed.wrapping_add(pair));
        raw_missing += result.raw_missing;
        missing += result.missing;
        recovered += result.recovered;
        worst = worst.max(result.missing as f64 / args.packets as f64);
    }

    let total = args.pairs * args.packets;
    println!(
        "raw loss      {:>8.3}%  ({} of {} originals dropped in transit)",
        raw_missing as f64 / total as f64 * 100.0,
        raw_missing,
        total
    );
    println!("recovered     {:>8} packets via FEC", recovered);
    println!(
        "effective loss {:>7.3}% average, {:.3}% worst pair",
        missing as f64 / total as f64 * 100.0,
        worst * 100.0
    );
}
