//! Stream FEC-protected packets over UDP.
//!
//! Run a receiver, then a sender:
//!
//! ```text
//! cargo run --example udp_stream -- recv 127.0.0.1:9000
//! cargo run --example udp_stream -- send 127.0.0.1:9000 --packets 1000
//! ```
//!
//! Each datagram starts with a one-byte type tag: originals carry their
//! full sequence number, recoveries carry the CCat wire header.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ccat::{CauchyCaterpillar, RecoveryPacket, Settings};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

const TAG_ORIGINAL: u8 = 0;
const TAG_RECOVERY: u8 = 1;

#[derive(Parser, Debug)]
#[command(about = "CCat UDP streaming demo")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send FEC-protected packets to an address
    Send {
        addr: String,
        #[arg(long, default_value_t = 1000)]
        packets: u64,
        #[arg(long, default_value_t = 1200)]
        bytes: usize,
        /// One recovery per this many originals
        #[arg(long, default_value_t = 3)]
        fec_interval: u64,
        /// Pacing interval in milliseconds
        #[arg(long, default_value_t = 5)]
        pace_ms: u64,
    },
    /// Receive and decode on a local address
    Recv { addr: String },
}

async fn run_sender(
    addr: &str,
    packets: u64,
    bytes: usize,
    fec_interval: u64,
    pace_ms: u64,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await.context("connect")?;

    let mut codec = CauchyCaterpillar::new(Settings::default(), |_, _| {})
        .map_err(|err| anyhow::anyhow!("codec init: {err}"))?;

    let mut pacer = interval(Duration::from_millis(pace_ms.max(1)));
    let mut datagram = Vec::with_capacity(bytes + 16);

    for sequence in 0..packets {
        pacer.tick().await;

        let data: Vec<u8> = (0..bytes).map(|i| (sequence as usize + i) as u8).collect();
        codec
            .encode_original(sequence, &data)
            .map_err(|err| anyhow::anyhow!("encode: {err}"))?;

        datagram.clear();
        datagram.push(TAG_ORIGINAL);
        datagram.extend_from_slice(&sequence.to_le_bytes());
        datagram.extend_from_slice(&data);
        socket.send(&datagram).await?;

        if (sequence + 1) % fec_interval == 0 {
            let recovery = codec
                .encode_recovery()
                .map_err(|err| anyhow::anyhow!("recovery: {err}"))?;
            datagram.clear();
            datagram.push(TAG_RECOVERY);
            recovery.write(&mut datagram);
            socket.send(&datagram).await?;
        }
    }

    info!(packets, "sender done");
    Ok(())
}

async fn run_receiver(addr: &str) -> Result<()> {
    let socket = UdpSocket::bind(addr).await.context("bind")?;
    info!(%addr, "listening");

    let recovered = Rc::new(RefCell::new(0u64));
    let count = Rc::clone(&recovered);
    let mut codec = CauchyCaterpillar::new(Settings::default(), move |sequence, data| {
        *count.borrow_mut() += 1;
        info!(sequence, bytes = data.len(), "recovered");
    })
    .map_err(|err| anyhow::anyhow!("codec init: {err}"))?;

    let mut buf = vec![0u8; 65536 + 64];
    let mut originals = 0u64;

    loop {
        // Stop once the sender has been quiet for a while.
        let n = match timeout(Duration::from_secs(5), socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => break,
        };
        if n == 0 {
            continue;
        }

        match buf[0] {
            TAG_ORIGINAL if n > 9 => {
                let sequence = u64::from_le_bytes(buf[1..9].try_into().unwrap());
                if codec.decode_original(sequence, &buf[9..n]).is_ok() {
                    originals += 1;
                }
            }
            TAG_RECOVERY => {
                if let Some(recovery) = RecoveryPacket::parse(&buf[1..n]) {
                    if codec.decode_recovery(&recovery).is_err() {
                        warn!("recovery packet rejected");
                    }
                } else {
                    warn!("malformed recovery packet");
                }
            }
            tag => warn!(tag, "unknown datagram tag"),
        }
    }

    info!(
        originals,
        recovered = *recovered.borrow(),
        "receiver done"
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    match args.command {
        Command::Send {
            addr,
            packets,
            bytes,
            fec_interval,
            pace_ms,
        } => {
            if bytes == 0 || bytes > 65536 {
                bail!("bytes must be 1..=65536");
            }
            run_sender(&addr, packets, bytes, fec_interval, pace_ms).await
        }
        Command::Recv { addr } => run_receiver(&addr).await,
    }
}
