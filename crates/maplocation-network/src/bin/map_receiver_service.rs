use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use maplocation_network::{MapDataReceiver, ReceiverConfig, Record, Vec3};
use std::time::{Duration, Instant};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Receives map location datagrams and logs every decoded record"
)]
struct Args {
    /// Address to bind
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Receive timeout in milliseconds; bounds shutdown latency
    #[arg(long, default_value = "100")]
    poll_ms: u64,

    /// Stop after this many seconds (runs until failure if omitted)
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .init();

    let config = ReceiverConfig {
        poll_interval: Duration::from_millis(args.poll_ms.max(1)),
        ..Default::default()
    };
    let mut receiver = MapDataReceiver::bind_with_config((args.bind.as_str(), args.port), config)?;
    let (_, records) = receiver.events().subscribe_channel(256);
    receiver.start_receiving_data()?;

    info!("Map receiver service listening on {}", receiver.local_addr());

    let deadline = args
        .seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut last_position: Option<Vec3> = None;

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }

        match records.recv_timeout(Duration::from_millis(500)) {
            Ok(Record::Position(p)) => {
                let moved = last_position
                    .map(|last| last.horizontal_distance(&p.position))
                    .unwrap_or(0.0);
                info!(
                    "{}: pos=({:.2}, {:.2}, {:.2}) rot=({:.1}, {:.1}) moved={:.2}",
                    p.map_name,
                    p.position.x,
                    p.position.y,
                    p.position.z,
                    p.rotation.x,
                    p.rotation.y,
                    moved
                );
                last_position = Some(p.position);
            }
            Ok(Record::LootBatch(batch)) => {
                info!("Loot layout: {} items", batch.len());
                for item in &batch.items {
                    info!(
                        "  {} [{}] #{} at ({:.1}, {:.1}, {:.1})",
                        item.display_name,
                        item.item_id,
                        item.network_id,
                        item.position.x,
                        item.position.y,
                        item.position.z
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(fault) = receiver.take_fault() {
                    error!("Map updates stopped: {}", fault);
                    return Err(fault.into());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    receiver.stop_receiving_data();

    let stats = receiver.stats();
    info!(
        "Received {} packets ({} bytes), dispatched {}, dropped {}",
        stats.packets_received,
        stats.bytes_received,
        stats.records_dispatched,
        stats.packets_dropped
    );

    Ok(())
}
