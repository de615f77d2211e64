//! Offline replay driver: capture files → port filter → reassembler.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureFile, CapturedPacket, PortFilter};
use crate::reassembly::Assembler;
use crate::stats;
use crate::stream::{trace_handler_factory, FactoryOptions, MySQLStreamFactory, ReplayOptions};

use super::ReplayArgs;

/// Capacity of the ingestion → assembler channel.
const PACKET_CHANNEL_CAPACITY: usize = 512;
/// Cadence of the idle-flow sweep.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Flows idle for longer than this are evicted by the sweep.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn run(args: ReplayArgs) -> anyhow::Result<()> {
    let opts = ReplayOptions {
        dry_run: args.dry_run,
        target_dsn: args.target_dsn.clone(),
        filter_in: args.filter_in.clone(),
        filter_out: args.filter_out.clone(),
    };
    let handler_factory = if args.target_dsn.is_empty() && !args.dry_run {
        trace_handler_factory()
    } else {
        opts.handler_factory()
    };
    let factory = MySQLStreamFactory::new(
        handler_factory,
        FactoryOptions {
            conn_cache_size: args.conn_cache_size,
        },
    );
    let mut assembler = Assembler::new(factory);

    let (tx, mut rx) = mpsc::channel::<CapturedPacket>(PACKET_CHANNEL_CAPACITY);
    let filter = PortFilter::new(args.ports.iter().copied());
    let files = args.files.clone();
    let producer = tokio::task::spawn_blocking(move || {
        for path in files {
            let mut reader = match CaptureFile::open(&path) {
                Ok(reader) => {
                    info!(file = %path.display(), "replay capture file");
                    reader
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "open capture file");
                    continue;
                }
            };
            loop {
                match reader.next_packet() {
                    Ok(Some(pkt)) => {
                        if !filter.admits(&pkt) {
                            continue;
                        }
                        if tx.blocking_send(pkt).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "read capture file");
                        break;
                    }
                }
            }
        }
        // Dropping the sender closes the channel and ends the loop below.
    });

    let mut sweep = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
    loop {
        tokio::select! {
            pkt = rx.recv() => match pkt {
                Some(pkt) => assembler.assemble(pkt).await,
                None => {
                    assembler.flush_all().await;
                    debug_assert!(assembler.is_empty());
                    break;
                }
            },
            _ = sweep.tick() => {
                if let Some(deadline) = SystemTime::now().checked_sub(IDLE_TIMEOUT) {
                    assembler.flush_close_older_than(deadline).await;
                    debug!(live_flows = assembler.len(), "idle sweep");
                }
            }
        }
    }

    producer.await?;

    let failed = stats::get(stats::FAILED_QUERIES);
    if failed > 0 {
        warn!(failed, "some queries failed during replay");
    }
    info!(counters = ?stats::snapshot(), "replay finished");
    Ok(())
}
