use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{info, warn};

use swarmcast_transfer::{
    run_receiver, MulticastConfig, MulticastSocket, ReceiverConfig, ReceiverEvent, TracingLogger,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarmcast=info,swarmcast_transfer=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let uav_id: u8 = match args.next().map(|raw| raw.parse()) {
        Some(Ok(id)) if id <= 31 => id,
        _ => {
            eprintln!("usage: swarmcast-uav <uav_id 0..=31>");
            std::process::exit(1);
        }
    };

    let transport = Arc::new(MulticastSocket::open(&MulticastConfig::default())?);

    let output_dir = std::env::current_dir()?;
    let mut config = ReceiverConfig::new(uav_id, output_dir);
    config.logger = Arc::new(TracingLogger);

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<ReceiverEvent>();
    std::thread::spawn(move || {
        for event in event_rx {
            match event {
                ReceiverEvent::SessionStarted {
                    file_id,
                    filename,
                    total_chunks,
                } => info!(file_id, file = %filename, total_chunks, "session started"),
                ReceiverEvent::Progress {
                    received_chunks,
                    total_chunks,
                } => info!(received_chunks, total_chunks, "receiving"),
                ReceiverEvent::Complete { file_id, hash_ok } => {
                    if hash_ok {
                        info!(file_id, "transfer complete, hash verified");
                    } else {
                        warn!(file_id, "transfer complete but hash mismatch");
                    }
                }
                ReceiverEvent::Incomplete {
                    file_id,
                    missing_chunks,
                } => warn!(file_id, missing_chunks, "session ended incomplete"),
            }
        }
    });

    info!(uav_id, "listening for broadcasts");
    // Runs until the process is killed.
    let cancelled = Arc::new(AtomicBool::new(false));
    run_receiver(config, transport, event_tx, cancelled)?;
    Ok(())
}
