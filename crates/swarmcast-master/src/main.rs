use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use swarmcast_transfer::{run_master, MasterConfig, MulticastConfig, MulticastSocket, TracingLogger};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarmcast=info,swarmcast_transfer=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(filename) = args.next() else {
        eprintln!("usage: swarmcast-master <filename> [file_id]");
        std::process::exit(1);
    };
    let file_id: u16 = match args.next() {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("file_id must be a 16-bit integer"))?,
        None => 1,
    };

    let path = PathBuf::from(&filename);
    if !path.is_file() {
        eprintln!("no such file: {}", filename);
        std::process::exit(1);
    }

    let transport = Arc::new(MulticastSocket::open(&MulticastConfig::default())?);

    let mut config = MasterConfig::new(file_id);
    config.logger = Arc::new(TracingLogger);

    info!(file = %filename, file_id, "starting broadcast");
    let report = run_master(config, &path, transport)?;

    info!(
        chunks = report.total_chunks,
        windows = report.total_windows,
        retransmits = report.retransmitted_chunks,
        "broadcast finished, hash={:#010x}",
        report.file_hash
    );
    for window_id in &report.exhausted_windows {
        warn!(window_id, "window never reached no-NACK stability");
    }

    Ok(())
}
