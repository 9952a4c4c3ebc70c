use std::time::Duration;

use clap::Parser;
use gallerysync_notifier::{AppState, FixedCountDetector, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gallerysync-notifier")]
struct NotifierArgs {
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind_address: String,
    /// Simulated processing latency per submission.
    #[arg(long, default_value_t = 0)]
    processing_delay_ms: u64,
    /// Report this human count for every image instead of zero.
    #[arg(long)]
    fixed_human_count: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = NotifierArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let mut state =
        AppState::new().with_processing_delay(Duration::from_millis(args.processing_delay_ms));
    if let Some(count) = args.fixed_human_count {
        state = state.with_detector(FixedCountDetector(count));
    }

    info!("notifier starting on {}", args.bind_address);
    if let Err(err) = serve(listener, state).await {
        warn!("notifier exited: {}", err);
    }
}
