use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use clap::Parser;
use gallerysync_client::{
    Channel, ClientConfig, DuplicatePolicy, GallerySnapshot, GalleryView, PendingTracker,
    SharedPending, SubmissionController, SubmitOutcome, config::load_config_from_path,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug)]
#[command(name = "gallerysync")]
struct ClientArgs {
    /// Overrides `server_url` from the config file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Image to submit; pair each one with a `--text`.
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[arg(long = "text", required = true)]
    texts: Vec<String>,
    /// How long to wait for results before printing the gallery.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
    #[arg(long, value_enum)]
    duplicate_policy: Option<DuplicatePolicy>,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };
    if args.images.len() != args.texts.len() {
        error!(
            images = args.images.len(),
            texts = args.texts.len(),
            "every --image needs a matching --text"
        );
        std::process::exit(1);
    }

    let channel = match Channel::open(&config.channel_config()).await {
        Ok(channel) => channel,
        Err(err) => {
            error!(server_url = %config.server_url, "{err}");
            std::process::exit(1);
        }
    };

    let pending = PendingTracker::shared();
    let view = GalleryView::mount(&channel, config.duplicate_policy, Arc::clone(&pending));
    let mut controller = SubmissionController::new(channel.clone(), Arc::clone(&pending))
        .with_max_file_bytes(config.max_file_bytes);

    for (image, text) in args.images.iter().zip(&args.texts) {
        controller.select_file(image);
        controller.set_text(text.as_str());
        match controller.submit().await {
            SubmitOutcome::Emitted => {}
            SubmitOutcome::Skipped => {
                warn!(file = %image.display(), "skipped: empty description");
            }
            SubmitOutcome::Abandoned(err) => {
                error!(file = %image.display(), "not submitted: {err}");
            }
        }
    }

    wait_for_results(&pending, &channel, Duration::from_secs(args.wait_secs)).await;

    render_gallery(&view.snapshot());
    report_pending(&pending, config.pending_timeout());

    view.unmount().await;
    channel.close().await;
}

fn resolve_config(args: &ClientArgs) -> Result<ClientConfig, String> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)
            .map_err(|err| format!("failed to load {}: {err}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(server_url) = &args.server_url {
        config.server_url = server_url.clone();
    }
    if let Some(policy) = args.duplicate_policy {
        config.duplicate_policy = policy;
    }
    config.validate()?;
    Ok(config)
}

async fn wait_for_results(pending: &SharedPending, channel: &Channel, wait: Duration) {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    let deadline = Instant::now() + wait;
    while pending_len(pending) > 0 && Instant::now() < deadline {
        if !channel.is_connected() {
            warn!("connection lost while waiting for results");
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn pending_len(pending: &SharedPending) -> usize {
    PendingTracker::lock(pending).len()
}

fn report_pending(pending: &SharedPending, timeout: Duration) {
    let mut tracker = PendingTracker::lock(pending);
    for submission in tracker.expire(Instant::now(), timeout) {
        warn!(
            text = %submission.text,
            waited_secs = submission.emitted_at.elapsed().as_secs(),
            "no result received; the request may have been lost"
        );
    }
    if !tracker.is_empty() {
        info!(count = tracker.len(), "submissions still processing");
    }
}

fn render_gallery(snapshot: &GallerySnapshot) {
    println!("gallery: {} item(s)", snapshot.len());
    for item in snapshot.iter() {
        println!(
            "  [{}] {:?} humans={} image={} ({} bytes)",
            item.id,
            item.text,
            item.human_count,
            item.image.media_type(),
            item.image.decoded_len()
        );
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
