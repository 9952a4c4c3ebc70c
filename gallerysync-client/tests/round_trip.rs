use std::{io::Cursor, path::Path, sync::Arc, time::Duration};

use gallerysync_client::{
    Channel, ChannelConfig, DuplicatePolicy, GalleryView, PendingTracker, SubmissionController,
    SubmitOutcome, TransportError,
};
use gallerysync_notifier::{AppState, FixedCountDetector};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tokio::{net::TcpListener, task::JoinHandle};

const WAIT: Duration = Duration::from_secs(10);

async fn start_notifier(state: AppState) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral notifier socket");
    let address = listener.local_addr().expect("notifier local addr");
    let server = tokio::spawn(async move {
        let _ = gallerysync_notifier::serve(listener, state).await;
    });
    (format!("ws://{address}/ws"), server)
}

fn channel_config(server_url: String) -> ChannelConfig {
    ChannelConfig {
        server_url,
        connect_timeout: Duration::from_secs(5),
    }
}

fn write_sample_jpeg(path: &Path) {
    let image = RgbImage::from_fn(24, 16, |x, y| Rgb([(x * 10) as u8, (y * 15) as u8, 140]));
    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .expect("encode sample jpeg");
    std::fs::write(path, jpeg).expect("write sample jpeg");
}

#[tokio::test]
async fn submission_round_trips_through_the_notifier() {
    let (server_url, server) =
        start_notifier(AppState::new().with_detector(FixedCountDetector(3))).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("ridge.jpg");
    write_sample_jpeg(&path);

    let channel = Channel::open(&channel_config(server_url))
        .await
        .expect("connect to notifier");
    let pending = PendingTracker::shared();
    let view = GalleryView::mount(&channel, DuplicatePolicy::default(), Arc::clone(&pending));
    let mut controller = SubmissionController::new(channel.clone(), Arc::clone(&pending));

    for text in ["dawn over ridge", "dusk over ridge"] {
        controller.select_file(&path);
        controller.set_text(text);
        assert!(matches!(controller.submit().await, SubmitOutcome::Emitted));
    }

    let snapshot = view
        .wait_for(|snapshot| snapshot.len() == 2, WAIT)
        .await
        .expect("both results arrive");
    let mut texts: Vec<_> = snapshot.iter().map(|item| item.text.clone()).collect();
    texts.sort();
    assert_eq!(texts, vec!["dawn over ridge", "dusk over ridge"]);
    for item in snapshot.iter() {
        assert!(!item.id.is_empty());
        assert_eq!(item.human_count, 3);
        assert_eq!(item.image.media_type(), "image/jpeg");
        let bytes = item.image.decode().expect("decode result image");
        assert_eq!(
            image::guess_format(&bytes).expect("known format"),
            ImageFormat::Jpeg
        );
    }
    assert_ne!(snapshot[0].id, snapshot[1].id);
    assert!(pending.lock().unwrap().is_empty());

    view.unmount().await;
    channel.close().await;
    server.abort();
}

#[tokio::test]
async fn rejected_image_resolves_pending_without_a_gallery_entry() {
    let (server_url, server) = start_notifier(AppState::new()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, b"definitely not pixels").expect("write notes.txt");

    let channel = Channel::open(&channel_config(server_url))
        .await
        .expect("connect to notifier");
    let pending = PendingTracker::shared();
    let view = GalleryView::mount(&channel, DuplicatePolicy::default(), Arc::clone(&pending));
    let mut controller = SubmissionController::new(channel.clone(), Arc::clone(&pending));

    controller.select_file(&path);
    controller.set_text("garbled");
    assert!(matches!(controller.submit().await, SubmitOutcome::Emitted));

    let resolved = tokio::time::timeout(WAIT, async {
        while !pending.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(resolved.is_ok(), "processing_error never arrived");
    assert!(view.snapshot().is_empty());

    view.unmount().await;
    channel.close().await;
    server.abort();
}

#[tokio::test]
async fn connecting_to_a_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral socket");
    let address = listener.local_addr().expect("local addr");
    drop(listener);

    let err = Channel::open(&channel_config(format!("ws://{address}/ws")))
        .await
        .expect_err("nothing is listening");
    assert!(matches!(err, TransportError::Connect(_)), "unexpected error: {err}");
}
