use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{ImageFormat, Rgba, RgbaImage};
use kiosk_frame::Error;
use kiosk_frame::coordinator::{SyncCoordinator, UploadCandidate};
use kiosk_frame::hub::{BroadcastHub, DeliveryError, ViewerChannel};
use kiosk_frame::library::{ImageLibrary, LibraryOptions};
use kiosk_frame::settings::{KioskSettings, MemorySettings, SettingsStore};
use kiosk_frame::slideshow::{SlideshowAction, SlideshowState};
use kiosk_frame::storage::FsAssetStore;
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([30, 60, 90, 255]));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

struct Fixture {
    tmp: TempDir,
    settings: Arc<MemorySettings>,
    coordinator: SyncCoordinator,
}

fn fixture() -> Fixture {
    let tmp = tempdir().unwrap();
    let settings = Arc::new(MemorySettings::new(KioskSettings {
        min_image_long_side: 32,
        ..KioskSettings::default()
    }));
    let assets = Arc::new(FsAssetStore::open(tmp.path(), "/images").unwrap());
    let library = ImageLibrary::open(
        settings.clone(),
        assets,
        LibraryOptions {
            thumbnail_size: 16,
            ..LibraryOptions::default()
        },
    );
    let coordinator = SyncCoordinator::new(library, settings.clone(), Arc::new(BroadcastHub::new()));
    Fixture {
        tmp,
        settings,
        coordinator,
    }
}

async fn upload(coordinator: &SyncCoordinator, names: &[&str]) {
    let candidates = names
        .iter()
        .map(|name| UploadCandidate::new(*name, png(64, 48)))
        .collect();
    let results = coordinator.upload(candidates).await;
    assert!(results.iter().all(|r| r.ok), "{results:?}");
}

async fn viewer(coordinator: &SyncCoordinator) -> mpsc::Receiver<Arc<str>> {
    let (tx, rx) = mpsc::channel::<Arc<str>>(16);
    coordinator.connect(Arc::new(tx)).await.unwrap();
    rx
}

async fn next_message(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for viewer message")
        .expect("viewer channel closed");
    serde_json::from_str(&text).unwrap()
}

fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

fn image_ids(message: &Value) -> Vec<&str> {
    message["images"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["id"].as_str().unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_viewer_is_caught_up_immediately() {
    let fx = fixture();
    fx.coordinator.control(SlideshowAction::Next).await;
    fx.coordinator.control(SlideshowAction::Next).await;
    fx.coordinator.control(SlideshowAction::Toggle).await;
    upload(&fx.coordinator, &["a.png", "b.png"]).await;

    let mut rx = viewer(&fx.coordinator).await;
    let state = next_message(&mut rx).await;
    assert_eq!(
        state,
        json!({"type": "slideshow-state", "state": {"index": 2, "playing": false}})
    );
    let images = next_message(&mut rx).await;
    assert_eq!(images["type"], "images-updated");
    assert_eq!(image_ids(&images), vec!["a.png", "b.png"]);
    assert_eq!(images["images"][0]["thumb"], "/images/thumbs/a.png");
    assert_eq!(drain(&mut rx), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn toggle_reaches_every_viewer_once() {
    let fx = fixture();
    let mut viewers = Vec::new();
    for _ in 0..3 {
        let mut rx = viewer(&fx.coordinator).await;
        assert_eq!(drain(&mut rx), 2);
        viewers.push(rx);
    }

    let state = fx.coordinator.control(SlideshowAction::Toggle).await;
    assert!(!state.playing);

    for rx in &mut viewers {
        let message = next_message(rx).await;
        assert_eq!(message["type"], "slideshow-state");
        assert_eq!(message["state"]["playing"], false);
        assert_eq!(drain(rx), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partially_failed_batch_broadcasts_once() {
    let fx = fixture();
    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    let results = fx
        .coordinator
        .upload(vec![
            UploadCandidate::new("tiny.png", png(20, 10)),
            UploadCandidate::new("good.png", png(64, 48)),
        ])
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].file, "tiny.png");
    assert!(!results[0].ok);
    assert!(
        results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("resolution too low")
    );
    assert!(results[1].ok);

    let message = next_message(&mut rx).await;
    assert_eq!(image_ids(&message), vec!["good.png"]);
    assert_eq!(drain(&mut rx), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fully_rejected_batch_is_silent() {
    let fx = fixture();
    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    let results = fx
        .coordinator
        .upload(vec![UploadCandidate::new("../bad.png", png(64, 48))])
        .await;
    assert!(!results[0].ok);
    assert!(fx.coordinator.images().is_empty());
    assert_eq!(drain(&mut rx), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_clamps_the_slideshow_index() {
    let fx = fixture();
    upload(&fx.coordinator, &["a.png", "b.png", "c.png"]).await;
    fx.coordinator.control(SlideshowAction::Next).await;
    fx.coordinator.control(SlideshowAction::Next).await;

    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    assert!(fx.coordinator.delete("c.png").await.ok);
    let images = next_message(&mut rx).await;
    assert_eq!(image_ids(&images), vec!["a.png", "b.png"]);
    let state = next_message(&mut rx).await;
    assert_eq!(state["state"]["index"], 1);
    assert_eq!(
        fx.coordinator.slideshow_state().await,
        SlideshowState {
            index: 1,
            playing: true
        }
    );

    // Index already in range: only the library is pushed.
    fx.coordinator.control(SlideshowAction::Prev).await;
    drain(&mut rx);
    assert!(fx.coordinator.delete("b.png").await.ok);
    let images = next_message(&mut rx).await;
    assert_eq!(image_ids(&images), vec!["a.png"]);
    assert_eq!(drain(&mut rx), 0);
    assert_eq!(fx.coordinator.slideshow_state().await.index, 0);
}

/// Records, for every library push, the listed ids and whether a file exists.
struct FileObserver {
    path: PathBuf,
    seen: Mutex<Vec<(Vec<String>, bool)>>,
}

impl ViewerChannel for FileObserver {
    fn send(&self, message: Arc<str>) -> Result<(), DeliveryError> {
        let message: Value = serde_json::from_str(&message).unwrap();
        if message["type"] == "images-updated" {
            let ids = image_ids(&message).into_iter().map(String::from).collect();
            self.seen.lock().unwrap().push((ids, self.path.exists()));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewers_drop_an_entry_before_its_files_go() {
    let fx = fixture();
    upload(&fx.coordinator, &["a.png", "b.png", "c.png"]).await;
    let observer = Arc::new(FileObserver {
        path: fx.tmp.path().join("originals/c.png"),
        seen: Mutex::new(Vec::new()),
    });
    fx.coordinator.connect(observer.clone()).await.unwrap();

    assert!(fx.coordinator.delete("c.png").await.ok);

    let seen = observer.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (vec!["a.png".to_string(), "b.png".into(), "c.png".into()], true),
            (vec!["a.png".to_string(), "b.png".into()], true),
        ]
    );
    assert!(!observer.path.exists());
    assert!(!fx.tmp.path().join("thumbs/c.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reorder_is_non_destructive_and_broadcast() {
    let fx = fixture();
    upload(&fx.coordinator, &["x.png", "y.png"]).await;
    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    let result = fx.coordinator.reorder(vec!["y.png".into()]).await;
    assert!(result.ok);
    let images = next_message(&mut rx).await;
    assert_eq!(image_ids(&images), vec!["y.png", "x.png"]);
    assert_eq!(fx.settings.read_order().unwrap(), vec!["y.png"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_mutations_do_not_broadcast() {
    let fx = fixture();
    upload(&fx.coordinator, &["x.png"]).await;
    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    let result = fx.coordinator.delete("../x.png").await;
    assert!(!result.ok);
    let result = fx.coordinator.reorder(vec![String::new()]).await;
    assert!(!result.ok);

    fx.settings.set_fail_writes(true);
    let result = fx.coordinator.reorder(vec!["x.png".into()]).await;
    assert!(!result.ok);
    assert!(result.error.unwrap().contains("persisting image order failed"));

    assert_eq!(drain(&mut rx), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecognized_action_still_echoes_state() {
    let fx = fixture();
    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    let state = fx
        .coordinator
        .control(SlideshowAction::parse("shuffle"))
        .await;
    assert_eq!(state, SlideshowState::default());
    let message = next_message(&mut rx).await;
    assert_eq!(
        message,
        json!({"type": "slideshow-state", "state": {"index": 0, "playing": true}})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_viewer_is_dropped_without_affecting_others() {
    let fx = fixture();
    let (slow_tx, _slow_rx) = mpsc::channel::<Arc<str>>(2);
    fx.coordinator.connect(Arc::new(slow_tx)).await.unwrap();
    let mut fast = viewer(&fx.coordinator).await;
    drain(&mut fast);

    fx.coordinator.control(SlideshowAction::Next).await;
    fx.coordinator.control(SlideshowAction::Next).await;

    assert_eq!(fx.coordinator.hub().len(), 1);
    assert_eq!(next_message(&mut fast).await["state"]["index"], 1);
    assert_eq!(next_message(&mut fast).await["state"]["index"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_patch_cannot_touch_the_order() {
    let fx = fixture();
    upload(&fx.coordinator, &["a.png"]).await;

    let updated = fx
        .coordinator
        .update_settings(json!({"slideshowInterval": 30, "imageOrder": [], "theme": "light"}))
        .await
        .unwrap();
    assert_eq!(updated.slideshow_interval, 30);
    assert_eq!(updated.image_order, vec!["a.png"]);
    assert_eq!(fx.coordinator.settings().extra["theme"], "light");

    let err = fx
        .coordinator
        .update_settings(json!({"slideshowInterval": 0}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = fx.coordinator.update_settings(json!([1, 2])).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(fx.coordinator.settings().slideshow_interval, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconcile_broadcasts_and_clamps() {
    let fx = fixture();
    upload(&fx.coordinator, &["a.png", "b.png"]).await;
    fx.coordinator.control(SlideshowAction::Next).await;
    let mut rx = viewer(&fx.coordinator).await;
    drain(&mut rx);

    std::fs::remove_file(fx.tmp.path().join("thumbs/b.png")).unwrap();
    assert_eq!(fx.coordinator.reconcile().await.unwrap(), 1);
    assert_eq!(image_ids(&next_message(&mut rx).await), vec!["a.png"]);
    assert_eq!(next_message(&mut rx).await["state"]["index"], 0);
}
