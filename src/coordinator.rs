//! Sequencing of mutations and the broadcasts that follow them.
//!
//! The slideshow mutex doubles as the process-wide publish gate: every
//! broadcast and every viewer registration happens while it is held, so each
//! viewer sees snapshots in commit order and a joining viewer can never miss
//! a push that happens between its catch-up and its registration.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::events::{ImageEntry, OpResult, ServerMessage, UploadResult};
use crate::hub::{BroadcastHub, ChannelId, DeliveryError, ViewerChannel};
use crate::library::ImageLibrary;
use crate::settings::{KioskSettings, SettingsStore};
use crate::slideshow::{SlideshowAction, SlideshowState};

/// One file of an upload batch.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadCandidate {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

pub struct SyncCoordinator {
    library: ImageLibrary,
    settings: Arc<dyn SettingsStore>,
    hub: Arc<BroadcastHub>,
    slideshow: Mutex<SlideshowState>,
}

impl SyncCoordinator {
    pub fn new(
        library: ImageLibrary,
        settings: Arc<dyn SettingsStore>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            library,
            settings,
            hub,
            slideshow: Mutex::new(SlideshowState::default()),
        }
    }

    pub fn images(&self) -> Vec<ImageEntry> {
        self.library.list().to_vec()
    }

    pub async fn slideshow_state(&self) -> SlideshowState {
        *self.slideshow.lock().await
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Ingest every candidate independently and broadcast the library once
    /// if anything was admitted.
    ///
    /// Files of one batch are appended in submission order.
    #[instrument(skip_all, fields(files = candidates.len()))]
    pub async fn upload(&self, candidates: Vec<UploadCandidate>) -> Vec<UploadResult> {
        let mut admitted = 0;
        let mut results = Vec::with_capacity(candidates.len());
        for UploadCandidate { name, bytes } in candidates {
            match self.library.ingest(bytes, &name).await {
                Ok(_) => {
                    admitted += 1;
                    results.push(UploadResult::accepted(name));
                }
                Err(err) => {
                    warn!(file = %name, error = %err, "upload rejected");
                    results.push(UploadResult::rejected(name, err));
                }
            }
        }

        if admitted > 0 {
            let gate = self.slideshow.lock().await;
            self.publish_images(&gate);
        }
        info!(admitted, rejected = results.len() - admitted, "upload batch processed");
        results
    }

    /// Viewers are told the entry is gone before its files are removed.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> OpResult {
        match self.library.remove(id).await {
            Ok(removal) => {
                self.publish_library_change().await;
                self.library.purge(removal).await;
                OpResult::ok()
            }
            Err(err) => {
                warn!(id, error = %err, "delete failed");
                OpResult::failed(err)
            }
        }
    }

    /// Replace the display order. Ids left out stay in the library.
    #[instrument(skip_all, fields(len = order.len()))]
    pub async fn reorder(&self, order: Vec<String>) -> OpResult {
        if let Some(blank) = order.iter().position(String::is_empty) {
            return OpResult::failed(Error::validation(format!(
                "order entry {blank} is an empty id"
            )));
        }
        match self.library.reorder(order).await {
            Ok(()) => {
                let gate = self.slideshow.lock().await;
                self.publish_images(&gate);
                OpResult::ok()
            }
            Err(err) => {
                warn!(error = %err, "reorder failed");
                OpResult::failed(err)
            }
        }
    }

    /// Apply a control action and echo the resulting state to every viewer,
    /// even when the action changed nothing.
    #[instrument(skip(self))]
    pub async fn control(&self, action: SlideshowAction) -> SlideshowState {
        let mut gate = self.slideshow.lock().await;
        let state = gate.apply(action);
        self.hub.publish(&ServerMessage::SlideshowState { state });
        info!(index = state.index, playing = state.playing, "slideshow updated");
        state
    }

    /// Register a viewer and hand it the current state and library.
    pub async fn connect(
        &self,
        channel: Arc<dyn ViewerChannel>,
    ) -> Result<ChannelId, DeliveryError> {
        let gate = self.slideshow.lock().await;
        let catch_up = [
            ServerMessage::SlideshowState { state: *gate },
            ServerMessage::ImagesUpdated {
                images: self.images(),
            },
        ];
        self.hub.register(channel, &catch_up)
    }

    pub fn disconnect(&self, id: ChannelId) {
        self.hub.unregister(id);
    }

    /// Re-read the persisted order and stored assets, then push the result.
    pub async fn reconcile(&self) -> Result<usize> {
        let count = self.library.reconcile().await?;
        self.publish_library_change().await;
        Ok(count)
    }

    pub fn settings(&self) -> KioskSettings {
        self.settings.snapshot()
    }

    /// Merge `patch` into the persisted settings. The image order is not
    /// editable this way.
    pub async fn update_settings(&self, patch: Value) -> Result<KioskSettings> {
        let Value::Object(patch) = patch else {
            return Err(Error::validation("settings patch must be a JSON object"));
        };
        self.settings
            .snapshot()
            .apply_patch(&patch)
            .map_err(|err| Error::validation(format!("{err:#}")))?;

        let settings = Arc::clone(&self.settings);
        let updated = task::spawn_blocking(move || settings.update(&patch))
            .await
            .map_err(|err| Error::Persistence(anyhow::anyhow!("settings writer failed: {err}")))?
            .map_err(Error::Persistence)?;
        info!("settings updated");
        Ok(updated)
    }

    async fn publish_library_change(&self) {
        let mut gate = self.slideshow.lock().await;
        self.publish_images(&gate);
        if gate.clamp_to(self.library.len()) {
            let state = *gate;
            info!(index = state.index, "slideshow index clamped");
            self.hub.publish(&ServerMessage::SlideshowState { state });
        }
    }

    fn publish_images(&self, _gate: &MutexGuard<'_, SlideshowState>) {
        self.hub.publish(&ServerMessage::ImagesUpdated {
            images: self.images(),
        });
    }
}

/// Validate a reorder payload: a JSON array of strings.
pub fn parse_order(value: &Value) -> Result<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(Error::validation("order must be an array of image ids"));
    };
    items
        .iter()
        .enumerate()
        .map(|(position, item)| match item {
            Value::String(id) => Ok(id.clone()),
            other => Err(Error::validation(format!(
                "order entry {position} is not a string: {other}"
            ))),
        })
        .collect()
}
