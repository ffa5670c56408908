//! The ordered image library and its ingestion pipeline.
//!
//! Two pieces of state are kept in step here: the set of entries whose
//! assets are fully written, and the persisted display order. Every
//! read-modify-write of the order happens while holding `state`, and so does
//! every change to the live asset files. Decoding, encoding and writing the
//! staged copies happen before the lock is taken; the staged files are
//! renamed into place inside it.
//! Readers never lock: [`ImageLibrary::list`] returns the last published
//! snapshot.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{Mutex, watch};
use tokio::task;
use tracing::{debug, info, instrument, warn};

use crate::config::EncodingOptions;
use crate::error::{Error, Result};
use crate::events::ImageEntry;
use crate::processing::pipeline::{IngestLimits, prepare_upload};
use crate::settings::SettingsStore;
use crate::storage::{AssetKind, AssetRef, AssetStore, StagedAsset, validate_storage_key};

#[derive(Debug, Clone, Copy)]
pub struct LibraryOptions {
    pub thumbnail_size: u32,
    pub encoding: EncodingOptions,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            thumbnail_size: 320,
            encoding: EncodingOptions::default(),
        }
    }
}

#[derive(Default)]
struct LibraryState {
    /// Mirror of the persisted order. May name ids that are no longer stored.
    order: Vec<String>,
    entries: HashMap<String, ImageEntry>,
}

/// Assets of an entry that is no longer listed, waiting for [`ImageLibrary::purge`].
#[derive(Debug)]
pub struct Removal {
    id: String,
    original: AssetRef,
    thumb: AssetRef,
}

impl Removal {
    pub fn id(&self) -> &str {
        &self.id
    }
}

pub struct ImageLibrary {
    settings: Arc<dyn SettingsStore>,
    assets: Arc<dyn AssetStore>,
    options: LibraryOptions,
    state: Mutex<LibraryState>,
    snapshot: watch::Sender<Arc<[ImageEntry]>>,
}

impl ImageLibrary {
    /// Rebuild the library from stored assets and the persisted order.
    ///
    /// Unreadable persistence is not fatal: the library starts with an empty
    /// order and lists whatever assets it finds.
    pub fn open(
        settings: Arc<dyn SettingsStore>,
        assets: Arc<dyn AssetStore>,
        options: LibraryOptions,
    ) -> Self {
        let state = load_state(settings.as_ref(), assets.as_ref());
        let (snapshot, _) = watch::channel(arrange(&state.order, &state.entries).into());
        info!(
            images = state.entries.len(),
            ordered = state.order.len(),
            "image library opened"
        );
        Self {
            settings,
            assets,
            options,
            state: Mutex::new(state),
            snapshot,
        }
    }

    /// Entries in display order.
    pub fn list(&self) -> Arc<[ImageEntry]> {
        self.snapshot.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot.borrow().iter().any(|entry| entry.id == id)
    }

    /// Validate, transform and store one upload, then make it visible.
    ///
    /// Either both assets are in place and the entry is listed, or the live
    /// files and the order are left as they were. Uploading an id that already
    /// exists replaces its assets and keeps its position.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn ingest(&self, bytes: Vec<u8>, original_name: &str) -> Result<ImageEntry> {
        let id = validate_storage_key(original_name)?.to_string();
        let limits = IngestLimits {
            min_long_side: self.settings.min_long_side(),
            display_cap: self.settings.display_cap(),
            thumbnail_size: self.options.thumbnail_size,
            encoding: self.options.encoding,
        };

        let assets = Arc::clone(&self.assets);
        let staged_id = id.clone();
        let (original, thumb) = task::spawn_blocking(move || {
            stage_assets(assets.as_ref(), &staged_id, &bytes, &limits)
        })
        .await
        .map_err(|err| Error::Transform(anyhow!("ingest worker failed: {err}")))??;

        let mut state = self.state.lock().await;
        let replacing = state.entries.contains_key(&id);
        let mut previous_order = None;
        if !state.order.iter().any(|known| known == &id) {
            let mut next = state.order.clone();
            next.push(id.clone());
            if let Err(err) = self.persist_order(next.clone()).await {
                self.drop_staged(vec![original, thumb]).await;
                return Err(err);
            }
            previous_order = Some(std::mem::replace(&mut state.order, next));
        }

        let assets = Arc::clone(&self.assets);
        let committed_id = id.clone();
        let committed = task::spawn_blocking(move || {
            commit_pair(assets.as_ref(), committed_id, original, thumb, replacing)
        })
        .await
        .map_err(|err| Error::Storage(anyhow!("commit worker failed: {err}")))
        .and_then(|committed| committed);
        let entry = match committed {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(previous) = previous_order {
                    match self.persist_order(previous.clone()).await {
                        Ok(()) => state.order = previous,
                        Err(rollback) => {
                            warn!(id = %id, error = %rollback, "could not take the id back out of the order")
                        }
                    }
                }
                return Err(err);
            }
        };
        state.entries.insert(id, entry.clone());
        self.publish(&state);
        info!(id = %entry.id, replacing, "image ingested");
        Ok(entry)
    }

    /// Take an entry out of the order and the listing. Its files stay until
    /// the returned [`Removal`] is purged. Unknown ids are not an error.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<Removal> {
        let id = validate_storage_key(id)?;
        let mut state = self.state.lock().await;
        if state.order.iter().any(|known| known == id) {
            let next: Vec<String> = state
                .order
                .iter()
                .filter(|known| known.as_str() != id)
                .cloned()
                .collect();
            self.persist_order(next.clone()).await?;
            state.order = next;
        }
        let removed = state.entries.remove(id);
        self.publish(&state);

        let (original, thumb) = match removed {
            Some(entry) => (entry.original, entry.thumb),
            None => (
                self.assets.asset_ref(AssetKind::Original, id),
                self.assets.asset_ref(AssetKind::Thumb, id),
            ),
        };
        info!(id, "image removed from library");
        Ok(Removal {
            id: id.to_string(),
            original,
            thumb,
        })
    }

    /// Delete the files of a removed entry, unless the id was uploaded again
    /// in the meantime.
    pub async fn purge(&self, removal: Removal) {
        let state = self.state.lock().await;
        let Removal {
            id,
            original,
            thumb,
        } = removal;
        if state.entries.contains_key(&id) {
            info!(id = %id, "image was uploaded again; keeping its assets");
            return;
        }
        let assets = Arc::clone(&self.assets);
        match task::spawn_blocking(move || discard(assets.as_ref(), &[&original, &thumb])).await {
            Ok(()) => debug!(id = %id, "image assets removed"),
            Err(err) => warn!(id = %id, error = %err, "asset removal worker failed"),
        }
        drop(state);
    }

    /// Remove an entry and its assets in one step.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removal = self.remove(id).await?;
        self.purge(removal).await;
        Ok(())
    }

    /// Replace the persisted order wholesale.
    ///
    /// Ids missing from `order` stay in the library and are listed after the
    /// ordered ones; ids that are not stored are kept in the order but not listed.
    #[instrument(skip(self, order), fields(len = order.len()))]
    pub async fn reorder(&self, order: Vec<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.persist_order(order.clone()).await?;
        state.order = order;
        self.publish(&state);
        info!("image order replaced");
        Ok(())
    }

    /// Re-read the persisted order and re-scan stored assets.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let settings = Arc::clone(&self.settings);
        let assets = Arc::clone(&self.assets);
        let fresh = task::spawn_blocking(move || load_state(settings.as_ref(), assets.as_ref()))
            .await
            .map_err(|err| Error::Storage(anyhow!("reconcile worker failed: {err}")))?;
        *state = fresh;
        self.publish(&state);
        let count = state.entries.len();
        info!(images = count, "library reconciled");
        Ok(count)
    }

    async fn persist_order(&self, order: Vec<String>) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        task::spawn_blocking(move || settings.write_order(&order))
            .await
            .map_err(|err| Error::Persistence(anyhow!("order writer failed: {err}")))?
            .map_err(Error::Persistence)
    }

    async fn drop_staged(&self, staged: Vec<StagedAsset>) {
        let assets = Arc::clone(&self.assets);
        let dropped = task::spawn_blocking(move || {
            for asset in staged {
                assets.discard_staged(asset);
            }
        });
        if let Err(err) = dropped.await {
            warn!(error = %err, "staged asset cleanup failed");
        }
    }

    fn publish(&self, state: &LibraryState) {
        self.snapshot
            .send_replace(arrange(&state.order, &state.entries).into());
    }
}

fn stage_assets(
    assets: &dyn AssetStore,
    id: &str,
    bytes: &[u8],
    limits: &IngestLimits,
) -> Result<(StagedAsset, StagedAsset)> {
    let prepared = prepare_upload(bytes, id, limits)?;
    let original = assets
        .stage_asset(AssetKind::Original, id, &prepared.original)
        .map_err(Error::Storage)?;
    match assets.stage_asset(AssetKind::Thumb, id, &prepared.thumb) {
        Ok(thumb) => Ok((original, thumb)),
        Err(err) => {
            assets.discard_staged(original);
            Err(Error::Storage(err))
        }
    }
}

/// Thumbnail first: an original is only listed once its thumbnail exists.
fn commit_pair(
    assets: &dyn AssetStore,
    id: String,
    original: StagedAsset,
    thumb: StagedAsset,
    replacing: bool,
) -> Result<ImageEntry> {
    let thumb = match assets.commit_staged(thumb) {
        Ok(thumb) => thumb,
        Err(err) => {
            assets.discard_staged(original);
            return Err(Error::Storage(err));
        }
    };
    let original = match assets.commit_staged(original) {
        Ok(original) => original,
        Err(err) => {
            if replacing {
                warn!(id = %id, "thumbnail replaced but the previous original was kept");
            } else {
                discard(assets, &[&thumb]);
            }
            return Err(Error::Storage(err));
        }
    };
    Ok(ImageEntry {
        id,
        original,
        thumb,
    })
}

fn discard(assets: &dyn AssetStore, refs: &[&AssetRef]) {
    for asset in refs {
        if let Err(err) = assets.delete_asset(asset) {
            warn!(asset = asset.location(), error = %err, "failed to remove asset");
        }
    }
}

fn load_state(settings: &dyn SettingsStore, assets: &dyn AssetStore) -> LibraryState {
    let order = settings.read_order().unwrap_or_else(|err| {
        warn!(error = %err, "persisted order unavailable; starting unordered");
        Vec::new()
    });
    let ids = assets.stored_ids().unwrap_or_else(|err| {
        warn!(error = %err, "asset listing failed; starting empty");
        Vec::new()
    });
    let entries = ids
        .into_iter()
        .map(|id| {
            let entry = ImageEntry {
                original: assets.asset_ref(AssetKind::Original, &id),
                thumb: assets.asset_ref(AssetKind::Thumb, &id),
                id: id.clone(),
            };
            (id, entry)
        })
        .collect();
    LibraryState { order, entries }
}

/// Ordered ids first, then every other entry in collation order.
fn arrange(order: &[String], entries: &HashMap<String, ImageEntry>) -> Vec<ImageEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut out = Vec::with_capacity(entries.len());
    for id in order {
        if let Some(entry) = entries.get(id) {
            if seen.insert(id.as_str()) {
                out.push(entry.clone());
            }
        }
    }
    let mut rest: Vec<&ImageEntry> = entries
        .values()
        .filter(|entry| !seen.contains(entry.id.as_str()))
        .collect();
    rest.sort_by(|a, b| collate(&a.id, &b.id));
    out.extend(rest.into_iter().cloned());
    out
}

fn collate(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
