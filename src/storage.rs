use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::error::Error;

const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Original,
    Thumb,
}

impl AssetKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Original => "originals",
            Self::Thumb => "thumbs",
        }
    }
}

/// Opaque handle to one stored asset. Serializes as its public location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    kind: AssetKind,
    id: String,
    location: String,
}

impl AssetRef {
    pub fn new(kind: AssetKind, id: &str, public_prefix: &str) -> Self {
        let prefix = public_prefix.trim_end_matches('/');
        Self {
            kind,
            id: id.to_string(),
            location: format!("{prefix}/{}/{id}", kind.dir_name()),
        }
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl Serialize for AssetRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.location)
    }
}

/// An asset written under a private staging name. Nothing is visible under
/// its id until it is committed.
#[derive(Debug)]
pub struct StagedAsset {
    kind: AssetKind,
    id: String,
    staging: PathBuf,
}

impl StagedAsset {
    pub fn new(kind: AssetKind, id: &str, staging: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            id: id.to_string(),
            staging: staging.into(),
        }
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }
}

/// Where originals and thumbnails live.
pub trait AssetStore: Send + Sync {
    /// Durably write `bytes` under a staging name.
    fn stage_asset(&self, kind: AssetKind, id: &str, bytes: &[u8]) -> Result<StagedAsset>;
    /// Atomically move a staged asset into place, replacing any previous
    /// asset of the same kind and id. On failure the staged data is dropped.
    fn commit_staged(&self, staged: StagedAsset) -> Result<AssetRef>;
    fn discard_staged(&self, staged: StagedAsset);
    /// Remove an asset. A missing asset is not an error.
    fn delete_asset(&self, asset: &AssetRef) -> Result<()>;
    fn asset_ref(&self, kind: AssetKind, id: &str) -> AssetRef;
    /// Ids for which both the original and the thumbnail are present.
    fn stored_ids(&self) -> Result<Vec<String>>;

    /// Stage and commit in one step.
    fn write_asset(&self, kind: AssetKind, id: &str, bytes: &[u8]) -> Result<AssetRef> {
        let staged = self.stage_asset(kind, id, bytes)?;
        self.commit_staged(staged)
    }
}

/// Reject names that cannot be used verbatim as a file name inside the asset folders.
pub fn validate_storage_key(name: &str) -> Result<&str, Error> {
    if name.is_empty() {
        return Err(Error::validation("file name must not be empty"));
    }
    if name.len() > MAX_KEY_LEN {
        return Err(Error::validation(format!(
            "file name is longer than {MAX_KEY_LEN} bytes"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::validation(format!(
            "file name '{name}' must not start with '.'"
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::validation(format!(
            "file name '{name}' contains a path separator or control character"
        )));
    }
    if Path::new(name).file_name() != Some(OsStr::new(name)) {
        return Err(Error::validation(format!(
            "file name '{name}' is not a plain file name"
        )));
    }
    Ok(name)
}

/// Assets stored as plain files under `<root>/originals` and `<root>/thumbs`.
pub struct FsAssetStore {
    root: PathBuf,
    public_prefix: String,
    temp_counter: AtomicU64,
}

impl FsAssetStore {
    pub fn open(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Result<Self> {
        let root = root.into();
        for kind in [AssetKind::Original, AssetKind::Thumb] {
            let dir = root.join(kind.dir_name());
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create asset directory {}", dir.display()))?;
        }
        info!(root = %root.display(), "asset store ready");
        Ok(Self {
            root,
            public_prefix: public_prefix.into(),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn path_for(&self, kind: AssetKind, id: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(id)
    }

    fn temp_path_for(&self, kind: AssetKind, id: &str) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(kind.dir_name())
            .join(format!(".{id}.{}-{n}.tmp", std::process::id()))
    }
}

impl AssetStore for FsAssetStore {
    fn stage_asset(&self, kind: AssetKind, id: &str, bytes: &[u8]) -> Result<StagedAsset> {
        let temp = self.temp_path_for(kind, id);
        let written = (|| -> Result<()> {
            let mut file = File::create(&temp)
                .with_context(|| format!("failed to create {}", temp.display()))?;
            file.write_all(bytes)
                .with_context(|| format!("failed to write {}", temp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to flush {}", temp.display()))?;
            Ok(())
        })();
        if let Err(err) = written {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
        debug!(path = %temp.display(), bytes = bytes.len(), "asset staged");
        Ok(StagedAsset::new(kind, id, temp))
    }

    fn commit_staged(&self, staged: StagedAsset) -> Result<AssetRef> {
        let target = self.path_for(staged.kind(), staged.id());
        if let Err(err) = fs::rename(staged.staging_path(), &target) {
            let _ = fs::remove_file(staged.staging_path());
            return Err(err)
                .with_context(|| format!("failed to move {} into place", target.display()));
        }
        debug!(path = %target.display(), "asset committed");
        Ok(self.asset_ref(staged.kind(), staged.id()))
    }

    fn discard_staged(&self, staged: StagedAsset) {
        match fs::remove_file(staged.staging_path()) {
            Ok(()) => debug!(path = %staged.staging_path().display(), "staged asset dropped"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %staged.staging_path().display(),
                error = %e,
                "failed to remove staged asset"
            ),
        }
    }

    fn delete_asset(&self, asset: &AssetRef) -> Result<()> {
        let path = self.path_for(asset.kind(), asset.id());
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "asset removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "asset already absent");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn asset_ref(&self, kind: AssetKind, id: &str) -> AssetRef {
        AssetRef::new(kind, id, &self.public_prefix)
    }

    fn stored_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join(AssetKind::Original.dir_name());
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "skipping non UTF-8 asset name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if !self.path_for(AssetKind::Thumb, &name).is_file() {
                warn!(id = %name, "original has no thumbnail; not listing it");
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }
}
