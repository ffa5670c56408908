use serde::Serialize;

use crate::slideshow::SlideshowState;
use crate::storage::AssetRef;

/// One ingested image as observers see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageEntry {
    pub id: String,
    pub original: AssetRef,
    pub thumb: AssetRef,
}

/// Snapshots pushed to every viewer channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    SlideshowState { state: SlideshowState },
    ImagesUpdated { images: Vec<ImageEntry> },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SlideshowState { .. } => "slideshow-state",
            Self::ImagesUpdated { .. } => "images-updated",
        }
    }
}

/// Per-file outcome of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub file: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResult {
    pub fn accepted(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ok: true,
            error: None,
        }
    }

    pub fn rejected(file: impl Into<String>, error: impl ToString) -> Self {
        Self {
            file: file.into(),
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of delete, reorder and settings updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

impl<E: ToString> From<Result<(), E>> for OpResult {
    fn from(value: Result<(), E>) -> Self {
        match value {
            Ok(()) => Self::ok(),
            Err(err) => Self::failed(err),
        }
    }
}
