use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub use kiosk_settings::KioskSettings;

/// Key-value persistence consumed by the image library and the config endpoint.
pub trait SettingsStore: Send + Sync {
    fn read_order(&self) -> Result<Vec<String>>;
    fn write_order(&self, order: &[String]) -> Result<()>;
    fn min_long_side(&self) -> u32;
    fn display_cap(&self) -> u32;
    fn snapshot(&self) -> KioskSettings;
    /// Merge `patch` into the document. Never changes the image order.
    fn update(&self, patch: &Map<String, Value>) -> Result<KioskSettings>;
}

/// JSON document on disk, cached in memory and rewritten atomically.
pub struct FileSettings {
    path: PathBuf,
    current: Mutex<KioskSettings>,
}

impl FileSettings {
    /// Load `path`, falling back to defaults when it is missing or unreadable.
    ///
    /// Out-of-range values are repaired one by one; the image order and
    /// unknown keys of a parseable document are always kept.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(text) => match KioskSettings::from_json_lenient(&text) {
                Ok((settings, repairs)) => {
                    for repair in &repairs {
                        warn!(path = %path.display(), %repair, "settings value repaired");
                    }
                    info!(path = %path.display(), images = settings.image_order.len(), "loaded settings");
                    settings
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "settings file is invalid; using defaults");
                    KioskSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no settings file yet; using defaults");
                KioskSettings::default()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "settings file unreadable; using defaults");
                KioskSettings::default()
            }
        };
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, KioskSettings>> {
        self.current
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    fn persist(&self, settings: &KioskSettings) -> Result<()> {
        let text = settings.to_json_pretty()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        let mut file = fs::File::create(&temp)
            .with_context(|| format!("failed to create {}", temp.display()))?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }

    fn modify(&self, change: impl FnOnce(&mut KioskSettings) -> Result<()>) -> Result<KioskSettings> {
        let mut current = self.lock()?;
        let mut next = current.clone();
        change(&mut next)?;
        self.persist(&next)?;
        *current = next;
        Ok(current.clone())
    }
}

impl SettingsStore for FileSettings {
    fn read_order(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.image_order.clone())
    }

    fn write_order(&self, order: &[String]) -> Result<()> {
        self.modify(|settings| {
            settings.image_order = order.to_vec();
            Ok(())
        })
        .map(|_| ())
    }

    fn min_long_side(&self) -> u32 {
        self.snapshot().min_image_long_side
    }

    fn display_cap(&self) -> u32 {
        self.snapshot().max_display_long_side
    }

    fn snapshot(&self) -> KioskSettings {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, patch: &Map<String, Value>) -> Result<KioskSettings> {
        self.modify(|settings| settings.apply_patch(patch))
    }
}

/// Settings kept only in memory. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemorySettings {
    current: Mutex<KioskSettings>,
    fail_writes: AtomicBool,
}

impl MemorySettings {
    pub fn new(settings: KioskSettings) -> Self {
        Self {
            current: Mutex::new(settings),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, KioskSettings>> {
        self.current
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(anyhow!("settings store is read-only"))
        } else {
            Ok(())
        }
    }
}

impl SettingsStore for MemorySettings {
    fn read_order(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.image_order.clone())
    }

    fn write_order(&self, order: &[String]) -> Result<()> {
        self.check_writable()?;
        self.lock()?.image_order = order.to_vec();
        Ok(())
    }

    fn min_long_side(&self) -> u32 {
        self.snapshot().min_image_long_side
    }

    fn display_cap(&self) -> u32 {
        self.snapshot().max_display_long_side
    }

    fn snapshot(&self) -> KioskSettings {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, patch: &Map<String, Value>) -> Result<KioskSettings> {
        self.check_writable()?;
        let mut current = self.lock()?;
        current.apply_patch(patch)?;
        Ok(current.clone())
    }
}
