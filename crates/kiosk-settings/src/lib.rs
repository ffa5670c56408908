//! Persisted kiosk settings document.
//!
//! This is the JSON document the admin console reads and edits. The server
//! consumes a few of its keys (resolution floor, display cap, image order)
//! and carries every other key through untouched so presentation-only
//! settings survive a round trip.

use anyhow::{Result, bail, ensure};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the image order inside the document. Owned by the image library,
/// never writable through [`KioskSettings::apply_patch`].
pub const IMAGE_ORDER_KEY: &str = "imageOrder";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KioskSettings {
    /// Uploads whose longer side is below this many pixels are rejected.
    pub min_image_long_side: u32,
    /// Stored originals are downscaled so their longer side fits this cap.
    pub max_display_long_side: u32,
    /// Seconds each slide stays on screen. Interpreted by the viewers.
    pub slideshow_interval: u64,
    /// Display order of image ids.
    pub image_order: Vec<String>,
    /// Keys this crate does not interpret (calendar, theme, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for KioskSettings {
    fn default() -> Self {
        Self {
            min_image_long_side: Self::DEFAULT_MIN_IMAGE_LONG_SIDE,
            max_display_long_side: Self::DEFAULT_MAX_DISPLAY_LONG_SIDE,
            slideshow_interval: Self::DEFAULT_SLIDESHOW_INTERVAL,
            image_order: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl KioskSettings {
    pub const DEFAULT_MIN_IMAGE_LONG_SIDE: u32 = 1280;
    pub const DEFAULT_MAX_DISPLAY_LONG_SIDE: u32 = 3840;
    pub const DEFAULT_SLIDESHOW_INTERVAL: u64 = 15;

    pub fn from_json(text: &str) -> Result<Self> {
        let parsed: Self = serde_json::from_str(text)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse a stored document, repairing unusable values instead of
    /// rejecting the document.
    ///
    /// The image order and unknown keys are always kept. Returns one message
    /// per repair. Fails only when `text` is not a JSON object.
    pub fn from_json_lenient(text: &str) -> Result<(Self, Vec<String>)> {
        let Value::Object(mut doc) = serde_json::from_str::<Value>(text)? else {
            bail!("settings document must be a JSON object");
        };
        let mut repairs = Vec::new();
        let min_image_long_side = take_or_default(
            &mut doc,
            "minImageLongSide",
            Self::DEFAULT_MIN_IMAGE_LONG_SIDE,
            &mut repairs,
        );
        let max_display_long_side = take_or_default(
            &mut doc,
            "maxDisplayLongSide",
            Self::DEFAULT_MAX_DISPLAY_LONG_SIDE,
            &mut repairs,
        );
        let slideshow_interval = take_or_default(
            &mut doc,
            "slideshowInterval",
            Self::DEFAULT_SLIDESHOW_INTERVAL,
            &mut repairs,
        );
        let image_order = match doc.remove(IMAGE_ORDER_KEY) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(id) if !id.is_empty() => Some(id),
                    other => {
                        repairs.push(format!("dropped imageOrder entry {other}"));
                        None
                    }
                })
                .collect(),
            Some(other) => {
                repairs.push(format!("imageOrder {other} is not an array; starting unordered"));
                Vec::new()
            }
        };

        let mut settings = Self {
            min_image_long_side,
            max_display_long_side,
            slideshow_interval,
            image_order,
            extra: doc,
        };
        if settings.min_image_long_side == 0 {
            repairs.push(format!(
                "minImageLongSide 0 replaced by {}",
                Self::DEFAULT_MIN_IMAGE_LONG_SIDE
            ));
            settings.min_image_long_side = Self::DEFAULT_MIN_IMAGE_LONG_SIDE;
        }
        if settings.max_display_long_side < settings.min_image_long_side {
            repairs.push(format!(
                "maxDisplayLongSide {} raised to minImageLongSide {}",
                settings.max_display_long_side, settings.min_image_long_side
            ));
            settings.max_display_long_side = settings.min_image_long_side;
        }
        if settings.slideshow_interval == 0 {
            repairs.push(format!(
                "slideshowInterval 0 replaced by {}",
                Self::DEFAULT_SLIDESHOW_INTERVAL
            ));
            settings.slideshow_interval = Self::DEFAULT_SLIDESHOW_INTERVAL;
        }
        Ok((settings, repairs))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.min_image_long_side > 0,
            "minImageLongSide must be greater than zero"
        );
        ensure!(
            self.max_display_long_side >= self.min_image_long_side,
            "maxDisplayLongSide ({}) must not be smaller than minImageLongSide ({})",
            self.max_display_long_side,
            self.min_image_long_side
        );
        ensure!(
            self.slideshow_interval > 0,
            "slideshowInterval must be at least one second"
        );
        ensure!(
            self.image_order.iter().all(|id| !id.is_empty()),
            "imageOrder must not contain empty ids"
        );
        Ok(())
    }

    /// Shallow-merge `patch` into a copy of the document and validate it.
    ///
    /// The image order is skipped even when present in the patch. On error
    /// `self` is left unchanged.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let Value::Object(mut merged) = serde_json::to_value(&*self)? else {
            bail!("settings document did not serialize to an object");
        };
        for (key, value) in patch {
            if key == IMAGE_ORDER_KEY {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
        let next: Self = serde_json::from_value(Value::Object(merged))?;
        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn take_or_default<T: DeserializeOwned>(
    doc: &mut Map<String, Value>,
    key: &str,
    default: T,
    repairs: &mut Vec<String>,
) -> T {
    let Some(value) = doc.remove(key) else {
        return default;
    };
    match T::deserialize(&value) {
        Ok(parsed) => parsed,
        Err(err) => {
            repairs.push(format!("{key} {value} ignored: {err}"));
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let settings = KioskSettings::from_json("{}").unwrap();
        assert_eq!(settings, KioskSettings::default());
    }

    #[test]
    fn unknown_keys_round_trip() {
        let text = r#"{"minImageLongSide": 800, "calendar": {"view": "WEEK"}}"#;
        let settings = KioskSettings::from_json(text).unwrap();
        assert_eq!(settings.min_image_long_side, 800);
        assert_eq!(settings.extra["calendar"], json!({"view": "WEEK"}));

        let reparsed = KioskSettings::from_json(&settings.to_json_pretty().unwrap()).unwrap();
        assert_eq!(reparsed, settings);
    }

    #[test]
    fn rejects_cap_below_minimum() {
        let err = KioskSettings::from_json(r#"{"minImageLongSide": 2000, "maxDisplayLongSide": 1000}"#)
            .unwrap_err();
        assert!(err.to_string().contains("maxDisplayLongSide"));
    }

    #[test]
    fn lenient_load_keeps_order_and_unknown_keys() {
        let text = r#"{
            "minImageLongSide": 4000,
            "imageOrder": ["b.jpg", "", "a.jpg"],
            "calendar": {"view": "WEEK"}
        }"#;
        assert!(KioskSettings::from_json(text).is_err());

        let (settings, repairs) = KioskSettings::from_json_lenient(text).unwrap();
        assert_eq!(settings.image_order, vec!["b.jpg".to_string(), "a.jpg".to_string()]);
        assert_eq!(settings.min_image_long_side, 4000);
        assert_eq!(settings.max_display_long_side, 4000);
        assert_eq!(settings.extra["calendar"], json!({"view": "WEEK"}));
        assert_eq!(repairs.len(), 2, "{repairs:?}");
        settings.validate().unwrap();
    }

    #[test]
    fn lenient_load_replaces_unusable_values() {
        let text = r#"{"minImageLongSide": 0, "slideshowInterval": "soon", "maxDisplayLongSide": null}"#;
        let (settings, repairs) = KioskSettings::from_json_lenient(text).unwrap();
        assert_eq!(
            settings.min_image_long_side,
            KioskSettings::DEFAULT_MIN_IMAGE_LONG_SIDE
        );
        assert_eq!(
            settings.max_display_long_side,
            KioskSettings::DEFAULT_MAX_DISPLAY_LONG_SIDE
        );
        assert_eq!(
            settings.slideshow_interval,
            KioskSettings::DEFAULT_SLIDESHOW_INTERVAL
        );
        assert_eq!(repairs.len(), 3, "{repairs:?}");
        assert!(settings.extra.is_empty());

        let (clean, repairs) = KioskSettings::from_json_lenient("{}").unwrap();
        assert_eq!(clean, KioskSettings::default());
        assert!(repairs.is_empty());
        assert!(KioskSettings::from_json_lenient("[1, 2]").is_err());
    }

    #[test]
    fn patch_never_touches_image_order() {
        let mut settings = KioskSettings {
            image_order: vec!["a.jpg".into()],
            ..KioskSettings::default()
        };
        settings
            .apply_patch(&patch(json!({
                "slideshowInterval": 30,
                "imageOrder": ["evil.jpg"],
                "showClock": true
            })))
            .unwrap();
        assert_eq!(settings.slideshow_interval, 30);
        assert_eq!(settings.image_order, vec!["a.jpg".to_string()]);
        assert_eq!(settings.extra["showClock"], json!(true));
    }

    #[test]
    fn invalid_patch_leaves_document_unchanged() {
        let mut settings = KioskSettings::default();
        let before = settings.clone();
        assert!(settings
            .apply_patch(&patch(json!({"minImageLongSide": 0})))
            .is_err());
        assert!(settings
            .apply_patch(&patch(json!({"slideshowInterval": "soon"})))
            .is_err());
        assert_eq!(settings, before);
    }
}
