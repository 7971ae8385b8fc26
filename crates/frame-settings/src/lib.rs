use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use chrono_tz::Tz;
use serde_json::{Map, Number, Value, json};

pub use snapshot::{ImageSizing, PowerMode, UserSettings};

/// File name of the user settings document inside the config directory.
pub const SETTINGS_FILE: &str = "settings.json";

fn defaults() -> BTreeMap<String, Value> {
    let table = json!({
        "width": 1920,
        "height": 1080,
        "depth": 32,
        "tvservice": "DMT 82 DVI",
        "resolution": "",
        "timezone": "",
        "interval": 60,
        "display-off": 22,
        "display-on": 4,
        "refresh-content": 24,
        "autooff-lux": 0.01,
        "autooff-lux-high": 0.05,
        "autooff-time": 0,
        "powersave": "",
        "shutdown-pin": 26,
        "imagesizing": "blur",
        "randomize_images": 1,
        "enable-cache": 1,
        "force_orientation": 0,
        "colortemp-min": 2000,
        "colortemp-max": 7500,
        "display-driver": "none",
        "rotation": 0,
    });
    match table {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

/// Turns user input into an int or float when it parses as one.
///
/// A dot selects float parsing; anything that fails to parse stays a string.
pub fn convert_to_native(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.contains('.') {
        if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(number);
        }
    } else if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    Value::String(raw.to_string())
}

fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => convert_to_native(&s),
        other => other,
    }
}

/// Persisted flat key/value settings with known keys and defaults.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    values: BTreeMap<String, Value>,
    legacy: BTreeMap<String, Value>,
}

impl SettingsStore {
    /// Settings backed by `path`, holding only defaults until saved.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: defaults(),
            legacy: BTreeMap::new(),
        }
    }

    /// Loads `path`, merging stored values over the defaults.
    ///
    /// Accepts both the flat layout and the older `{"cfg": {..}, ..}` layout.
    /// Keys the store doesn't know are kept aside for [`Self::take_legacy`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::with_defaults(path);
        if !store.path.exists() {
            tracing::info!(path = %store.path.display(), "no settings file; using defaults");
            return Ok(store);
        }
        let raw = fs::read_to_string(&store.path)
            .with_context(|| format!("failed to read settings from {}", store.path.display()))?;
        let parsed: Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt settings file {}", store.path.display()))?;
        store.merge(parsed);
        Ok(store)
    }

    fn merge(&mut self, mut parsed: Map<String, Value>) {
        if let Some(Value::Object(cfg)) = parsed.remove("cfg") {
            for (key, value) in parsed {
                self.legacy.insert(key, value);
            }
            parsed = cfg;
        }
        for (key, value) in parsed {
            if self.values.contains_key(&key) {
                self.values.insert(key, normalize(value));
            } else {
                self.legacy.insert(key, value);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(&self.values)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn all(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Writes a user-supplied string, converted to its native type.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<Value> {
        let value = convert_to_native(raw);
        self.set_value(key, value.clone())?;
        Ok(value)
    }

    pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
        if !self.is_known(key) {
            bail!("unknown setting {key:?}");
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Restores every known key to its default.
    pub fn reset(&mut self) {
        self.values = defaults();
    }

    pub fn take_legacy(&mut self, key: &str) -> Option<Value> {
        self.legacy.remove(key)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes" | "on"),
            Some(_) => self.int(key).is_some_and(|v| v != 0),
            None => false,
        }
    }

    /// Typed copy of the values the service acts on.
    pub fn snapshot(&self) -> UserSettings {
        let int_or = |key: &str, default: i64| self.int(key).unwrap_or(default);
        let float_or = |key: &str, default: f64| self.float(key).unwrap_or(default);
        let timezone = self
            .string("timezone")
            .filter(|tz| !tz.trim().is_empty())
            .and_then(|tz| match tz.parse::<Tz>() {
                Ok(tz) => Some(tz),
                Err(err) => {
                    tracing::warn!(timezone = %tz, error = %err, "ignoring unknown timezone");
                    None
                }
            });

        UserSettings {
            width: int_or("width", 1920).max(1) as u32,
            height: int_or("height", 1080).max(1) as u32,
            depth: int_or("depth", 32).max(1) as u32,
            tvservice: self.string("tvservice").unwrap_or_default(),
            timezone,
            interval_secs: int_or("interval", 60).max(1) as u64,
            display_on: int_or("display-on", 4).clamp(0, 23) as u32,
            display_off: int_or("display-off", 22).clamp(0, 23) as u32,
            refresh_content_hours: int_or("refresh-content", 24).max(0) as u64,
            autooff_lux: float_or("autooff-lux", 0.01),
            autooff_lux_high: float_or("autooff-lux-high", 0.05),
            autooff_time_minutes: int_or("autooff-time", 0).max(0) as u64,
            powersave: PowerMode::parse(&self.string("powersave").unwrap_or_default()),
            shutdown_pin: int_or("shutdown-pin", 26) as i32,
            imagesizing: ImageSizing::parse(&self.string("imagesizing").unwrap_or_default()),
            randomize: self.flag("randomize_images"),
            enable_cache: self.flag("enable-cache"),
            force_orientation: self.flag("force_orientation"),
            colortemp_min: float_or("colortemp-min", 2000.0),
            colortemp_max: float_or("colortemp-max", 7500.0),
            display_driver: self.string("display-driver").unwrap_or_default(),
            rotation: int_or("rotation", 0).rem_euclid(360) as u32,
        }
    }
}

mod snapshot {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum PowerMode {
        #[default]
        None,
        Sensor,
        Schedule,
        SensorAndSchedule,
    }

    impl PowerMode {
        pub fn parse(raw: &str) -> Self {
            match raw.trim() {
                "sensor" => Self::Sensor,
                "schedule" => Self::Schedule,
                "sensor+schedule" => Self::SensorAndSchedule,
                _ => Self::None,
            }
        }

        pub fn uses_sensor(self) -> bool {
            matches!(self, Self::Sensor | Self::SensorAndSchedule)
        }

        pub fn uses_schedule(self) -> bool {
            matches!(self, Self::Schedule | Self::SensorAndSchedule)
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Self::None => "none",
                Self::Sensor => "sensor",
                Self::Schedule => "schedule",
                Self::SensorAndSchedule => "sensor+schedule",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum ImageSizing {
        #[default]
        Blur,
        Zoom,
        None,
    }

    impl ImageSizing {
        pub fn parse(raw: &str) -> Self {
            match raw.trim() {
                "zoom" => Self::Zoom,
                "none" => Self::None,
                _ => Self::Blur,
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct UserSettings {
        pub width: u32,
        pub height: u32,
        pub depth: u32,
        pub tvservice: String,
        pub timezone: Option<Tz>,
        pub interval_secs: u64,
        pub display_on: u32,
        pub display_off: u32,
        /// Hours before a keyword snapshot is considered stale.
        pub refresh_content_hours: u64,
        pub autooff_lux: f64,
        pub autooff_lux_high: f64,
        /// Minutes of darkness before the ambient watcher votes standby; 0 disables it.
        pub autooff_time_minutes: u64,
        pub powersave: PowerMode,
        pub shutdown_pin: i32,
        pub imagesizing: ImageSizing,
        pub randomize: bool,
        pub enable_cache: bool,
        pub force_orientation: bool,
        pub colortemp_min: f64,
        pub colortemp_max: f64,
        pub display_driver: String,
        pub rotation: u32,
    }

    impl UserSettings {
        pub fn validate(&self) -> Result<()> {
            ensure!(
                self.colortemp_min <= self.colortemp_max,
                "colortemp-min must not exceed colortemp-max"
            );
            ensure!(
                self.autooff_lux <= self.autooff_lux_high,
                "autooff-lux must not exceed autooff-lux-high"
            );
            Ok(())
        }

        /// Display size after applying the configured rotation.
        pub fn display_size(&self) -> (u32, u32) {
            if self.rotation == 90 || self.rotation == 270 {
                (self.height, self.width)
            } else {
                (self.width, self.height)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_conversion_prefers_numbers() {
        assert_eq!(convert_to_native("42"), json!(42));
        assert_eq!(convert_to_native("0.25"), json!(0.25));
        assert_eq!(convert_to_native("sensor+schedule"), json!("sensor+schedule"));
        assert_eq!(convert_to_native("1.2.3"), json!("1.2.3"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join(SETTINGS_FILE)).unwrap();
        let snap = store.snapshot();
        assert_eq!((snap.width, snap.height), (1920, 1080));
        assert_eq!(snap.interval_secs, 60);
        assert_eq!(snap.refresh_content_hours, 24);
        assert_eq!(snap.powersave, PowerMode::None);
        assert_eq!(snap.imagesizing, ImageSizing::Blur);
        assert!(snap.randomize);
        assert!(!snap.force_orientation);
    }

    #[test]
    fn unknown_keys_are_rejected_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::with_defaults(dir.path().join(SETTINGS_FILE));
        assert!(store.set("no-such-key", "1").is_err());
        assert_eq!(store.set("interval", "15").unwrap(), json!(15));
        assert_eq!(store.snapshot().interval_secs, 15);
    }

    #[test]
    fn saved_values_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join(SETTINGS_FILE);
        let mut store = SettingsStore::with_defaults(&path);
        store.set("display-on", "7").unwrap();
        store.set("powersave", "schedule").unwrap();
        store.save().unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.int("display-on"), Some(7));
        assert_eq!(reloaded.snapshot().powersave, PowerMode::Schedule);
    }

    #[test]
    fn legacy_layout_is_understood() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(
            &path,
            r#"{"oauth_token": {"access_token": "abc"}, "cfg": {"width": "1280", "keywords": ["cats"]}}"#,
        )
        .unwrap();

        let mut store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.int("width"), Some(1280));
        assert_eq!(store.take_legacy("keywords"), Some(json!(["cats"])));
        assert!(store.take_legacy("oauth_token").is_some());
        assert!(store.take_legacy("oauth_token").is_none());
    }

    #[test]
    fn power_modes_parse() {
        assert!(PowerMode::parse("sensor+schedule").uses_sensor());
        assert!(PowerMode::parse("sensor+schedule").uses_schedule());
        assert!(!PowerMode::parse("").uses_schedule());
        assert_eq!(PowerMode::parse("bogus"), PowerMode::None);
    }

    #[test]
    fn rotation_swaps_display_axes() {
        let mut store = SettingsStore::with_defaults("unused.json");
        store.set("rotation", "90").unwrap();
        assert_eq!(store.snapshot().display_size(), (1080, 1920));
    }
}
