use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

pub const CONFIG_DIR: &str = "photoframe_config";
pub const SERVICES_DIR: &str = "services";
pub const CACHE_DIR: &str = "cache";
pub const HISTORY_DIR: &str = "history";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DisplayConfig {
    /// Shows a rendered file; `@FILE@` and `@MIME@` are substituted.
    pub show_command: Option<String>,
    /// Renders a text message; `@TEXT@`, `@WIDTH@` and `@HEIGHT@` are substituted.
    pub message_command: Option<String>,
    pub power_on_command: Option<String>,
    pub power_off_command: Option<String>,
    pub backlight: Option<BacklightConfig>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_command: Some("fbi -T 1 -a --noverbose -1 @FILE@".to_string()),
            message_command: None,
            power_on_command: Some("vcgencmd display_power 1".to_string()),
            power_off_command: Some("vcgencmd display_power 0".to_string()),
            backlight: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BacklightConfig {
    pub path: PathBuf,
    #[serde(default = "BacklightConfig::default_off")]
    pub off_value: String,
    #[serde(default = "BacklightConfig::default_on")]
    pub on_value: String,
}

impl BacklightConfig {
    fn default_off() -> String {
        "1".to_string()
    }

    fn default_on() -> String {
        "0".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ColorMatchConfig {
    /// Script invoked as `<script> -t <kelvin> <in> <out>`.
    pub script: Option<PathBuf>,
    /// Text file holding raw `r g b [c]` sensor counts.
    pub sensor_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for ColorMatchConfig {
    fn default() -> Self {
        Self {
            script: None,
            sensor_path: None,
            sample_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MotionConfig {
    pub enabled: bool,
    pub gpio_pin: u32,
    pub sysfs_root: PathBuf,
    #[serde(with = "humantime_serde")]
    pub absence_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gpio_pin: 20,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            absence_delay: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct UsbConfig {
    pub base_dir: PathBuf,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/mnt/usb/photoframe"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retries: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            retries: 5,
            user_agent: format!("photoframe-svc/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    pub reboot_command: Option<String>,
    pub shutdown_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Root for settings, provider state, cache and history.
    pub base_dir: PathBuf,
    /// Scratch space for downloads in flight.
    pub temp_dir: PathBuf,
    pub bind_address: SocketAddr,
    /// Web UI assets served under `/`.
    pub static_dir: Option<PathBuf>,
    pub supported_mime_types: Vec<String>,
    pub oauth_redirect_uri: String,
    pub display: DisplayConfig,
    pub colormatch: ColorMatchConfig,
    pub motion: MotionConfig,
    pub usb: UsbConfig,
    pub http: HttpConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/photoframe"),
            temp_dir: std::env::temp_dir().join("photoframe"),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 7777)),
            static_dir: None,
            supported_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/gif".to_string(),
                "image/webp".to_string(),
            ],
            oauth_redirect_uri: "http://localhost:7777/callback".to_string(),
            display: DisplayConfig::default(),
            colormatch: ColorMatchConfig::default(),
            motion: MotionConfig::default(),
            usb: UsbConfig::default(),
            http: HttpConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.base_dir.as_os_str().is_empty(),
            "base-dir must not be empty"
        );
        ensure!(
            !self.supported_mime_types.is_empty(),
            "supported-mime-types must list at least one type"
        );
        ensure!(self.http.retries > 0, "http.retries must be at least 1");
        ensure!(!self.http.timeout.is_zero(), "http.timeout must be positive");
        ensure!(
            !self.motion.poll_interval.is_zero(),
            "motion.poll-interval must be positive"
        );
        ensure!(
            !self.colormatch.sample_interval.is_zero(),
            "colormatch.sample-interval must be positive"
        );
        url::Url::parse(&self.oauth_redirect_uri)
            .with_context(|| format!("invalid oauth-redirect-uri {}", self.oauth_redirect_uri))?;
        Ok(self)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join(CONFIG_DIR)
    }

    pub fn services_dir(&self) -> PathBuf {
        self.config_dir().join(SERVICES_DIR)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join(frame_settings::SETTINGS_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join(CACHE_DIR)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.base_dir.join(HISTORY_DIR)
    }

    pub fn supports_mime(&self, mime: &str) -> bool {
        self.supported_mime_types.iter().any(|m| m == mime)
    }
}
