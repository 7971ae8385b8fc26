use photoframe_svc::config::Configuration;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn parse_kebab_case_config() {
    let yaml = r#"
base-dir: "/srv/frame"
bind-address: "127.0.0.1:8080"
"#;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(cfg.base_dir, PathBuf::from("/srv/frame"));
    assert_eq!(cfg.bind_address.port(), 8080);
    assert_eq!(
        cfg.services_dir(),
        PathBuf::from("/srv/frame/photoframe_config/services")
    );
    assert_eq!(cfg.cache_dir(), PathBuf::from("/srv/frame/cache"));
    assert!(cfg.supports_mime("image/jpeg"));
}

#[test]
fn parse_durations_and_commands() {
    let yaml = r#"
display:
  show-command: "feh -F @FILE@"
  power-off-command: "wlr-randr --output HDMI-A-1 --off"
motion:
  enabled: true
  gpio-pin: 17
  absence-delay: 5m
  poll-interval: 100ms
http:
  timeout: 30s
  retries: 2
"#;
    let cfg = serde_yaml::from_str::<Configuration>(yaml)
        .unwrap()
        .validated()
        .unwrap();
    assert_eq!(cfg.display.show_command.as_deref(), Some("feh -F @FILE@"));
    assert_eq!(
        cfg.display.power_on_command.as_deref(),
        Some("vcgencmd display_power 1"),
        "omitted commands keep their defaults"
    );
    assert!(cfg.motion.enabled);
    assert_eq!(cfg.motion.gpio_pin, 17);
    assert_eq!(cfg.motion.absence_delay, Duration::from_secs(300));
    assert_eq!(cfg.motion.poll_interval, Duration::from_millis(100));
    assert_eq!(cfg.http.timeout, Duration::from_secs(30));
    assert_eq!(cfg.http.retries, 2);
}

#[test]
fn unknown_keys_are_rejected() {
    let yaml = r#"
base-dir: "/srv/frame"
photo-library-path: "/photos"
"#;
    assert!(serde_yaml::from_str::<Configuration>(yaml).is_err());
}

#[test]
fn validation_rejects_zero_retries() {
    let yaml = r#"
http:
  retries: 0
"#;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    let err = cfg.validated().unwrap_err();
    assert!(err.to_string().contains("retries"));
}

#[test]
fn validation_rejects_empty_mime_list() {
    let yaml = "supported-mime-types: []\n";
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "oauth-redirect-uri: \"http://frame.local:7777/callback\"\n").unwrap();
    let cfg = Configuration::from_yaml_file(&path).unwrap().validated().unwrap();
    assert_eq!(cfg.oauth_redirect_uri, "http://frame.local:7777/callback");
}
