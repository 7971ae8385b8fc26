use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::PowerArbiter;
use crate::config::MotionConfig;
use crate::events::VoteSource;

/// Presence keeps the display awake; absence longer than `delay` votes
/// standby.
#[derive(Debug, Clone)]
pub struct MotionGate {
    delay: Duration,
    last_seen: Instant,
}

impl MotionGate {
    pub fn new(delay: Duration, now: Instant) -> Self {
        Self {
            delay,
            last_seen: now,
        }
    }

    pub fn update(&mut self, present: bool, now: Instant) -> bool {
        if present {
            self.last_seen = now;
            return false;
        }
        now.duration_since(self.last_seen) >= self.delay
    }
}

/// Sysfs GPIO input, e.g. `/sys/class/gpio/gpio20/value`.
#[derive(Debug, Clone)]
pub struct GpioInput {
    root: PathBuf,
    pin: u32,
}

impl GpioInput {
    pub fn new(root: impl Into<PathBuf>, pin: u32) -> Self {
        Self {
            root: root.into(),
            pin,
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    /// Exports the pin as an input if the kernel hasn't already.
    pub fn export(&self) -> Result<()> {
        if !self.pin_dir().exists() {
            write_attr(&self.root.join("export"), &self.pin.to_string())?;
        }
        write_attr(&self.pin_dir().join("direction"), "in")
    }

    pub fn read(&self) -> Result<bool> {
        let path = self.pin_dir().join("value");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(raw.trim() == "1")
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("failed to write {value} to {}", path.display()))
}

#[instrument(skip_all, fields(pin = config.gpio_pin))]
pub async fn run(
    config: MotionConfig,
    arbiter: Arc<PowerArbiter>,
    cancel: CancellationToken,
) -> Result<()> {
    if !config.enabled {
        debug!("motion watcher disabled");
        return Ok(());
    }
    let input = GpioInput::new(&config.sysfs_root, config.gpio_pin);
    if let Err(err) = input.export() {
        warn!(error = %err, "unable to configure motion sensor pin");
    }
    info!("watching motion sensor");

    let mut gate = MotionGate::new(config.absence_delay, Instant::now());
    let mut failing = false;
    loop {
        match input.read() {
            Ok(present) => {
                failing = false;
                let standby = gate.update(present, Instant::now());
                let description = if standby {
                    format!("no motion for {}", humantime::format_duration(config.absence_delay))
                } else {
                    "motion detected recently".to_string()
                };
                arbiter.vote(VoteSource::Motion, standby, description).await?;
            }
            Err(err) if !failing => {
                failing = true;
                warn!(error = %err, "motion sensor read failed");
            }
            Err(_) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(config.poll_interval) => {}
        }
    }
    arbiter.withdraw(VoteSource::Motion).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absence_after_delay_votes_standby() {
        let start = Instant::now();
        let mut gate = MotionGate::new(Duration::from_secs(600), start);
        assert!(!gate.update(false, start + Duration::from_secs(599)));
        assert!(gate.update(false, start + Duration::from_secs(600)));
        assert!(!gate.update(true, start + Duration::from_secs(601)));
        assert!(!gate.update(false, start + Duration::from_secs(1000)));
    }

    #[test]
    fn gpio_value_is_read_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let pin = root.path().join("gpio20");
        fs::create_dir_all(&pin).unwrap();
        fs::write(pin.join("value"), "1\n").unwrap();
        let input = GpioInput::new(root.path(), 20);
        input.export().unwrap();
        assert_eq!(fs::read_to_string(pin.join("direction")).unwrap(), "in");
        assert!(input.read().unwrap());
        fs::write(pin.join("value"), "0\n").unwrap();
        assert!(!input.read().unwrap());
    }
}
