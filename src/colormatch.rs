use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::display::{CommandRunner, default_runner, shell_quote};

/// Reported when the sensor sees no light at all.
pub const DEFAULT_KELVIN: f64 = 3350.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorReading {
    pub kelvin: f64,
    pub lux: f64,
}

/// Converts raw TCS34725 channel counts into colour temperature and lux
/// using McCamy's approximation.
pub fn raw_to_reading(red: u16, green: u16, blue: u16, clear: u16) -> ColorReading {
    if red == 0 && green == 0 && blue == 0 && clear == 0 {
        return ColorReading {
            kelvin: DEFAULT_KELVIN,
            lux: 0.0,
        };
    }
    let (r, g, b) = (f64::from(red), f64::from(green), f64::from(blue));
    let x = -0.14282 * r + 1.54924 * g + -0.95641 * b;
    let y = -0.32466 * r + 1.57837 * g + -0.73191 * b;
    let z = -0.68202 * r + 0.77073 * g + 0.56332 * b;
    let divisor = x + y + z;
    let n = (x / divisor - 0.3320) / (0.1858 - y / divisor);
    let kelvin = 449.0 * n.powi(3) + 3525.0 * n.powi(2) + 6823.3 * n + 5520.33;
    ColorReading {
        kelvin: if kelvin.is_finite() { kelvin } else { DEFAULT_KELVIN },
        lux: y.max(0.0),
    }
}

pub trait ColorSensor: Send {
    fn name(&self) -> &str;

    /// Whether a sensor is attached at all; absent sensors are never polled.
    fn detect(&mut self) -> bool {
        true
    }

    /// Raw `[red, green, blue, clear]` counts.
    fn read_raw(&mut self) -> Result<[u16; 4]>;
}

#[derive(Debug, Default)]
pub struct NoSensor;

impl ColorSensor for NoSensor {
    fn name(&self) -> &str {
        "none"
    }

    fn detect(&mut self) -> bool {
        false
    }

    fn read_raw(&mut self) -> Result<[u16; 4]> {
        bail!("no colour sensor attached")
    }
}

/// Reads `r g b [c]` counts from a text file kept fresh by an external
/// I²C helper.
#[derive(Debug)]
pub struct FileColorSensor {
    path: PathBuf,
}

impl FileColorSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn parse_counts(text: &str) -> Result<[u16; 4]> {
    let values = text
        .split_whitespace()
        .map(|part| part.parse::<u16>().with_context(|| format!("bad sensor count {part:?}")))
        .collect::<Result<Vec<_>>>()?;
    match values.as_slice() {
        [r, g, b] => Ok([*r, *g, *b, 0]),
        [r, g, b, c] => Ok([*r, *g, *b, *c]),
        _ => bail!("expected 3 or 4 sensor counts, got {}", values.len()),
    }
}

impl ColorSensor for FileColorSensor {
    fn name(&self) -> &str {
        "file"
    }

    fn detect(&mut self) -> bool {
        self.path.exists()
    }

    fn read_raw(&mut self) -> Result<[u16; 4]> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        parse_counts(&text)
    }
}

/// Polls `sensor` and publishes readings until cancelled.
#[instrument(skip_all, fields(sensor = sensor.name()))]
pub async fn run(
    mut sensor: Box<dyn ColorSensor>,
    interval: Duration,
    readings: watch::Sender<Option<ColorReading>>,
    cancel: CancellationToken,
) -> Result<()> {
    if !sensor.detect() {
        info!("no colour sensor detected; ambient colour matching disabled");
        return Ok(());
    }
    let mut failing = false;
    loop {
        match sensor.read_raw() {
            Ok([r, g, b, c]) => {
                failing = false;
                let reading = raw_to_reading(r, g, b, c);
                debug!(kelvin = reading.kelvin, lux = reading.lux, "colour sample");
                readings.send_replace(Some(reading));
            }
            Err(err) if !failing => {
                failing = true;
                warn!(error = %err, "colour sensor read failed");
            }
            Err(_) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

pub fn clamp_kelvin(kelvin: f64, min: f64, max: f64) -> f64 {
    kelvin.max(min).min(max)
}

/// Runs the external colour temperature script over rendered files.
#[derive(Clone)]
pub struct ColorMatcher {
    script: Option<PathBuf>,
    runner: CommandRunner,
}

impl fmt::Debug for ColorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColorMatcher")
            .field("script", &self.script)
            .finish()
    }
}

impl ColorMatcher {
    pub fn new(script: Option<PathBuf>) -> Self {
        Self::with_runner(script, default_runner())
    }

    pub fn with_runner(script: Option<PathBuf>, runner: CommandRunner) -> Self {
        Self { script, runner }
    }

    pub fn available(&self) -> bool {
        self.script.as_deref().is_some_and(Path::exists)
    }

    /// Writes a copy of `src` corrected to `kelvin` into `dest`.
    ///
    /// Returns false when there is no script or it failed; `dest` should
    /// then be ignored.
    pub fn adjust(&self, src: &Path, dest: &Path, kelvin: f64, min: f64, max: f64) -> bool {
        let Some(script) = self.script.as_deref().filter(|s| s.exists()) else {
            return false;
        };
        let kelvin = clamp_kelvin(kelvin, min, max);
        let command = format!(
            "{} -t {:.0} {} {}",
            shell_quote(&script.to_string_lossy()),
            kelvin,
            shell_quote(&src.to_string_lossy()),
            shell_quote(&dest.to_string_lossy()),
        );
        match (self.runner)(&command) {
            Ok(output) if output.status.success() && dest.exists() => {
                debug!(kelvin, "colour matched photo");
                true
            }
            Ok(output) => {
                warn!(kelvin, stderr = output.stderr, "colour match script failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "unable to run colour match script");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::CommandOutput;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::{Arc, Mutex};

    #[test]
    fn darkness_reads_as_default_temperature() {
        assert_eq!(
            raw_to_reading(0, 0, 0, 0),
            ColorReading {
                kelvin: DEFAULT_KELVIN,
                lux: 0.0
            }
        );
    }

    #[test]
    fn daylight_counts_give_plausible_temperature() {
        // Equal counts sit near 8900 K on this sensor's matrix.
        let reading = raw_to_reading(1000, 1000, 1000, 3000);
        assert!(reading.kelvin > 8000.0 && reading.kelvin < 10000.0, "{reading:?}");
        assert!(reading.lux > 0.0);
    }

    #[test]
    fn counts_parse_with_optional_clear() {
        assert_eq!(parse_counts("1 2 3\n").unwrap(), [1, 2, 3, 0]);
        assert_eq!(parse_counts("1 2 3 4").unwrap(), [1, 2, 3, 4]);
        assert!(parse_counts("1 2").is_err());
        assert!(parse_counts("a b c").is_err());
    }

    #[test]
    fn adjust_clamps_and_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("colortemp.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        let src = dir.path().join("in");
        let dest = dir.path().join("out");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let out = dest.clone();
        let runner: CommandRunner = Arc::new(move |cmd: &str| {
            log.lock().unwrap().push(cmd.to_string());
            fs::write(&out, b"x").unwrap();
            Ok(CommandOutput {
                status: ExitStatus::from_raw(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        });
        let matcher = ColorMatcher::with_runner(Some(script), runner);
        assert!(matcher.adjust(&src, &dest, 12000.0, 2000.0, 7500.0));
        assert!(seen.lock().unwrap()[0].contains("-t 7500 "));

        let missing = ColorMatcher::new(Some(dir.path().join("absent.sh")));
        assert!(!missing.available());
        assert!(!missing.adjust(&src, &dest, 5000.0, 2000.0, 7500.0));
    }
}
