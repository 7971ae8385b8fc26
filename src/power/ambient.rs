use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::PowerArbiter;
use crate::colormatch::ColorReading;
use crate::events::VoteSource;
use crate::settings::SharedSettings;

/// Lux hysteresis: standby after staying below `low` for `hold`, awake
/// again once above `high`. Readings in between keep the current state.
#[derive(Debug, Clone)]
pub struct AmbientGate {
    low: f64,
    high: f64,
    hold: Duration,
    dark_since: Option<Instant>,
    standby: bool,
}

impl AmbientGate {
    pub fn new(low: f64, high: f64, hold: Duration) -> Self {
        Self {
            low,
            high: high.max(low),
            hold,
            dark_since: None,
            standby: false,
        }
    }

    pub fn reconfigure(&mut self, low: f64, high: f64, hold: Duration) {
        if self.low != low || self.high != high.max(low) || self.hold != hold {
            *self = Self::new(low, high, hold);
        }
    }

    pub fn update(&mut self, lux: f64, now: Instant) -> bool {
        if lux < self.low {
            let since = *self.dark_since.get_or_insert(now);
            if now.duration_since(since) >= self.hold {
                self.standby = true;
            }
        } else {
            self.dark_since = None;
            if lux > self.high {
                self.standby = false;
            }
        }
        self.standby
    }
}

/// Votes standby while the room stays dark, fed by the colour sampler.
#[instrument(skip_all)]
pub async fn run(
    settings: SharedSettings,
    arbiter: Arc<PowerArbiter>,
    mut readings: watch::Receiver<Option<ColorReading>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut gate: Option<AmbientGate> = None;
    loop {
        let reading = *readings.borrow_and_update();
        let snapshot = settings.snapshot();
        let hold = Duration::from_secs(snapshot.autooff_time_minutes * 60);
        let enabled = snapshot.powersave.uses_sensor() && !hold.is_zero();

        match (enabled, reading) {
            (true, Some(reading)) => {
                let gate = gate.get_or_insert_with(|| {
                    AmbientGate::new(snapshot.autooff_lux, snapshot.autooff_lux_high, hold)
                });
                gate.reconfigure(snapshot.autooff_lux, snapshot.autooff_lux_high, hold);
                let standby = gate.update(reading.lux, Instant::now());
                debug!(lux = reading.lux, standby, "ambient check");
                let description = format!("ambient light {:.3} lux", reading.lux);
                arbiter.vote(VoteSource::Ambient, standby, description).await?;
            }
            (true, None) => {}
            (false, _) => {
                gate = None;
                arbiter.withdraw(VoteSource::Ambient).await?;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = readings.changed() => {
                if changed.is_err() {
                    debug!("colour sampler stopped; ambient watcher exiting");
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn darkness_must_persist_before_standby() {
        let start = Instant::now();
        let mut gate = AmbientGate::new(0.01, 0.05, Duration::from_secs(60));
        assert!(!gate.update(0.0, start));
        assert!(!gate.update(0.0, start + Duration::from_secs(30)));
        assert!(gate.update(0.0, start + Duration::from_secs(61)));
    }

    #[test]
    fn hysteresis_band_keeps_state() {
        let start = Instant::now();
        let mut gate = AmbientGate::new(0.01, 0.05, Duration::ZERO);
        assert!(gate.update(0.001, start));
        assert!(gate.update(0.03, start), "between thresholds stays in standby");
        assert!(!gate.update(0.06, start));
        assert!(!gate.update(0.03, start), "between thresholds stays awake");
    }

    #[test]
    fn brief_light_resets_the_timer() {
        let start = Instant::now();
        let mut gate = AmbientGate::new(0.01, 0.05, Duration::from_secs(60));
        gate.update(0.0, start);
        gate.update(0.02, start + Duration::from_secs(50));
        assert!(!gate.update(0.0, start + Duration::from_secs(70)));
        assert!(gate.update(0.0, start + Duration::from_secs(131)));
    }
}
