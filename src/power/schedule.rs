use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Timelike, Utc};
use frame_settings::UserSettings;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::PowerArbiter;
use crate::events::VoteSource;
use crate::settings::SharedSettings;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Whether `hour` lies in the window starting at `on` and ending before
/// `off`. The window wraps midnight when `off < on`; `on == off` means
/// always on.
pub fn is_active_hour(hour: u32, on: u32, off: u32) -> bool {
    match on.cmp(&off) {
        std::cmp::Ordering::Equal => true,
        std::cmp::Ordering::Less => hour >= on && hour < off,
        std::cmp::Ordering::Greater => hour >= on || hour < off,
    }
}

fn current_hour(settings: &UserSettings) -> u32 {
    match settings.timezone {
        Some(tz) => Utc::now().with_timezone(&tz).hour(),
        None => Local::now().hour(),
    }
}

/// Votes standby outside the configured display hours. `reconfigure`
/// forces an immediate re-evaluation after the hours or power mode change.
#[instrument(skip_all)]
pub async fn run(
    settings: SharedSettings,
    arbiter: Arc<PowerArbiter>,
    reconfigure: Arc<Notify>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut enabled: Option<bool> = None;
    loop {
        let snapshot = settings.snapshot();
        let uses_schedule = snapshot.powersave.uses_schedule();
        if enabled != Some(uses_schedule) {
            info!(enabled = uses_schedule, "schedule watcher");
            enabled = Some(uses_schedule);
        }
        if uses_schedule {
            let hour = current_hour(&snapshot);
            let active = is_active_hour(hour, snapshot.display_on, snapshot.display_off);
            debug!(hour, on = snapshot.display_on, off = snapshot.display_off, active, "schedule check");
            let description = format!(
                "display hours {:02}:00-{:02}:00",
                snapshot.display_on, snapshot.display_off
            );
            arbiter.vote(VoteSource::Schedule, !active, description).await?;
        } else {
            arbiter.withdraw(VoteSource::Schedule).await?;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = reconfigure.notified() => debug!("schedule reconfigured"),
            _ = sleep(CHECK_INTERVAL) => {}
        }
    }
    Ok(())
}
