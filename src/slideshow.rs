use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheManager;
use crate::colormatch::{ColorMatcher, ColorReading};
use crate::display::DisplayAdapter;
use crate::event_log::{EventLevel, EventLog, NewEvent};
use crate::events::{PowerState, SlideshowEvent};
use crate::history::ImageHistory;
use crate::photo::{Dimensions, ImageDescriptor};
use crate::processing::frame;
use crate::provider_manager::SharedManager;
use crate::providers::FetchRequest;
use crate::settings::SharedSettings;

/// Attempts per tick before giving up on finding any image.
pub const RETRY_BUDGET: usize = 50;
/// Cache subdirectory for colour matched variants; the first to go under pressure.
pub const COLORMATCH_DIR: &str = "colormatch";

const STATUS_TAG: &str = "slideshow";

/// What is on screen right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentImage {
    pub id: String,
    pub mime: String,
    pub provider: Option<String>,
    pub keyword: Option<String>,
    pub source: Option<String>,
    pub cache_used: bool,
}

impl CurrentImage {
    fn from_descriptor(image: &ImageDescriptor) -> Self {
        Self {
            id: image.id.clone(),
            mime: image.mime_type.clone().unwrap_or_default(),
            provider: image.provider.clone(),
            keyword: image.keyword.clone(),
            source: image.source.clone(),
            cache_used: image.cache_used,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedCurrent(Arc<RwLock<Option<CurrentImage>>>);

impl SharedCurrent {
    pub fn get(&self) -> Option<CurrentImage> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, image: CurrentImage) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(image);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Shown(CurrentImage),
    /// Showed the history entry this many steps back from the newest.
    Replayed(usize),
    Message(String),
    Unchanged,
    Parked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Advance,
    Back,
    Hold,
}

/// Collaborators handed to [`Slideshow::new`].
pub struct SlideshowParts {
    pub settings: SharedSettings,
    pub manager: SharedManager,
    pub cache: Arc<CacheManager>,
    pub history: ImageHistory,
    pub events: Arc<EventLog>,
    pub display: DisplayAdapter,
    pub matcher: ColorMatcher,
    pub colour: watch::Receiver<Option<ColorReading>>,
    pub inbox: mpsc::Receiver<SlideshowEvent>,
    pub current: SharedCurrent,
    /// Scratch directory for downloads and composition.
    pub work_dir: PathBuf,
    pub supported_mimes: Vec<String>,
    /// Shown once before the first photo.
    pub greeting: Option<String>,
}

pub struct Slideshow {
    settings: SharedSettings,
    manager: SharedManager,
    cache: Arc<CacheManager>,
    history: ImageHistory,
    events: Arc<EventLog>,
    display: DisplayAdapter,
    matcher: ColorMatcher,
    colour: watch::Receiver<Option<ColorReading>>,
    inbox: mpsc::Receiver<SlideshowEvent>,
    current: SharedCurrent,
    work_dir: PathBuf,
    supported_mimes: Vec<String>,
    greeting: Option<String>,
    standby: bool,
    /// Nothing can be shown until something is posted to the inbox.
    idle: bool,
    /// History index of what is on screen; 0 is the newest photo.
    back: usize,
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking slideshow task failed")
}

impl Slideshow {
    pub fn new(parts: SlideshowParts) -> Result<Self> {
        std::fs::create_dir_all(&parts.work_dir)
            .with_context(|| format!("failed to create {}", parts.work_dir.display()))?;
        Ok(Self {
            settings: parts.settings,
            manager: parts.manager,
            cache: parts.cache,
            history: parts.history,
            events: parts.events,
            display: parts.display,
            matcher: parts.matcher,
            colour: parts.colour,
            inbox: parts.inbox,
            current: parts.current,
            work_dir: parts.work_dir,
            supported_mimes: parts.supported_mimes,
            greeting: parts.greeting,
            standby: false,
            idle: false,
            back: 0,
        })
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }

    /// True after a tick found no ready provider; the interval timer is off
    /// until the next inbox event.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn history(&self) -> &ImageHistory {
        &self.history
    }

    /// Shows the next photo; same as an interval expiring.
    pub async fn tick(&mut self) -> TickOutcome {
        self.perform(Step::Advance).await
    }

    /// Applies a control event and performs the step it implies.
    pub async fn dispatch(&mut self, event: SlideshowEvent) -> TickOutcome {
        let step = self.handle(event).await;
        self.perform(step).await
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if let Some(greeting) = self.greeting.take() {
            self.message(&greeting).await;
        }
        let mut step = Step::Advance;
        loop {
            let outcome = self.perform(step).await;
            debug!(?outcome, "slideshow step done");

            let interval = Duration::from_secs(self.settings.snapshot().interval_secs.max(1));
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.inbox.recv() => match event {
                    Some(event) => Some(event),
                    None => {
                        debug!("slideshow inbox closed");
                        break;
                    }
                },
                _ = sleep(interval), if !self.standby && !self.idle => None,
            };
            step = match event {
                Some(event) => self.handle(event).await,
                None => Step::Advance,
            };
        }
        Ok(())
    }

    async fn handle(&mut self, event: SlideshowEvent) -> Step {
        debug!(?event, "slideshow event");
        self.idle = false;
        match event {
            SlideshowEvent::Next | SlideshowEvent::Trigger | SlideshowEvent::SettingsChanged => {
                Step::Advance
            }
            SlideshowEvent::Prev => Step::Back,
            SlideshowEvent::NextAlbum | SlideshowEvent::PrevAlbum => {
                let mut manager = self.manager.lock().await;
                let moved = if event == SlideshowEvent::NextAlbum {
                    manager.next_album().await
                } else {
                    manager.prev_album().await
                };
                if let Err(err) = moved {
                    warn!(error = ?err, "failed to change album");
                }
                self.back = 0;
                Step::Advance
            }
            SlideshowEvent::ClearCache => {
                let cache = self.cache.clone();
                match blocking(move || cache.empty(None)).await {
                    Ok(sweep) => info!(files = sweep.files, "cache cleared"),
                    Err(err) => warn!(error = ?err, "failed to clear cache"),
                }
                Step::Advance
            }
            SlideshowEvent::MemoryForget => {
                if let Err(err) = self.manager.lock().await.memory_forget_all().await {
                    warn!(error = ?err, "failed to forget memory");
                }
                Step::Advance
            }
            SlideshowEvent::Power(PowerState::Standby) => {
                if !self.standby {
                    self.set_power(false).await;
                    self.standby = true;
                }
                Step::Hold
            }
            SlideshowEvent::Power(PowerState::Active) => {
                if self.standby {
                    self.set_power(true).await;
                    self.standby = false;
                    Step::Advance
                } else {
                    Step::Hold
                }
            }
        }
    }

    async fn set_power(&self, on: bool) {
        let display = self.display.clone();
        match blocking(move || display.power(on)).await {
            Ok(report) if report.success() => info!(on, "display power changed"),
            Ok(_) => warn!(on, "display power change reported failures"),
            Err(err) => warn!(error = ?err, "display power change failed"),
        }
    }

    async fn perform(&mut self, step: Step) -> TickOutcome {
        if self.standby {
            return TickOutcome::Parked;
        }
        match step {
            Step::Hold => TickOutcome::Unchanged,
            Step::Back => {
                if self.history.get(self.back + 1).is_none() {
                    debug!(back = self.back, "no older photo in history");
                    return TickOutcome::Unchanged;
                }
                self.back += 1;
                self.replay().await
            }
            Step::Advance if self.back > 0 => {
                self.back -= 1;
                self.replay().await
            }
            Step::Advance => self.show_next().await,
        }
    }

    async fn replay(&mut self) -> TickOutcome {
        let Some(entry) = self.history.get(self.back).cloned() else {
            return TickOutcome::Unchanged;
        };
        let mime = entry.image.mime_type.clone().unwrap_or_default();
        self.show(entry.path.clone(), mime).await;
        self.current.set(CurrentImage::from_descriptor(&entry.image));
        TickOutcome::Replayed(self.back)
    }

    async fn show(&self, path: PathBuf, mime: String) -> bool {
        let display = self.display.clone();
        match blocking(move || display.show_image(&path, &mime)).await {
            Ok(report) => report.success(),
            Err(err) => {
                warn!(error = ?err, "failed to run display command");
                false
            }
        }
    }

    async fn message(&self, text: &str) -> TickOutcome {
        self.events.add(
            text,
            NewEvent::unique(STATUS_TAG).level(EventLevel::Warn),
        );
        let settings = self.settings.snapshot();
        let (width, height) = settings.display_size();
        let display = self.display.clone();
        let body = text.to_string();
        if let Err(err) = blocking(move || display.message(&body, Dimensions::new(width, height))).await
        {
            warn!(error = ?err, "failed to show message");
        }
        TickOutcome::Message(text.to_string())
    }

    async fn housekeeping(&self) {
        let expired = self.manager.lock().await.expire_stale_keywords().await;
        if expired > 0 {
            info!(expired, "stale keyword snapshots dropped");
        }
        let cache = self.cache.clone();
        match blocking(move || cache.garbage_collect(&[COLORMATCH_DIR])).await {
            Ok(Ok(report)) => debug!(pressure = ?report.pressure, removed = report.removed.files, "cache checked"),
            Ok(Err(err)) | Err(err) => warn!(error = ?err, "cache garbage collection failed"),
        }
    }

    #[instrument(skip_all)]
    async fn show_next(&mut self) -> TickOutcome {
        let settings = self.settings.snapshot();
        let (width, height) = settings.display_size();
        let display = Dimensions::new(width, height);
        self.housekeeping().await;

        let download = self.work_dir.join("download");
        let cache = settings.enable_cache.then_some(self.cache.as_ref());
        let mut found: Option<ImageDescriptor> = None;
        // Providers that already failed during this tick; the others get a
        // turn before any of them is asked again.
        let mut failed: HashSet<String> = HashSet::new();
        for attempt in 0..RETRY_BUDGET {
            let chosen = self
                .manager
                .lock()
                .await
                .choose_service_skipping(settings.randomize, &failed)
                .await;
            let Some(chosen) = chosen else {
                if failed.is_empty() {
                    self.idle = true;
                    return self
                        .message(
                            "No service is ready to show photos.\n\
                             Add a service and keywords through the web interface",
                        )
                        .await;
                }
                debug!(attempt, failed = failed.len(), "every ready provider failed once; retrying all");
                failed.clear();
                continue;
            };
            let req = FetchRequest {
                dest: &download,
                supported_mimes: &self.supported_mimes,
                display,
                randomize: settings.randomize,
                force_orientation: settings.force_orientation,
                cache,
            };
            let mut item = chosen.provider.lock().await.prepare_next_item(&req).await;
            match &item.error {
                Some(err) => {
                    debug!(attempt, provider = %chosen.id, error = %err, "provider gave no photo");
                    failed.insert(chosen.id);
                }
                None => {
                    item.provider.get_or_insert_with(|| chosen.id.clone());
                    found = Some(item);
                    break;
                }
            }
        }
        let Some(mut image) = found else {
            return self
                .message("Unable to download ANY images.\nCheck the services and your network")
                .await;
        };

        let mut rendered = download.clone();
        let composed = self.work_dir.join("composed");
        let sizing = settings.imagesizing;
        let (src, dst) = (download.clone(), composed.clone());
        match blocking(move || frame::compose_file(&src, &dst, display, sizing)).await {
            Ok(Ok(Some(mime))) => {
                rendered = composed;
                image.mime_type = Some(mime.to_string());
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) | Err(err) => warn!(id = %image.id, error = ?err, "composition failed; showing photo as is"),
        }

        if settings.enable_cache && image.cache_allowed && !image.cache_used {
            if let Err(err) = self.cache.store(&rendered, &image.cache_id()) {
                warn!(error = ?err, "failed to cache rendered photo");
            }
        }

        let reading = *self.colour.borrow();
        if let Some(reading) = reading {
            if self.matcher.available() {
                rendered = self
                    .colour_match(rendered, &image, reading, settings.colortemp_min, settings.colortemp_max)
                    .await;
            }
        }

        if let Err(err) = self.history.add(&image, &rendered) {
            warn!(error = ?err, "failed to record photo in history");
        }
        let mime = image.mime_type.clone().unwrap_or_default();
        if !self.show(rendered, mime).await {
            warn!(id = %image.id, "display command reported failure");
        }
        self.events.clear_unique(STATUS_TAG);
        self.back = 0;
        self.idle = false;
        let current = CurrentImage::from_descriptor(&image);
        info!(id = %current.id, provider = ?current.provider, cached = current.cache_used, "photo shown");
        self.current.set(current.clone());
        TickOutcome::Shown(current)
    }

    async fn colour_match(
        &self,
        rendered: PathBuf,
        image: &ImageDescriptor,
        reading: ColorReading,
        min: f64,
        max: f64,
    ) -> PathBuf {
        let dest = match self.cache.subdir(COLORMATCH_DIR) {
            Ok(dir) => dir.join(image.cache_id()),
            Err(err) => {
                warn!(error = ?err, "no colour match directory");
                return rendered;
            }
        };
        let matcher = self.matcher.clone();
        let (src, dst) = (rendered.clone(), dest.clone());
        match blocking(move || matcher.adjust(&src, &dst, reading.kelvin, min, max)).await {
            Ok(true) => dest,
            _ => rendered,
        }
    }
}
