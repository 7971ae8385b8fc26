#![allow(dead_code)]

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{Rgba, RgbaImage};

use photoframe_svc::config::{Configuration, HttpConfig};
use photoframe_svc::display::{CommandOutput, CommandRunner};
use photoframe_svc::error::Error;
use photoframe_svc::event_log::EventLog;
use photoframe_svc::network::HttpClient;
use photoframe_svc::photo::{ImageDescriptor, SizeHints};
use photoframe_svc::providers::{
    ContentLocation, PhotoSource, Provider, ProviderContext, ProviderCore, ProviderKind,
};

/// Writes a solid PNG and returns its path.
pub fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(format!("{name}.png"));
    RgbaImage::from_pixel(width, height, Rgba([90, 120, 200, 255]))
        .save(&path)
        .unwrap();
    path
}

pub fn context(base: &Path, events: Arc<EventLog>) -> ProviderContext {
    let cfg = Configuration {
        base_dir: base.to_path_buf(),
        ..Configuration::default()
    };
    let http = HttpClient::new(&HttpConfig::default()).unwrap();
    ProviderContext::new(&cfg, http, events)
}

/// In-memory photo source serving local files per keyword.
pub struct FixtureSource {
    kind: ProviderKind,
    albums: BTreeMap<String, Vec<(ImageDescriptor, PathBuf)>>,
    scans: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
    revoked: bool,
}

impl FixtureSource {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            albums: BTreeMap::new(),
            scans: Arc::new(AtomicUsize::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
            revoked: false,
        }
    }

    pub fn album(mut self, keyword: &str, photos: Vec<(&str, PathBuf, u32, u32)>) -> Self {
        let entries = photos
            .into_iter()
            .map(|(id, path, w, h)| {
                let image = ImageDescriptor::new(id, path.to_string_lossy())
                    .with_mime("image/png")
                    .with_dimensions(w, h);
                (image, path)
            })
            .collect();
        self.albums.insert(keyword.to_string(), entries);
        self
    }

    /// Content requests fail as if the OAuth grant had been revoked.
    pub fn revoked(mut self) -> Self {
        self.revoked = true;
        self
    }

    pub fn scan_counter(&self) -> Arc<AtomicUsize> {
        self.scans.clone()
    }

    /// While set, scans fail with `NoNetwork`.
    pub fn offline_switch(&self) -> Arc<AtomicBool> {
        self.offline.clone()
    }
}

#[async_trait]
impl PhotoSource for FixtureSource {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn images_for(
        &self,
        _core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::NoNetwork("fixture is offline".to_string()));
        }
        Ok(self
            .albums
            .get(keyword)
            .map(|photos| photos.iter().map(|(image, _)| image.clone()).collect())
            .unwrap_or_default())
    }

    async fn content_location(
        &self,
        _core: &mut ProviderCore,
        image: &ImageDescriptor,
        _hints: SizeHints,
    ) -> Result<ContentLocation, Error> {
        if self.revoked {
            return Err(Error::OAuthInvalid);
        }
        self.albums
            .values()
            .flatten()
            .find(|(candidate, _)| candidate.id == image.id)
            .map(|(_, path)| ContentLocation::Local(path.clone()))
            .ok_or_else(|| Error::Unknown(format!("no fixture for {}", image.id)))
    }
}

/// Opens a provider around `source` and adds `keywords`.
pub async fn provider(
    base: &Path,
    id: &str,
    events: Arc<EventLog>,
    source: FixtureSource,
    keywords: &[&str],
) -> Provider {
    let dir = base.join("photoframe_config/services").join(id);
    let mut provider =
        Provider::with_source(id, id, dir, context(base, events), Box::new(source)).unwrap();
    for keyword in keywords {
        provider.add_keyword(keyword).await.unwrap();
    }
    provider
}

/// Runner that records every command line and always succeeds.
pub fn recording_runner() -> (CommandRunner, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let runner: CommandRunner = Arc::new(move |command: &str| {
        log.lock().unwrap().push(command.to_string());
        Ok(CommandOutput {
            status: ExitStatus::from_raw(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    });
    (runner, seen)
}
