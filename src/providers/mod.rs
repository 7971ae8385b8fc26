//! Photo providers: a common state machine around per-service hooks.

pub mod base;
pub mod google_photos;
pub mod pexels;
pub mod simple_url;
pub mod usb;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::config::Configuration;
use crate::error::Error;
use crate::event_log::{EventLevel, EventLog, NewEvent};
use crate::network::{ApiRequest, HttpClient};
use crate::oauth::OAuthConfig;
use crate::photo::{Dimensions, ImageDescriptor, SizeHints};

pub use base::{ProviderCore, ProviderStateData, StateFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderState {
    Error,
    Uninitialized,
    NeedConfig,
    #[serde(rename = "NEED_OAUTH")]
    NeedOAuth,
    NeedKeywords,
    NoImages,
    NotConnected,
    Ready,
}

/// The four provider kinds, serialised by their stable type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ProviderKind {
    GooglePhotos,
    SimpleUrl,
    UsbPhotos,
    Pexels,
}

impl From<ProviderKind> for u32 {
    fn from(kind: ProviderKind) -> Self {
        kind.type_id()
    }
}

impl TryFrom<u32> for ProviderKind {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        ProviderKind::from_type_id(value).ok_or_else(|| format!("unknown provider type {value}"))
    }
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::GooglePhotos,
        ProviderKind::SimpleUrl,
        ProviderKind::UsbPhotos,
        ProviderKind::Pexels,
    ];

    pub fn type_id(self) -> u32 {
        match self {
            Self::GooglePhotos => 2,
            Self::SimpleUrl => 3,
            Self::UsbPhotos => 4,
            Self::Pexels => 5,
        }
    }

    pub fn from_type_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GooglePhotos => "GooglePhotos",
            Self::SimpleUrl => "Simple URL",
            Self::UsbPhotos => "USB-Photos",
            Self::Pexels => "Pexels",
        }
    }

    pub fn needs_oauth(self) -> bool {
        matches!(self, Self::GooglePhotos)
    }

    pub fn needs_config(self) -> bool {
        matches!(self, Self::Pexels)
    }

    pub fn oauth_scopes(self) -> Vec<String> {
        match self {
            Self::GooglePhotos => google_photos::SCOPES.iter().map(|s| s.to_string()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn help_keywords(self) -> &'static str {
        match self {
            Self::GooglePhotos => google_photos::HELP,
            Self::SimpleUrl => simple_url::HELP,
            Self::UsbPhotos => usb::HELP,
            Self::Pexels => pexels::HELP,
        }
    }

    /// Schema of the static configuration, `{key: {type, name, description}}`.
    pub fn config_fields(self) -> Value {
        match self {
            Self::Pexels => pexels::config_fields(),
            _ => json!({}),
        }
    }

    fn source(self, ctx: &ProviderContext) -> Box<dyn PhotoSource> {
        match self {
            Self::GooglePhotos => Box::new(google_photos::GooglePhotos::default()),
            Self::SimpleUrl => Box::new(simple_url::SimpleUrl),
            Self::UsbPhotos => Box::new(usb::UsbPhotos::new(ctx.usb_dir.clone())),
            Self::Pexels => Box::new(pexels::Pexels::default()),
        }
    }
}

/// Where the bytes of an image come from.
#[derive(Debug, Clone)]
pub enum ContentLocation {
    Remote(ApiRequest),
    Local(PathBuf),
}

/// Outcome of a provider's keyword validation.
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordCheck {
    Accept {
        keyword: String,
        extras: Option<Value>,
    },
    Reject(String),
}

/// Services shared by every provider instance.
#[derive(Clone)]
pub struct ProviderContext {
    pub http: HttpClient,
    pub events: Arc<EventLog>,
    pub redirect_uri: String,
    pub usb_dir: PathBuf,
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("redirect_uri", &self.redirect_uri)
            .field("usb_dir", &self.usb_dir)
            .finish_non_exhaustive()
    }
}

impl ProviderContext {
    pub fn new(cfg: &Configuration, http: HttpClient, events: Arc<EventLog>) -> Self {
        Self {
            http,
            events,
            redirect_uri: cfg.oauth_redirect_uri.clone(),
            usb_dir: cfg.usb.base_dir.clone(),
        }
    }
}

/// Inputs of one `prepare_next_item` call.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub dest: &'a Path,
    pub supported_mimes: &'a [String],
    pub display: Dimensions,
    pub randomize: bool,
    pub force_orientation: bool,
    pub cache: Option<&'a CacheManager>,
}

/// Per-service hooks; everything else lives in [`ProviderCore`].
#[async_trait]
pub trait PhotoSource: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn needs_oauth(&self) -> bool {
        self.kind().needs_oauth()
    }

    fn needs_config(&self) -> bool {
        self.kind().needs_config()
    }

    /// Runs before the generic state rules and may decide the state itself.
    fn precheck(&self, _core: &mut ProviderCore) -> Option<ProviderState> {
        None
    }

    fn explain(&self, _state: ProviderState) -> Option<String> {
        None
    }

    async fn validate_keyword(
        &self,
        _core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<KeywordCheck, Error> {
        Ok(KeywordCheck::Accept {
            keyword: keyword.to_string(),
            extras: None,
        })
    }

    /// Runs once the OAuth session is available.
    async fn post_setup(&self, _core: &mut ProviderCore) -> Result<(), Error> {
        Ok(())
    }

    async fn images_for(
        &self,
        core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error>;

    async fn content_location(
        &self,
        core: &mut ProviderCore,
        image: &ImageDescriptor,
        hints: SizeHints,
    ) -> Result<ContentLocation, Error>;

    fn source_url(&self, _core: &ProviderCore, _keyword: &str) -> Option<String> {
        None
    }

    /// Message shown when no keyword yields an image.
    async fn nothing_found(&self, _core: &mut ProviderCore) -> String {
        "No (new) images could be found.\nCheck spelling or make sure you have added albums"
            .to_string()
    }
}

pub struct Provider {
    name: String,
    state: ProviderState,
    core: ProviderCore,
    source: Box<dyn PhotoSource>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("core", &self.core)
            .finish()
    }
}

impl Provider {
    pub fn open(
        kind: ProviderKind,
        id: &str,
        name: &str,
        dir: impl Into<PathBuf>,
        ctx: ProviderContext,
    ) -> Result<Self> {
        let source = kind.source(&ctx);
        Self::with_source(id, name, dir, ctx, source)
    }

    /// Wraps an arbitrary source; the kind is taken from the source.
    pub fn with_source(
        id: &str,
        name: &str,
        dir: impl Into<PathBuf>,
        ctx: ProviderContext,
        source: Box<dyn PhotoSource>,
    ) -> Result<Self> {
        let core = ProviderCore::open(source.kind(), id, dir, ctx)?;
        Ok(Self {
            name: name.to_string(),
            state: ProviderState::Uninitialized,
            core,
            source,
        })
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn kind(&self) -> ProviderKind {
        self.core.kind()
    }

    pub fn core(&self) -> &ProviderCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ProviderCore {
        &mut self.core
    }

    /// Last state computed by [`Provider::update_state`].
    pub fn state(&self) -> ProviderState {
        self.state
    }

    /// Recomputes the state from persisted fields and the image total.
    pub async fn update_state(&mut self) -> ProviderState {
        self.state = self.compute_state().await;
        self.state
    }

    async fn compute_state(&mut self) -> ProviderState {
        if let Some(state) = self.source.precheck(&mut self.core) {
            return state;
        }
        if self.source.needs_config() && self.core.state().read(|s| s.config.is_empty()) {
            return ProviderState::NeedConfig;
        }
        if self.source.needs_oauth() {
            if !self.core.has_oauth_config() || !self.core.has_oauth_token() {
                return ProviderState::NeedOAuth;
            }
            if !self.core.has_session() {
                self.core.ensure_session();
                if let Err(err) = self.source.post_setup(&mut self.core).await {
                    self.report(&err);
                    if err.is_oauth() {
                        return ProviderState::NeedOAuth;
                    }
                }
            }
        }
        if self.core.keywords().is_empty() {
            return ProviderState::NeedKeywords;
        }
        match self.core.images_total(self.source.as_ref()).await {
            Ok(0) => ProviderState::NoImages,
            Ok(_) => ProviderState::Ready,
            Err(err) => {
                self.report(&err);
                if err.is_oauth() {
                    ProviderState::NeedOAuth
                } else {
                    ProviderState::Error
                }
            }
        }
    }

    /// Human explanation of a non-ready state.
    pub fn explain_state(&self) -> Option<String> {
        if let Some(text) = self.source.explain(self.state) {
            return Some(text);
        }
        let text = match self.state {
            ProviderState::Ready | ProviderState::Uninitialized => return None,
            ProviderState::Error => "failed to talk to the service",
            ProviderState::NeedConfig => "needs to be configured",
            ProviderState::NeedOAuth => "needs to be linked to your account",
            ProviderState::NeedKeywords => "has no keywords or albums",
            ProviderState::NoImages => "no images could be found",
            ProviderState::NotConnected => "storage is not connected",
        };
        Some(text.to_string())
    }

    /// Surfaces an error in the event log; OAuth failures also drop the token.
    fn report(&mut self, err: &Error) {
        let id = self.core.id().to_string();
        if err.is_oauth() {
            self.core.clear_oauth();
        }
        let level = match err {
            Error::ApiDisabled(_) | Error::OAuthInvalid | Error::OAuthExpired => EventLevel::Error,
            _ => EventLevel::Warn,
        };
        let mut opts = NewEvent::unique(format!("provider-{id}")).level(level);
        if matches!(err, Error::ApiDisabled(_)) {
            opts = opts.persist();
        }
        self.core
            .ctx()
            .events
            .add(format!("{}: {}", self.name, err.user_message()), opts);
    }

    pub fn set_oauth_config(&mut self, config: OAuthConfig) -> Result<()> {
        self.core.set_oauth_config(config)
    }

    pub fn start_oauth(&mut self, link_state: &str) -> Result<String> {
        self.core.start_oauth(link_state)
    }

    pub async fn finish_oauth(&mut self, callback_url: &str) -> Result<(), Error> {
        let outcome = self.core.finish_oauth(callback_url).await;
        if let Err(err) = &outcome {
            self.report(err);
        }
        outcome
    }

    pub fn configuration(&self) -> BTreeMap<String, String> {
        self.core.state().read(|s| s.config.clone())
    }

    pub fn set_configuration(&mut self, config: BTreeMap<String, String>) -> Result<()> {
        self.core.state().update(|s| s.config = config)
    }

    pub fn keywords(&self) -> Vec<String> {
        self.core.keywords()
    }

    pub fn keyword_source_url(&self, keyword: &str) -> Option<String> {
        self.source.source_url(&self.core, keyword)
    }

    /// Validates and appends a keyword; returns the keyword as stored.
    pub async fn add_keyword(&mut self, raw: &str) -> Result<String> {
        let keyword = raw.trim();
        if keyword.is_empty() {
            bail!("Keyword must not be empty");
        }
        if self.core.keywords().iter().any(|k| k == keyword) {
            bail!("Keyword already in list");
        }
        let (keyword, extras) = match self.source.validate_keyword(&mut self.core, keyword).await {
            Ok(KeywordCheck::Accept { keyword, extras }) => (keyword, extras),
            Ok(KeywordCheck::Reject(message)) => bail!(message),
            Err(err) => {
                self.report(&err);
                bail!(err.user_message());
            }
        };
        if self.core.keywords().contains(&keyword) {
            bail!("Keyword already in list");
        }
        self.core
            .state()
            .update(|s| s.push_keyword(&keyword, extras))?;
        info!(provider = %self.id(), keyword, "keyword added");
        Ok(keyword)
    }

    /// Removes the keyword at `index` with its snapshot and memory.
    pub fn remove_keyword(&mut self, index: usize) -> Result<bool> {
        let keyword = self.keywords().get(index).cloned();
        let Some(keyword) = keyword else {
            return Ok(false);
        };
        self.core.clear_images_for(&keyword)?;
        self.core.memory_forget(Some(&keyword))?;
        self.core.state().update(|s| s.remove_keyword_at(index))?;
        info!(provider = %self.id(), keyword, "keyword removed");
        Ok(true)
    }

    /// Selects and fetches the next image; failures come back as a
    /// descriptor carrying an error.
    pub async fn prepare_next_item(&mut self, req: &FetchRequest<'_>) -> ImageDescriptor {
        if self.core.keywords().is_empty() {
            let message = match self.kind() {
                ProviderKind::SimpleUrl => "No URLs have been configured",
                _ => "No keywords or albums have been configured",
            };
            self.notice(message);
            return ImageDescriptor::failed(message);
        }
        let selected = match self.core.select_image(self.source.as_ref(), req).await {
            Ok(Some(image)) => image,
            Ok(None) => {
                let message = self.source.nothing_found(&mut self.core).await;
                self.notice(&message);
                return ImageDescriptor::failed(message);
            }
            Err(err) => return self.failure(err),
        };
        match self.core.fetch(self.source.as_ref(), selected, req).await {
            Ok(image) => image,
            Err(err) => self.failure(err),
        }
    }

    fn notice(&self, message: &str) {
        let tag = format!("provider-{}", self.id());
        self.core.ctx().events.add(
            format!("{}: {message}", self.name),
            NewEvent::unique(tag).level(EventLevel::Info),
        );
    }

    fn failure(&mut self, err: Error) -> ImageDescriptor {
        warn!(provider = %self.id(), error = %err, "failed to prepare image");
        self.report(&err);
        if err.is_oauth() {
            self.state = ProviderState::NeedOAuth;
        }
        ImageDescriptor::failed(err.user_message())
    }

    pub async fn images_total(&mut self) -> usize {
        match self.core.images_total(self.source.as_ref()).await {
            Ok(total) => total,
            Err(err) => {
                self.report(&err);
                0
            }
        }
    }

    pub fn images_seen(&self) -> usize {
        self.core.images_seen()
    }

    pub async fn images_remaining(&mut self) -> usize {
        self.images_total().await.saturating_sub(self.images_seen())
    }

    pub fn freshness_for(&self, keyword: &str) -> f64 {
        self.core.freshness_for(keyword)
    }

    pub fn clear_images_for(&mut self, keyword: &str) -> Result<()> {
        self.core.clear_images_for(keyword)
    }

    pub fn memory_forget(&mut self, keyword: Option<&str>) -> Result<()> {
        self.core.memory_forget(keyword)
    }

    pub fn expire_stale_keywords(&mut self) -> Result<usize> {
        self.core.expire_stale_keywords()
    }

    /// Advances the keyword cursor; `false` when it wrapped past the end.
    pub fn next_album(&mut self) -> Result<bool> {
        let n = self.keywords().len();
        self.core.state().update(|s| {
            s.image_index = 0;
            if s.keyword_index + 1 >= n {
                s.keyword_index = 0;
                false
            } else {
                s.keyword_index += 1;
                true
            }
        })
    }

    /// Moves the keyword cursor back; `false` when already at the first one.
    pub fn prev_album(&mut self) -> Result<bool> {
        self.core.state().update(|s| {
            s.image_index = 0;
            if s.keyword_index == 0 {
                false
            } else {
                s.keyword_index -= 1;
                true
            }
        })
    }

    pub fn start_at_first_album(&mut self) -> Result<()> {
        self.core.state().update(|s| {
            s.keyword_index = 0;
            s.image_index = 0;
        })
    }

    pub fn start_at_last_album(&mut self) -> Result<()> {
        let n = self.keywords().len();
        self.core.state().update(|s| {
            s.keyword_index = n.saturating_sub(1);
            s.image_index = 0;
        })
    }

    /// Per-keyword summary for the keyword UI.
    pub fn keyword_details(&self) -> Vec<Value> {
        let counts = self.core.state().read(|s| s.counts.clone());
        self.keywords()
            .iter()
            .map(|k| {
                json!({
                    "keyword": k,
                    "images": counts.get(k).copied().unwrap_or(0),
                    "freshness": self.freshness_for(k),
                    "source": self.keyword_source_url(k),
                })
            })
            .collect()
    }

    /// Removes the provider's directory tree.
    pub fn purge(self) -> Result<()> {
        let dir = self.core.dir().to_path_buf();
        drop(self);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }
}
