use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{ContentLocation, FetchRequest, PhotoSource, ProviderContext, ProviderKind};
use crate::error::Error;
use crate::memory::MemoryStore;
use crate::network::{ApiRequest, HttpResponse};
use crate::oauth::{OAuthConfig, OAuthSession, OAuthToken, TokenUpdater};
use crate::photo::{ImageDescriptor, SizeHints, hash_text, recommended_size, sniff_mime};

pub const STATE_FILE: &str = "state.json";
pub const PRIVATE_DIR: &str = "private";
pub const MEMORY_DIR: &str = "memory";

/// Everything a provider instance persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderStateData {
    pub oauth_config: Option<OAuthConfig>,
    pub oauth_token: Option<OAuthToken>,
    pub config: BTreeMap<String, String>,
    pub keywords: Vec<String>,
    pub counts: BTreeMap<String, usize>,
    /// Unix seconds after which a keyword is re-indexed.
    pub deadlines: BTreeMap<String, i64>,
    pub extras: BTreeMap<String, Value>,
    pub keyword_index: usize,
    pub image_index: usize,
}

impl ProviderStateData {
    /// Appends a keyword together with its zero-valued bookkeeping entries.
    pub fn push_keyword(&mut self, keyword: &str, extras: Option<Value>) {
        self.keywords.push(keyword.to_string());
        self.counts.insert(keyword.to_string(), 0);
        self.deadlines.insert(keyword.to_string(), 0);
        if let Some(extras) = extras {
            self.extras.insert(keyword.to_string(), extras);
        }
    }

    pub fn remove_keyword_at(&mut self, index: usize) -> Option<String> {
        if index >= self.keywords.len() {
            return None;
        }
        let keyword = self.keywords.remove(index);
        self.counts.remove(&keyword);
        self.deadlines.remove(&keyword);
        self.extras.remove(&keyword);
        if self.keyword_index >= self.keywords.len() {
            self.keyword_index = 0;
            self.image_index = 0;
        }
        Some(keyword)
    }
}

/// Provider state shared with the OAuth token callback; every mutation is
/// written back to disk before it becomes visible.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    data: Arc<Mutex<ProviderStateData>>,
}

impl StateFile {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse provider state {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => ProviderStateData::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            data: Arc::new(Mutex::new(data)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read<R>(&self, f: impl FnOnce(&ProviderStateData) -> R) -> R {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ProviderStateData) -> R) -> Result<R> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        let body = serde_json::to_string_pretty(&*guard)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(out)
    }
}

pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn saving(err: anyhow::Error) -> Error {
    Error::FailedSaving(format!("{err:#}"))
}

/// Shared machinery of every provider: persisted state, memory, snapshots,
/// OAuth session and the selection walk.
pub struct ProviderCore {
    id: String,
    kind: ProviderKind,
    dir: PathBuf,
    state: StateFile,
    memory: MemoryStore,
    ctx: ProviderContext,
    oauth: Option<OAuthSession>,
    refresh_hours: u64,
    rng: StdRng,
}

impl std::fmt::Debug for ProviderCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ProviderCore {
    pub fn open(
        kind: ProviderKind,
        id: &str,
        dir: impl Into<PathBuf>,
        ctx: ProviderContext,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(PRIVATE_DIR))
            .with_context(|| format!("failed to create provider dir {}", dir.display()))?;
        let memory = MemoryStore::new(dir.join(MEMORY_DIR))?;
        let state = StateFile::load(dir.join(STATE_FILE))?;
        Ok(Self {
            id: id.to_string(),
            kind,
            dir,
            state,
            memory,
            ctx,
            oauth: None,
            refresh_hours: 24,
            rng: StdRng::from_os_rng(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ctx(&self) -> &ProviderContext {
        &self.ctx
    }

    pub fn state(&self) -> &StateFile {
        &self.state
    }

    pub fn memory_mut(&mut self) -> &mut MemoryStore {
        &mut self.memory
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn refresh_hours(&self) -> u64 {
        self.refresh_hours
    }

    /// Zero disables periodic re-indexing.
    pub fn set_refresh_hours(&mut self, hours: u64) {
        self.refresh_hours = hours;
    }

    pub fn keywords(&self) -> Vec<String> {
        self.state.read(|s| s.keywords.clone())
    }

    pub fn extras_for(&self, keyword: &str) -> Option<Value> {
        self.state.read(|s| s.extras.get(keyword).cloned())
    }

    pub fn config_value(&self, key: &str) -> Option<String> {
        self.state
            .read(|s| s.config.get(key).cloned())
            .filter(|v| !v.is_empty())
    }

    pub fn has_oauth_config(&self) -> bool {
        self.state.read(|s| s.oauth_config.is_some())
    }

    pub fn has_oauth_token(&self) -> bool {
        self.state.read(|s| s.oauth_token.is_some())
    }

    pub fn has_session(&self) -> bool {
        self.oauth.is_some()
    }

    fn token_updater(&self) -> TokenUpdater {
        let state = self.state.clone();
        let id = self.id.clone();
        Arc::new(move |token: &OAuthToken| {
            let token = token.clone();
            if let Err(err) = state.update(|s| s.oauth_token = Some(token)) {
                warn!(provider = %id, error = ?err, "failed to persist oauth token");
            }
        })
    }

    /// Builds the OAuth session from persisted state; returns whether one exists.
    pub fn ensure_session(&mut self) -> bool {
        if self.oauth.is_some() {
            return true;
        }
        let (config, token) = self.state.read(|s| (s.oauth_config.clone(), s.oauth_token.clone()));
        let Some(config) = config else {
            return false;
        };
        self.oauth = Some(OAuthSession::new(
            config,
            token,
            self.kind.oauth_scopes(),
            self.ctx.redirect_uri.clone(),
            self.token_updater(),
        ));
        true
    }

    pub fn set_oauth_config(&mut self, config: OAuthConfig) -> Result<()> {
        self.state.update(|s| {
            s.oauth_config = Some(config);
            s.oauth_token = None;
        })?;
        self.oauth = None;
        Ok(())
    }

    pub fn start_oauth(&mut self, link_state: &str) -> Result<String> {
        self.oauth = None;
        if !self.ensure_session() {
            anyhow::bail!("OAuth client configuration is missing");
        }
        match &self.oauth {
            Some(session) => session.authorization_url(link_state),
            None => anyhow::bail!("OAuth session unavailable"),
        }
    }

    pub async fn finish_oauth(&mut self, callback_url: &str) -> Result<(), Error> {
        if !self.ensure_session() {
            return Err(Error::OAuthInvalid);
        }
        let http = self.ctx.http.clone();
        match self.oauth.as_mut() {
            Some(session) => session.finish(&http, callback_url).await,
            None => Err(Error::OAuthInvalid),
        }
    }

    /// Forgets the token so the provider asks to be linked again.
    pub fn clear_oauth(&mut self) {
        self.oauth = None;
        if let Err(err) = self.state.update(|s| s.oauth_token = None) {
            warn!(provider = %self.id, error = ?err, "failed to clear oauth token");
        }
    }

    /// Sends through the OAuth session when one exists.
    pub async fn request(&mut self, req: ApiRequest) -> Result<HttpResponse, Error> {
        let http = self.ctx.http.clone();
        match self.oauth.as_mut() {
            Some(session) => session.request(&http, req).await,
            None => http.send(&req).await,
        }
    }

    fn snapshot_path(&self, keyword: &str) -> PathBuf {
        self.dir
            .join(PRIVATE_DIR)
            .join(format!("{}.json", hash_text(keyword)))
    }

    fn read_snapshot(&self, keyword: &str) -> Option<Vec<ImageDescriptor>> {
        let path = self.snapshot_path(keyword);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read snapshot");
                return None;
            }
        };
        match serde_json::from_slice::<Vec<ImageDescriptor>>(&raw) {
            Ok(images) => Some(images),
            Err(err) => {
                let corrupt = path.with_extension("json.corrupt");
                warn!(
                    path = %path.display(),
                    bytes = raw.len(),
                    error = %err,
                    "snapshot is corrupt; keeping a copy"
                );
                let _ = fs::remove_file(&corrupt);
                if fs::rename(&path, &corrupt).is_err() {
                    let _ = fs::remove_file(&path);
                }
                None
            }
        }
    }

    fn write_snapshot(&self, keyword: &str, images: &[ImageDescriptor]) -> Result<()> {
        let path = self.snapshot_path(keyword);
        let body = serde_json::to_vec(images)?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    fn next_deadline(&self) -> i64 {
        if self.refresh_hours == 0 {
            i64::MAX
        } else {
            now_secs().saturating_add((self.refresh_hours * 3600) as i64)
        }
    }

    /// Re-indexes `keyword` through the provider and records count and deadline.
    #[instrument(skip(self, source), fields(provider = %self.id))]
    pub async fn rescan(
        &mut self,
        source: &dyn PhotoSource,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        let images = source.images_for(self, keyword).await?;
        self.write_snapshot(keyword, &images).map_err(saving)?;
        let deadline = self.next_deadline();
        let count = images.len();
        self.state
            .update(|s| {
                s.counts.insert(keyword.to_string(), count);
                s.deadlines.insert(keyword.to_string(), deadline);
            })
            .map_err(saving)?;
        info!(keyword, count, "keyword indexed");
        Ok(images)
    }

    fn scan_due(&self, keyword: &str) -> bool {
        let deadline = self
            .state
            .read(|s| s.deadlines.get(keyword).copied().unwrap_or(0));
        deadline <= now_secs()
    }

    /// Snapshot for `keyword`, re-indexed when absent or past its deadline.
    pub async fn snapshot(
        &mut self,
        source: &dyn PhotoSource,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        if !self.scan_due(keyword) {
            if let Some(images) = self.read_snapshot(keyword) {
                return Ok(images);
            }
        }
        self.rescan(source, keyword).await
    }

    /// Sum of per-keyword counts, re-indexing keywords whose deadline passed.
    pub async fn images_total(&mut self, source: &dyn PhotoSource) -> Result<usize, Error> {
        for keyword in self.keywords() {
            if !self.scan_due(&keyword) {
                continue;
            }
            match self.rescan(source, &keyword).await {
                Ok(_) => {}
                Err(err) if err.is_oauth() => return Err(err),
                Err(err) => {
                    warn!(provider = %self.id, keyword, error = %err, "failed to index keyword")
                }
            }
        }
        Ok(self.state.read(|s| {
            s.keywords
                .iter()
                .map(|k| s.counts.get(k).copied().unwrap_or(0))
                .sum()
        }))
    }

    pub fn images_seen(&self) -> usize {
        self.keywords()
            .iter()
            .map(|k| self.memory.count(k).unwrap_or(0))
            .sum()
    }

    /// Age of the keyword's snapshot in hours; zero when there is none.
    pub fn freshness_for(&self, keyword: &str) -> f64 {
        let modified = fs::metadata(self.snapshot_path(keyword)).and_then(|m| m.modified());
        match modified {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age.as_secs_f64() / 3600.0)
                .unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }

    /// Drops the snapshot so the next total or selection re-indexes it.
    pub fn clear_images_for(&mut self, keyword: &str) -> Result<()> {
        let path = self.snapshot_path(keyword);
        match fs::remove_file(&path) {
            Ok(()) => info!(provider = %self.id, keyword, "cleared image index"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
        self.state.update(|s| {
            if s.deadlines.contains_key(keyword) {
                s.deadlines.insert(keyword.to_string(), 0);
            }
        })
    }

    /// Resets memory of one keyword or, with `None`, of all keywords along
    /// with their index freshness.
    pub fn memory_forget(&mut self, keyword: Option<&str>) -> Result<()> {
        match keyword {
            Some(keyword) => self.memory.forget(keyword),
            None => {
                self.memory.forget_all()?;
                self.state.update(|s| {
                    for deadline in s.deadlines.values_mut() {
                        *deadline = 0;
                    }
                    s.keyword_index = 0;
                    s.image_index = 0;
                })
            }
        }
    }

    /// Drops snapshot and memory of keywords older than the refresh interval.
    pub fn expire_stale_keywords(&mut self) -> Result<usize> {
        if self.refresh_hours == 0 {
            return Ok(0);
        }
        let mut expired = 0;
        for keyword in self.keywords() {
            if self.freshness_for(&keyword) > self.refresh_hours as f64 {
                self.clear_images_for(&keyword)?;
                self.memory.forget(&keyword)?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Walks keywords and their snapshots for the next unseen, displayable image.
    pub async fn select_image(
        &mut self,
        source: &dyn PhotoSource,
        req: &FetchRequest<'_>,
    ) -> Result<Option<ImageDescriptor>, Error> {
        let keywords = self.keywords();
        let n = keywords.len();
        if n == 0 {
            return Ok(None);
        }

        let (start, steps) = if req.randomize {
            let weights: Vec<usize> = self.state.read(|s| {
                keywords
                    .iter()
                    .map(|k| s.counts.get(k).copied().unwrap_or(0))
                    .collect()
            });
            (weighted_pick(&mut self.rng, &weights).unwrap_or(0), n)
        } else {
            let start = self.state.read(|s| s.keyword_index);
            (start, n.saturating_sub(start))
        };

        for step in 0..steps {
            let k = (start + step) % n;
            let keyword = &keywords[k];
            let images = match self.snapshot(source, keyword).await {
                Ok(images) => images,
                Err(err) if err.is_oauth() => return Err(err),
                Err(err) => {
                    warn!(provider = %self.id, keyword, error = %err, "skipping keyword");
                    Vec::new()
                }
            };
            let len = images.len();
            let (offset, span) = if req.randomize {
                (if len == 0 { 0 } else { self.rng.random_range(0..len) }, len)
            } else {
                let first = if step == 0 {
                    self.state.read(|s| s.image_index).min(len)
                } else {
                    0
                };
                (first, len - first)
            };

            for j in 0..span {
                let idx = (offset + j) % len;
                let candidate = &images[idx];
                if !self.memory.remember(&candidate.id, keyword).map_err(saving)? {
                    continue;
                }
                if req.force_orientation {
                    if let Some(dims) = candidate.dimensions {
                        if dims.is_portrait() != req.display.is_portrait() {
                            debug!(id = %candidate.id, "orientation does not match display");
                            continue;
                        }
                    }
                }
                if let Some(mime) = &candidate.mime_type {
                    if !req.supported_mimes.iter().any(|m| m == mime) {
                        debug!(id = %candidate.id, mime, "unsupported mime type");
                        continue;
                    }
                }
                if !req.randomize {
                    self.state
                        .update(|s| {
                            s.keyword_index = k;
                            s.image_index = idx + 1;
                        })
                        .map_err(saving)?;
                }
                let mut chosen = candidate.clone();
                chosen.keyword = Some(keyword.clone());
                chosen.provider = Some(self.id.clone());
                return Ok(Some(chosen));
            }

            if !req.randomize {
                self.state
                    .update(|s| s.image_index = 0)
                    .map_err(saving)?;
            }
        }

        if !req.randomize {
            self.state
                .update(|s| {
                    s.keyword_index = 0;
                    s.image_index = 0;
                })
                .map_err(saving)?;
        }
        Ok(None)
    }

    /// Places the image at `req.dest`, from cache or from its content location.
    #[instrument(skip_all, fields(provider = %self.id, id = %image.id))]
    pub async fn fetch(
        &mut self,
        source: &dyn PhotoSource,
        mut image: ImageDescriptor,
        req: &FetchRequest<'_>,
    ) -> Result<ImageDescriptor, Error> {
        if let Some(cache) = req.cache.filter(|_| image.cache_allowed) {
            if cache.lookup(&image.cache_id(), req.dest).map_err(saving)? {
                image.cache_used = true;
                image.mime_type = sniff_mime(req.dest).or(image.mime_type);
                return Ok(image);
            }
        }

        let size = recommended_size(image.dimensions, req.display);
        let hints = SizeHints {
            size,
            display: req.display,
        };
        match source.content_location(self, &image, hints).await? {
            ContentLocation::Remote(request) => {
                let http = self.ctx.http.clone();
                let outcome = match self.oauth.as_mut() {
                    Some(session) => session.download(&http, request, req.dest).await?,
                    None => http.download(&request, req.dest).await?,
                };
                if !outcome.is_success() {
                    return Err(Error::Http {
                        status: outcome.status,
                        message: outcome.error_body.unwrap_or_default(),
                    });
                }
            }
            ContentLocation::Local(path) => {
                let dest = req.dest.to_path_buf();
                tokio::task::spawn_blocking(move || {
                    crate::processing::frame::shrink_into(&path, &dest, size)
                })
                .await
                .map_err(|err| Error::Unknown(err.to_string()))?
                .map_err(saving)?;
            }
        }

        image.mime_type = sniff_mime(req.dest).or(image.mime_type);
        match &image.mime_type {
            Some(mime) if req.supported_mimes.iter().any(|m| m == mime) => Ok(image),
            other => Err(Error::Unknown(format!(
                "unsupported image type {}",
                other.as_deref().unwrap_or("unknown")
            ))),
        }
    }
}

/// Index drawn with probability proportional to its weight.
pub fn weighted_pick(rng: &mut StdRng, weights: &[usize]) -> Option<usize> {
    let dist = WeightedIndex::new(weights.iter().copied()).ok()?;
    Some(dist.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_bookkeeping_stays_in_sync() {
        let mut data = ProviderStateData::default();
        data.push_keyword("cats", Some(serde_json::json!({"albumId": "1"})));
        data.push_keyword("dogs", None);
        data.keyword_index = 1;
        assert_eq!(data.counts.len(), 2);
        assert_eq!(data.deadlines.len(), 2);

        assert_eq!(data.remove_keyword_at(1).as_deref(), Some("dogs"));
        assert_eq!(data.keyword_index, 0);
        assert!(!data.counts.contains_key("dogs"));
        assert_eq!(data.remove_keyword_at(1), None);
        assert_eq!(data.remove_keyword_at(0).as_deref(), Some("cats"));
        assert!(data.extras.is_empty());
    }

    #[test]
    fn state_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        let state = StateFile::load(&path).unwrap();
        state.update(|s| s.push_keyword("latest", None)).unwrap();

        let reloaded = StateFile::load(&path).unwrap();
        assert_eq!(reloaded.read(|s| s.keywords.clone()), vec!["latest"]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn weighted_pick_skips_zero_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            assert_eq!(weighted_pick(&mut rng, &[0, 3, 0]), Some(1));
        }
        assert_eq!(weighted_pick(&mut rng, &[0, 0]), None);
        assert_eq!(weighted_pick(&mut rng, &[]), None);
    }
}
