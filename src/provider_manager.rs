use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use frame_settings::SettingsStore;
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::oauth::{OAuthConfig, OAuthToken};
use crate::photo::hash_text;
use crate::providers::base::weighted_pick;
use crate::providers::{Provider, ProviderContext, ProviderKind, ProviderState};

pub const SERVICES_FILE: &str = "services.json";
pub const LEGACY_OAUTH_FILE: &str = "oauth.json";

pub type SharedProvider = Arc<Mutex<Provider>>;
pub type SharedManager = Arc<Mutex<ProviderManager>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ServiceRecord {
    #[serde(rename = "type")]
    kind: ProviderKind,
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    record: ServiceRecord,
    provider: SharedProvider,
}

/// Row of `/service/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_id: u32,
    pub service: &'static str,
    pub state: ProviderState,
    pub explanation: Option<String>,
    pub needs_oauth: bool,
    pub needs_config: bool,
    pub keywords: usize,
}

/// Provider picked for the next slide.
#[derive(Debug, Clone)]
pub struct Chosen {
    pub id: String,
    pub provider: SharedProvider,
}

/// Owns the ordered set of provider instances.
///
/// Lock order: the manager before any provider; callers never hold a
/// provider lock while waiting for the manager.
pub struct ProviderManager {
    config_dir: PathBuf,
    services_dir: PathBuf,
    ctx: ProviderContext,
    entries: Vec<ServiceEntry>,
    last_used: Option<usize>,
    created: u64,
    refresh_hours: u64,
    rng: StdRng,
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager")
            .field("services_dir", &self.services_dir)
            .field("providers", &self.entries.len())
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// Catalog of provider kinds for `/service/available`.
pub fn available() -> Vec<Value> {
    ProviderKind::ALL
        .iter()
        .map(|kind| {
            json!({
                "id": kind.type_id(),
                "name": kind.name(),
                "oauth": kind.needs_oauth(),
                "config": kind.needs_config(),
                "help": kind.help_keywords(),
                "fields": kind.config_fields(),
            })
        })
        .collect()
}

impl ProviderManager {
    /// Opens every provider listed in `services.json`.
    pub fn load(
        config_dir: impl Into<PathBuf>,
        services_dir: impl Into<PathBuf>,
        ctx: ProviderContext,
    ) -> Result<Self> {
        let config_dir = config_dir.into();
        let services_dir = services_dir.into();
        fs::create_dir_all(&services_dir)
            .with_context(|| format!("failed to create {}", services_dir.display()))?;

        let records: Vec<ServiceRecord> = match fs::read_to_string(config_dir.join(SERVICES_FILE)) {
            Ok(raw) => serde_json::from_str(&raw).context("failed to parse services.json")?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context("failed to read services.json"),
        };

        let mut manager = Self {
            config_dir,
            services_dir,
            ctx,
            entries: Vec::new(),
            last_used: None,
            created: 0,
            refresh_hours: 24,
            rng: StdRng::from_os_rng(),
        };
        for record in records {
            match manager.open(&record) {
                Ok(provider) => manager.entries.push(ServiceEntry {
                    record,
                    provider: Arc::new(Mutex::new(provider)),
                }),
                Err(err) => warn!(id = %record.id, error = ?err, "skipping provider that failed to open"),
            }
        }
        info!(providers = manager.entries.len(), "providers loaded");
        Ok(manager)
    }

    fn open(&self, record: &ServiceRecord) -> Result<Provider> {
        let mut provider = Provider::open(
            record.kind,
            &record.id,
            &record.name,
            self.services_dir.join(&record.id),
            self.ctx.clone(),
        )?;
        provider.core_mut().set_refresh_hours(self.refresh_hours);
        Ok(provider)
    }

    fn save(&self) -> Result<()> {
        let records: Vec<&ServiceRecord> = self.entries.iter().map(|e| &e.record).collect();
        let path = self.config_dir.join(SERVICES_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&records)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("failed to replace {}", path.display()))
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.record.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<SharedProvider> {
        self.entries
            .iter()
            .find(|e| e.record.id == id)
            .map(|e| e.provider.clone())
    }

    pub fn last_used(&self) -> Option<String> {
        self.last_used
            .and_then(|i| self.entries.get(i))
            .map(|e| e.record.id.clone())
    }

    fn new_id(&mut self, name: &str) -> String {
        self.created += 1;
        let seed = format!("{name}-{}-{}", Utc::now().timestamp(), self.created);
        let mut id = hash_text(&seed);
        id.truncate(16);
        id
    }

    /// Creates and registers a provider; returns its id.
    pub fn add(&mut self, kind: ProviderKind, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            bail!("service name must not be empty");
        }
        let mut id = self.new_id(name);
        while self.get(&id).is_some() {
            id = self.new_id(name);
        }
        let record = ServiceRecord {
            kind,
            id: id.clone(),
            name: name.to_string(),
        };
        let provider = self.open(&record)?;
        self.entries.push(ServiceEntry {
            record,
            provider: Arc::new(Mutex::new(provider)),
        });
        self.save()?;
        info!(id, kind = kind.name(), name, "service added");
        Ok(id)
    }

    /// Registers an already opened provider.
    pub fn insert_provider(&mut self, provider: Provider) -> Result<()> {
        let record = ServiceRecord {
            kind: provider.kind(),
            id: provider.id().to_string(),
            name: provider.name().to_string(),
        };
        if self.get(&record.id).is_some() {
            bail!("service {} already exists", record.id);
        }
        self.entries.push(ServiceEntry {
            record,
            provider: Arc::new(Mutex::new(provider)),
        });
        self.save()
    }

    /// Deletes a provider together with its state, memory and snapshots.
    pub async fn remove(&mut self, id: &str) -> Result<bool> {
        let Some(index) = self.entries.iter().position(|e| e.record.id == id) else {
            return Ok(false);
        };
        let entry = self.entries.remove(index);
        self.last_used = match self.last_used {
            Some(i) if i == index => None,
            Some(i) if i > index => Some(i - 1),
            other => other,
        };
        self.save()?;

        let dir = entry.provider.lock().await.core().dir().to_path_buf();
        drop(entry);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("failed to remove {}", dir.display())),
        }
        info!(id, "service removed");
        Ok(true)
    }

    pub async fn rename(&mut self, id: &str, name: &str) -> Result<bool> {
        let name = name.trim();
        let Some(entry) = self.entries.iter_mut().find(|e| e.record.id == id) else {
            return Ok(false);
        };
        entry.record.name = name.to_string();
        entry.provider.lock().await.set_name(name);
        self.save()?;
        Ok(true)
    }

    pub async fn set_refresh_hours(&mut self, hours: u64) {
        self.refresh_hours = hours;
        for entry in &self.entries {
            entry.provider.lock().await.core_mut().set_refresh_hours(hours);
        }
    }

    /// Refreshes every provider's state and summarises it.
    pub async fn list(&self) -> Vec<ServiceSummary> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut provider = entry.provider.lock().await;
            let state = provider.update_state().await;
            out.push(ServiceSummary {
                id: entry.record.id.clone(),
                name: entry.record.name.clone(),
                type_id: entry.record.kind.type_id(),
                service: entry.record.kind.name(),
                state,
                explanation: provider.explain_state(),
                needs_oauth: entry.record.kind.needs_oauth(),
                needs_config: entry.record.kind.needs_config(),
                keywords: provider.keywords().len(),
            });
        }
        out
    }

    /// Picks a ready provider with images left; resets all memory and
    /// retries once when none has any.
    pub async fn choose_service(&mut self, randomize: bool) -> Option<Chosen> {
        self.choose_service_skipping(randomize, &HashSet::new()).await
    }

    /// Like [`Self::choose_service`] but never returns a provider in `skip`.
    ///
    /// Memory is only reset when a provider outside `skip` ran out of unseen
    /// images, never because every remaining candidate was skipped.
    pub async fn choose_service_skipping(
        &mut self,
        randomize: bool,
        skip: &HashSet<String>,
    ) -> Option<Chosen> {
        let exhausted = match self.choose_once(randomize, skip).await {
            Ok(chosen) => return Some(chosen),
            Err(exhausted) => exhausted,
        };
        if !exhausted {
            return None;
        }
        debug!("no provider has unseen images; resetting memory");
        if let Err(err) = self.memory_forget_all().await {
            warn!(error = ?err, "failed to reset memory");
        }
        self.choose_once(randomize, skip).await.ok()
    }

    /// On failure, tells whether some eligible provider had images but had
    /// already shown all of them.
    async fn choose_once(
        &mut self,
        randomize: bool,
        skip: &HashSet<String>,
    ) -> Result<Chosen, bool> {
        let mut candidates: Vec<(usize, usize)> = Vec::new();
        let mut exhausted = false;
        for (index, entry) in self.entries.iter().enumerate() {
            if skip.contains(&entry.record.id) {
                continue;
            }
            let mut provider = entry.provider.lock().await;
            if provider.update_state().await != ProviderState::Ready {
                continue;
            }
            let total = provider.images_total().await;
            let remaining = total.saturating_sub(provider.images_seen());
            if remaining > 0 {
                candidates.push((index, total));
            } else if total > 0 {
                exhausted = true;
            }
        }
        if candidates.is_empty() {
            return Err(exhausted);
        }

        let index = if randomize {
            let weights: Vec<usize> = candidates.iter().map(|(_, total)| *total).collect();
            let pick = weighted_pick(&mut self.rng, &weights).unwrap_or(0);
            candidates[pick].0
        } else {
            let n = self.entries.len();
            let start = self.last_used.unwrap_or(0);
            (0..n)
                .map(|step| (start + step) % n)
                .find(|i| candidates.iter().any(|(c, _)| c == i))
                .unwrap_or(candidates[0].0)
        };
        self.last_used = Some(index);
        let entry = &self.entries[index];
        Ok(Chosen {
            id: entry.record.id.clone(),
            provider: entry.provider.clone(),
        })
    }

    /// Clears per-keyword memory and index freshness of every provider.
    pub async fn memory_forget_all(&self) -> Result<()> {
        for entry in &self.entries {
            entry.provider.lock().await.memory_forget(None)?;
        }
        info!("memory of all providers reset");
        Ok(())
    }

    pub async fn expire_stale_keywords(&self) -> usize {
        let mut expired = 0;
        for entry in &self.entries {
            match entry.provider.lock().await.expire_stale_keywords() {
                Ok(count) => expired += count,
                Err(err) => warn!(id = %entry.record.id, error = ?err, "failed to expire keywords"),
            }
        }
        expired
    }

    /// Moves to the next keyword, rotating to the following provider on wrap.
    pub async fn next_album(&mut self) -> Result<()> {
        let Some(current) = self.last_used.filter(|i| *i < self.entries.len()) else {
            return Ok(());
        };
        if self.entries[current].provider.lock().await.next_album()? {
            return Ok(());
        }
        let next = (current + 1) % self.entries.len();
        self.entries[next].provider.lock().await.start_at_first_album()?;
        self.last_used = Some(next);
        Ok(())
    }

    pub async fn prev_album(&mut self) -> Result<()> {
        let Some(current) = self.last_used.filter(|i| *i < self.entries.len()) else {
            return Ok(());
        };
        if self.entries[current].provider.lock().await.prev_album()? {
            return Ok(());
        }
        let n = self.entries.len();
        let prev = (current + n - 1) % n;
        self.entries[prev].provider.lock().await.start_at_last_album()?;
        self.last_used = Some(prev);
        Ok(())
    }

    /// Begins linking `id`; the returned URL carries a state naming the service.
    pub async fn oauth_start(&self, id: &str, client_ip: &str) -> Result<String> {
        let provider = self.get(id).ok_or_else(|| anyhow!("no such service {id}"))?;
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let link_state = format!("{nonce}-{client_ip}-{id}");
        let url = provider.lock().await.start_oauth(&link_state)?;
        Ok(url)
    }

    /// Completes a link; the service id is the last segment of `state`.
    pub async fn oauth_callback(&self, state: &str, callback_url: &str) -> Result<String> {
        let id = state
            .rsplit('-')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("malformed OAuth state"))?;
        let provider = self.get(id).ok_or_else(|| anyhow!("no such service {id}"))?;
        let mut provider = provider.lock().await;
        provider
            .finish_oauth(callback_url)
            .await
            .map_err(|err| anyhow!(err.user_message()))?;
        provider.update_state().await;
        Ok(id.to_string())
    }

    /// One-time import of the single-account layout that predates services.
    pub async fn migrate_legacy(&mut self, settings: &mut SettingsStore) -> Result<bool> {
        let legacy = self.config_dir.join(LEGACY_OAUTH_FILE);
        if !self.entries.is_empty() || !legacy.is_file() {
            return Ok(false);
        }
        let raw = fs::read(&legacy).with_context(|| format!("failed to read {}", legacy.display()))?;
        let client = OAuthConfig::from_client_json(&raw)?;
        let token = settings
            .take_legacy("oauth_token")
            .and_then(|v| serde_json::from_value::<OAuthToken>(v).ok());
        let keywords: Vec<String> = settings
            .take_legacy("keywords")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let id = self.add(ProviderKind::GooglePhotos, "Google Photos")?;
        if let Some(provider) = self.get(&id) {
            let mut provider = provider.lock().await;
            provider.set_oauth_config(client)?;
            let core = provider.core_mut();
            core.state().update(|s| {
                s.oauth_token = token;
                for keyword in &keywords {
                    let keyword = crate::providers::google_photos::normalize_keyword(keyword);
                    if !keyword.is_empty() && !s.keywords.contains(&keyword) {
                        s.push_keyword(&keyword, None);
                    }
                }
            })?;
        }
        settings.save()?;
        rename_migrated(&legacy)?;
        info!(id, keywords = keywords.len(), "imported legacy configuration");
        Ok(true)
    }
}

fn rename_migrated(path: &Path) -> Result<()> {
    let target = path.with_extension("json.migrated");
    fs::rename(path, &target)
        .with_context(|| format!("failed to rename {} to {}", path.display(), target.display()))
}
