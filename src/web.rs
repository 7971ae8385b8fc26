//! HTTP control plane: settings, services, keywords, slideshow control and
//! introspection for the web UI.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Multipart, Path, Query, Request, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono_tz::{TZ_VARIANTS, Tz};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, instrument, warn};

use crate::cache::CacheManager;
use crate::colormatch::ColorReading;
use crate::config::MaintenanceConfig;
use crate::display::{CommandRunner, DisplayAdapter};
use crate::event_log::EventLog;
use crate::events::SlideshowEvent;
use crate::oauth::OAuthConfig;
use crate::power::PowerArbiter;
use crate::provider_manager::{self, SharedManager, SharedProvider};
use crate::providers::ProviderKind;
use crate::settings::SharedSettings;
use crate::slideshow::SharedCurrent;

type ApiError = (StatusCode, String);
type ApiResult = Result<Response, ApiError>;

/// Everything the handlers reach into.
#[derive(Clone)]
pub struct AppState {
    pub settings: SharedSettings,
    pub manager: SharedManager,
    pub events: Arc<EventLog>,
    pub cache: Arc<CacheManager>,
    pub arbiter: Arc<PowerArbiter>,
    /// Wakes the schedule watcher after on/off hours change.
    pub schedule: Arc<Notify>,
    pub display: DisplayAdapter,
    pub current: SharedCurrent,
    pub colour: watch::Receiver<Option<ColorReading>>,
    pub inbox: mpsc::Sender<SlideshowEvent>,
    pub runner: CommandRunner,
    pub maintenance: MaintenanceConfig,
    pub redirect_uri: String,
    pub static_dir: Option<PathBuf>,
}

impl AppState {
    async fn post(&self, event: SlideshowEvent) -> Result<(), ApiError> {
        self.inbox.send(event).await.map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "slideshow is not running".to_string(),
            )
        })
    }

    /// Best effort wake-up; a stopped slideshow is not the caller's problem.
    async fn trigger(&self) {
        if self.inbox.send(SlideshowEvent::Trigger).await.is_err() {
            warn!("slideshow inbox closed; trigger dropped");
        }
    }

    async fn provider(&self, id: &str) -> Result<SharedProvider, ApiError> {
        self.manager
            .lock()
            .await
            .get(id)
            .ok_or_else(|| not_found(format!("no such service {id}")))
    }
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/settings", get(all_settings))
        .route("/settings/{key}", get(one_setting))
        .route("/settings/{key}/{value}", put(put_setting))
        .route("/keywords/{svc}", get(list_keywords))
        .route("/keywords/{svc}/help", get(keyword_help))
        .route("/keywords/{svc}/add", post(add_keyword))
        .route("/keywords/{svc}/delete", post(delete_keyword))
        .route("/keywords/{svc}/source/{index}", get(keyword_source))
        .route("/service/available", get(available_services))
        .route("/service/list", get(list_services))
        .route("/service/add", post(add_service))
        .route("/service/remove", post(remove_service))
        .route("/service/rename", post(rename_service))
        .route(
            "/service/{id}/config",
            get(service_config).post(set_service_config),
        )
        .route("/service/{id}/config/fields", get(service_config_fields))
        .route("/service/{id}/link", get(oauth_link))
        .route("/service/{id}/oauth", post(upload_oauth))
        .route("/callback", get(oauth_callback))
        .route("/control/{cmd}", get(control))
        .route("/events", get(all_events))
        .route("/events/{since}", get(events_since))
        .route("/events/remove/{id}", get(remove_event))
        .route("/details/{topic}", get(details))
        .route("/rotation", get(rotation))
        .route("/rotation/{deg}", put(set_rotation))
        .route("/maintenance/{cmd}", get(maintenance))
        .route("/upload/{kind}", post(upload));
    if let Some(dir) = &state.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(SetResponseHeaderLayer::overriding(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    ))
    .with_state(state)
}

#[instrument(skip_all, fields(%addr))]
pub async fn run(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control plane on {addr}"))?;
    info!("control plane listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancel.cancelled().await;
    })
    .await
    .context("control plane server failed")
}

fn not_found(message: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, message.into())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

fn not_implemented(what: &str) -> ApiError {
    (
        StatusCode::NOT_IMPLEMENTED,
        format!("{what} is not supported on this frame"),
    )
}

fn internal_error(msg: &'static str) -> impl Fn(anyhow::Error) -> ApiError {
    move |err| {
        tracing::error!(error = ?err, "{msg}");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{msg}: {err:#}"))
    }
}

fn json_response(value: Value) -> Response {
    Json(value).into_response()
}

// ---- settings ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideEffect {
    DisplayDriver,
    Timezone,
    Resolution,
    Schedule,
    Refresh,
    Rotation,
    Slideshow,
}

const SIDE_EFFECTS: &[(&str, SideEffect)] = &[
    ("display-driver", SideEffect::DisplayDriver),
    ("timezone", SideEffect::Timezone),
    ("resolution", SideEffect::Resolution),
    ("tvservice", SideEffect::Resolution),
    ("width", SideEffect::Resolution),
    ("height", SideEffect::Resolution),
    ("display-on", SideEffect::Schedule),
    ("display-off", SideEffect::Schedule),
    ("powersave", SideEffect::Schedule),
    ("refresh-content", SideEffect::Refresh),
    ("rotation", SideEffect::Rotation),
    ("imagesizing", SideEffect::Slideshow),
    ("randomize_images", SideEffect::Slideshow),
    ("force_orientation", SideEffect::Slideshow),
    ("enable-cache", SideEffect::Slideshow),
];

fn side_effect(key: &str) -> Option<SideEffect> {
    SIDE_EFFECTS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, effect)| *effect)
}

/// Parses `1920x1080`.
fn parse_resolution(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(['x', 'X'])?;
    let w = w.trim().parse().ok().filter(|v| *v > 0)?;
    let h = h.trim().parse().ok().filter(|v| *v > 0)?;
    Some((w, h))
}

async fn all_settings(State(state): State<AppState>) -> ApiResult {
    let all = state.settings.read(|s| s.all().clone());
    Ok(Json(all).into_response())
}

async fn one_setting(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    let value = state
        .settings
        .read(|s| s.get(&key).cloned())
        .ok_or_else(|| not_found(format!("unknown setting {key}")))?;
    let mut body = serde_json::Map::new();
    body.insert(key, value);
    Ok(json_response(Value::Object(body)))
}

async fn put_setting(
    State(state): State<AppState>,
    Path((key, value)): Path<(String, String)>,
) -> ApiResult {
    apply_setting(&state, &key, value).await?;
    Ok(json_response(json!({ "status": true })))
}

/// Validates, stores and then runs the key's side effect.
async fn apply_setting(state: &AppState, key: &str, value: String) -> Result<(), ApiError> {
    if key == "keywords" || !state.settings.read(|s| s.is_known(key)) {
        return Err(not_found(format!("unknown setting {key}")));
    }
    let effect = side_effect(key);
    let value = match effect {
        Some(SideEffect::Timezone) => value.replace('+', "/"),
        _ => value,
    };
    match effect {
        Some(SideEffect::DisplayDriver) if value != "none" => {
            return Err(bad_request(format!("display driver {value} is not installed")));
        }
        Some(SideEffect::Timezone) if !value.is_empty() && value.parse::<Tz>().is_err() => {
            return Err(bad_request(format!("unknown timezone {value}")));
        }
        Some(SideEffect::Rotation) => {
            let degrees: u32 = value
                .parse()
                .map_err(|_| bad_request(format!("rotation must be a number, got {value}")))?;
            if degrees >= 360 || degrees % 90 != 0 {
                return Err(bad_request("rotation must be one of 0, 90, 180 or 270"));
            }
        }
        _ => {}
    }
    let resolution = if key == "resolution" && !value.is_empty() {
        Some(parse_resolution(&value).ok_or_else(|| bad_request(format!("bad resolution {value}")))?)
    } else {
        None
    };

    state
        .settings
        .update(|store| {
            let mut candidate = store.clone();
            candidate.set(key, &value)?;
            if let Some((width, height)) = resolution {
                candidate.set_value("width", json!(width))?;
                candidate.set_value("height", json!(height))?;
            }
            candidate.snapshot().validate()?;
            *store = candidate;
            Ok(())
        })
        .map_err(|err| bad_request(format!("{err:#}")))?;
    info!(key, value, "setting changed");

    match effect {
        Some(SideEffect::Resolution | SideEffect::Rotation) => {
            empty_cache(state).await?;
            state.post(SlideshowEvent::SettingsChanged).await?;
        }
        Some(SideEffect::Timezone | SideEffect::Schedule) => state.schedule.notify_one(),
        Some(SideEffect::Refresh) => {
            let hours = state.settings.snapshot().refresh_content_hours;
            state.manager.lock().await.set_refresh_hours(hours).await;
        }
        Some(SideEffect::Slideshow) => state.post(SlideshowEvent::SettingsChanged).await?,
        Some(SideEffect::DisplayDriver) | None => {}
    }
    Ok(())
}

async fn empty_cache(state: &AppState) -> Result<(), ApiError> {
    let cache = state.cache.clone();
    let sweep = tokio::task::spawn_blocking(move || cache.empty(None))
        .await
        .map_err(|err| internal_error("cache sweep failed")(err.into()))?;
    info!(?sweep, "cache emptied");
    Ok(())
}

// ---- keywords ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddKeyword {
    keywords: String,
}

#[derive(Debug, Deserialize)]
struct DeleteKeyword {
    id: usize,
}

async fn list_keywords(State(state): State<AppState>, Path(svc): Path<String>) -> ApiResult {
    let provider = state.provider(&svc).await?;
    let details = provider.lock().await.keyword_details();
    Ok(json_response(json!({ "keywords": details })))
}

async fn keyword_help(State(state): State<AppState>, Path(svc): Path<String>) -> ApiResult {
    let provider = state.provider(&svc).await?;
    let kind = provider.lock().await.kind();
    Ok(json_response(json!({ "message": kind.help_keywords() })))
}

async fn add_keyword(
    State(state): State<AppState>,
    Path(svc): Path<String>,
    Json(body): Json<AddKeyword>,
) -> ApiResult {
    let provider = state.provider(&svc).await?;
    let (had_keywords, result) = {
        let mut provider = provider.lock().await;
        let had = !provider.keywords().is_empty();
        let result = provider.add_keyword(&body.keywords).await;
        if result.is_ok() {
            provider.update_state().await;
        }
        (had, result)
    };
    match result {
        Ok(keyword) => {
            if !had_keywords {
                state.trigger().await;
            }
            Ok(json_response(json!({ "status": true, "keyword": keyword })))
        }
        Err(err) => Ok(json_response(
            json!({ "status": false, "error": format!("{err:#}") }),
        )),
    }
}

async fn delete_keyword(
    State(state): State<AppState>,
    Path(svc): Path<String>,
    Json(body): Json<DeleteKeyword>,
) -> ApiResult {
    let provider = state.provider(&svc).await?;
    let removed = {
        let mut provider = provider.lock().await;
        let removed = provider
            .remove_keyword(body.id)
            .map_err(internal_error("failed to remove keyword"))?;
        provider.update_state().await;
        removed
    };
    if !removed {
        return Err(not_found(format!("no keyword at index {}", body.id)));
    }
    state.trigger().await;
    Ok(json_response(json!({ "status": true })))
}

async fn keyword_source(
    State(state): State<AppState>,
    Path((svc, index)): Path<(String, usize)>,
) -> ApiResult {
    let provider = state.provider(&svc).await?;
    let provider = provider.lock().await;
    let url = provider
        .keywords()
        .get(index)
        .and_then(|keyword| provider.keyword_source_url(keyword))
        .ok_or_else(|| not_found(format!("no source for keyword {index}")))?;
    Ok(Redirect::temporary(&url).into_response())
}

// ---- services ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddService {
    id: u32,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RemoveService {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RenameService {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: BTreeMap<String, String>,
}

async fn available_services() -> ApiResult {
    Ok(json_response(Value::Array(provider_manager::available())))
}

async fn list_services(State(state): State<AppState>) -> ApiResult {
    let list = state.manager.lock().await.list().await;
    Ok(Json(list).into_response())
}

async fn add_service(State(state): State<AppState>, Json(body): Json<AddService>) -> ApiResult {
    let kind = ProviderKind::from_type_id(body.id)
        .ok_or_else(|| bad_request(format!("unknown service type {}", body.id)))?;
    let id = state
        .manager
        .lock()
        .await
        .add(kind, &body.name)
        .map_err(|err| bad_request(format!("{err:#}")))?;
    state.trigger().await;
    Ok(json_response(json!({ "id": id })))
}

async fn remove_service(
    State(state): State<AppState>,
    Json(body): Json<RemoveService>,
) -> ApiResult {
    let removed = state
        .manager
        .lock()
        .await
        .remove(&body.id)
        .await
        .map_err(internal_error("failed to remove service"))?;
    if !removed {
        return Err(not_found(format!("no such service {}", body.id)));
    }
    state.trigger().await;
    Ok(json_response(json!({ "status": "Done" })))
}

async fn rename_service(
    State(state): State<AppState>,
    Json(body): Json<RenameService>,
) -> ApiResult {
    let renamed = state
        .manager
        .lock()
        .await
        .rename(&body.id, &body.name)
        .await
        .map_err(internal_error("failed to rename service"))?;
    if !renamed {
        return Err(not_found(format!("no such service {}", body.id)));
    }
    Ok(json_response(json!({ "status": "Done" })))
}

async fn service_config(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let provider = state.provider(&id).await?;
    let config = provider.lock().await.configuration();
    Ok(json_response(json!({ "config": config })))
}

async fn set_service_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ServiceConfig>,
) -> ApiResult {
    let provider = state.provider(&id).await?;
    let ready = {
        let mut provider = provider.lock().await;
        provider
            .set_configuration(body.config)
            .map_err(internal_error("failed to store service configuration"))?;
        provider.update_state().await
    };
    state.trigger().await;
    Ok(json_response(json!({ "status": true, "state": ready })))
}

async fn service_config_fields(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let provider = state.provider(&id).await?;
    let kind = provider.lock().await.kind();
    Ok(json_response(kind.config_fields()))
}

async fn oauth_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> ApiResult {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "local".to_string());
    let url = state
        .manager
        .lock()
        .await
        .oauth_start(&id, &client)
        .await
        .map_err(|err| bad_request(format!("{err:#}")))?;
    Ok(Redirect::to(&url).into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: String,
}

async fn oauth_callback(
    State(state): State<AppState>,
    uri: Uri,
    Query(query): Query<CallbackQuery>,
) -> ApiResult {
    let callback_url = match uri.query() {
        Some(q) => format!("{}?{q}", state.redirect_uri),
        None => state.redirect_uri.clone(),
    };
    let id = state
        .manager
        .lock()
        .await
        .oauth_callback(&query.state, &callback_url)
        .await
        .map_err(|err| bad_request(format!("{err:#}")))?;
    info!(id, "service linked");
    state.trigger().await;
    Ok(Redirect::to("/").into_response())
}

async fn upload_oauth(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult {
    let provider = state.provider(&id).await?;
    let mut payload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(err.to_string()))?
    {
        if field.name() == Some("filename") {
            payload = Some(field.bytes().await.map_err(|err| bad_request(err.to_string()))?);
        }
    }
    let raw = payload.ok_or_else(|| bad_request("missing \"filename\" field"))?;
    let config = OAuthConfig::from_client_json(&raw).map_err(|err| bad_request(format!("{err:#}")))?;
    let mut provider = provider.lock().await;
    provider
        .set_oauth_config(config)
        .map_err(internal_error("failed to store OAuth client"))?;
    let ready = provider.update_state().await;
    Ok(json_response(json!({ "status": true, "state": ready })))
}

// ---- control & events --------------------------------------------------

async fn control(State(state): State<AppState>, Path(cmd): Path<String>) -> ApiResult {
    let event = SlideshowEvent::from_control(&cmd)
        .ok_or_else(|| not_found(format!("unknown command {cmd}")))?;
    state.post(event).await?;
    Ok(json_response(json!({ "control": true })))
}

async fn all_events(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.events.all()).into_response())
}

async fn events_since(State(state): State<AppState>, Path(since): Path<u64>) -> ApiResult {
    Ok(Json(state.events.since(since)).into_response())
}

async fn remove_event(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    if !state.events.remove(id) {
        return Err(not_found(format!("no removable event {id}")));
    }
    Ok("ok".into_response())
}

// ---- introspection -----------------------------------------------------

async fn details(State(state): State<AppState>, Path(topic): Path<String>) -> ApiResult {
    let body = match topic.as_str() {
        "version" => json!({ "version": env!("CARGO_PKG_VERSION") }),
        "current" => {
            let current = state
                .current
                .get()
                .ok_or_else(|| not_found("nothing has been shown yet"))?;
            json!(current)
        }
        "timezone" => {
            let current = state.settings.snapshot().timezone.map(|tz| tz.name());
            let zones: Vec<&str> = TZ_VARIANTS.iter().map(|tz| tz.name()).collect();
            json!({ "current": current, "timezones": zones })
        }
        "display" => {
            let votes: BTreeMap<&str, _> = state
                .arbiter
                .votes()
                .await
                .into_iter()
                .map(|(source, vote)| (source.as_str(), vote))
                .collect();
            json!({
                "display": state.display.is_on(),
                "standby": state.arbiter.is_standby().await,
                "votes": votes,
            })
        }
        "color" => {
            let reading = *state.colour.borrow();
            json!({
                "temperature": reading.map(|r| r.kelvin),
                "lux": reading.map(|r| r.lux),
            })
        }
        "sensor" => {
            let present = state.colour.borrow().is_some();
            json!({ "sensor": present })
        }
        "cache" => {
            let cache = state.cache.clone();
            let (stats, pressure) = tokio::task::spawn_blocking(move || {
                (cache.stats(), cache.pressure().ok())
            })
            .await
            .map_err(|err| internal_error("cache inspection failed")(err.into()))?;
            json!({
                "files": stats.files,
                "bytes": stats.bytes,
                "size": crate::cache::format_bytes(stats.bytes),
                "pressure": pressure,
            })
        }
        "resolution" => {
            let snapshot = state.settings.snapshot();
            let (width, height) = snapshot.display_size();
            json!({
                "width": snapshot.width,
                "height": snapshot.height,
                "depth": snapshot.depth,
                "tvservice": snapshot.tvservice,
                "rotation": snapshot.rotation,
                "effective": { "width": width, "height": height },
            })
        }
        "services" => json!(state.manager.lock().await.list().await),
        other => return Err(not_found(format!("unknown topic {other}"))),
    };
    Ok(json_response(body))
}

async fn rotation(State(state): State<AppState>) -> ApiResult {
    let degrees = state.settings.snapshot().rotation;
    Ok(json_response(json!({ "rotation": degrees })))
}

async fn set_rotation(State(state): State<AppState>, Path(deg): Path<String>) -> ApiResult {
    apply_setting(&state, "rotation", deg).await?;
    rotation(State(state)).await
}

// ---- maintenance -------------------------------------------------------

/// Runs a configured host command without waiting; reboot and shutdown may
/// take this process down with them.
fn launch(state: &AppState, command: &str, what: &'static str) {
    let runner = state.runner.clone();
    let command = command.to_string();
    info!(command, "running {what} command");
    tokio::task::spawn_blocking(move || match runner(&command) {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(status = ?output.status.code(), stderr = %output.stderr, "{what} command failed"),
        Err(err) => warn!(error = ?err, "{what} command could not run"),
    });
}

async fn maintenance(State(state): State<AppState>, Path(cmd): Path<String>) -> ApiResult {
    match cmd.as_str() {
        "reset" => {
            state
                .settings
                .update(|store| {
                    store.reset();
                    Ok(())
                })
                .map_err(internal_error("failed to reset settings"))?;
            {
                let mut manager = state.manager.lock().await;
                for id in manager.ids() {
                    manager
                        .remove(&id)
                        .await
                        .map_err(internal_error("failed to remove service"))?;
                }
            }
            empty_cache(&state).await?;
            state.events.warn("Frame was reset to factory settings");
            match state.maintenance.reboot_command.as_deref() {
                Some(command) => launch(&state, command, "reboot"),
                None => state.post(SlideshowEvent::SettingsChanged).await?,
            }
            Ok(json_response(json!({ "reset": true })))
        }
        "reboot" | "shutdown" => {
            let command = if cmd == "reboot" {
                state.maintenance.reboot_command.as_deref()
            } else {
                state.maintenance.shutdown_command.as_deref()
            };
            let command = command.ok_or_else(|| not_implemented(&cmd))?;
            let what = if cmd == "reboot" { "reboot" } else { "shutdown" };
            launch(&state, command, what);
            let mut body = serde_json::Map::new();
            body.insert(cmd, Value::Bool(true));
            Ok(json_response(Value::Object(body)))
        }
        "clearCache" => {
            state.post(SlideshowEvent::ClearCache).await?;
            Ok(json_response(json!({ "clearCache": true })))
        }
        "forgetMemory" => {
            state.post(SlideshowEvent::MemoryForget).await?;
            Ok(json_response(json!({ "forgetMemory": true })))
        }
        "checkversion" | "update" | "ssh" => Err(not_implemented(&cmd)),
        other => Err(not_found(format!("unknown maintenance command {other}"))),
    }
}

async fn upload(Path(kind): Path<String>) -> ApiResult {
    Err(not_implemented(&format!("uploading {kind}")))
}
