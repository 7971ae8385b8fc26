mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use frame_settings::SettingsStore;
use tokio::sync::{mpsc, watch};

use photoframe_svc::cache::CacheManager;
use photoframe_svc::colormatch::ColorMatcher;
use photoframe_svc::config::{Configuration, DisplayConfig};
use photoframe_svc::display::DisplayAdapter;
use photoframe_svc::event_log::{EventLevel, EventLog};
use photoframe_svc::events::{PowerState, SlideshowEvent};
use photoframe_svc::history::ImageHistory;
use photoframe_svc::oauth::{OAuthConfig, OAuthToken};
use photoframe_svc::provider_manager::{ProviderManager, SharedManager};
use photoframe_svc::providers::{Provider, ProviderKind, ProviderState};
use photoframe_svc::settings::SharedSettings;
use photoframe_svc::slideshow::{SharedCurrent, Slideshow, SlideshowParts, TickOutcome};

use common::{FixtureSource, context, provider, recording_runner, write_png};

struct Frame {
    slideshow: Slideshow,
    manager: SharedManager,
    events: Arc<EventLog>,
    shown: Arc<Mutex<Vec<String>>>,
    current: SharedCurrent,
    _inbox: mpsc::Sender<SlideshowEvent>,
}

async fn frame(base: &Path, source: FixtureSource, keywords: &[&str]) -> Frame {
    let events = Arc::new(EventLog::with_capacity(100));
    let p1 = provider(base, "p1", events.clone(), source, keywords).await;
    frame_with(base, events, vec![p1], &[]).await
}

/// Frame over `providers` in order, with extra user settings applied.
async fn frame_with(
    base: &Path,
    events: Arc<EventLog>,
    providers: Vec<Provider>,
    settings: &[(&str, &str)],
) -> Frame {
    let cfg = Configuration {
        base_dir: base.to_path_buf(),
        ..Configuration::default()
    };
    let mut manager =
        ProviderManager::load(cfg.config_dir(), cfg.services_dir(), context(base, events.clone()))
            .unwrap();
    for p in providers {
        manager.insert_provider(p).unwrap();
    }
    let manager: SharedManager = Arc::new(tokio::sync::Mutex::new(manager));

    let mut store = SettingsStore::with_defaults(cfg.settings_path());
    store.set("randomize_images", "0").unwrap();
    store.set("imagesizing", "none").unwrap();
    for (key, value) in settings {
        store.set(key, value).unwrap();
    }

    let (runner, shown) = recording_runner();
    let display = DisplayAdapter::with_runner(
        DisplayConfig {
            show_command: Some("show @FILE@".to_string()),
            power_on_command: Some("power on".to_string()),
            power_off_command: Some("power off".to_string()),
            ..DisplayConfig::default()
        },
        runner,
    )
    .unwrap();
    let (_colour_tx, colour) = watch::channel(None);
    let (tx, inbox) = mpsc::channel(8);
    let current = SharedCurrent::default();
    let slideshow = Slideshow::new(SlideshowParts {
        settings: SharedSettings::new(store),
        manager: manager.clone(),
        cache: Arc::new(CacheManager::new(cfg.cache_dir()).unwrap()),
        history: ImageHistory::new(cfg.history_dir()).unwrap(),
        events: events.clone(),
        display,
        matcher: ColorMatcher::new(None),
        colour,
        inbox,
        current: current.clone(),
        work_dir: base.join("tmp"),
        supported_mimes: cfg.supported_mime_types.clone(),
        greeting: None,
    })
    .unwrap();
    Frame {
        slideshow,
        manager,
        events,
        shown,
        current,
        _inbox: tx,
    }
}

fn shown_id(outcome: &TickOutcome) -> &str {
    match outcome {
        TickOutcome::Shown(image) => &image.id,
        other => panic!("expected a photo, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn album_plays_in_order_then_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let source = FixtureSource::new(ProviderKind::UsbPhotos).album(
        "vacation",
        vec![
            ("A", write_png(&photos, "a", 40, 30), 40, 30),
            ("B", write_png(&photos, "b", 40, 30), 40, 30),
            ("C", write_png(&photos, "c", 40, 30), 40, 30),
        ],
    );
    let mut frame = frame(dir.path(), source, &["vacation"]).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        let outcome = frame.slideshow.tick().await;
        ids.push(shown_id(&outcome).to_string());
    }
    assert_eq!(ids, ["A", "B", "C", "A"]);
    assert_eq!(frame.shown.lock().unwrap().len(), 4);
    assert_eq!(frame.current.get().unwrap().id, "A");
    assert_eq!(frame.current.get().unwrap().provider.as_deref(), Some("p1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn previous_walks_history_and_stops_at_the_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let album = (1..=5)
        .map(|n| {
            let name = n.to_string();
            let path = write_png(&photos, &name, 40, 30);
            (["1", "2", "3", "4", "5"][n - 1], path, 40, 30)
        })
        .collect();
    let source = FixtureSource::new(ProviderKind::UsbPhotos).album("vacation", album);
    let mut frame = frame(dir.path(), source, &["vacation"]).await;

    for expected in ["1", "2", "3", "4", "5"] {
        let outcome = frame.slideshow.tick().await;
        assert_eq!(shown_id(&outcome), expected);
    }

    for expected in ["4", "3", "2", "1"] {
        let outcome = frame.slideshow.dispatch(SlideshowEvent::Prev).await;
        assert!(matches!(outcome, TickOutcome::Replayed(_)), "{outcome:?}");
        assert_eq!(frame.current.get().unwrap().id, expected);
    }
    let outcome = frame.slideshow.dispatch(SlideshowEvent::Prev).await;
    assert_eq!(outcome, TickOutcome::Unchanged);
    assert_eq!(frame.current.get().unwrap().id, "1");

    let outcome = frame.slideshow.dispatch(SlideshowEvent::Next).await;
    assert_eq!(outcome, TickOutcome::Replayed(3));
    assert_eq!(frame.current.get().unwrap().id, "2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standby_parks_the_slideshow_until_woken() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let source = FixtureSource::new(ProviderKind::UsbPhotos).album(
        "vacation",
        vec![
            ("A", write_png(&photos, "a", 40, 30), 40, 30),
            ("B", write_png(&photos, "b", 40, 30), 40, 30),
        ],
    );
    let mut frame = frame(dir.path(), source, &["vacation"]).await;

    shown_id(&frame.slideshow.tick().await);
    let outcome = frame
        .slideshow
        .dispatch(SlideshowEvent::Power(PowerState::Standby))
        .await;
    assert_eq!(outcome, TickOutcome::Parked);
    assert!(frame.slideshow.is_standby());
    assert_eq!(frame.slideshow.tick().await, TickOutcome::Parked);

    let outcome = frame
        .slideshow
        .dispatch(SlideshowEvent::Power(PowerState::Active))
        .await;
    assert_eq!(shown_id(&outcome), "B");
    let commands = frame.shown.lock().unwrap().clone();
    assert!(commands.contains(&"power off".to_string()));
    assert!(commands.contains(&"power on".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_keywords_shows_a_message() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixtureSource::new(ProviderKind::UsbPhotos);
    let mut frame = frame(dir.path(), source, &[]).await;

    let outcome = frame.slideshow.tick().await;
    assert!(matches!(outcome, TickOutcome::Message(_)), "{outcome:?}");
    assert!(frame.current.get().is_none());
}

fn shown_from<'a>(outcome: &'a TickOutcome) -> (&'a str, Option<&'a str>) {
    match outcome {
        TickOutcome::Shown(image) => (&image.id, image.provider.as_deref()),
        other => panic!("expected a photo, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_provider_falls_through_to_the_next_one() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let flaky = FixtureSource::new(ProviderKind::UsbPhotos).album(
        "a",
        vec![
            ("A1", write_png(&photos, "a1", 40, 30), 40, 30),
            ("A2", write_png(&photos, "a2", 40, 30), 40, 30),
        ],
    );
    let offline = flaky.offline_switch();
    let steady = FixtureSource::new(ProviderKind::UsbPhotos)
        .album("b", vec![("B1", write_png(&photos, "b1", 40, 30), 40, 30)]);
    let events = Arc::new(EventLog::with_capacity(100));
    let p1 = provider(dir.path(), "p1", events.clone(), flaky, &["a"]).await;
    let p2 = provider(dir.path(), "p2", events.clone(), steady, &["b"]).await;
    let mut frame = frame_with(dir.path(), events, vec![p1, p2], &[]).await;

    let outcome = frame.slideshow.tick().await;
    assert_eq!(shown_from(&outcome), ("A1", Some("p1")));

    offline.store(true, Ordering::SeqCst);
    {
        let manager = frame.manager.lock().await;
        let p1 = manager.get("p1").unwrap();
        p1.lock().await.clear_images_for("a").unwrap();
    }
    let outcome = frame.slideshow.tick().await;
    assert_eq!(shown_from(&outcome), ("B1", Some("p2")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoked_provider_is_skipped_in_the_same_tick() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let revoked = FixtureSource::new(ProviderKind::GooglePhotos)
        .album("vacation", vec![("G1", write_png(&photos, "g1", 40, 30), 40, 30)])
        .revoked();
    let healthy = FixtureSource::new(ProviderKind::UsbPhotos)
        .album("b", vec![("B1", write_png(&photos, "b1", 40, 30), 40, 30)]);
    let events = Arc::new(EventLog::with_capacity(100));
    let mut g1 = provider(dir.path(), "g1", events.clone(), revoked, &["vacation"]).await;
    g1.set_oauth_config(OAuthConfig {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        auth_uri: "https://accounts.example.com/auth".to_string(),
        token_uri: "https://accounts.example.com/token".to_string(),
    })
    .unwrap();
    g1.core()
        .state()
        .update(|s| {
            s.oauth_token = Some(OAuthToken {
                access_token: "token".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: i64::MAX / 2,
                token_type: Some("Bearer".to_string()),
                scope: None,
            })
        })
        .unwrap();
    let p2 = provider(dir.path(), "p2", events.clone(), healthy, &["b"]).await;
    let mut frame = frame_with(dir.path(), events, vec![g1, p2], &[]).await;

    let outcome = frame.slideshow.tick().await;
    assert_eq!(shown_from(&outcome), ("B1", Some("p2")));

    let manager = frame.manager.lock().await;
    let g1 = manager.get("g1").unwrap();
    assert_eq!(g1.lock().await.state(), ProviderState::NeedOAuth);
    let errors = frame
        .events
        .all()
        .into_iter()
        .filter(|e| e.unique.as_deref() == Some("provider-g1") && e.level == EventLevel::Error)
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn portrait_display_rolls_over_landscape_only_provider() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let wide = FixtureSource::new(ProviderKind::UsbPhotos).album(
        "wide",
        vec![
            ("W1", write_png(&photos, "w1", 60, 30), 60, 30),
            ("W2", write_png(&photos, "w2", 60, 30), 60, 30),
        ],
    );
    let tall = FixtureSource::new(ProviderKind::UsbPhotos)
        .album("tall", vec![("T1", write_png(&photos, "t1", 30, 60), 30, 60)]);
    let events = Arc::new(EventLog::with_capacity(100));
    let p1 = provider(dir.path(), "p1", events.clone(), wide, &["wide"]).await;
    let p2 = provider(dir.path(), "p2", events.clone(), tall, &["tall"]).await;
    let settings = [("width", "1080"), ("height", "1920"), ("force_orientation", "1")];
    let mut frame = frame_with(dir.path(), events, vec![p1, p2], &settings).await;

    let outcome = frame.slideshow.tick().await;
    assert_eq!(shown_from(&outcome), ("T1", Some("p2")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_frame_wakes_on_the_next_event() {
    let dir = tempfile::tempdir().unwrap();
    let photos = dir.path().join("photos");
    std::fs::create_dir_all(&photos).unwrap();
    let source = FixtureSource::new(ProviderKind::UsbPhotos)
        .album("later", vec![("L1", write_png(&photos, "l1", 40, 30), 40, 30)]);
    let mut frame = frame(dir.path(), source, &[]).await;

    let outcome = frame.slideshow.tick().await;
    assert!(matches!(outcome, TickOutcome::Message(_)), "{outcome:?}");
    assert!(frame.slideshow.is_idle());

    {
        let manager = frame.manager.lock().await;
        let p1 = manager.get("p1").unwrap();
        p1.lock().await.add_keyword("later").await.unwrap();
    }
    let outcome = frame.slideshow.dispatch(SlideshowEvent::Trigger).await;
    assert_eq!(shown_from(&outcome), ("L1", Some("p1")));
    assert!(!frame.slideshow.is_idle());
}
