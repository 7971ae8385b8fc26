mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use photoframe_svc::event_log::{EventLevel, EventLog};
use photoframe_svc::oauth::{OAuthConfig, OAuthToken};
use photoframe_svc::photo::{Dimensions, hash_text};
use photoframe_svc::providers::{FetchRequest, ProviderKind, ProviderState};

use common::{FixtureSource, provider, write_png};

fn mimes() -> Vec<String> {
    vec!["image/png".to_string(), "image/jpeg".to_string()]
}

#[tokio::test]
async fn removing_a_keyword_drops_its_memory_and_count() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "a", 40, 30);
    let source = FixtureSource::new(ProviderKind::UsbPhotos).album("vacation", vec![("a", a, 40, 30)]);
    let events = Arc::new(EventLog::with_capacity(100));
    let mut p = provider(dir.path(), "p1", events, source, &["vacation"]).await;

    assert_eq!(p.update_state().await, ProviderState::Ready);
    let dest = dir.path().join("download");
    let mimes = mimes();
    let req = FetchRequest {
        dest: &dest,
        supported_mimes: &mimes,
        display: Dimensions::new(800, 600),
        randomize: false,
        force_orientation: false,
        cache: None,
    };
    let item = p.prepare_next_item(&req).await;
    assert_eq!(item.error, None);
    p.core_mut().memory_mut().flush().unwrap();

    let memory_file = p.core_mut().memory_mut().file_for_keyword("vacation");
    assert!(memory_file.exists());
    assert!(p.core().state().read(|s| s.counts.contains_key("vacation")));

    assert!(p.remove_keyword(0).unwrap());
    assert!(!memory_file.exists());
    p.core().state().read(|s| {
        assert!(!s.counts.contains_key("vacation"));
        assert!(!s.deadlines.contains_key("vacation"));
        assert!(s.keywords.is_empty());
    });
    let snapshot = p
        .core()
        .dir()
        .join("private")
        .join(format!("{}.json", hash_text("vacation")));
    assert!(!snapshot.exists());
}

#[tokio::test]
async fn clearing_images_forces_a_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "a", 40, 30);
    let source = FixtureSource::new(ProviderKind::UsbPhotos).album("vacation", vec![("a", a, 40, 30)]);
    let scans = source.scan_counter();
    let events = Arc::new(EventLog::with_capacity(100));
    let mut p = provider(dir.path(), "p1", events, source, &["vacation"]).await;

    assert_eq!(p.images_total().await, 1);
    assert_eq!(p.images_total().await, 1);
    assert_eq!(scans.load(Ordering::SeqCst), 1, "snapshot is reused before its deadline");

    p.clear_images_for("vacation").unwrap();
    assert_eq!(p.images_total().await, 1);
    assert_eq!(scans.load(Ordering::SeqCst), 2);
    let deadline = p.core().state().read(|s| s.deadlines["vacation"]);
    assert!(deadline > 0, "rescan sets a fresh deadline");
}

#[tokio::test]
async fn orientation_filter_skips_mismatched_photos() {
    let dir = tempfile::tempdir().unwrap();
    let wide1 = write_png(dir.path(), "wide1", 60, 30);
    let wide2 = write_png(dir.path(), "wide2", 60, 30);
    let tall = write_png(dir.path(), "tall", 30, 60);
    let source = FixtureSource::new(ProviderKind::UsbPhotos)
        .album("mixed", vec![("wide1", wide1.clone(), 60, 30), ("tall", tall, 30, 60)])
        .album("landscapes", vec![("wide2", wide2, 60, 30)]);
    let events = Arc::new(EventLog::with_capacity(100));
    let mut p = provider(dir.path(), "p1", events, source, &["mixed"]).await;

    let dest = dir.path().join("download");
    let mimes = mimes();
    let req = FetchRequest {
        dest: &dest,
        supported_mimes: &mimes,
        display: Dimensions::new(1080, 1920),
        randomize: false,
        force_orientation: true,
        cache: None,
    };
    let item = p.prepare_next_item(&req).await;
    assert_eq!(item.error, None);
    assert_eq!(item.id, "tall");

    assert!(p.remove_keyword(0).unwrap());
    p.add_keyword("landscapes").await.unwrap();
    let item = p.prepare_next_item(&req).await;
    assert!(item.is_error(), "only landscape candidates are left");
    p.core().state().read(|s| {
        assert_eq!(s.keyword_index, 0);
        assert_eq!(s.image_index, 0);
    });
}

#[tokio::test]
async fn revoked_grant_requires_relinking_and_logs_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "a", 40, 30);
    let source = FixtureSource::new(ProviderKind::GooglePhotos)
        .album("vacation", vec![("a", a, 40, 30)])
        .revoked();
    let events = Arc::new(EventLog::with_capacity(100));
    let mut p = provider(dir.path(), "g1", events.clone(), source, &["vacation"]).await;

    assert_eq!(p.update_state().await, ProviderState::NeedOAuth);
    p.set_oauth_config(OAuthConfig {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        auth_uri: "https://accounts.example.com/auth".to_string(),
        token_uri: "https://accounts.example.com/token".to_string(),
    })
    .unwrap();
    p.core()
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
    assert_eq!(p.update_state().await, ProviderState::Ready);

    let dest = dir.path().join("download");
    let mimes = mimes();
    let req = FetchRequest {
        dest: &dest,
        supported_mimes: &mimes,
        display: Dimensions::new(800, 600),
        randomize: false,
        force_orientation: false,
        cache: None,
    };
    let item = p.prepare_next_item(&req).await;
    assert!(item.is_error());
    assert_eq!(p.state(), ProviderState::NeedOAuth);
    assert_eq!(p.update_state().await, ProviderState::NeedOAuth);
    assert!(!p.core().has_oauth_token());

    let logged: Vec<_> = events
        .all()
        .into_iter()
        .filter(|e| e.unique.as_deref() == Some("provider-g1"))
        .collect();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].level, EventLevel::Error);
}
