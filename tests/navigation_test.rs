//! Navigation controller: retries, consent handling, readiness and reload.
mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use feed_harvester::core::config::NavigationSettings;
use feed_harvester::core::error::NavigationError;
use feed_harvester::diagnostics::DiagnosticsRecorder;
use feed_harvester::navigation::NavigationController;
use feed_harvester::scraping::feed_profile::FeedProfile;
use feed_harvester::{ActionOutcome, RetryPolicy};

const URL: &str = "https://feed.test/groups/1";

fn controller(debug_dir: &std::path::Path) -> NavigationController {
    let settings = NavigationSettings {
        retry: RetryPolicy::new(3, Duration::from_millis(200)),
        readiness_retry: RetryPolicy::new(3, Duration::from_millis(100)),
        consent_attempts: 2,
        consent_delay_ms: 50,
    };
    NavigationController::new(
        settings,
        FeedProfile::default(),
        DiagnosticsRecorder::new(debug_dir),
    )
}

#[tokio::test(start_paused = true)]
async fn transient_goto_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::frames(vec![frame(0..3)]).failing_goto(2);
    controller(dir.path()).navigate(&page, URL).await.unwrap();
    assert_eq!(page.goto_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_goto_reports_url_and_last_error() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::frames(vec![frame(0..3)]).failing_goto(10);
    let err = controller(dir.path()).navigate(&page, URL).await.unwrap_err();
    assert!(matches!(err, NavigationError::Failed { .. }));
    assert_eq!(err.url(), URL);
    assert_eq!(page.goto_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn closed_page_fails_without_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::frames(vec![frame(0..3)]);
    page.mark_closed();
    let err = controller(dir.path()).navigate(&page, URL).await.unwrap_err();
    assert!(matches!(err, NavigationError::PageClosed { .. }));
    assert_eq!(page.goto_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn consent_outcomes_are_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let nav = controller(dir.path());

    let page = FakePage::frames(vec![frame(0..3)]).with_consent("handled");
    assert_eq!(nav.dismiss_consent(&page).await, ActionOutcome::Handled);

    let page = FakePage::frames(vec![frame(0..3)]);
    assert_eq!(nav.dismiss_consent(&page).await, ActionOutcome::NotFound);

    let page = FakePage::frames(vec![frame(0..3)]).with_consent("failed");
    assert_eq!(nav.dismiss_consent(&page).await, ActionOutcome::Failed);
    // A failed dismissal does not fail navigation.
    nav.navigate(&page, URL).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reload_is_the_last_resort_for_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::frames(vec![frame(0..3)]).ready_only_after_reload();
    controller(dir.path()).navigate(&page, URL).await.unwrap();
    assert_eq!(page.reload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn never_ready_captures_navigation_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::frames(vec![frame(0..3)]).never_ready();
    let err = controller(dir.path()).navigate(&page, URL).await.unwrap_err();

    let summary = match err {
        NavigationError::ContentNotReady { diagnostics, .. } => diagnostics.unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(page.reload_calls.load(Ordering::SeqCst), 1);
    let name = summary.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("navigation-failed_"));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary).unwrap()).unwrap();
    assert_eq!(json["stage"], "navigation-failed");
    assert_eq!(json["snapshot"]["ready_state"], "complete");
    // The fake cannot screenshot; markup is still written.
    assert!(json["screenshot_error"].is_string());
    assert!(json["markup_file"].is_string());
}
