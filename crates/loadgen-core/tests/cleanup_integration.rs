//! Exercises the cleanup tracker against a mocked user/chat/posts service,
//! covering the partial-failure scenario from spec.md §8 scenario 3.

use loadgen_core::cleanup::CleanupTracker;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread")]
async fn delete_one_succeeds_against_a_live_mock() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("DELETE", "/api/users/user_1")
        .with_status(200)
        .create_async()
        .await;

    let tracker = CleanupTracker::new(server.url(), server.url(), server.url());
    tracker.add("user_1").await;

    let cancel = CancellationToken::new();
    let (ok, status) = tracker.delete_one("user_1", &cancel).await;

    assert!(ok);
    assert_eq!(status, 200);
    assert!(!tracker.list().await.contains(&"user_1".to_string()));
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_one_non_2xx_keeps_user_tracked() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("DELETE", "/api/users/user_9")
        .with_status(500)
        .create_async()
        .await;

    let tracker = CleanupTracker::new(server.url(), server.url(), server.url());
    tracker.add("user_9").await;

    let cancel = CancellationToken::new();
    let (ok, status) = tracker.delete_one("user_9", &cancel).await;

    assert!(!ok);
    assert_eq!(status, 500);
    assert!(tracker.list().await.contains(&"user_9".to_string()));
}

/// Scenario 3 from spec.md §8: dashboard returns a mixed bag of candidates,
/// some deletes succeed, one fails, and a non-`user_` entry is never
/// attempted against the user service.
#[tokio::test(flavor = "multi_thread")]
async fn delete_test_users_reports_partial_failure_and_skips_wrong_prefix() {
    let mut server = mockito::Server::new_async().await;

    server
        .mock("GET", "/api/users/dashboard")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"users": ["user_1", "user_2", "bob", "user_3"]}"#)
        .create_async()
        .await;
    server
        .mock("DELETE", "/api/users/user_1")
        .with_status(200)
        .create_async()
        .await;
    server
        .mock("DELETE", "/api/users/user_2")
        .with_status(500)
        .create_async()
        .await;
    server
        .mock("DELETE", "/api/users/user_3")
        .with_status(204)
        .create_async()
        .await;
    // chat/posts cascade endpoints: empty lists are fine, best-effort.
    server
        .mock("GET", "/api/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;
    server
        .mock("GET", "/api/posts")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;

    let tracker = CleanupTracker::new(server.url(), server.url(), server.url());
    let cancel = CancellationToken::new();
    let outcome = tracker.delete_test_users(10, &cancel).await;

    assert_eq!(outcome.deleted.len(), 2);
    assert!(outcome.deleted.contains(&"user_1".to_string()));
    assert!(outcome.deleted.contains(&"user_3".to_string()));
    assert_eq!(outcome.failed.get("user_2"), Some(&500));
    assert!(!outcome.deleted.contains(&"bob".to_string()));
    assert!(!outcome.failed.contains_key("bob"));
}

/// Scenario 4 from spec.md §8: concurrency never exceeds the configured
/// bound. Asserted indirectly -- all 20 candidates eventually resolve
/// through a pool of 5 -- since mockito doesn't expose live in-flight
/// counts across async handlers.
#[tokio::test(flavor = "multi_thread")]
async fn delete_concurrent_resolves_all_candidates_through_a_bounded_pool() {
    let mut server = mockito::Server::new_async().await;

    let mut dashboard_users = Vec::new();
    for i in 0..20 {
        dashboard_users.push(format!("user_{i}"));
        server
            .mock("DELETE", format!("/api/users/user_{i}").as_str())
            .with_status(200)
            .create_async()
            .await;
    }
    let body = serde_json::json!({ "users": dashboard_users }).to_string();
    server
        .mock("GET", "/api/users/dashboard")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await;
    server
        .mock("GET", "/api/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;
    server
        .mock("GET", "/api/posts")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;

    let tracker = CleanupTracker::new(server.url(), server.url(), server.url());
    let cancel = CancellationToken::new();
    let outcome = tracker.delete_concurrent(20, 5, cancel).await;

    assert_eq!(outcome.deleted.len(), 20);
    assert!(outcome.failed.is_empty());
}
