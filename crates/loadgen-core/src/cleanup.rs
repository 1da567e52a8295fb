//! Tracks synthetic usernames created by virtual users and deletes them
//! from the user service (and, best-effort, chat/posts) on request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TRACKED_PREFIX: &str = "user_";

/// Outcome of a bulk-deletion call: usernames actually deleted, and the
/// status code the user service returned for each that was not.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: HashMap<String, u16>,
}

pub struct CleanupTracker {
    tracked: Mutex<Vec<String>>,
    client: reqwest::Client,
    user_service_url: String,
    chat_service_url: String,
    posts_service_url: String,
}

impl CleanupTracker {
    pub fn new(user_service_url: String, chat_service_url: String, posts_service_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("building the default reqwest client is infallible");
        Self {
            tracked: Mutex::new(Vec::new()),
            client,
            user_service_url,
            chat_service_url,
            posts_service_url,
        }
    }

    /// Idempotent insert; preserves first-seen order.
    pub async fn add(&self, username: impl Into<String>) {
        let username = username.into();
        let mut tracked = self.tracked.lock().await;
        if !tracked.contains(&username) {
            tracked.push(username);
        }
    }

    pub async fn list(&self) -> Vec<String> {
        self.tracked.lock().await.clone()
    }

    /// Deletes a single tracked user. `(false, 400)` without any network
    /// I/O if `username` doesn't carry the reserved prefix.
    pub async fn delete_one(&self, username: &str, cancel: &CancellationToken) -> (bool, u16) {
        if !username.starts_with(TRACKED_PREFIX) {
            return (false, 400);
        }

        let status = self.delete_user_request(username, cancel).await;
        match status {
            Some(code) if code == 200 || code == 204 => {
                let mut tracked = self.tracked.lock().await;
                tracked.retain(|u| u != username);
                (true, code)
            }
            Some(code) => (false, code),
            None => (false, 0),
        }
    }

    /// Selects `min(n, |tracked|)` usernames uniformly at random, deletes
    /// them sequentially, then best-effort-cascades to chat/posts.
    pub async fn reduce_load(&self, n: usize, cancel: &CancellationToken) -> DeleteOutcome {
        let candidates = {
            let tracked = self.tracked.lock().await;
            let mut copy = tracked.clone();
            copy.shuffle(&mut rand::thread_rng());
            copy.truncate(n);
            copy
        };
        self.delete_selected(candidates, cancel).await
    }

    /// Queries the dashboard for candidate usernames, falling back to the
    /// tracked list (filtered by prefix) if the dashboard is unreachable
    /// or returns nothing usable.
    pub async fn delete_test_users(&self, count: usize, cancel: &CancellationToken) -> DeleteOutcome {
        let mut candidates = self.dashboard_candidates(cancel).await;
        if candidates.is_empty() {
            candidates = self.list().await;
        }
        dedup_prefixed(&mut candidates);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        self.delete_selected(candidates, cancel).await
    }

    /// Same candidate selection as `delete_test_users`, but deletions run
    /// through a semaphore-bounded pool. Once `cancel` fires, no new
    /// deletion is launched; in-flight ones run to completion or timeout.
    pub async fn delete_concurrent(
        &self,
        count: usize,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> DeleteOutcome {
        let mut candidates = self.dashboard_candidates(&cancel).await;
        if candidates.is_empty() {
            candidates = self.list().await;
        }
        dedup_prefixed(&mut candidates);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);

        let permits = concurrency.min(candidates.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let outcome = Arc::new(Mutex::new(DeleteOutcome::default()));
        let mut set = tokio::task::JoinSet::new();

        for username in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let semaphore = semaphore.clone();
            let outcome = outcome.clone();
            let cancel = cancel.clone();
            let client = self.client.clone();
            let url = format!("{}/api/users/{}", self.user_service_url, username);
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let status = send_delete(&client, &url, &cancel).await;
                let mut outcome = outcome.lock().await;
                match status {
                    Some(code) if code == 200 || code == 204 => outcome.deleted.push(username),
                    Some(code) => {
                        outcome.failed.insert(username, code);
                    }
                    None => {
                        outcome.failed.insert(username, 0);
                    }
                }
            });
        }

        while set.join_next().await.is_some() {}

        let outcome = Arc::try_unwrap(outcome)
            .map(|m| m.into_inner())
            .unwrap_or_default();
        self.prune_deleted(&outcome.deleted).await;
        self.cascade_delete(&outcome.deleted, &cancel).await;
        outcome
    }

    async fn delete_selected(&self, candidates: Vec<String>, cancel: &CancellationToken) -> DeleteOutcome {
        let mut outcome = DeleteOutcome::default();
        for username in &candidates {
            if cancel.is_cancelled() {
                break;
            }
            match self.delete_user_request(username, cancel).await {
                Some(code) if code == 200 || code == 204 => outcome.deleted.push(username.clone()),
                Some(code) => {
                    outcome.failed.insert(username.clone(), code);
                }
                None => {
                    outcome.failed.insert(username.clone(), 0);
                }
            }
        }
        self.prune_deleted(&outcome.deleted).await;
        self.cascade_delete(&outcome.deleted, cancel).await;
        outcome
    }

    async fn prune_deleted(&self, deleted: &[String]) {
        if deleted.is_empty() {
            return;
        }
        let mut tracked = self.tracked.lock().await;
        tracked.retain(|u| !deleted.contains(u));
    }

    async fn delete_user_request(&self, username: &str, cancel: &CancellationToken) -> Option<u16> {
        let url = format!("{}/api/users/{}", self.user_service_url, username);
        send_delete(&self.client, &url, cancel).await
    }

    async fn dashboard_candidates(&self, cancel: &CancellationToken) -> Vec<String> {
        let url = format!("{}/api/users/dashboard", self.user_service_url);
        let fut = self.client.get(&url).send();
        let response = tokio::select! {
            res = fut => res,
            _ = cancel.cancelled() => return Vec::new(),
        };
        let Ok(response) = response else {
            return Vec::new();
        };
        let Ok(body) = response.json::<Value>().await else {
            return Vec::new();
        };
        let Some(users) = body.get("users").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        users
            .iter()
            .filter_map(extract_username)
            .filter(|u| u.starts_with(TRACKED_PREFIX))
            .collect()
    }

    /// Best-effort deletion of a deleted user's chat messages and posts.
    /// Any failure here is swallowed -- it never surfaces to the caller.
    async fn cascade_delete(&self, deleted_usernames: &[String], cancel: &CancellationToken) {
        if deleted_usernames.is_empty() {
            return;
        }
        self.cascade_one(
            &format!("{}/api/messages", self.chat_service_url),
            &self.chat_service_url,
            "api/messages",
            deleted_usernames,
            cancel,
        )
        .await;
        self.cascade_one(
            &format!("{}/api/posts", self.posts_service_url),
            &self.posts_service_url,
            "api/posts",
            deleted_usernames,
            cancel,
        )
        .await;
    }

    async fn cascade_one(
        &self,
        list_url: &str,
        base_url: &str,
        path: &str,
        deleted_usernames: &[String],
        cancel: &CancellationToken,
    ) {
        let fut = self.client.get(list_url).send();
        let response = tokio::select! {
            res = fut => res,
            _ = cancel.cancelled() => return,
        };
        let Ok(response) = response else {
            debug!("cascade delete: {list_url} unreachable, skipping");
            return;
        };
        let Ok(items) = response.json::<Vec<Value>>().await else {
            return;
        };
        for item in items {
            let Some(username) = item.get("username").and_then(|v| v.as_str()) else {
                continue;
            };
            if !deleted_usernames.iter().any(|u| u == username) {
                continue;
            }
            let Some(id) = item.get("id").and_then(id_as_string) else {
                continue;
            };
            let url = format!("{base_url}/{path}/{id}");
            if self.client.delete(&url).send().await.is_err() {
                debug!("cascade delete of {url} failed, swallowing");
            }
        }
    }
}

fn id_as_string(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        Some(s.to_string())
    } else {
        value.as_i64().map(|n| n.to_string())
    }
}

#[derive(Deserialize)]
struct DashboardUserObject {
    username: String,
}

fn extract_username(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    serde_json::from_value::<DashboardUserObject>(value.clone())
        .ok()
        .map(|u| u.username)
}

fn dedup_prefixed(candidates: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|u| u.starts_with(TRACKED_PREFIX) && seen.insert(u.clone()));
}

async fn send_delete(client: &reqwest::Client, url: &str, cancel: &CancellationToken) -> Option<u16> {
    let fut = client.delete(url).send();
    let response = tokio::select! {
        res = fut => res,
        _ = cancel.cancelled() => return None,
    };
    response.ok().map(|r| r.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CleanupTracker {
        CleanupTracker::new(
            "http://localhost:1".to_string(),
            "http://localhost:2".to_string(),
            "http://localhost:3".to_string(),
        )
    }

    #[tokio::test]
    async fn add_is_idempotent_and_preserves_order() {
        let tracker = tracker();
        tracker.add("user_1").await;
        tracker.add("user_2").await;
        tracker.add("user_1").await;
        assert_eq!(tracker.list().await, vec!["user_1", "user_2"]);
    }

    #[tokio::test]
    async fn delete_one_rejects_unprefixed_username_without_io() {
        let tracker = tracker();
        let cancel = CancellationToken::new();
        let (ok, status) = tracker.delete_one("bob", &cancel).await;
        assert!(!ok);
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn reduce_load_zero_is_a_noop() {
        let tracker = tracker();
        tracker.add("user_1").await;
        let cancel = CancellationToken::new();
        let outcome = tracker.reduce_load(0, &cancel).await;
        assert!(outcome.deleted.is_empty());
        assert!(outcome.failed.is_empty());
        assert_eq!(tracker.list().await, vec!["user_1"]);
    }

    #[test]
    fn dedup_prefixed_drops_wrong_prefix_and_duplicates() {
        let mut candidates = vec![
            "user_1".to_string(),
            "bob".to_string(),
            "user_1".to_string(),
            "user_2".to_string(),
        ];
        dedup_prefixed(&mut candidates);
        assert_eq!(candidates, vec!["user_1", "user_2"]);
    }

    #[test]
    fn extract_username_handles_strings_and_objects() {
        let as_string = Value::String("user_9".to_string());
        assert_eq!(extract_username(&as_string), Some("user_9".to_string()));

        let as_object = serde_json::json!({ "username": "user_8", "id": 1 });
        assert_eq!(extract_username(&as_object), Some("user_8".to_string()));

        let malformed = serde_json::json!({ "id": 1 });
        assert_eq!(extract_username(&malformed), None);
    }
}
