//! Control plane: start/stop/status/overview/reports/reduce/delete HTTP API
//! plus the static status page, built on axum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use loadgen_core::cleanup::CleanupTracker;
use loadgen_core::config::ServiceUrls;
use loadgen_core::generator::{Generator, RunParams, RunStatus, TestReport};
use loadgen_core::metrics::MetricsRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STATUS_PAGE: &str = include_str!("../static/index.html");

const REDUCE_TIMEOUT: Duration = Duration::from_secs(30);
const CONCURRENT_DELETE_TIMEOUT: Duration = Duration::from_secs(60);
const SINGLE_DELETE_TIMEOUT: Duration = Duration::from_secs(15);
const CONCURRENT_DELETE_CONCURRENCY: usize = 10;

/// A run as tracked while it's current: enough to answer `/api/status`
/// without blocking on the generator's completion.
struct CurrentRun {
    id: u64,
    params: RunParams,
    status: RunStatus,
    start_time: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    current: Option<CurrentRun>,
    reports: Vec<TestReport>,
    next_id: u64,
}

/// Owns the cleanup tracker for the process's lifetime; each generator run
/// receives a borrowed handle (spec.md §9: cyclic ownership note).
pub struct ControlPlane {
    inner: RwLock<Inner>,
    tracker: Arc<CleanupTracker>,
    generator: Generator,
    metrics: Arc<MetricsRegistry>,
    services: ServiceUrls,
    metrics_port: u16,
    http: reqwest::Client,
    root_cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        services: ServiceUrls,
        metrics: Arc<MetricsRegistry>,
        metrics_port: u16,
        root_cancel: CancellationToken,
    ) -> Arc<Self> {
        let tracker = Arc::new(CleanupTracker::new(
            services.user.url.clone(),
            services.chat.url.clone(),
            services.posts.url.clone(),
        ));
        let generator = Generator::new(services.clone(), metrics.clone());
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            tracker,
            generator,
            metrics,
            services,
            metrics_port,
            http: reqwest::Client::new(),
            root_cancel,
        })
    }

    pub fn tracker(&self) -> Arc<CleanupTracker> {
        self.tracker.clone()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/api/start", post(start))
            .route("/api/stop", post(stop))
            .route("/api/status", get(status))
            .route("/api/overview", get(overview))
            .route("/api/reports", get(reports))
            .route("/api/reduce", post(reduce))
            .route("/api/delete-users", post(delete_users))
            .route("/api/delete-user", post(delete_user))
            .route("/metrics", get(metrics_proxy))
            .with_state(self.clone())
    }

    pub fn metrics_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_direct))
            .with_state(self.clone())
    }
}

async fn index() -> Html<&'static str> {
    Html(STATUS_PAGE)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    users: u64,
    duration: String,
    ramp: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: &'static str,
}

async fn start(State(plane): State<Arc<ControlPlane>>, Json(req): Json<StartRequest>) -> Response {
    let mut inner = plane.inner.write().await;
    if let Some(current) = inner.current.take() {
        info!(previous_id = current.id, "cancelling current run for new start");
        current.cancel.cancel();
    }

    inner.next_id += 1;
    let id = inner.next_id;
    let params = RunParams {
        users: req.users,
        duration: req.duration.clone(),
        ramp: req.ramp.clone(),
    };

    if loadgen_core::generator::parse_duration(&req.duration).is_none() {
        warn!(duration = %req.duration, "invalid duration string, run recorded as error");
        inner.current = Some(CurrentRun {
            id,
            params,
            status: RunStatus::Error,
            start_time: Utc::now(),
            cancel: CancellationToken::new(),
        });
        return Json(StartResponse { status: "started" }).into_response();
    }

    let handle = plane.generator.run(
        id,
        params.clone(),
        plane.tracker.clone(),
        &plane.root_cancel,
    );

    inner.current = Some(CurrentRun {
        id,
        params,
        status: RunStatus::Running,
        start_time: Utc::now(),
        cancel: handle.cancellation_token(),
    });
    drop(inner);

    let plane_for_task = plane.clone();
    tokio::spawn(async move {
        let report = handle.await_completion().await;
        let mut inner = plane_for_task.inner.write().await;
        if matches!(&inner.current, Some(c) if c.id == id) {
            inner.current = None;
        }
        inner.reports.push(report);
    });

    Json(StartResponse { status: "started" }).into_response()
}

#[derive(Debug, Serialize)]
struct StopResponse {
    status: &'static str,
}

async fn stop(State(plane): State<Arc<ControlPlane>>) -> Json<StopResponse> {
    let mut inner = plane.inner.write().await;
    if let Some(current) = inner.current.as_mut() {
        current.cancel.cancel();
        current.status = RunStatus::Stopped;
    }
    Json(StopResponse { status: "stopped" })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<RunParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
}

async fn status(State(plane): State<Arc<ControlPlane>>) -> Json<StatusResponse> {
    let inner = plane.inner.read().await;
    match &inner.current {
        Some(current) => Json(StatusResponse {
            id: Some(current.id),
            status: current.status.to_string(),
            params: Some(current.params.clone()),
            start_time: Some(current.start_time),
        }),
        None => Json(StatusResponse {
            id: None,
            status: "stopped".to_string(),
            params: None,
            start_time: None,
        }),
    }
}

#[derive(Debug, Serialize)]
struct OverviewResponse {
    total_users: u64,
    tracked_users: Vec<String>,
    tracked_count: usize,
    metrics: HashMap<String, u64>,
}

async fn overview(State(plane): State<Arc<ControlPlane>>) -> Json<OverviewResponse> {
    let total_users = fetch_total_users(&plane).await;
    let tracked_users = plane.tracker.list().await;
    let metrics = loadgen_core::metrics::scrape_well_known(&plane.metrics.render());
    Json(OverviewResponse {
        total_users,
        tracked_count: tracked_users.len(),
        tracked_users,
        metrics,
    })
}

async fn fetch_total_users(plane: &ControlPlane) -> u64 {
    let url = format!("{}/api/users/dashboard", plane.services.user.url);
    let Ok(response) = plane.http.get(&url).send().await else {
        return 0;
    };
    let Ok(body) = response.json::<serde_json::Value>().await else {
        return 0;
    };
    body.get("totalUsers").and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Last five reports in the order they were appended -- newest last, per
/// spec.md §4.7 (the data-model summary in §3 calls this "reverse
/// chronological"; the per-endpoint description in §4.7 is more specific
/// and wins -- see DESIGN.md).
async fn reports(State(plane): State<Arc<ControlPlane>>) -> Json<Vec<TestReport>> {
    let inner = plane.inner.read().await;
    let len = inner.reports.len();
    let start = len.saturating_sub(5);
    Json(inner.reports[start..].to_vec())
}

#[derive(Debug, Deserialize)]
struct CountRequest {
    count: usize,
}

#[derive(Debug, Serialize)]
struct ReduceResponse {
    deleted_count: usize,
    deleted_users: Vec<String>,
    failed_users: HashMap<String, u16>,
    remaining: usize,
    status: &'static str,
}

async fn reduce(
    State(plane): State<Arc<ControlPlane>>,
    Json(req): Json<CountRequest>,
) -> Json<ReduceResponse> {
    let cancel = timeout_token(REDUCE_TIMEOUT);
    let outcome = plane.tracker.delete_test_users(req.count, &cancel).await;
    let remaining = plane.tracker.list().await.len();
    Json(ReduceResponse {
        deleted_count: outcome.deleted.len(),
        deleted_users: outcome.deleted,
        failed_users: outcome.failed,
        remaining,
        status: "completed",
    })
}

#[derive(Debug, Serialize)]
struct DeleteUsersResponse {
    deleted_count: usize,
    deleted_users: Vec<String>,
    failed_users: HashMap<String, u16>,
    remaining: usize,
    status: &'static str,
}

async fn delete_users(
    State(plane): State<Arc<ControlPlane>>,
    Json(req): Json<CountRequest>,
) -> Json<DeleteUsersResponse> {
    let cancel = timeout_token(CONCURRENT_DELETE_TIMEOUT);
    let outcome = plane
        .tracker
        .delete_concurrent(req.count, CONCURRENT_DELETE_CONCURRENCY, cancel)
        .await;
    let remaining = plane.tracker.list().await.len();
    Json(DeleteUsersResponse {
        deleted_count: outcome.deleted.len(),
        deleted_users: outcome.deleted,
        failed_users: outcome.failed,
        remaining,
        status: "completed",
    })
}

#[derive(Debug, Deserialize)]
struct DeleteUserRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct DeleteUserResponse {
    deleted: bool,
    status: u16,
}

async fn delete_user(
    State(plane): State<Arc<ControlPlane>>,
    Json(req): Json<DeleteUserRequest>,
) -> Json<DeleteUserResponse> {
    let cancel = timeout_token(SINGLE_DELETE_TIMEOUT);
    let (deleted, status) = plane.tracker.delete_one(&req.username, &cancel).await;
    Json(DeleteUserResponse { deleted, status })
}

/// Reverse-proxies the dedicated metrics server -- the control plane and
/// metrics endpoints are bound to different ports per spec.md §6.
async fn metrics_proxy(State(plane): State<Arc<ControlPlane>>) -> Response {
    let url = format!("http://127.0.0.1:{}/metrics", plane.metrics_port);
    match plane.http.get(&url).send().await {
        Ok(response) => {
            let body = response.text().await.unwrap_or_default();
            ([("content-type", "text/plain; version=0.0.4")], body).into_response()
        }
        Err(e) => {
            warn!("metrics proxy failed: {e}");
            (StatusCode::BAD_GATEWAY, "metrics unreachable").into_response()
        }
    }
}

async fn metrics_direct(State(plane): State<Arc<ControlPlane>>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        plane.metrics.render(),
    )
        .into_response()
}

/// A cancellation token that fires on its own after `duration` -- the
/// bounded-deadline pattern deletion endpoints use instead of the run
/// context, since they must work independently of any active test.
fn timeout_token(duration: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        child.cancel();
    });
    token
}
