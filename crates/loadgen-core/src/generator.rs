//! Owns one test run: ramp pacing, fan-out of virtual users, and
//! cancellation-driven report synthesis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cleanup::CleanupTracker;
use crate::config::ServiceUrls;
use crate::metrics::MetricsRegistry;
use crate::virtual_user::VirtualUser;

/// Terminal status of a run, as recorded in a [`TestReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
    Completed,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Parameters a start request supplies; carried verbatim into the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    pub users: u64,
    pub duration: String,
    pub ramp: String,
}

/// A finished (or forcibly stopped) run: parameters, timing, terminal
/// status, a metrics snapshot, and a frozen copy -- not a reference -- of
/// the tracked-user list at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub id: u64,
    pub params: RunParams,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub metrics: std::collections::HashMap<String, u64>,
    pub tracked_users: Vec<String>,
}

/// Parses `<rate>/s`. Anything that doesn't parse as a non-negative
/// integer before the `/` is treated as 0 (fire-at-once), per spec.md §4.6.
pub fn parse_ramp_rate(ramp: &str) -> u64 {
    ramp.split('/')
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Parses a duration string like `30s`, `5m`, `1h`. `None` on anything that
/// doesn't look like `<digits><s|m|h>` -- a configuration error per
/// spec.md §7, which the caller turns into an `error` run with no report.
pub fn parse_duration(duration: &str) -> Option<Duration> {
    let duration = duration.trim();
    let split_at = duration.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = duration.split_at(split_at);
    let num: u64 = num.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        _ => None,
    }
}

/// A handle to a running test: cancellable early, or awaitable to
/// completion for its final report.
pub struct GeneratorHandle {
    cancel: CancellationToken,
    completion: tokio::task::JoinHandle<TestReport>,
}

impl GeneratorHandle {
    /// Cancels this run's own context. A sibling run's context is a
    /// separate child of the process token, so this never reaches it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of this run's cancellation token, for callers (the control
    /// plane) that need to cancel it later without holding the handle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn await_completion(self) -> TestReport {
        match self.completion.await {
            Ok(report) => report,
            Err(e) => {
                warn!("generator task panicked: {e}");
                error_report()
            }
        }
    }
}

fn error_report() -> TestReport {
    TestReport {
        id: 0,
        params: RunParams {
            users: 0,
            duration: String::new(),
            ramp: String::new(),
        },
        start_time: Utc::now(),
        end_time: Utc::now(),
        status: RunStatus::Error,
        metrics: std::collections::HashMap::new(),
        tracked_users: Vec::new(),
    }
}

#[derive(Clone)]
pub struct Generator {
    services: ServiceUrls,
    metrics: Arc<MetricsRegistry>,
}

impl Generator {
    pub fn new(services: ServiceUrls, metrics: Arc<MetricsRegistry>) -> Self {
        Self { services, metrics }
    }

    /// Starts a run in the background and returns a handle immediately.
    /// Derives a run context by attaching a `duration`-bounded deadline to
    /// `parent` -- an independent child token, per spec.md §5: "a
    /// replacement test's context is independent".
    pub fn run(
        &self,
        id: u64,
        params: RunParams,
        tracker: Arc<CleanupTracker>,
        parent: &CancellationToken,
    ) -> GeneratorHandle {
        let cancel = parent.child_token();
        let n = params.users;
        let rate = parse_ramp_rate(&params.ramp);
        let duration = parse_duration(&params.duration).unwrap_or(Duration::from_secs(30));
        let services = self.services.clone();
        let metrics = self.metrics.clone();
        let start_time = Utc::now();
        let report_params = params;

        // Both natural duration-expiry and an explicit stop cancel the same
        // token, so `run_cancel.is_cancelled()` alone can't tell them apart
        // once the run has ended -- this flag is set only on the expiry
        // path, before the cancel that the user loops observe.
        let expired = Arc::new(AtomicBool::new(false));

        let deadline_cancel = cancel.clone();
        let deadline_expired = expired.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    deadline_expired.store(true, Ordering::SeqCst);
                    deadline_cancel.cancel();
                }
                _ = deadline_cancel.cancelled() => {}
            }
        });

        let run_cancel = cancel.clone();
        let completion = tokio::spawn(async move {
            info!(users = n, rate, ?duration, "starting run {id}");

            let (slot_tx, slot_rx) = mpsc::channel::<u64>(n.max(1) as usize);
            let slot_rx = Arc::new(Mutex::new(slot_rx));

            let mut user_tasks = tokio::task::JoinSet::new();
            for _ in 0..n {
                let slot_rx = slot_rx.clone();
                let services = services.clone();
                let metrics = metrics.clone();
                let tracker = tracker.clone();
                let cancel = run_cancel.clone();
                user_tasks.spawn(async move {
                    let slot_id = {
                        let mut rx = slot_rx.lock().await;
                        tokio::select! {
                            v = rx.recv() => v,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(slot_id) = slot_id else { return };
                    let user = VirtualUser::new(slot_id, services, metrics);
                    user.run(tracker, cancel).await;
                });
            }

            let pacer_cancel = run_cancel.clone();
            let pacer = tokio::spawn(async move {
                if rate == 0 {
                    for i in 0..n {
                        if slot_tx.send(i).await.is_err() {
                            break;
                        }
                    }
                    return;
                }
                let period = Duration::from_secs_f64(1.0 / rate as f64);
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // first tick fires immediately
                for i in 0..n {
                    tokio::select! {
                        _ = interval.tick() => {
                            if slot_tx.send(i).await.is_err() {
                                break;
                            }
                        }
                        _ = pacer_cancel.cancelled() => break,
                    }
                }
            });

            while user_tasks.join_next().await.is_some() {}
            pacer.abort();

            let status = if expired.load(Ordering::SeqCst) {
                RunStatus::Completed
            } else if run_cancel.is_cancelled() {
                RunStatus::Stopped
            } else {
                RunStatus::Completed
            };

            let metrics_snapshot = crate::metrics::scrape_well_known(&metrics.render());

            TestReport {
                id,
                params: report_params,
                start_time,
                end_time: Utc::now(),
                status,
                metrics: metrics_snapshot,
                tracked_users: tracker.list().await,
            }
        });

        GeneratorHandle { cancel, completion }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_rate_parses_leading_integer() {
        assert_eq!(parse_ramp_rate("5/s"), 5);
        assert_eq!(parse_ramp_rate("0/s"), 0);
    }

    #[test]
    fn ramp_rate_defaults_to_zero_on_garbage() {
        assert_eq!(parse_ramp_rate("fast"), 0);
        assert_eq!(parse_ramp_rate(""), 0);
        assert_eq!(parse_ramp_rate("-3/s"), 0);
    }

    #[test]
    fn duration_parses_seconds_minutes_hours() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn duration_rejects_unknown_suffix() {
        assert_eq!(parse_duration("30x"), None);
        assert_eq!(parse_duration("abc"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ramp_reaches_target_user_count() {
        let tracker = Arc::new(CleanupTracker::new(
            "http://localhost:1".to_string(),
            "http://localhost:2".to_string(),
            "http://localhost:3".to_string(),
        ));
        let metrics = Arc::new(MetricsRegistry::new());
        let generator = Generator::new(ServiceUrls::default(), metrics.clone());
        let parent = CancellationToken::new();

        let handle = generator.run(
            1,
            RunParams {
                users: 3,
                duration: "1s".to_string(),
                ramp: "0/s".to_string(),
            },
            tracker.clone(),
            &parent,
        );

        let report = handle.await_completion().await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.tracked_users.len(), 3);
        assert!(report.tracked_users.contains(&"user_0".to_string()));
        assert!(report.tracked_users.contains(&"user_1".to_string()));
        assert!(report.tracked_users.contains(&"user_2".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_the_handle_marks_the_run_stopped() {
        let tracker = Arc::new(CleanupTracker::new(
            "http://localhost:1".to_string(),
            "http://localhost:2".to_string(),
            "http://localhost:3".to_string(),
        ));
        let metrics = Arc::new(MetricsRegistry::new());
        let generator = Generator::new(ServiceUrls::default(), metrics);
        let parent = CancellationToken::new();

        let handle = generator.run(
            2,
            RunParams {
                users: 1,
                duration: "30s".to_string(),
                ramp: "0/s".to_string(),
            },
            tracker,
            &parent,
        );
        handle.cancel();
        let report = handle.await_completion().await;
        assert_eq!(report.status, RunStatus::Stopped);
    }
}
