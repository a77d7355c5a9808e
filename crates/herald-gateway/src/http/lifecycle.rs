//! Request-server side of the shutdown sequence.
//!
//! Once shutdown is requested new requests get `503` with `Retry-After`.
//! Requests already inside the router are tracked until their response is
//! produced; a `WAITING_FOR_TASKS` task waits for that set to empty and a
//! `CLEANING_RESOURCES` task stops the server, exiting the process if it has
//! not stopped after a grace period.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use herald_core::config::GatewayConfig;
use herald_lifecycle::{
    ExitHook, ShutdownManager, ShutdownPhase, ShutdownTask, FORCED_EXIT_CODE,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Paths answered even while shutting down.
const ALWAYS_SERVED: &[&str] = &["/shutdown/status"];

const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct InFlight {
    pub method: Method,
    pub path: String,
    pub started: Instant,
}

pub struct ServerLifecycle {
    shutdown: Arc<ShutdownManager>,
    in_flight: DashMap<u64, InFlight>,
    next_id: AtomicU64,
    retry_after: Duration,
    drain_timeout: Duration,
    stop_grace: Duration,
    stop: CancellationToken,
    stopped: AtomicBool,
    exit_hook: ExitHook,
}

impl ServerLifecycle {
    pub fn new(shutdown: Arc<ShutdownManager>, config: &GatewayConfig) -> Self {
        Self {
            shutdown,
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
            retry_after: Duration::from_secs(config.retry_after_secs),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            exit_hook: Arc::new(|code| std::process::exit(code)),
        }
    }

    /// Replace the last-resort exit, for tests.
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.exit_hook = hook;
        self
    }

    /// Register the drain and stop tasks with the shutdown manager.
    pub fn register(self: &Arc<Self>) -> herald_lifecycle::Result<()> {
        let drain = Arc::clone(self);
        self.shutdown.register_task(
            ShutdownTask::new("http-drain", ShutdownPhase::WaitingForTasks, move || {
                drain.drain(drain.drain_timeout)
            })
            .priority(10)
            .timeout(self.drain_timeout),
        )?;

        let stop = Arc::clone(self);
        self.shutdown.register_task(
            ShutdownTask::new("http-stop", ShutdownPhase::CleaningResources, move || {
                stop.stop_server();
                Ok::<_, String>(())
            })
            .priority(10)
            .timeout(self.stop_grace + Duration::from_secs(1)),
        )
    }

    /// Token the server's graceful-shutdown future waits on.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Called once the server future has returned.
    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        self.in_flight.iter().map(|e| e.value().clone()).collect()
    }

    fn begin(self: &Arc<Self>, method: &Method, path: &str) -> RequestGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            id,
            InFlight {
                method: method.clone(),
                path: path.to_string(),
                started: Instant::now(),
            },
        );
        RequestGuard {
            lifecycle: Arc::clone(self),
            id,
        }
    }

    /// Block until no request is in flight, or `timeout` passes.
    pub fn drain(&self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.in_flight.len();
            if remaining == 0 {
                info!("all in-flight requests finished");
                return Ok(());
            }
            if Instant::now() >= deadline {
                let paths: Vec<String> = self.in_flight.iter().map(|e| e.value().path.clone()).collect();
                warn!(remaining, ?paths, "requests still in flight after drain timeout");
                return Err(format!("{remaining} request(s) still in flight"));
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    /// Cancel the server, then exit the process if it has not stopped
    /// within the grace period.
    pub fn stop_server(&self) {
        info!("stopping request server");
        self.stop.cancel();

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline {
            if self.stopped.load(Ordering::Acquire) {
                debug!("request server stopped");
                return;
            }
            thread::sleep(DRAIN_POLL);
        }
        if !self.stopped.load(Ordering::Acquire) {
            warn!(
                grace_ms = self.stop_grace.as_millis() as u64,
                "request server did not stop, forcing exit"
            );
            (self.exit_hook)(FORCED_EXIT_CODE);
        }
    }

    fn unavailable(&self) -> Response {
        let secs = self.retry_after.as_secs();
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, secs.to_string())],
            Json(json!({
                "error": "server is shutting down",
                "retry_after": secs,
            })),
        )
            .into_response()
    }
}

/// Removes its request from the in-flight set when dropped, so cancelled
/// handlers are untracked too.
struct RequestGuard {
    lifecycle: Arc<ServerLifecycle>,
    id: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle.in_flight.remove(&self.id);
    }
}

/// Middleware: refuse new requests during shutdown, track the rest.
pub async fn track_requests(
    State(lifecycle): State<Arc<ServerLifecycle>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if ALWAYS_SERVED.contains(&path.as_str()) {
        return next.run(req).await;
    }
    if lifecycle.shutdown.is_shutdown_requested() {
        debug!(%path, "request refused, shutting down");
        return lifecycle.unavailable();
    }
    let _guard = lifecycle.begin(req.method(), &path);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use herald_lifecycle::ShutdownOptions;
    use parking_lot::Mutex;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn lifecycle() -> (Arc<ShutdownManager>, Arc<ServerLifecycle>, Arc<Mutex<Vec<i32>>>) {
        let manager = Arc::new(ShutdownManager::with_exit_hook(
            ShutdownOptions::default(),
            Arc::new(|_| {}),
        ));
        let exits = Arc::new(Mutex::new(Vec::new()));
        let hook = exits.clone();
        let config = GatewayConfig {
            retry_after_secs: 30,
            stop_grace_secs: 0,
            ..GatewayConfig::default()
        };
        let lc = Arc::new(
            ServerLifecycle::new(manager.clone(), &config)
                .with_exit_hook(Arc::new(move |code| hook.lock().push(code))),
        );
        (manager, lc, exits)
    }

    fn router(lc: Arc<ServerLifecycle>, gate: Arc<Notify>) -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route(
                "/slow",
                get(move || {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        "done"
                    }
                }),
            )
            .route("/shutdown/status", get(|| async { "status" }))
            .layer(middleware::from_fn_with_state(lc, track_requests))
    }

    fn get_req(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn requests_are_untracked_after_response() {
        let (_, lc, _) = lifecycle();
        let app = router(lc.clone(), Arc::new(Notify::new()));
        let res = app.oneshot(get_req("/ping")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(lc.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn new_requests_rejected_once_shutdown_requested() {
        let (manager, lc, _) = lifecycle();
        let m = manager.clone();
        tokio::task::spawn_blocking(move || m.shutdown(false)).await.unwrap();

        let app = router(lc.clone(), Arc::new(Notify::new()));
        let res = app.clone().oneshot(get_req("/ping")).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.headers()[header::RETRY_AFTER], "30");

        let res = app.oneshot(get_req("/shutdown/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_requests() {
        let (_, lc, _) = lifecycle();
        let gate = Arc::new(Notify::new());
        let app = router(lc.clone(), gate.clone());
        let pending = tokio::spawn(app.oneshot(get_req("/slow")));

        while lc.in_flight_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(lc.in_flight()[0].path, "/slow");

        let drainer = lc.clone();
        let early = tokio::task::spawn_blocking(move || drainer.drain(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(early.is_err());

        gate.notify_one();
        let res = pending.await.unwrap().unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let drainer = lc.clone();
        let done = tokio::task::spawn_blocking(move || drainer.drain(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(done.is_ok());
    }

    #[test]
    fn stop_cancels_token_and_forces_exit_when_server_hangs() {
        let (_, lc, exits) = lifecycle();
        let token = lc.stop_token();
        lc.stop_server();
        assert!(token.is_cancelled());
        assert_eq!(*exits.lock(), vec![FORCED_EXIT_CODE]);
    }

    #[test]
    fn stop_does_not_exit_when_server_already_stopped() {
        let (_, lc, exits) = lifecycle();
        lc.mark_stopped();
        lc.stop_server();
        assert!(exits.lock().is_empty());
    }

    #[test]
    fn registers_drain_and_stop_tasks() {
        let (manager, lc, _) = lifecycle();
        lc.register().unwrap();
        let status = manager.get_status();
        let names: Vec<_> = status.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["http-drain", "http-stop"]);
        assert_eq!(status.tasks[0].phase, ShutdownPhase::WaitingForTasks);
        assert_eq!(status.tasks[1].phase, ShutdownPhase::CleaningResources);
    }
}
