use axum::{extract::State, Json};
use herald_lifecycle::ShutdownStatus;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with runner and shutdown summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let schedules = match state.store.list() {
        Ok(all) => json!({
            "total": all.len(),
            "enabled": all.iter().filter(|s| s.enabled).count(),
        }),
        Err(e) => {
            tracing::warn!("health: schedule listing failed: {e}");
            Value::Null
        }
    };
    let shutdown = state.shutdown.get_status();
    Json(json!({
        "status": if shutdown.requested { "shutting_down" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": env!("HERALD_GIT_SHA"),
        "started_at": herald_core::time::to_persisted(state.started_at),
        "in_flight": state.lifecycle.in_flight_count(),
        "schedules": schedules,
        "shutdown_phase": shutdown.phase,
    }))
}

/// GET /shutdown/status: full shutdown manager snapshot.
pub async fn shutdown_status_handler(State(state): State<Arc<AppState>>) -> Json<ShutdownStatus> {
    Json(state.shutdown.get_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, extract::Request, http::StatusCode};
    use herald_core::config::HeraldConfig;
    use herald_lifecycle::{ShutdownManager, ShutdownOptions};
    use herald_scheduler::{MemoryScheduleStore, NewSchedule, ScheduleStore};
    use tower::ServiceExt;

    use crate::{app::build_router, http::lifecycle::ServerLifecycle};

    fn state() -> Arc<AppState> {
        let config = HeraldConfig::default();
        let shutdown = Arc::new(ShutdownManager::with_exit_hook(
            ShutdownOptions::default(),
            Arc::new(|_| {}),
        ));
        let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
        store
            .insert(NewSchedule {
                params: json!({"topic": "rust"}),
                recurrence_rule: "FREQ=DAILY;BYHOUR=7;BYMINUTE=0".to_string(),
                ..Default::default()
            })
            .unwrap();
        let lifecycle = Arc::new(ServerLifecycle::new(shutdown.clone(), &config.gateway));
        Arc::new(AppState::new(config, shutdown, store, lifecycle))
    }

    async fn body_json(res: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_schedules_and_phase() {
        let app = build_router(state());
        let res = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["schedules"]["total"], 1);
        assert_eq!(body["shutdown_phase"], "STARTING");
        let sha = body["git_sha"].as_str().unwrap();
        assert!(!sha.is_empty());
        assert_eq!(sha, env!("HERALD_GIT_SHA"));
    }

    #[tokio::test]
    async fn shutdown_status_served_after_shutdown() {
        let state = state();
        let manager = state.shutdown.clone();
        tokio::task::spawn_blocking(move || manager.shutdown(false))
            .await
            .unwrap();

        let app = build_router(state);
        let res = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let res = app.oneshot(get("/shutdown/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["phase"], "COMPLETED");
        assert_eq!(body["completed"], true);
    }
}
