//! Minimal status/control surface stub (spec.md §1/§6: the full HTTP/JSON
//! control surface and dashboard are out of scope for the core, but the
//! core must remain exercisable end-to-end). Grounded in the teacher's
//! `server.rs` `axum::Router` + `tokio::net::TcpListener::bind` +
//! `axum::serve` shape, trimmed from a static file server down to two
//! read-only JSON endpoints standing in for the real control surface.

use crate::model::{Task, TaskId};
use crate::scheduler::Scheduler;
use crate::Runtime;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
    scheduler: Arc<Scheduler>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct TaskSummary {
    id: TaskId,
    name: String,
    kind: &'static str,
    enabled: bool,
    cron: String,
    status: crate::model::TaskStatus,
}

#[derive(Serialize)]
struct StatusResponse {
    queued: usize,
    running: Vec<TaskId>,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let summaries: Vec<TaskSummary> = state
        .runtime
        .task_store
        .list()
        .into_iter()
        .map(|t| {
            let id = t.id().to_string();
            let status = state.runtime.runtime_state.snapshot(&id).status;
            TaskSummary {
                name: t.name().to_string(),
                kind: match &t {
                    Task::Sync(_) => "sync",
                    Task::Strm(_) => "strm",
                },
                enabled: t.enabled(),
                cron: t.cron().to_string(),
                id,
                status,
            }
        })
        .collect();
    Json(summaries)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        queued: state.scheduler.queue_len(),
        running: state.scheduler.running_ids(),
    })
}

fn router(runtime: Arc<Runtime>, scheduler: Arc<Scheduler>) -> Router {
    let state = AppState { runtime, scheduler };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/tasks", get(list_tasks))
        .route("/api/status", get(status))
        .with_state(state)
}

/// Binds the status stub to `addr` and serves until the runtime's
/// cancellation token fires. Errors (e.g. the port already in use) are
/// not fatal to the scheduler; the caller logs and continues without the
/// stub rather than taking the whole process down (out-of-scope surface
/// per spec.md §1).
pub async fn serve(runtime: Arc<Runtime>, scheduler: Arc<Scheduler>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(runtime.clone(), scheduler);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            runtime.cancellation.cancelled().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeletePolicy, RuleFlags, SizeFilter, SuffixFilter, SyncTask};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn sample_task(id: &str) -> Task {
        Task::Sync(SyncTask {
            id: id.to_string(),
            name: "T1".into(),
            source_path: "/src".into(),
            target_path: "/dst".into(),
            cron: "*/5 * * * *".into(),
            thread_cap: 1,
            is_slow_storage: false,
            rules: RuleFlags {
                rule_not_exists: true,
                ..Default::default()
            },
            size_filter: SizeFilter::default(),
            suffix_filter: SuffixFilter::default(),
            delete_policy: DeletePolicy::default(),
            enabled: true,
            last_run: None,
            next_run: None,
        })
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(Runtime::init_for_test(dir.path()).unwrap());
        let scheduler = Scheduler::new(runtime.clone());
        let app = router(runtime, scheduler);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_tasks_lists_stored_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(Runtime::init_for_test(dir.path()).unwrap());
        runtime.task_store.upsert(sample_task("t1")).unwrap();
        let scheduler = Scheduler::new(runtime.clone());
        let app = router(runtime, scheduler);

        let response = app
            .oneshot(Request::builder().uri("/api/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
