//! Diagnostic endpoints served on the instrumentation listener.
//!
//! - `GET /debug/status`: identity and listener state of this process, as JSON
//! - `GET /healthz`: liveness, always `ok`
//! - `GET /metrics`: Prometheus exposition, when a handle is mounted

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use uuid::Uuid;

use crate::reload::Reloader;

/// What a process reports about itself.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub instance_id: Uuid,
    pub pid: u32,
    pub started: Instant,
}

impl ProcessInfo {
    /// Identity of the current process with a fresh instance id.
    pub fn current(name: impl Into<String>, version: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            revision: revision.into(),
            instance_id: Uuid::new_v4(),
            pid: std::process::id(),
            started: Instant::now(),
        }
    }
}

#[derive(Clone)]
struct DiagnosticState {
    info: Arc<ProcessInfo>,
    reloader: Arc<Reloader>,
}

/// Body of `GET /debug/status`.
#[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
pub struct StatusReport {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub instance_id: Uuid,
    pub pid: u32,
    pub uptime_secs: u64,
    pub inherited: bool,
    pub state: String,
    pub listeners: Vec<String>,
}

async fn get_status(State(state): State<DiagnosticState>) -> Json<StatusReport> {
    let info = &state.info;
    Json(StatusReport {
        name: info.name.clone(),
        version: info.version.clone(),
        revision: info.revision.clone(),
        instance_id: info.instance_id,
        pid: info.pid,
        uptime_secs: info.started.elapsed().as_secs(),
        inherited: state.reloader.is_inherited(),
        state: state.reloader.state().to_string(),
        listeners: state
            .reloader
            .listener_keys()
            .iter()
            .map(ToString::to_string)
            .collect(),
    })
}

async fn get_healthz() -> &'static str {
    "ok"
}

/// Router for `/debug/status` and `/healthz`.
pub fn diagnostic_router(info: Arc<ProcessInfo>, reloader: Arc<Reloader>) -> Router {
    Router::new()
        .route("/debug/status", get(get_status))
        .route("/healthz", get(get_healthz))
        .with_state(DiagnosticState { info, reloader })
}

/// Router for `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || std::future::ready(handle.render())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        let info = Arc::new(ProcessInfo::current("baton", "1.2.3", "abc123"));
        diagnostic_router(info, Arc::new(Reloader::disabled()))
    }

    async fn body_of(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn status_reports_identity() {
        let response = router()
            .oneshot(Request::get("/debug/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report: StatusReport = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(report.name, "baton");
        assert_eq!(report.version, "1.2.3");
        assert_eq!(report.revision, "abc123");
        assert_eq!(report.pid, std::process::id());
        assert!(!report.inherited);
        assert_eq!(report.state, "serving");
        assert!(report.listeners.is_empty());
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let response = router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, b"ok");
    }

    #[tokio::test]
    async fn metrics_are_rendered() {
        let (recorder, handle) = crate::observability::metrics::prometheus_recorder("baton");
        metrics::with_local_recorder(&recorder, || metrics::gauge!("actors_running").set(5.0));

        let response = metrics_router(handle)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = String::from_utf8(body_of(response).await).unwrap();
        assert!(body.contains("baton_actors_running 5"));
    }
}
