mod error;

use axum::extract::ws::{self, WebSocket};
use axum::extract::{Extension, Path, Query};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{instrument, trace};

use smidr_common::build::{
    ArtifactSummary, BuildDetails, BuildState, BuildStatusResponse, CancelResponse,
    StartBuildRequest,
};
use smidr_common::log::LogItem;

use crate::deployment::{LogSubscription, Scheduler, SubmitRequest};
use crate::error::Result;
use crate::persistence::BuildFilter;

pub fn make_router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/builds", post(start_build).get(list_builds))
        .route("/builds/:build_id", get(get_build_status))
        .route("/builds/:build_id/cancel", post(cancel_build))
        .route("/builds/:build_id/artifacts", get(list_artifacts))
        .route("/ws/builds/:build_id/logs", get(stream_build_logs))
        .route("/status", get(|| async { "Ok" }))
        .layer(Extension(scheduler))
}

#[instrument(skip_all, fields(customer = %request.customer))]
async fn start_build(
    Extension(scheduler): Extension<Scheduler>,
    Json(request): Json<StartBuildRequest>,
) -> Result<Json<BuildStatusResponse>> {
    let submit = SubmitRequest {
        customer: request.customer,
        target: request.target,
        config_yaml: request.config,
        force_clean: request.force_clean,
        force_image_rebuild: request.force_image_rebuild,
        submitter_host: request.submitter_host.unwrap_or_else(local_hostname),
        submitter_user: request
            .submitter_user
            .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())),
    };

    let build = scheduler.submit(submit).await?;

    Ok(Json(build.status_response()))
}

#[instrument(skip_all, fields(%build_id))]
async fn get_build_status(
    Extension(scheduler): Extension<Scheduler>,
    Path(build_id): Path<String>,
) -> Result<Json<BuildStatusResponse>> {
    let build = scheduler.get(&build_id).await?;

    Ok(Json(build.status_response()))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    customer: Option<String>,
    state: Option<BuildState>,
    #[serde(default)]
    include_deleted: bool,
    limit: Option<u32>,
}

#[instrument(skip_all)]
async fn list_builds(
    Extension(scheduler): Extension<Scheduler>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BuildDetails>>> {
    let filter = BuildFilter {
        customer: query.customer,
        status: query.state.map(Into::into),
        include_deleted: query.include_deleted,
        limit: query.limit,
    };

    let builds = scheduler
        .list(&filter)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(Json(builds))
}

#[instrument(skip_all, fields(%build_id))]
async fn cancel_build(
    Extension(scheduler): Extension<Scheduler>,
    Path(build_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    Ok(Json(scheduler.cancel(&build_id).await?))
}

#[instrument(skip_all, fields(%build_id))]
async fn list_artifacts(
    Extension(scheduler): Extension<Scheduler>,
    Path(build_id): Path<String>,
) -> Result<Json<Vec<ArtifactSummary>>> {
    let artifacts = scheduler
        .artifacts(&build_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(Json(artifacts))
}

#[derive(Debug, Deserialize)]
struct FollowQuery {
    #[serde(default = "default_follow")]
    follow: bool,
}

fn default_follow() -> bool {
    true
}

/// Buffered entries first, then live entries while `follow` is true and the
/// build has not finished.
#[instrument(skip_all, fields(%build_id))]
async fn stream_build_logs(
    Extension(scheduler): Extension<Scheduler>,
    Path(build_id): Path<String>,
    Query(FollowQuery { follow }): Query<FollowQuery>,
    ws_upgrade: ws::WebSocketUpgrade,
) -> axum::response::Response {
    ws_upgrade.on_upgrade(move |socket| logs_websocket(socket, scheduler, build_id, follow))
}

async fn logs_websocket(mut socket: WebSocket, scheduler: Scheduler, build_id: String, follow: bool) {
    let subscription = match scheduler.subscribe(&build_id).await {
        Ok(subscription) => subscription,
        Err(err) => {
            let _ = socket.send(ws::Message::Text(err.to_string())).await;
            let _ = socket.close().await;
            return;
        }
    };

    match subscription {
        LogSubscription::Replay { entries } => {
            for entry in entries {
                if send_entry(&mut socket, &entry).await.is_err() {
                    return;
                }
            }
        }
        LogSubscription::Live {
            snapshot,
            mut receiver,
            subscriber,
            hub,
        } => {
            for entry in &snapshot {
                if send_entry(&mut socket, entry).await.is_err() {
                    hub.unsubscribe(subscriber);
                    return;
                }
            }

            if follow {
                while let Some(entry) = receiver.recv().await {
                    if send_entry(&mut socket, &entry).await.is_err() {
                        hub.unsubscribe(subscriber);
                        return;
                    }
                }
                trace!("log stream drained to end of build");
            }

            hub.unsubscribe(subscriber);
        }
    }

    let _ = socket.close().await;
}

async fn send_entry(socket: &mut WebSocket, entry: &LogItem) -> std::result::Result<(), axum::Error> {
    let encoded = serde_json::to_string(entry).unwrap_or_default();

    socket.send(ws::Message::Text(encoded)).await
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::artifacts::ArtifactStore;
    use crate::cache::LayerCache;
    use crate::deployment::{Scheduler, SchedulerConfig};
    use crate::persistence::{BuildStore, Persistence};
    use crate::runtime::mock::MockRuntime;

    use super::make_router;

    const CONFIG_YAML: &str = "machine: qemux86-64\ntarget: core-image-minimal\n";

    struct Api {
        router: Router,
        store: Persistence,
        _state_dir: tempfile::TempDir,
    }

    async fn api() -> Api {
        let state_dir = tempfile::tempdir().unwrap();
        let store = Persistence::new_in_memory().await.unwrap();

        let cache_root = state_dir.path().join("layers");
        for (layer, sub) in [("poky", "meta"), ("meta-openembedded", "meta-oe")] {
            let conf = cache_root.join(layer).join(sub).join("conf");
            std::fs::create_dir_all(&conf).unwrap();
            std::fs::write(
                conf.join("layer.conf"),
                "LAYERSERIES_COMPAT_x = \"scarthgap\"\n",
            )
            .unwrap();
        }

        let scheduler = Scheduler::new(
            Arc::new(store.clone()),
            Arc::new(MockRuntime::default()),
            LayerCache::new(cache_root, Duration::from_secs(1), Duration::from_secs(3600)),
            ArtifactStore::new(state_dir.path().join("artifacts")),
            SchedulerConfig {
                state_dir: state_dir.path().to_path_buf(),
                max_concurrent_builds: 2,
                build_timeout: Duration::from_secs(60),
                shutdown_grace: Duration::from_secs(5),
            },
        );

        Api {
            router: make_router(scheduler),
            store,
            _state_dir: state_dir,
        }
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        (status, value)
    }

    fn start_body() -> Value {
        json!({
            "config": CONFIG_YAML,
            "customer": "acme",
            "submitter_host": "devbox",
            "submitter_user": "builder",
        })
    }

    async fn wait_terminal(store: &Persistence, id: &str) {
        for _ in 0..400 {
            if store.get(id).await.unwrap().status.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("build {id} never reached a terminal state");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_then_get_then_list() {
        let api = api().await;

        let (status, body) =
            send(&api.router, Method::POST, "/builds", Some(start_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "queued");
        assert_eq!(body["target"], "core-image-minimal");
        let id = body["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("acme-"));

        let (status, body) =
            send(&api.router, Method::GET, &format!("/builds/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());

        let (status, body) = send(
            &api.router,
            Method::GET,
            "/builds?customer=acme&limit=10",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        wait_terminal(&api.store, &id).await;
        let (_, body) = send(&api.router, Method::GET, &format!("/builds/{id}"), None).await;
        assert_eq!(body["state"], "completed");
        assert_eq!(body["exit_code"], 0);
    }

    #[tokio::test]
    async fn malformed_config_maps_to_bad_request() {
        let api = api().await;

        let mut body = start_body();
        body["config"] = json!("machine: ''");

        let (status, body) = send(&api.router, Method::POST, "/builds", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn unknown_build_maps_to_not_found() {
        let api = api().await;

        let (status, body) =
            send(&api.router, Method::GET, "/builds/acme-ffffffff", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_after_completion_reports_failure_without_error() {
        let api = api().await;

        let (_, body) = send(&api.router, Method::POST, "/builds", Some(start_body())).await;
        let id = body["id"].as_str().unwrap().to_string();
        wait_terminal(&api.store, &id).await;

        let (status, body) = send(
            &api.router,
            Method::POST,
            &format!("/builds/{id}/cancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn artifacts_of_unfinished_build_conflict() {
        let api = api().await;

        let (_, body) = send(&api.router, Method::POST, "/builds", Some(start_body())).await;
        let id = body["id"].as_str().unwrap().to_string();

        // Immediately after submit the build is queued or running; either
        // way the artifact listing is refused. If the mock build already
        // finished, the listing is an empty success instead.
        let (status, body) = send(
            &api.router,
            Method::GET,
            &format!("/builds/{id}/artifacts"),
            None,
        )
        .await;
        if status == StatusCode::CONFLICT {
            assert_eq!(body["error"], "illegal_transition");
        } else {
            assert_eq!(status, StatusCode::OK);
        }

        wait_terminal(&api.store, &id).await;
        let (status, body) = send(
            &api.router,
            Method::GET,
            &format!("/builds/{id}/artifacts"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let api = api().await;

        let request = Request::builder()
            .method(Method::GET)
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let response = api.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
