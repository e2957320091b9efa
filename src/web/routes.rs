use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/status", get(handlers::status))
        .route("/config", get(handlers::get_config))
        // Uploads are bounded by the image size, not a request limit
        .route(
            "/upload",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/uploads", get(handlers::list_uploads))
        .route("/commit", post(handlers::commit))
        .route("/reload", post(handlers::reload))
        .route("/clear", post(handlers::clear))
        .route("/files", get(handlers::list_files))
        .route("/files/download", get(handlers::download_file))
        .route("/files/pending", get(handlers::pending_deletions))
        .route("/files/delete", post(handlers::mark_deleted))
        .route("/files/restore", post(handlers::unmark_deleted))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigStore, StorageConfig};
    use crate::msd::MsdController;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let config = AppConfig {
            storage: StorageConfig {
                image_path: dir.path().join("data.img").to_string_lossy().to_string(),
                mount_dir: dir.path().join("mnt").to_string_lossy().to_string(),
                upload_dir: dir.path().join("upload").to_string_lossy().to_string(),
                manifest_path: dir.path().join("pending.txt").to_string_lossy().to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let msd = Arc::new(MsdController::from_config(&config));
        AppState::new(ConfigStore::in_memory(config), msd)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_index() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let (status, body) = send(app, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Upload Server is running.\n");
    }

    #[tokio::test]
    async fn test_mark_and_restore_deletion() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, _) = send(
            create_router(state.clone()),
            json_post("/files/delete", r#"{"path":"docs/a.txt"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            create_router(state.clone()),
            Request::get("/files/pending").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"["docs/a.txt"]"#);

        let (status, body) = send(
            create_router(state.clone()),
            json_post("/files/delete", r#"{"path":"../etc/passwd"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains(r#""success":false"#));

        let (status, _) = send(
            create_router(state.clone()),
            json_post("/files/restore", r#"{"path":"docs/a.txt"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            create_router(state),
            json_post("/files/restore", r#"{"path":"docs/a.txt"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_then_list() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"../hello.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nhello world\r\n--{b}--\r\n",
            b = boundary
        );
        let req = Request::post("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(create_router(state.clone()), req).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("upload/hello.txt")).unwrap(),
            "hello world"
        );

        let (status, body) = send(
            create_router(state),
            Request::get("/uploads").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"names":["hello.txt"]}"#);
    }

    #[tokio::test]
    async fn test_config_endpoint() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let (status, body) = send(app, Request::get("/config").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["web"]["http_port"], 80);
        assert!(value["storage"]["upload_dir"]
            .as_str()
            .unwrap()
            .ends_with("upload"));
    }

    #[tokio::test]
    async fn test_download_requires_path() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let (status, _) = send(
            app,
            Request::get("/files/download").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
