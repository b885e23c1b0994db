use std::net::Ipv4Addr;

use axum::Json;
use axum::Router;
use axum::routing::get;

use crate::version::BUILD_INFO;
use crate::version::BuildInfo;

pub(crate) fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(build_info))
}

/// Serves the debug endpoints on `port` until the process exits.
pub(crate) async fn serve(port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Debug server listening on http://{addr}");
    }
    axum::serve(listener, router()).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn build_info() -> Json<BuildInfo> {
    Json(BUILD_INFO)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use axum::http::StatusCode;
    use tower::ServiceExt as _;

    use super::*;

    async fn get_body(uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        let response = router().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (status, body) = get_body("/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn version_reports_build_info() {
        let (status, body) = get_body("/version").await;

        assert_eq!(status, StatusCode::OK);
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["git_commit"].is_string());
        assert!(info["git_ref"].is_string());
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (status, _) = get_body("/debug/pprof").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
