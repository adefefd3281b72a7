//! HTTP trigger for the LH ingestion run.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use pickly_sync::{pipeline_from_env, IngestPipeline};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pickly-web";

const CORS_ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";

pub struct AppState {
    pub pipeline: IngestPipeline,
}

impl AppState {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", any(fetch_handler))
        .route("/fetch-lh-announcements", any(fetch_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PICKLY_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(pipeline_from_env()?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for fetch triggers");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn cors_headers() -> [(HeaderName, &'static str); 2] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, CORS_ALLOW_HEADERS),
    ]
}

async fn fetch_handler(State(state): State<Arc<AppState>>, method: Method) -> Response {
    if method == Method::OPTIONS {
        return (cors_headers(), "ok").into_response();
    }

    let outcome = state.pipeline.invoke().await;
    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, cors_headers(), Json(outcome)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use pickly_adapters::{AdapterError, LhLeaseNoticeAdapter, ListingTarget, SourceAdapter};
    use pickly_core::{Category, RawAnnouncementItem};
    use pickly_storage::{HttpFetcher, MemoryAnnouncementStore};
    use pickly_sync::{FixedClock, IngestConfig};
    use serde_json::{json, Value as JsonValue};
    use tower::ServiceExt;
    use uuid::Uuid;

    struct CannedSource {
        body: JsonValue,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceAdapter for CannedSource {
        fn source_id(&self) -> &'static str {
            "canned"
        }

        async fn fetch_listing(
            &self,
            _http: &HttpFetcher,
            _target: &ListingTarget,
        ) -> Result<JsonValue, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }

        fn parse_listing(&self, body: &JsonValue) -> Vec<RawAnnouncementItem> {
            LhLeaseNoticeAdapter.parse_listing(body)
        }
    }

    fn test_app(api_key: Option<&str>) -> (Router, Arc<AtomicUsize>) {
        let store = Arc::new(MemoryAnnouncementStore::new());
        store.add_category(
            Category {
                id: Uuid::new_v4(),
                name: "주거".into(),
                slug: "housing".into(),
            },
            None,
            true,
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let source = CannedSource {
            body: json!({"body": {"items": [
                {"공고번호": "W-1", "공고명": "행복주택 모집", "모집시작일": "2024-01-10", "모집종료일": "2024-01-31"}
            ]}}),
            calls: calls.clone(),
        };
        let config = IngestConfig {
            api_key: api_key.map(ToString::to_string),
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).single().unwrap();
        let pipeline = IngestPipeline::new(config, store)
            .unwrap()
            .with_source(Box::new(source))
            .with_clock(Box::new(FixedClock(now)));
        (app(AppState::new(pipeline)), calls)
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn assert_cors(resp: &Response) {
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            CORS_ALLOW_HEADERS
        );
    }

    #[tokio::test]
    async fn preflight_answers_ok_without_fetching() {
        let (app, calls) = test_app(Some("key"));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/fetch-lh-announcements")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors(&resp);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn post_runs_ingestion() {
        let (app, calls) = test_app(Some("key"));
        let resp = app
            .oneshot(Request::builder().method("POST").uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors(&resp);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 1);
        assert_eq!(body["announcements"][0]["external_id"], "W-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_is_a_500_with_error_body() {
        let (app, calls) = test_app(None);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/fetch-lh-announcements")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&resp);
        let body = json_body(resp).await;
        assert_eq!(
            body,
            json!({"success": false, "error": "LH_API_KEY is not configured"})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
