//! HTTP trigger for checks: `POST /check` with a typed request body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cidchk_checker::{CheckError, CheckOutcome, CheckService, CheckerConfig};
use cidchk_core::{CheckRequest, RequestError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cidchk-web";

/// What the trigger needs from a configured checker.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, request: CheckRequest, cancel: &CancellationToken) -> anyhow::Result<CheckOutcome>;

    async fn post_comment(&self, request: &CheckRequest, outcome: &CheckOutcome) -> anyhow::Result<Option<String>>;
}

#[async_trait]
impl CheckRunner for CheckService {
    async fn run(&self, request: CheckRequest, cancel: &CancellationToken) -> anyhow::Result<CheckOutcome> {
        CheckService::run(self, request, cancel).await
    }

    async fn post_comment(&self, request: &CheckRequest, outcome: &CheckOutcome) -> anyhow::Result<Option<String>> {
        CheckService::post_comment(self, request, outcome).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn CheckRunner>,
    pub check_timeout: Duration,
}

impl AppState {
    pub fn new(runner: Arc<dyn CheckRunner>, check_timeout: Duration) -> Self {
        Self { runner, check_timeout }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CheckParams {
    #[serde(default)]
    comment: bool,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    outcome: CheckOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/check", post(check_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &CheckerConfig) -> anyhow::Result<()> {
    let service = CheckService::from_config(config).await?;
    let state = AppState::new(Arc::new(service), config.check_timeout());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&CheckerConfig::from_env()?).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn check_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckParams>,
    Json(request): Json<CheckRequest>,
) -> Response {
    if let Err(err) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        let timeout = state.check_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };
    let result = state.runner.run(request.clone(), &cancel).await;
    deadline.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(repository = %request.repository, issue = request.issue_number, "check failed: {err:#}");
            return error_response(status_for(&err), format!("{err:#}"));
        }
    };

    let comment_url = if params.comment {
        match state.runner.post_comment(&request, &outcome).await {
            Ok(url) => url,
            Err(err) => return error_response(StatusCode::BAD_GATEWAY, format!("{err:#}")),
        }
    } else {
        None
    };
    Json(CheckResponse { outcome, comment_url }).into_response()
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    if err.downcast_ref::<RequestError>().is_some() {
        return StatusCode::BAD_REQUEST;
    }
    match err.downcast_ref::<CheckError>() {
        Some(CheckError::Cancelled) => StatusCode::GATEWAY_TIMEOUT,
        Some(CheckError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cidchk_checker::AbortReason;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeRunner {
        wait_for_cancel: bool,
        comments: AtomicUsize,
    }

    #[async_trait]
    impl CheckRunner for FakeRunner {
        async fn run(&self, request: CheckRequest, cancel: &CancellationToken) -> anyhow::Result<CheckOutcome> {
            if self.wait_for_cancel {
                cancel.cancelled().await;
                return Err(CheckError::Cancelled.into());
            }
            Ok(CheckOutcome::Aborted {
                reason: AbortReason::NoPreviousAllocation,
                report: format!("no allocation yet for #{}", request.issue_number),
                report_url: "https://artifacts.test/report.md".into(),
            })
        }

        async fn post_comment(&self, _request: &CheckRequest, _outcome: &CheckOutcome) -> anyhow::Result<Option<String>> {
            self.comments.fetch_add(1, Ordering::SeqCst);
            Ok(Some("https://github.com/acme/ldn/issues/42#issuecomment-1".into()))
        }
    }

    fn check_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    const BODY: &str = r#"{"issue_number":42,"repository":"acme/ldn"}"#;

    #[tokio::test]
    async fn healthz_answers() {
        let runner = Arc::new(FakeRunner::default());
        let resp = app(AppState::new(runner, Duration::from_secs(5)))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn check_returns_the_outcome_and_optionally_comments() {
        let runner = Arc::new(FakeRunner::default());
        let app = app(AppState::new(runner.clone(), Duration::from_secs(5)));

        let resp = app.clone().oneshot(check_request("/check", BODY)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["outcome"]["status"], "aborted");
        assert_eq!(json["outcome"]["reason"]["reason"], "no_previous_allocation");
        assert!(json.get("comment_url").is_none());
        assert_eq!(runner.comments.load(Ordering::SeqCst), 0);

        let resp = app.oneshot(check_request("/check?comment=true", BODY)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert!(json["comment_url"].as_str().unwrap().contains("issuecomment"));
        assert_eq!(runner.comments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let runner = Arc::new(FakeRunner::default());
        let resp = app(AppState::new(runner, Duration::from_secs(5)))
            .oneshot(check_request("/check", r#"{"issue_number":42,"repository":"no-slash"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = json_body(resp).await;
        assert!(json["error"].as_str().unwrap().contains("no-slash"));
    }

    #[tokio::test]
    async fn slow_checks_are_cancelled_at_the_deadline() {
        let runner = Arc::new(FakeRunner {
            wait_for_cancel: true,
            ..Default::default()
        });
        let resp = app(AppState::new(runner, Duration::from_millis(20)))
            .oneshot(check_request("/check", BODY))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
