use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rcv_core::cohort_plan::CohortParams;
use rcv_core::{
    ActivitySummary, CleanupReport, MindblockEntry, RunResult, SettingsPatch, SyntheticSettings,
    SyntheticsStatus,
};
use rcv_storage::SyntheticsStore;
use rcv_synthetics::control::{self, DEFAULT_RETAIN_DAYS};
use rcv_synthetics::{
    seed_cohort, seed_library, BackendError, ControlError, RunRequest, SeedError, SeedReport,
    SimUserPreview, SyntheticsRunner,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

pub const DEFAULT_ROUTE_PREFIX: &str = "make-server-49b28b8a";
const MINDBLOCK_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<SyntheticsStore>>,
    runner: Arc<SyntheticsRunner>,
    api_token: Option<String>,
}

impl AppState {
    pub fn new(store: SyntheticsStore, api_token: Option<String>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            runner: Arc::new(SyntheticsRunner::default()),
            api_token: api_token.filter(|token| !token.trim().is_empty()),
        }
    }

    /// Runs `op` against the store on the blocking pool. A lock poisoned by a
    /// panicking operation is taken over; every write path is transactional.
    pub async fn with_store<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&SyntheticsStore, &SyntheticsRunner) -> Result<T, ApiError> + Send + 'static,
    {
        let store = self.store.clone();
        let runner = self.runner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            op(&guard, &runner)
        })
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match &err {
            ControlError::Invalid(_) | ControlError::OutOfRange { .. } => {
                Self::bad_request(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<SeedError> for ApiError {
    fn from(err: SeedError) -> Self {
        match err {
            SeedError::InvalidParams(message) => Self::bad_request(message),
            other => Self::internal(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub retain_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SeedRequest {
    #[serde(flatten)]
    pub params: CohortParams,
    /// Demo library entries to create before seeding.
    #[serde(default)]
    pub library_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub success: bool,
    pub settings: SyntheticSettings,
}

#[derive(Debug, Serialize)]
pub struct RunNowResponse {
    pub success: bool,
    pub result: RunResult,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: CleanupReport,
}

#[derive(Debug, Serialize)]
pub struct SeedResponse {
    #[serde(flatten)]
    pub report: SeedReport,
    pub library_created: usize,
}

#[derive(Debug, Serialize)]
pub struct MindblockListResponse {
    pub count: usize,
    pub mindblocks: Vec<MindblockEntry>,
}

/// An empty body stands for the defaults; anything else has to parse.
fn optional_body<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}

pub fn build_router(state: AppState, prefix: &str) -> Router {
    let trimmed = prefix.trim().trim_matches('/');
    let base = if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    };
    let synthetics = format!("{base}/synthetics");

    let api = Router::new()
        .route(&format!("{synthetics}/status"), get(status_handler))
        .route(&format!("{synthetics}/activity/:hours"), get(activity_handler))
        .route(&format!("{synthetics}/sim-users"), get(sim_users_handler))
        .route(&format!("{synthetics}/toggle"), post(toggle_handler))
        .route(&format!("{synthetics}/settings"), post(settings_handler))
        .route(&format!("{synthetics}/run-now"), post(run_now_handler))
        .route(&format!("{synthetics}/run"), post(run_handler))
        .route(&format!("{synthetics}/cleanup"), post(cleanup_handler))
        .route(&format!("{synthetics}/seed"), post(seed_handler))
        .route(&format!("{base}/cc2/mindblocks/list"), get(mindblock_list_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(api)
        .with_state(state)
}

async fn require_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if is_authorized(&headers, state.api_token.as_deref()) {
        next.run(request).await
    } else {
        warn!(event = "hub_unauthorized", path = %request.uri().path());
        ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response()
    }
}

pub fn is_authorized(headers: &HeaderMap, api_token: Option<&str>) -> bool {
    let Some(expected) = api_token else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == expected)
}

pub async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<SyntheticsStatus>, ApiError> {
    let status = state
        .with_store(|store, _| Ok(control::status(store, Utc::now())?))
        .await?;
    Ok(Json(status))
}

pub async fn activity_handler(
    State(state): State<AppState>,
    Path(hours): Path<u32>,
) -> Result<Json<ActivitySummary>, ApiError> {
    let summary = state
        .with_store(move |store, _| Ok(control::activity(store, hours, Utc::now())?))
        .await?;
    Ok(Json(summary))
}

pub async fn sim_users_handler(
    State(state): State<AppState>,
) -> Result<Json<SimUserPreview>, ApiError> {
    let preview = state
        .with_store(|store, _| Ok(control::sim_user_preview(store)?))
        .await?;
    Ok(Json(preview))
}

pub async fn toggle_handler(
    State(state): State<AppState>,
    body: Result<Json<ToggleRequest>, JsonRejection>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let Json(body) = body?;
    let settings = state
        .with_store(move |store, _| Ok(control::toggle(store, body.enabled, Utc::now())?))
        .await?;
    info!(event = "synthetics_toggled", enabled = settings.enabled);
    Ok(Json(SettingsResponse {
        success: true,
        settings,
    }))
}

pub async fn settings_handler(
    State(state): State<AppState>,
    body: Result<Json<SettingsPatch>, JsonRejection>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let Json(patch) = body?;
    let settings = state
        .with_store(move |store, _| Ok(control::update_settings(store, &patch, Utc::now())?))
        .await?;
    Ok(Json(SettingsResponse {
        success: true,
        settings,
    }))
}

pub async fn run_now_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RunNowResponse>, ApiError> {
    let result = execute_run(&state, optional_body(&body)?).await?;
    Ok(Json(RunNowResponse {
        success: result.success,
        result,
    }))
}

pub async fn run_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RunResult>, ApiError> {
    let result = execute_run(&state, optional_body(&body)?).await?;
    Ok(Json(result))
}

pub async fn execute_run(state: &AppState, request: RunRequest) -> Result<RunResult, ApiError> {
    state
        .with_store(move |store, runner| Ok(runner.run(store, request)?))
        .await
}

pub async fn cleanup_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CleanupResponse>, ApiError> {
    let request: CleanupRequest = optional_body(&body)?;
    let retain_days = request.retain_days.unwrap_or(DEFAULT_RETAIN_DAYS);
    let report = state
        .with_store(move |store, _| Ok(control::cleanup(store, retain_days, Utc::now())?))
        .await?;
    Ok(Json(CleanupResponse {
        success: true,
        report,
    }))
}

pub async fn seed_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SeedResponse>, ApiError> {
    let request: SeedRequest = optional_body(&body)?;
    let response = state
        .with_store(move |store, _| {
            let library_created = match request.library_size {
                Some(size) => seed_library(store, size)?,
                None => 0,
            };
            let report = seed_cohort(store, &request.params, Utc::now())?;
            Ok(SeedResponse {
                report,
                library_created,
            })
        })
        .await?;
    Ok(Json(response))
}

pub async fn mindblock_list_handler(
    State(state): State<AppState>,
) -> Result<Json<MindblockListResponse>, ApiError> {
    let mindblocks = state
        .with_store(|store, _| Ok(control::mindblock_listing(store, MINDBLOCK_LIST_LIMIT)?))
        .await?;
    Ok(Json(MindblockListResponse {
        count: mindblocks.len(),
        mindblocks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rcv_core::RunState;
    use serde_json::Value;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state() -> AppState {
        AppState::new(
            SyntheticsStore::open_in_memory().expect("open db"),
            None,
        )
    }

    async fn seed_small_cohort(state: &AppState) {
        let body = Bytes::from_static(
            br#"{"count_users": 12, "coverage_per_mindblock": 3, "library_size": 5}"#,
        );
        let Json(response) = seed_handler(State(state.clone()), body)
            .await
            .expect("seed");
        assert_eq!(response.library_created, 5);
        assert_eq!(response.report.users_created, 12);
    }

    async fn serve(state: AppState, prefix: &str) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let app = build_router(state, prefix);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn send(
        addr: SocketAddr,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: &str,
    ) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let auth = token
            .map(|token| format!("Authorization: Bearer {token}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n{auth}Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(request.as_bytes())
            .await
            .expect("write request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        let (head, body) = response
            .split_once("\r\n\r\n")
            .expect("http response split");
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");
        (status, body.to_string())
    }

    fn error_message(body: &str) -> String {
        let value: Value = serde_json::from_str(body).expect("error json");
        value["error"].as_str().expect("error field").to_string()
    }

    #[test]
    fn bearer_token_is_required_only_when_configured() {
        let mut headers = HeaderMap::new();
        assert!(is_authorized(&headers, None));
        assert!(!is_authorized(&headers, Some("secret")));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!is_authorized(&headers, Some("secret")));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(is_authorized(&headers, Some("secret")));
    }

    #[test]
    fn blank_token_disables_auth() {
        let state = AppState::new(
            SyntheticsStore::open_in_memory().expect("open db"),
            Some("  ".to_string()),
        );
        assert!(state.api_token.is_none());
    }

    #[tokio::test]
    async fn status_reports_running_with_default_settings() {
        let Json(status) = status_handler(State(state())).await.expect("status");
        assert_eq!(status.status, RunState::Running);
        assert_eq!(status.settings.sessions_per_min, 2);
    }

    #[tokio::test]
    async fn toggle_then_scheduled_run_is_a_noop() {
        let state = state();
        seed_small_cohort(&state).await;
        let Json(toggled) = toggle_handler(
            State(state.clone()),
            Ok(Json(ToggleRequest { enabled: false })),
        )
        .await
        .expect("toggle");
        assert!(!toggled.settings.enabled);

        let Json(result) = run_handler(State(state.clone()), Bytes::new())
            .await
            .expect("run");
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.settings.target, 0);
    }

    #[tokio::test]
    async fn run_now_with_target_creates_sessions() {
        let state = state();
        seed_small_cohort(&state).await;
        let Json(response) = run_now_handler(
            State(state.clone()),
            Bytes::from_static(br#"{"target": 3, "seed": 17}"#),
        )
        .await
        .expect("run now");
        assert!(response.success);
        assert_eq!(response.result.sessions_created, 3);

        let Json(summary) = activity_handler(State(state.clone()), Path(24))
            .await
            .expect("activity");
        assert_eq!(summary.period_hours, 24);
        assert!(summary.scene_events_by_type.get("scene_started").copied().unwrap_or(0) >= 3);
    }

    #[tokio::test]
    async fn out_of_range_settings_are_bad_requests() {
        let patch = SettingsPatch {
            abandon_rate: Some(2.0),
            ..SettingsPatch::default()
        };
        let err = settings_handler(State(state()), Ok(Json(patch)))
            .await
            .expect_err("invalid rate");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_defaults_to_forty_five_days() {
        let Json(response) = cleanup_handler(State(state()), Bytes::new())
            .await
            .expect("cleanup");
        assert!(response.success);
        assert_eq!(response.report.journeys_deleted, 0);
        let age = Utc::now() - response.report.cutoff;
        assert_eq!(age.num_days(), i64::from(DEFAULT_RETAIN_DAYS));
    }

    #[tokio::test]
    async fn sim_users_and_mindblocks_are_listed() {
        let state = state();
        seed_small_cohort(&state).await;
        let Json(preview) = sim_users_handler(State(state.clone()))
            .await
            .expect("sim users");
        assert_eq!(preview.count, 12);
        assert_eq!(preview.users.len(), 12);

        let Json(listing) = mindblock_list_handler(State(state))
            .await
            .expect("mindblocks");
        assert_eq!(listing.count, 5);
    }

    #[tokio::test]
    async fn huge_windows_are_rejected_and_the_store_stays_usable() {
        let addr = serve(state(), "p").await;

        let (status, body) =
            send(addr, "GET", "/p/synthetics/activity/4294967295", None, "").await;
        assert_eq!(status, 400);
        assert!(error_message(&body).contains("hours"));

        let (status, body) = send(
            addr,
            "POST",
            "/p/synthetics/cleanup",
            None,
            r#"{"retain_days": 4294967295}"#,
        )
        .await;
        assert_eq!(status, 400);
        assert!(error_message(&body).contains("retain_days"));

        let (status, _) = send(addr, "GET", "/p/synthetics/status", None, "").await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_instead_of_defaulted() {
        let state = state();
        let addr = serve(state.clone(), "p").await;

        let (status, body) = send(
            addr,
            "POST",
            "/p/synthetics/cleanup",
            None,
            r#"{"retain_days": -1}"#,
        )
        .await;
        assert_eq!(status, 400);
        assert!(error_message(&body).starts_with("invalid request body"));

        let (status, _) = send(
            addr,
            "POST",
            "/p/synthetics/seed",
            None,
            r#"{"count_users": "lots"}"#,
        )
        .await;
        assert_eq!(status, 400);
        let users = state
            .with_store(|store, _| {
                store
                    .sim_user_count()
                    .map_err(|err| ApiError::internal(err.to_string()))
            })
            .await
            .expect("count users");
        assert_eq!(users, 0);

        let (status, _) = send(addr, "POST", "/p/synthetics/toggle", None, "{").await;
        assert_eq!(status, 400);

        let (status, body) = send(addr, "POST", "/p/synthetics/run-now", None, "").await;
        assert_eq!(status, 200);
        let value: Value = serde_json::from_str(&body).expect("run json");
        assert_eq!(value["result"]["sessions_created"], 0);
    }

    #[tokio::test]
    async fn protected_routes_need_the_token_but_health_does_not() {
        let state = AppState::new(
            SyntheticsStore::open_in_memory().expect("open db"),
            Some("secret".to_string()),
        );
        let addr = serve(state, DEFAULT_ROUTE_PREFIX).await;
        let status_path = format!("/{DEFAULT_ROUTE_PREFIX}/synthetics/status");

        let (status, body) = send(addr, "GET", "/health", None, "").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");

        let (status, body) = send(addr, "GET", &status_path, None, "").await;
        assert_eq!(status, 401);
        assert_eq!(error_message(&body), "missing or invalid bearer token");

        let (status, _) = send(addr, "GET", &status_path, Some("wrong"), "").await;
        assert_eq!(status, 401);

        let (status, _) = send(addr, "GET", &status_path, Some("secret"), "").await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn empty_prefix_mounts_routes_at_the_root() {
        let addr = serve(state(), "").await;
        let (status, body) = send(addr, "GET", "/cc2/mindblocks/list", None, "").await;
        assert_eq!(status, 200);
        let value: Value = serde_json::from_str(&body).expect("listing json");
        assert_eq!(value["count"], 0);
    }
}
