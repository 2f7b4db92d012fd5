use crate::diagnostic_logging::set_diagnostic_log_filter;
use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::Json;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::Handle;
use placement_check::{TestError, TestId, TestManager};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;
// Avoid referencing api types as crate::name in the utoipa macros,
// otherwise they show up with namespaced names in openapi.json
use placement_api_types::*;

pub mod check_v1;
pub mod report_v1;
pub mod test_v1;

#[derive(OpenApi)]
#[openapi(
    info(title = "placementd"),
    paths(
        test_v1::start_test_v1,
        test_v1::confirm_test_v1,
        check_v1::check_v1,
        check_v1::check_status_v1,
        report_v1::report_v1,
        set_diagnostic_log_filter_v1
    ),
    components(schemas(
        StartTestV1Request,
        StartTestV1Response,
        ConfirmTestV1Response,
        ReportV1Response,
        CheckStatusV1Response,
        CheckState,
        InboxOutcome,
        PlacementStatus,
        Folder,
        ErrorResponse,
        SetDiagnosticFilterRequest
    ))
)]
struct ApiDoc;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut docs = ApiDoc::openapi();
    docs.info.version = env!("CARGO_PKG_VERSION").to_string();
    docs
}

/// The api routes, without any listener specific layers
pub fn make_router(manager: TestManager) -> Router {
    Router::new()
        .route("/api/test", post(test_v1::start_test_v1))
        .route("/api/test/{id}/confirm", post(test_v1::confirm_test_v1))
        .route("/api/check/{id}", post(check_v1::check_v1))
        .route("/api/check/{id}/status", get(check_v1::check_status_v1))
        .route("/api/report/{id}", get(report_v1::report_v1))
        .route(
            "/api/admin/set_diagnostic_log_filter/v1",
            post(set_diagnostic_log_filter_v1),
        )
        .with_state(manager)
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", api_docs()).path("/rapidoc"))
}

pub struct HttpServer {
    pub listen: String,
    /// Origins permitted to make cross-origin requests
    pub cors_origins: Vec<HeaderValue>,
}

impl HttpServer {
    pub fn start(self, manager: TestManager) -> anyhow::Result<RunningServer> {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::list(self.cors_origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]);
        let app = make_router(manager)
            .layer(cors)
            .layer(TraceLayer::new_for_http());

        let socket = TcpListener::bind(&self.listen)
            .with_context(|| format!("listen on {}", self.listen))?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;
        tracing::info!("http listener on {addr:?}");

        let handle = Handle::new();
        let server = axum_server::from_tcp(socket).handle(handle.clone());
        let task = tokio::spawn(async move { server.serve(app.into_make_service()).await });

        Ok(RunningServer { addr, handle, task })
    }
}

pub struct RunningServer {
    pub addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    /// Stop accepting connections and give in-flight requests up to
    /// `grace` to complete
    pub async fn shutdown(self, grace: Duration) -> anyhow::Result<()> {
        self.handle.graceful_shutdown(Some(grace));
        self.task
            .await
            .context("joining http server task")?
            .context("http server")
    }
}

/// An error response: a status code with a `{"error": message}` body
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<TestError> for AppError {
    fn from(err: TestError) -> Self {
        match err {
            TestError::Validation(msg) | TestError::Precondition(msg) => {
                Self::new(StatusCode::BAD_REQUEST, msg)
            }
            TestError::NotFound(msg) => Self::new(StatusCode::NOT_FOUND, msg),
            TestError::Internal(err) => {
                tracing::error!("{err:#}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        TestError::Internal(err).into()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

/// Ids that are not even well formed cannot name a test, so they
/// are reported with the same error as a well formed unknown id
pub(crate) fn parse_test_id(id: &str, not_found: fn() -> TestError) -> Result<TestId, AppError> {
    id.parse().map_err(|_| not_found().into())
}

/// Changes the diagnostic log filter dynamically.
#[utoipa::path(
    post,
    tag="logging",
    path="/api/admin/set_diagnostic_log_filter/v1",
    request_body=SetDiagnosticFilterRequest,
    responses(
        (status = 200, description = "Diagnostic level set successfully"),
        (status = 400, description = "The filter is invalid", body=ErrorResponse),
    ),
)]
async fn set_diagnostic_log_filter_v1(
    request: Result<Json<SetDiagnosticFilterRequest>, JsonRejection>,
) -> Result<(), AppError> {
    let Json(request) = request?;
    let filter = EnvFilter::try_new(&request.filter).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid filter {:?}: {err}", request.filter),
        )
    })?;
    set_diagnostic_log_filter(filter)?;
    tracing::info!("diagnostic log filter is now {}", request.filter);
    Ok(())
}
