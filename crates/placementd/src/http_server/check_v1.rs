use super::{parse_test_id, AppError};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use placement_api_types::*;
use placement_check::{TestError, TestManager};

/// Check where the test message was placed.
///
/// By default this waits until the message has been seen in at least
/// one inbox, or until the poll budget is used up, and then responds
/// with the report. With `wait=false` the check continues in the
/// background and its status is returned immediately; poll
/// `/api/check/{id}/status` to follow it.
#[utoipa::path(
    post,
    tag="check",
    path="/api/check/{id}",
    params(
        ("id" = String, Path, description = "Test id returned when the test was created"),
        CheckV1Params,
    ),
    responses(
        (status = 200, description = "The check has finished", body=ReportV1Response),
        (status = 202, description = "The check is running in the background", body=CheckStatusV1Response),
        (status = 400, description = "The test has not been confirmed", body=ErrorResponse),
        (status = 404, description = "Test not found", body=ErrorResponse),
        (status = 500, description = "The check failed and may be retried", body=ErrorResponse),
    ),
)]
pub async fn check_v1(
    State(manager): State<TestManager>,
    Path(id): Path<String>,
    params: Result<Query<CheckV1Params>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params?;
    let id = parse_test_id(&id, TestError::test_not_found)?;
    if params.wait {
        Ok(Json(manager.check_test(&id).await?).into_response())
    } else {
        let status = manager.begin_check(&id).await?;
        Ok((StatusCode::ACCEPTED, Json(status)).into_response())
    }
}

/// Report on the progress of a check without starting one
#[utoipa::path(
    get,
    tag="check",
    path="/api/check/{id}/status",
    params(
        ("id" = String, Path, description = "Test id returned when the test was created")
    ),
    responses(
        (status = 200, description = "Current check status", body=CheckStatusV1Response),
        (status = 404, description = "Test not found", body=ErrorResponse),
    ),
)]
pub async fn check_status_v1(
    State(manager): State<TestManager>,
    Path(id): Path<String>,
) -> Result<Json<CheckStatusV1Response>, AppError> {
    let id = parse_test_id(&id, TestError::test_not_found)?;
    Ok(Json(manager.check_status(&id).await?))
}
